//! Core runtime traits

mod device;
mod engine;

pub(crate) use device::ActivationFlag;
pub use device::{
    Device, DeviceCaps, DeviceConfig, DeviceId, DeviceType, ExternalMemoryTypes,
    ScopedActivation,
};
pub use engine::{ConvKernel, Engine};
