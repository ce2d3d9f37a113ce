//! Compute backends and device management
//!
//! # Architecture
//!
//! ```text
//! PhysicalDevice (discovered, ranked by score)
//! └── Device (compute context, capabilities, activation guard)
//!     └── Engine (ordered work stream: memory, copies, kernels, wait)
//!         ├── Allocator (tracked device or host memory)
//!         └── ConvKernel (per-node backend state)
//! ```
//!
//! Backends are selected at runtime through `Arc<dyn Device>`. The CPU
//! backend is always available when the `cpu` feature is on; `cuda` and
//! `wgpu` add GPU backends.

mod allocator;
mod physical;
mod traits;

#[cfg(feature = "cpu")]
pub mod cpu;

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use allocator::{Allocator, TrackingAllocator};
pub use physical::{
    DEFAULT_DEVICE_ENV, DeviceSelector, PciAddress, PhysicalDevice, create_device,
    enumerate_physical_devices, new_device, parse_device_selector, select_from,
    select_physical_device,
};
pub(crate) use traits::ActivationFlag;
pub use traits::{
    ConvKernel, Device, DeviceCaps, DeviceConfig, DeviceId, DeviceType, Engine,
    ExternalMemoryTypes, ScopedActivation,
};
