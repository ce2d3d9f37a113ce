//! # denoise-rt
//!
//! **Tiled U-Net denoising inference across CPU, CUDA and WebGPU backends.**
//!
//! denoise-rt runs a fixed encoder/decoder convolutional network over images
//! of any size. Large images are split into overlapping tiles sized to fit a
//! memory budget; the overlap covers the network's receptive field, so a tiled
//! result matches a single pass pixel for pixel.
//!
//! ## Layers
//!
//! - **Memory**: [`Buffer`](tensor::Buffer)s with a [`Storage`](tensor::Storage)
//!   class, [`Tensor`](tensor::Tensor) views and strided [`Image`](image::Image)s
//! - **Runtime**: [`Device`](runtime::Device)s discovered and ranked across
//!   backends, each owning an ordered [`Engine`](runtime::Engine)
//! - **Graph**: convolution, pooling, upsampling and image process nodes with
//!   liveness-planned scratch memory
//! - **Filter**: [`UNetFilter`](filter::UNetFilter) with a commit/execute
//!   lifecycle and the tile scheduler
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use denoise_rt::prelude::*;
//!
//! let device = new_device(&DeviceSelector::Default)?;
//! let color = Image::alloc(device.as_ref(), Format::Float3, 1920, 1080)?;
//! let output = Image::alloc(device.as_ref(), Format::Float3, 1920, 1080)?;
//!
//! let mut filter = UNetFilter::new(device.clone());
//! filter.set_weights(WeightsKey::Hdr, weights);
//! filter.set_image("color", color);
//! filter.set_image("output", output);
//! filter.set_int("hdr", 1)?;
//! filter.commit()?;
//! filter.execute(SyncMode::Sync)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `cpu` (default): CPU backend
//! - `rayon` (default): Multi-threaded CPU kernels
//! - `cuda`: NVIDIA CUDA backend
//! - `wgpu`: Cross-platform GPU via WebGPU

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dtype;
pub mod error;
pub mod filter;
pub mod graph;
pub mod image;
pub mod runtime;
pub mod tensor;
mod util;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::dtype::DType;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::filter::{
        AliasingMode, HostTensor, LinearTransfer, SyncMode, TransferFunction, UNetFilter, Weights,
        WeightsKey,
    };
    pub use crate::image::{Format, Image};
    pub use crate::runtime::{
        Device, DeviceConfig, DeviceSelector, DeviceType, PhysicalDevice, create_device,
        enumerate_physical_devices, new_device,
    };
    pub use crate::tensor::{Buffer, Storage, Tensor, TensorDesc, TensorLayout};

    #[cfg(feature = "cpu")]
    pub use crate::runtime::cpu::CpuDevice;

    #[cfg(feature = "cuda")]
    pub use crate::runtime::cuda::CudaDevice;

    #[cfg(feature = "wgpu")]
    pub use crate::runtime::wgpu::WgpuDevice;
}
