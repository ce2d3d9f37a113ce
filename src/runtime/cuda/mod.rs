//! CUDA backend
//!
//! Uses `cudarc` for the driver API: one stream on each device's primary
//! context, stream-ordered allocations and PTX kernels compiled by `build.rs`
//! from `kernels/unet.cu`. Feature maps are f16 CHW padded to 8 channels and
//! convolutions fuse their pooling and upsampling post-ops.
//!
//! Driver libraries are loaded dynamically; a machine without them simply
//! reports no CUDA devices.

mod context;
mod device;
mod engine;
mod kernels;

pub use device::CudaDevice;
pub use engine::{CudaAllocator, CudaEngine};

use super::physical::{PciAddress, PhysicalDevice};
use super::traits::DeviceType;
use crate::error::Result;
use cudarc::driver::result;
use cudarc::driver::sys::{self, CUdevice_attribute};

/// Lowest supported compute capability (Volta)
pub const MIN_COMPUTE_CAPABILITY: (u32, u32) = (7, 0);

/// Score of CUDA ordinal `index` in cross-backend ranking
pub const fn score(index: usize) -> u32 {
    (20 << 16) - 1 - index as u32
}

fn uuid(ordinal: i32) -> Option<[u8; 16]> {
    let device = result::device::get(ordinal).ok()?;
    let mut uuid = sys::CUuuid { bytes: [0; 16] };
    // SAFETY: uuid is a valid out pointer and device a valid handle.
    let rc = unsafe { sys::cuDeviceGetUuid(&mut uuid, device) };
    (rc == sys::CUresult::CUDA_SUCCESS).then(|| uuid.bytes.map(|b| b as u8))
}

fn pci_address(ordinal: i32) -> Option<PciAddress> {
    let get = |attrib| device::attribute(ordinal, attrib).ok().map(|v| v as u32);
    Some(PciAddress {
        domain: get(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_PCI_DOMAIN_ID)?,
        bus: get(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_PCI_BUS_ID)?,
        device: get(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_PCI_DEVICE_ID)?,
        function: 0,
    })
}

fn discover() -> Result<Vec<PhysicalDevice>> {
    result::init()?;
    let count = result::device::get_count()?;
    let mut devices = Vec::new();
    for ordinal in 0..count {
        let (major, minor) = device::compute_capability(ordinal)?;
        if (major, minor) < MIN_COMPUTE_CAPABILITY {
            tracing::debug!(ordinal, major, minor, "Skipping CUDA device below sm_70");
            continue;
        }
        let name = result::device::get_name(result::device::get(ordinal)?)?;
        let index = ordinal as usize;
        devices.push(PhysicalDevice {
            device_type: DeviceType::Cuda,
            score: score(index),
            name,
            uuid: uuid(ordinal),
            pci_address: pci_address(ordinal),
            backend_index: index,
        });
    }
    Ok(devices)
}

/// Physical CUDA devices with a supported architecture
///
/// Never fails: a missing driver (which makes `cudarc` panic while loading
/// the library) or any driver error yields an empty list.
pub(crate) fn enumerate() -> Vec<PhysicalDevice> {
    match std::panic::catch_unwind(discover) {
        Ok(Ok(devices)) => devices,
        Ok(Err(err)) => {
            tracing::debug!(%err, "CUDA device discovery failed");
            Vec::new()
        }
        Err(_) => {
            tracing::debug!("CUDA driver library not available");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_ranks_above_other_backends() {
        assert!(score(0) > score(1));
        assert!(score(15) > (10 << 16));
        assert!(score(0) > 1 << 16);
    }

    #[test]
    fn test_enumerate_never_panics() {
        for device in enumerate() {
            assert_eq!(device.device_type, DeviceType::Cuda);
            assert!(device.score > 10 << 16);
        }
    }
}
