//! CPU backend
//!
//! Host memory, direct convolution loops and a per-device `rayon` pool.
//! Kernels run synchronously inside `submit`, so waiting is free.

mod device;
mod engine;
mod kernels;

pub use device::CpuDevice;
pub use engine::{CpuAllocator, CpuEngine};

use super::physical::PhysicalDevice;
use super::traits::DeviceType;

/// Score of the CPU in cross-backend ranking
pub const CPU_SCORE: u32 = 1 << 16;

/// Whether the host architecture is supported
pub fn is_supported() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("sse4.1")
    }
    #[cfg(target_arch = "aarch64")]
    {
        true
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

fn cpu_name() -> String {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    format!("{} CPU ({cores} threads)", std::env::consts::ARCH)
}

/// Physical CPU devices (one, or none on unsupported architectures)
pub(crate) fn enumerate() -> Vec<PhysicalDevice> {
    if !is_supported() {
        return Vec::new();
    }
    vec![PhysicalDevice {
        device_type: DeviceType::Cpu,
        score: CPU_SCORE,
        name: cpu_name(),
        uuid: None,
        pci_address: None,
        backend_index: 0,
    }]
}
