//! WebGPU backend
//!
//! Runs the operator shaders through `wgpu` on Vulkan, Metal or DX12 adapters.
//! Feature maps are f32 CHW; buffer addresses are registry handles rather
//! than pointers, so all host access goes through staged copies.

mod device;
mod engine;
mod shaders;

pub use device::WgpuDevice;
pub use engine::{WgpuAllocator, WgpuEngine};

use super::physical::PhysicalDevice;
use super::traits::DeviceType;

/// Native backends probed for adapters (GL is excluded to avoid duplicates)
const BACKENDS: wgpu::Backends = wgpu::Backends::PRIMARY;

/// Score of an adapter in cross-backend ranking, `None` if unsupported
pub fn score(device_type: wgpu::DeviceType, index: usize) -> Option<u32> {
    let base: u32 = match device_type {
        wgpu::DeviceType::DiscreteGpu => 10 << 16,
        wgpu::DeviceType::IntegratedGpu => 9 << 16,
        wgpu::DeviceType::VirtualGpu => 8 << 16,
        wgpu::DeviceType::Cpu | wgpu::DeviceType::Other => return None,
    };
    Some(base - 1 - index as u32)
}

/// All adapters in a stable order; device indices refer to this list
pub(crate) async fn enumerate_adapters() -> Vec<wgpu::Adapter> {
    wgpu::Instance::default().enumerate_adapters(BACKENDS).await
}

/// Physical WebGPU devices with a recognized GPU type
pub(crate) fn enumerate() -> Vec<PhysicalDevice> {
    let adapters = match std::panic::catch_unwind(|| pollster::block_on(enumerate_adapters())) {
        Ok(adapters) => adapters,
        Err(_) => {
            tracing::debug!("WebGPU adapter enumeration failed");
            return Vec::new();
        }
    };

    adapters
        .iter()
        .enumerate()
        .filter_map(|(index, adapter)| {
            let info = adapter.get_info();
            let Some(score) = score(info.device_type, index) else {
                tracing::debug!(
                    adapter = %info.name,
                    device_type = ?info.device_type,
                    "Skipping non-GPU WebGPU adapter"
                );
                return None;
            };
            Some(PhysicalDevice {
                device_type: DeviceType::Wgpu,
                score,
                name: info.name,
                uuid: None,
                pci_address: info.device_pci_bus_id.parse().ok(),
                backend_index: index,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_by_adapter_type() {
        let discrete = score(wgpu::DeviceType::DiscreteGpu, 0).unwrap();
        let integrated = score(wgpu::DeviceType::IntegratedGpu, 0).unwrap();
        let virt = score(wgpu::DeviceType::VirtualGpu, 0).unwrap();
        assert_eq!(discrete, (10 << 16) - 1);
        assert!(discrete > integrated && integrated > virt);
        assert!(virt > 1 << 16);
        assert!(score(wgpu::DeviceType::Cpu, 0).is_none());
        assert!(score(wgpu::DeviceType::Other, 0).is_none());
    }

    #[test]
    fn test_enumerate_skips_software_adapters() {
        for device in enumerate() {
            assert_eq!(device.device_type, DeviceType::Wgpu);
            assert!(device.score >= (8 << 16) - 64);
        }
    }
}
