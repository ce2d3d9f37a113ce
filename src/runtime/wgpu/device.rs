//! WebGPU device implementation

use std::sync::Arc;

use super::engine::WgpuEngine;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::{
    ActivationFlag, Device, DeviceCaps, DeviceConfig, DeviceId, DeviceType, Engine,
    ExternalMemoryTypes,
};
use crate::tensor::{Storage, TensorLayout};

/// A GPU adapter driven through WebGPU (Vulkan, Metal or DX12)
pub struct WgpuDevice {
    id: DeviceId,
    name: String,
    backend: wgpu::Backend,
    caps: DeviceCaps,
    config: DeviceConfig,
    engines: Vec<Arc<dyn Engine>>,
    active: ActivationFlag,
}

impl WgpuDevice {
    /// Create a device on adapter `index` of [`super::enumerate_adapters`]
    pub fn create(index: usize, config: DeviceConfig) -> Result<Arc<dyn Device>> {
        let mut adapters = pollster::block_on(super::enumerate_adapters());
        if index >= adapters.len() {
            return Err(Error::unsupported_hardware(format!(
                "WebGPU adapter {index} not found ({} available)",
                adapters.len()
            )));
        }
        let adapter = adapters.swap_remove(index);
        let info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("denoise WebGPU device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::default(),
        }))
        .map_err(|e| Error::backend(format!("WebGPU device request failed: {e}")))?;

        let max_buffer_size = limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size));
        let id = DeviceId::new();
        let caps = DeviceCaps {
            tensor_layout: TensorLayout::Chw,
            weight_layout: TensorLayout::Oihw,
            tensor_dtype: DType::F32,
            block_c: 1,
            buffer_alignment: limits.min_storage_buffer_offset_alignment as usize,
            max_allocation_byte_size: max_buffer_size as usize,
            external_memory_types: ExternalMemoryTypes::NONE,
            managed_memory_supported: false,
            fused_post_ops: true,
            default_storage: Storage::Device,
        };
        let engine = WgpuEngine::new(
            id,
            caps.clone(),
            Arc::new(device),
            Arc::new(queue),
            max_buffer_size,
        );

        if config.verbose >= 1 {
            tracing::info!(
                device = %info.name,
                backend = ?info.backend,
                device_type = ?info.device_type,
                max_buffer_size,
                "WebGPU device created"
            );
        }
        Ok(Arc::new(Self {
            id,
            name: info.name,
            backend: info.backend,
            caps,
            config,
            engines: vec![Arc::new(engine)],
            active: ActivationFlag::default(),
        }))
    }

    /// Native graphics API behind this adapter
    pub fn backend(&self) -> wgpu::Backend {
        self.backend
    }
}

impl Device for WgpuDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Wgpu
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn engines(&self) -> &[Arc<dyn Engine>] {
        &self.engines
    }

    fn begin(&self) -> Result<()> {
        // WebGPU has no thread-current device state
        self.active.enter(&self.name)
    }

    fn end(&self) {
        self.active.exit();
    }

    fn is_active(&self) -> bool {
        self.active.is_set()
    }
}
