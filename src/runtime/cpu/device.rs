//! CPU device implementation

use super::engine::{CPU_ALIGNMENT, CpuEngine};
use crate::dtype::DType;
use crate::error::Result;
#[cfg(feature = "rayon")]
use crate::error::Error;
use crate::runtime::{
    ActivationFlag, Device, DeviceCaps, DeviceConfig, DeviceId, DeviceType, Engine,
    ExternalMemoryTypes,
};
use crate::tensor::{Storage, TensorLayout};
use std::sync::Arc;

/// The host CPU as a compute device
pub struct CpuDevice {
    id: DeviceId,
    name: String,
    caps: DeviceCaps,
    config: DeviceConfig,
    engines: Vec<Arc<dyn Engine>>,
    active: ActivationFlag,
}

/// Capabilities of the CPU backend
pub(super) fn cpu_caps() -> DeviceCaps {
    DeviceCaps {
        tensor_layout: TensorLayout::Chw,
        weight_layout: TensorLayout::Oihw,
        tensor_dtype: DType::F32,
        block_c: 1,
        buffer_alignment: CPU_ALIGNMENT,
        max_allocation_byte_size: isize::MAX as usize,
        external_memory_types: ExternalMemoryTypes::NONE,
        managed_memory_supported: true,
        fused_post_ops: false,
        default_storage: Storage::Host,
    }
}

impl CpuDevice {
    /// Create a CPU device with its own worker pool
    pub fn create(config: DeviceConfig) -> Result<Arc<dyn Device>> {
        let id = DeviceId::new();
        let caps = cpu_caps();

        #[cfg(feature = "rayon")]
        let engine = {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads.unwrap_or(0))
                .thread_name(|i| format!("denoise-cpu-{i}"))
                .build()
                .map_err(|e| Error::backend(format!("failed to create CPU thread pool: {e}")))?;
            CpuEngine::new(id, caps.clone(), Arc::new(pool))
        };
        #[cfg(not(feature = "rayon"))]
        let engine = CpuEngine::new(id, caps.clone());

        let name = super::cpu_name();
        if config.verbose >= 1 {
            tracing::info!(
                device = %name,
                threads = config.num_threads.unwrap_or(0),
                "CPU device created"
            );
        }
        Ok(Arc::new(Self {
            id,
            name,
            caps,
            config,
            engines: vec![Arc::new(engine)],
            active: ActivationFlag::default(),
        }))
    }
}

impl Device for CpuDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
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
        // No ambient backend state on the host
        self.active.enter(&self.name)
    }

    fn end(&self) {
        self.active.exit();
    }

    fn is_active(&self) -> bool {
        self.active.is_set()
    }
}
