//! CUDA device implementation

use cudarc::driver::result;
use cudarc::driver::safe::CudaContext;
use cudarc::driver::sys::{self, CUdevice_attribute};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::context::{CudaContextGuard, RawContext, check, current_context};
use super::engine::CudaEngine;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::{
    ActivationFlag, Device, DeviceCaps, DeviceConfig, DeviceId, DeviceType, Engine,
    ExternalMemoryTypes,
};
use crate::tensor::{Storage, TensorLayout};

/// Required alignment of tensor offsets within a CUDA buffer
pub(super) const CUDA_ALIGNMENT: usize = 256;

/// Channel blocking of CUDA feature maps
const CUDA_BLOCK_C: usize = 8;

/// An NVIDIA GPU driven through its primary context and one stream
pub struct CudaDevice {
    id: DeviceId,
    index: usize,
    name: String,
    compute_capability: (u32, u32),
    context: Arc<CudaContext>,
    caps: DeviceCaps,
    config: DeviceConfig,
    engines: Vec<Arc<dyn Engine>>,
    active: ActivationFlag,
    /// Context that was current before `begin`, per activating thread
    saved: Mutex<HashMap<ThreadId, RawContext>>,
}

/// Read an integer device attribute
pub(super) fn attribute(ordinal: i32, attrib: CUdevice_attribute) -> Result<i32> {
    let device = result::device::get(ordinal)?;
    // SAFETY: device is a valid handle returned by cuDeviceGet.
    Ok(unsafe { result::device::get_attribute(device, attrib) }?)
}

/// Compute capability as (major, minor), e.g. (8, 6) for sm_86
pub(super) fn compute_capability(ordinal: i32) -> Result<(u32, u32)> {
    let major = attribute(
        ordinal,
        CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
    )?;
    let minor = attribute(
        ordinal,
        CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
    )?;
    Ok((major as u32, minor as u32))
}

fn external_memory_types() -> ExternalMemoryTypes {
    if cfg!(windows) {
        ExternalMemoryTypes::OPAQUE_WIN32.union(ExternalMemoryTypes::OPAQUE_WIN32_KMT)
    } else {
        ExternalMemoryTypes::OPAQUE_FD
    }
}

impl CudaDevice {
    /// Create a device on CUDA ordinal `index`
    ///
    /// The calling thread's current context is left as it was.
    pub fn create(index: usize, config: DeviceConfig) -> Result<Arc<dyn Device>> {
        Ok(Arc::new(Self::new(index, config)?))
    }

    fn new(index: usize, config: DeviceConfig) -> Result<Self> {
        let ordinal = index as i32;
        let (major, minor) = compute_capability(ordinal)?;
        if major < super::MIN_COMPUTE_CAPABILITY.0 {
            return Err(Error::unsupported_hardware(format!(
                "CUDA device {index} has compute capability {major}.{minor}, \
                 at least {}.{} is required",
                super::MIN_COMPUTE_CAPABILITY.0,
                super::MIN_COMPUTE_CAPABILITY.1
            )));
        }

        let previous = current_context()?;
        let created = CudaContext::new(index).and_then(|ctx| {
            let stream = ctx.new_stream()?;
            Ok((ctx, stream))
        });
        // SAFETY: restores whatever the caller had current (possibly null).
        check(unsafe { sys::cuCtxSetCurrent(previous) }, "cuCtxSetCurrent")?;
        let (context, stream) = created?;

        let device = result::device::get(ordinal)?;
        let name = result::device::get_name(device)?;
        // SAFETY: device is a valid handle.
        let total_mem = unsafe { result::device::total_mem(device) }?;
        let managed = attribute(ordinal, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY)?;

        let id = DeviceId::new();
        let caps = DeviceCaps {
            tensor_layout: TensorLayout::Chw,
            weight_layout: TensorLayout::Ohwi,
            tensor_dtype: DType::F16,
            block_c: CUDA_BLOCK_C,
            buffer_alignment: CUDA_ALIGNMENT,
            max_allocation_byte_size: total_mem,
            external_memory_types: external_memory_types(),
            managed_memory_supported: managed != 0,
            fused_post_ops: true,
            default_storage: Storage::Device,
        };
        let engine = CudaEngine::new(id, index, caps.clone(), context.clone(), stream);

        if config.verbose >= 1 {
            tracing::info!(
                device = %name,
                index,
                compute_capability = format_args!("{major}.{minor}"),
                total_mem,
                "CUDA device created"
            );
        }
        Ok(Self {
            id,
            index,
            name,
            compute_capability: (major, minor),
            context,
            caps,
            config,
            engines: vec![Arc::new(engine)],
            active: ActivationFlag::default(),
            saved: Mutex::new(HashMap::new()),
        })
    }

    /// CUDA ordinal of this device
    pub fn index(&self) -> usize {
        self.index
    }

    /// Compute capability as (major, minor)
    pub fn compute_capability(&self) -> (u32, u32) {
        self.compute_capability
    }

    /// Free and total device memory in bytes
    pub fn memory_info(&self) -> Result<(usize, usize)> {
        let _ctx = CudaContextGuard::make_current(self.context.cu_ctx())?;
        Ok(result::mem_get_info()?)
    }
}

impl Device for CudaDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
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
        self.active.enter(&self.name)?;
        let switched = current_context().and_then(|previous| {
            // SAFETY: the context is retained by self.context.
            check(
                unsafe { sys::cuCtxSetCurrent(self.context.cu_ctx()) },
                "cuCtxSetCurrent",
            )?;
            Ok(previous)
        });
        match switched {
            Ok(previous) => {
                self.saved
                    .lock()
                    .insert(thread::current().id(), RawContext(previous));
                Ok(())
            }
            Err(err) => {
                self.active.exit();
                Err(err)
            }
        }
    }

    fn end(&self) {
        let saved = self.saved.lock().remove(&thread::current().id());
        if let Some(RawContext(previous)) = saved {
            // SAFETY: previous was current on this thread before begin.
            let rc = unsafe { sys::cuCtxSetCurrent(previous) };
            if rc != sys::CUresult::CUDA_SUCCESS {
                tracing::warn!(?rc, "cuCtxSetCurrent restore failed");
            }
        }
        self.active.exit();
    }

    fn is_active(&self) -> bool {
        self.active.is_set()
    }
}
