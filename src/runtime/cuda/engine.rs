//! CUDA engine, allocator and convolution kernel

use cudarc::driver::safe::{CudaContext, CudaStream};
use cudarc::driver::sys::{self, CUresult};
use std::ffi::c_void;
use std::sync::Arc;

use super::context::{CudaContextGuard, check, is_cuda_context_valid};
use super::kernels::{self, ConvLaunch};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::ConvDesc;
use crate::runtime::{Allocator, ConvKernel, DeviceCaps, DeviceId, Engine, TrackingAllocator};
use crate::tensor::{Storage, Tensor, TensorLayout};

/// Log a CUDA memory operation failure
#[cold]
#[inline(never)]
fn log_cuda_memory_error(operation: &str, ptr: u64, result: CUresult) {
    tracing::warn!(
        operation,
        ptr = format_args!("0x{ptr:x}"),
        ?result,
        "CUDA memory operation failed"
    );
}

/// Stream-ordered allocator for device, managed and pinned host memory
///
/// Device memory uses `cuMemAllocAsync`/`cuMemFreeAsync` on the engine
/// stream. Managed and pinned host allocations are synchronous.
pub struct CudaAllocator {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl Allocator for CudaAllocator {
    fn allocate(&self, byte_size: usize, storage: Storage) -> Result<u64> {
        let _ctx = CudaContextGuard::make_current(self.context.cu_ctx())?;
        let mut ptr = 0u64;
        let rc = match storage {
            Storage::Device => {
                // SAFETY: context is current; ptr is a valid out pointer.
                let mut rc =
                    unsafe { sys::cuMemAllocAsync(&mut ptr, byte_size, self.stream.cu_stream()) };
                if rc != CUresult::CUDA_SUCCESS {
                    // Pending stream-ordered frees are released by a synchronize
                    let _ = self.stream.synchronize();
                    // SAFETY: as above.
                    rc = unsafe {
                        sys::cuMemAllocAsync(&mut ptr, byte_size, self.stream.cu_stream())
                    };
                }
                rc
            }
            Storage::Managed => {
                // SAFETY: context is current; ptr is a valid out pointer.
                unsafe {
                    sys::cuMemAllocManaged(
                        &mut ptr,
                        byte_size,
                        sys::CUmemAttach_flags::CU_MEM_ATTACH_GLOBAL as u32,
                    )
                }
            }
            Storage::Host => {
                let mut host: *mut c_void = std::ptr::null_mut();
                // SAFETY: context is current; host is a valid out pointer.
                let rc = unsafe { sys::cuMemAllocHost_v2(&mut host, byte_size) };
                ptr = host as u64;
                rc
            }
            Storage::Undefined => {
                return Err(Error::invalid_argument(
                    "storage",
                    "cannot allocate memory of undefined storage",
                ));
            }
        };

        match rc {
            CUresult::CUDA_SUCCESS => Ok(ptr),
            CUresult::CUDA_ERROR_OUT_OF_MEMORY => Err(Error::OutOfMemory { size: byte_size }),
            other => check(other, "cuMemAlloc").map(|_| ptr),
        }
    }

    fn deallocate(&self, ptr: u64, _byte_size: usize, storage: Storage) {
        if ptr == 0 {
            return;
        }
        let Ok(_ctx) = CudaContextGuard::make_current(self.context.cu_ctx()) else {
            return;
        };
        if !is_cuda_context_valid() {
            return;
        }
        // SAFETY: ptr came from allocate with the same storage.
        let result = unsafe {
            match storage {
                Storage::Device => sys::cuMemFreeAsync(ptr, self.stream.cu_stream()),
                Storage::Managed => {
                    let _ = self.stream.synchronize();
                    sys::cuMemFree_v2(ptr)
                }
                _ => {
                    let _ = self.stream.synchronize();
                    sys::cuMemFreeHost(ptr as *mut c_void)
                }
            }
        };
        if result != CUresult::CUDA_SUCCESS && result != CUresult::CUDA_ERROR_ILLEGAL_ADDRESS {
            log_cuda_memory_error("cuMemFree", ptr, result);
        }
    }
}

/// CUDA engine: one stream on the device's primary context
pub struct CudaEngine {
    device_id: DeviceId,
    device_index: usize,
    caps: DeviceCaps,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    allocator: TrackingAllocator<CudaAllocator>,
}

impl CudaEngine {
    pub(super) fn new(
        device_id: DeviceId,
        device_index: usize,
        caps: DeviceCaps,
        context: Arc<CudaContext>,
        stream: Arc<CudaStream>,
    ) -> Self {
        let allocator = TrackingAllocator::new(CudaAllocator {
            context: context.clone(),
            stream: stream.clone(),
        });
        Self {
            device_id,
            device_index,
            caps,
            context,
            stream,
            allocator,
        }
    }

    /// Stream all work of this engine is enqueued on
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// Peak bytes allocated by this engine
    pub fn peak_bytes(&self) -> usize {
        self.allocator.peak_bytes()
    }

    fn bind(&self) -> Result<CudaContextGuard> {
        CudaContextGuard::make_current(self.context.cu_ctx())
    }

    fn check_tensor(&self, arg: &'static str, tensor: &Tensor) -> Result<()> {
        let desc = tensor.desc();
        if desc.dtype() != self.caps.tensor_dtype {
            return Err(Error::unsupported_hardware(format!(
                "CUDA kernels compute in {}, '{arg}' is {}",
                self.caps.tensor_dtype,
                desc.dtype()
            )));
        }
        if desc.rank() == 3 && desc.layout() != TensorLayout::Chw {
            return Err(Error::unsupported_hardware(format!(
                "CUDA kernels require Chw tensors, '{arg}' is {:?}",
                desc.layout()
            )));
        }
        if tensor.buffer().storage() == Storage::Undefined {
            return Err(Error::invalid_argument(
                arg,
                "tensor memory is not visible to the CUDA device",
            ));
        }
        Ok(())
    }

    fn submit_resample(&self, base: &'static str, src: &Tensor, dst: &Tensor) -> Result<()> {
        self.check_tensor("src", src)?;
        self.check_tensor("dst", dst)?;
        check_disjoint(src, dst)?;
        let d = src.desc();
        let _ctx = self.bind()?;
        // SAFETY: both tensors were validated against their buffers and are disjoint.
        unsafe {
            kernels::launch_resample(
                &self.context,
                &self.stream,
                self.device_index,
                base,
                d.dtype(),
                src.ptr(),
                dst.ptr(),
                (d.c(), d.h(), d.w()),
                dst.desc().num_elements(),
            )
        }
    }
}

fn check_disjoint(src: &Tensor, dst: &Tensor) -> Result<()> {
    if src.overlaps(dst) {
        return Err(Error::invalid_argument(
            "dst",
            "destination overlaps the source tensor",
        ));
    }
    Ok(())
}

impl Engine for CudaEngine {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn allocator(&self) -> &dyn Allocator {
        &self.allocator
    }

    fn resolve_storage(&self, requested: Storage) -> Result<Storage> {
        match requested {
            Storage::Host | Storage::Device => Ok(requested),
            Storage::Managed if self.caps.managed_memory_supported => Ok(Storage::Managed),
            Storage::Managed => Err(Error::invalid_argument(
                "storage",
                "managed memory is not supported by this CUDA device",
            )),
            Storage::Undefined => Err(Error::invalid_argument(
                "storage",
                "cannot allocate memory of undefined storage",
            )),
        }
    }

    fn pointer_storage(&self, ptr: *const u8) -> Storage {
        let Ok(_ctx) = self.bind() else {
            return Storage::Undefined;
        };
        let addr = ptr as u64;

        let mut is_managed: u32 = 0;
        // SAFETY: the attribute is written into a properly sized out value.
        let rc = unsafe {
            sys::cuPointerGetAttribute(
                &mut is_managed as *mut u32 as *mut c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_IS_MANAGED,
                addr,
            )
        };
        if rc != CUresult::CUDA_SUCCESS {
            // Pageable memory the driver has never seen
            return Storage::Undefined;
        }
        if is_managed != 0 {
            return Storage::Managed;
        }

        let mut memory_type: u32 = 0;
        // SAFETY: as above.
        let rc = unsafe {
            sys::cuPointerGetAttribute(
                &mut memory_type as *mut u32 as *mut c_void,
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
                addr,
            )
        };
        if rc != CUresult::CUDA_SUCCESS {
            return Storage::Undefined;
        }
        if memory_type == sys::CUmemorytype::CU_MEMORYTYPE_DEVICE as u32 {
            Storage::Device
        } else if memory_type == sys::CUmemorytype::CU_MEMORYTYPE_HOST as u32 {
            Storage::Host
        } else {
            Storage::Undefined
        }
    }

    fn copy_to_device(&self, src: &[u8], dst: u64, dst_offset: usize) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let _ctx = self.bind()?;
        // SAFETY: Buffer checked the destination range.
        let rc = unsafe {
            sys::cuMemcpyHtoDAsync_v2(
                dst + dst_offset as u64,
                src.as_ptr() as *const c_void,
                src.len(),
                self.stream.cu_stream(),
            )
        };
        check(rc, "cuMemcpyHtoDAsync")?;
        // Source may be pageable and is released when this returns
        self.stream.synchronize()?;
        Ok(())
    }

    fn copy_from_device(&self, src: u64, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let _ctx = self.bind()?;
        // SAFETY: Buffer checked the source range.
        let rc = unsafe {
            sys::cuMemcpyDtoHAsync_v2(
                dst.as_mut_ptr() as *mut c_void,
                src + src_offset as u64,
                dst.len(),
                self.stream.cu_stream(),
            )
        };
        check(rc, "cuMemcpyDtoHAsync")?;
        self.stream.synchronize()?;
        Ok(())
    }

    fn copy_within_device(
        &self,
        src: u64,
        src_offset: usize,
        dst: u64,
        dst_offset: usize,
        byte_size: usize,
    ) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        let _ctx = self.bind()?;
        // SAFETY: callers pass disjoint ranges inside live buffers.
        let rc = unsafe {
            sys::cuMemcpyDtoDAsync_v2(
                dst + dst_offset as u64,
                src + src_offset as u64,
                byte_size,
                self.stream.cu_stream(),
            )
        };
        check(rc, "cuMemcpyDtoDAsync")
    }

    fn new_conv_kernel(&self, desc: &ConvDesc) -> Result<Box<dyn ConvKernel>> {
        let dtype = desc.src_desc.dtype();
        if dtype != self.caps.tensor_dtype {
            return Err(Error::unsupported_hardware(format!(
                "CUDA convolution computes in {}, got {dtype}",
                self.caps.tensor_dtype
            )));
        }
        if desc.src_desc.layout() != TensorLayout::Chw
            || desc.weight_desc.layout() != TensorLayout::Ohwi
        {
            return Err(Error::unsupported_hardware(format!(
                "CUDA convolution requires Chw tensors and Ohwi weights, got {:?} and {:?}",
                desc.src_desc.layout(),
                desc.weight_desc.layout()
            )));
        }
        Ok(Box::new(CudaConvKernel {
            context: self.context.clone(),
            stream: self.stream.clone(),
            device_index: self.device_index,
            dtype,
            launch: ConvLaunch {
                c: desc.src_desc.c(),
                h: desc.src_desc.h(),
                w: desc.src_desc.w(),
                o: desc.weight_desc.o(),
                kh: desc.weight_desc.h(),
                kw: desc.weight_desc.w(),
                post_op: desc.post_op,
                activation: desc.activation,
                full_bias: desc.has_full_bias(),
            },
        }))
    }

    fn submit_pool(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        self.submit_resample("pool2x2", src, dst)
    }

    fn submit_upsample(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        self.submit_resample("upsample2x", src, dst)
    }

    fn wait(&self) -> Result<()> {
        let _ctx = self.bind()?;
        self.stream.synchronize()?;
        Ok(())
    }
}

/// Direct convolution reading device-resident OHWI weights
struct CudaConvKernel {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    device_index: usize,
    dtype: DType,
    launch: ConvLaunch,
}

impl ConvKernel for CudaConvKernel {
    fn submit(&self, src: &Tensor, weight: &Tensor, bias: &Tensor, dst: &Tensor) -> Result<()> {
        check_disjoint(src, dst)?;
        let _ctx = CudaContextGuard::make_current(self.context.cu_ctx())?;
        // SAFETY: the node validated every tensor against the descriptor this
        // kernel was created from.
        unsafe {
            kernels::launch_conv2d(
                &self.context,
                &self.stream,
                self.device_index,
                self.dtype,
                src.ptr(),
                weight.ptr(),
                bias.ptr(),
                dst.ptr(),
                &self.launch,
            )
        }
    }
}
