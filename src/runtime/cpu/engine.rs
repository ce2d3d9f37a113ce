//! CPU engine, allocator and convolution kernel

use super::kernels::{self, Bias, ConvShape};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{Activation, ConvDesc, PostOp};
use crate::runtime::{Allocator, ConvKernel, DeviceCaps, DeviceId, Engine, TrackingAllocator};
use crate::tensor::{Storage, Tensor, TensorLayout};
use std::alloc::{Layout as AllocLayout, alloc_zeroed, dealloc};
#[cfg(feature = "rayon")]
use std::sync::Arc;

/// Alignment of every host allocation (AVX-512 friendly)
pub(super) const CPU_ALIGNMENT: usize = 64;

/// Host memory allocator
#[derive(Debug, Default)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn allocate(&self, byte_size: usize, _storage: Storage) -> Result<u64> {
        let layout = AllocLayout::from_size_align(byte_size, CPU_ALIGNMENT)
            .map_err(|_| Error::OutOfMemory { size: byte_size })?;
        // SAFETY: byte_size is non-zero (checked by Buffer::allocate).
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory { size: byte_size });
        }
        Ok(ptr as u64)
    }

    fn deallocate(&self, ptr: u64, byte_size: usize, _storage: Storage) {
        if ptr == 0 || byte_size == 0 {
            return;
        }
        if let Ok(layout) = AllocLayout::from_size_align(byte_size, CPU_ALIGNMENT) {
            // SAFETY: ptr came from allocate with the same layout.
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
    }
}

/// CPU engine: kernels run synchronously on the device's thread pool
pub struct CpuEngine {
    device_id: DeviceId,
    caps: DeviceCaps,
    allocator: TrackingAllocator<CpuAllocator>,
    #[cfg(feature = "rayon")]
    pool: Arc<rayon::ThreadPool>,
}

impl CpuEngine {
    pub(super) fn new(
        device_id: DeviceId,
        caps: DeviceCaps,
        #[cfg(feature = "rayon")] pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        Self {
            device_id,
            caps,
            allocator: TrackingAllocator::new(CpuAllocator),
            #[cfg(feature = "rayon")]
            pool,
        }
    }

    /// Run `f` inside the device's thread pool
    fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        #[cfg(feature = "rayon")]
        {
            self.pool.install(f)
        }
        #[cfg(not(feature = "rayon"))]
        {
            f()
        }
    }

    /// Peak host bytes allocated by this engine
    pub fn peak_bytes(&self) -> usize {
        self.allocator.peak_bytes()
    }
}

/// Borrow the f32 elements of a host tensor
fn host_slice(tensor: &Tensor) -> Result<&[f32]> {
    check_host_f32(tensor)?;
    // SAFETY: the tensor span was validated against its buffer and the CPU
    // engine only hands out host memory.
    Ok(unsafe {
        std::slice::from_raw_parts(tensor.ptr() as *const f32, tensor.desc().num_elements())
    })
}

/// Mutably borrow the f32 elements of a host tensor
///
/// The caller guarantees no other live slice overlaps `tensor`.
#[allow(clippy::mut_from_ref)]
fn host_slice_mut(tensor: &Tensor) -> Result<&mut [f32]> {
    check_host_f32(tensor)?;
    // SAFETY: as host_slice; overlap with inputs is rejected by the callers.
    Ok(unsafe {
        std::slice::from_raw_parts_mut(tensor.ptr() as *mut f32, tensor.desc().num_elements())
    })
}

fn check_host_f32(tensor: &Tensor) -> Result<()> {
    if tensor.desc().dtype() != DType::F32 {
        return Err(Error::unsupported_hardware(format!(
            "CPU kernels compute in f32, got {}",
            tensor.desc().dtype()
        )));
    }
    if !tensor.buffer().storage().is_host_accessible() {
        return Err(Error::invalid_argument("tensor", "tensor is not in host memory"));
    }
    if tensor.ptr() % std::mem::align_of::<f32>() as u64 != 0 {
        return Err(Error::invalid_argument("tensor", "tensor data is not f32 aligned"));
    }
    Ok(())
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

fn check_feature_map(arg: &'static str, tensor: &Tensor) -> Result<()> {
    if tensor.desc().layout() != TensorLayout::Chw {
        return Err(Error::unsupported_hardware(format!(
            "CPU kernels require Chw tensors, '{arg}' is {:?}",
            tensor.desc().layout()
        )));
    }
    Ok(())
}

impl Engine for CpuEngine {
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
            Storage::Host | Storage::Device | Storage::Managed => Ok(Storage::Host),
            Storage::Undefined => Err(Error::invalid_argument(
                "storage",
                "cannot allocate memory of undefined storage",
            )),
        }
    }

    fn pointer_storage(&self, _ptr: *const u8) -> Storage {
        Storage::Host
    }

    fn copy_to_device(&self, src: &[u8], dst: u64, dst_offset: usize) -> Result<()> {
        // SAFETY: Buffer checked the range; CPU addresses are host pointers.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                (dst as usize + dst_offset) as *mut u8,
                src.len(),
            );
        }
        Ok(())
    }

    fn copy_from_device(&self, src: u64, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        // SAFETY: Buffer checked the range; CPU addresses are host pointers.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (src as usize + src_offset) as *const u8,
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
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
        // SAFETY: callers pass ranges inside live buffers; regions may overlap.
        unsafe {
            std::ptr::copy(
                (src as usize + src_offset) as *const u8,
                (dst as usize + dst_offset) as *mut u8,
                byte_size,
            );
        }
        Ok(())
    }

    fn new_conv_kernel(&self, desc: &ConvDesc) -> Result<Box<dyn ConvKernel>> {
        if desc.src_desc.dtype() != DType::F32 {
            return Err(Error::unsupported_hardware(format!(
                "CPU convolution computes in f32, got {}",
                desc.src_desc.dtype()
            )));
        }
        if desc.src_desc.layout() != TensorLayout::Chw {
            return Err(Error::unsupported_hardware(format!(
                "CPU convolution requires Chw tensors, got {:?}",
                desc.src_desc.layout()
            )));
        }
        Ok(Box::new(CpuConvKernel {
            post_op: desc.post_op,
            activation: desc.activation,
            shape: ConvShape {
                c: desc.src_desc.c(),
                h: desc.src_desc.h(),
                w: desc.src_desc.w(),
                o: desc.weight_desc.o(),
                kh: desc.weight_desc.h(),
                kw: desc.weight_desc.w(),
            },
            full_bias: desc.has_full_bias(),
            weight: Vec::new(),
            bias: Vec::new(),
            #[cfg(feature = "rayon")]
            pool: self.pool.clone(),
        }))
    }

    fn submit_pool(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        check_feature_map("src", src)?;
        check_feature_map("dst", dst)?;
        check_disjoint(src, dst)?;
        let (h, w) = (src.desc().h(), src.desc().w());
        let s = host_slice(src)?;
        let d = host_slice_mut(dst)?;
        self.install(|| kernels::pool2x2(s, h, w, d));
        Ok(())
    }

    fn submit_upsample(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        check_feature_map("src", src)?;
        check_feature_map("dst", dst)?;
        check_disjoint(src, dst)?;
        let (h, w) = (src.desc().h(), src.desc().w());
        let s = host_slice(src)?;
        let d = host_slice_mut(dst)?;
        self.install(|| kernels::upsample2x(s, h, w, d));
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        // Kernels complete before submit returns
        Ok(())
    }
}

/// Convolution with weights repacked to OIHW when bound
struct CpuConvKernel {
    post_op: PostOp,
    activation: Activation,
    shape: ConvShape,
    full_bias: bool,
    weight: Vec<f32>,
    bias: Vec<f32>,
    #[cfg(feature = "rayon")]
    pool: Arc<rayon::ThreadPool>,
}

impl ConvKernel for CpuConvKernel {
    fn update_weight(&mut self, weight: &Tensor) -> Result<()> {
        let desc = weight.desc();
        let values = weight.read_f32()?;
        let (o, i, kh, kw) = (desc.o(), desc.i(), desc.h(), desc.w());
        let mut packed = Vec::with_capacity(values.len());
        for oc in 0..o {
            for ic in 0..i {
                for y in 0..kh {
                    for x in 0..kw {
                        packed.push(values[desc.offset_of(&[oc, ic, y, x])]);
                    }
                }
            }
        }
        self.weight = packed;
        Ok(())
    }

    fn update_bias(&mut self, bias: &Tensor) -> Result<()> {
        self.bias = bias.read_f32()?;
        Ok(())
    }

    fn submit(&self, src: &Tensor, _weight: &Tensor, _bias: &Tensor, dst: &Tensor) -> Result<()> {
        check_disjoint(src, dst)?;
        let s = host_slice(src)?;
        let d = host_slice_mut(dst)?;
        let bias = if self.full_bias {
            Bias::Full(&self.bias)
        } else {
            Bias::PerChannel(&self.bias)
        };
        let (shape, post_op, activation) = (self.shape, self.post_op, self.activation);
        #[cfg(feature = "rayon")]
        self.pool
            .install(|| kernels::conv2d(s, &self.weight, bias, shape, post_op, activation, d));
        #[cfg(not(feature = "rayon"))]
        kernels::conv2d(s, &self.weight, bias, shape, post_op, activation, d);
        Ok(())
    }
}
