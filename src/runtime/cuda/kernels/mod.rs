//! CUDA kernel loading and launching
//!
//! PTX is compiled from `unet.cu` by `build.rs`. The module is loaded on first
//! use and cached per device; launchers wrap the argument packing for each
//! kernel family.

use cudarc::driver::PushKernelArg;
use cudarc::driver::safe::{CudaContext, CudaFunction, CudaModule, CudaStream, LaunchConfig};
use cudarc::nvrtc::Ptx;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{Activation, PostOp};

/// Directory containing compiled PTX files (set by build.rs)
const KERNEL_DIR: &str = env!("CUDA_KERNEL_DIR");

/// Module holding every U-Net operator kernel
pub const UNET_MODULE: &str = "unet";

/// Threads per block for the one-thread-per-element kernels
pub const BLOCK_SIZE: u32 = 256;

/// Loaded modules keyed by (device_index, module_name)
static MODULE_CACHE: OnceLock<Mutex<HashMap<(usize, &'static str), Arc<CudaModule>>>> =
    OnceLock::new();

fn load_ptx(name: &str) -> Ptx {
    Ptx::from_file(format!("{KERNEL_DIR}/{name}.ptx"))
}

/// Get or load a CUDA module from PTX
pub fn get_or_load_module(
    context: &Arc<CudaContext>,
    device_index: usize,
    module_name: &'static str,
) -> Result<Arc<CudaModule>> {
    let cache = MODULE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().map_err(|e| {
        Error::Internal(format!(
            "Failed to acquire module cache lock (Mutex poisoned): {e}"
        ))
    })?;

    let key = (device_index, module_name);
    if let Some(module) = guard.get(&key) {
        return Ok(module.clone());
    }

    let module = context.load_module(load_ptx(module_name)).map_err(|e| {
        Error::unsupported_hardware(format!(
            "Failed to load CUDA module '{module_name}': {e:?}. \
             Ensure CUDA kernels were compiled correctly by build.rs."
        ))
    })?;
    guard.insert(key, module.clone());
    Ok(module)
}

/// Look up a kernel function in a loaded module
pub fn get_kernel_function(module: &Arc<CudaModule>, name: &str) -> Result<CudaFunction> {
    module.load_function(name).map_err(|e| {
        Error::Internal(format!(
            "Failed to get kernel '{name}': {e:?}. \
             Check that the kernel name matches the CUDA source."
        ))
    })
}

/// Kernel symbol for a dtype, e.g. `conv2d_f16`
pub fn kernel_name(base: &str, dtype: DType) -> String {
    format!("{base}_{}", dtype.name())
}

/// One thread per element, 1D grid
#[inline]
pub fn elementwise_launch_config(numel: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: ((numel as u32).div_ceil(BLOCK_SIZE), 1, 1),
        block_dim: (BLOCK_SIZE, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Geometry of one convolution launch
#[derive(Copy, Clone, Debug)]
pub struct ConvLaunch {
    /// Input channels
    pub c: usize,
    /// Input height
    pub h: usize,
    /// Input width
    pub w: usize,
    /// Output channels
    pub o: usize,
    /// Kernel height
    pub kh: usize,
    /// Kernel width
    pub kw: usize,
    /// Fused post-operation
    pub post_op: PostOp,
    /// Output activation
    pub activation: Activation,
    /// Bias has the destination dims instead of one value per channel
    pub full_bias: bool,
}

impl ConvLaunch {
    fn dst_elements(&self) -> usize {
        let (h, w) = match self.post_op {
            PostOp::None => (self.h, self.w),
            PostOp::Pool => (self.h / 2, self.w / 2),
            PostOp::Upsample => (self.h * 2, self.w * 2),
        };
        self.o * h * w
    }

    fn post_op_code(&self) -> u32 {
        match self.post_op {
            PostOp::None => 0,
            PostOp::Pool => 1,
            PostOp::Upsample => 2,
        }
    }
}

/// Launch the fused convolution kernel
///
/// # Safety
///
/// All pointers must address device-visible memory of the sizes implied by
/// `shape` and `dtype`; `dst` must not overlap `src`.
#[allow(clippy::too_many_arguments)]
pub unsafe fn launch_conv2d(
    context: &Arc<CudaContext>,
    stream: &CudaStream,
    device_index: usize,
    dtype: DType,
    src: u64,
    weight: u64,
    bias: u64,
    dst: u64,
    shape: &ConvLaunch,
) -> Result<()> {
    let total = shape.dst_elements();
    if total == 0 {
        return Ok(());
    }

    let module = get_or_load_module(context, device_index, UNET_MODULE)?;
    let func = get_kernel_function(&module, &kernel_name("conv2d", dtype))?;
    let cfg = elementwise_launch_config(total);

    let c = shape.c as u32;
    let h = shape.h as u32;
    let w = shape.w as u32;
    let o = shape.o as u32;
    let kh = shape.kh as u32;
    let kw = shape.kw as u32;
    let post_op = shape.post_op_code();
    let relu = u32::from(shape.activation == Activation::Relu);
    let full_bias = u32::from(shape.full_bias);

    let mut builder = stream.launch_builder(&func);
    builder.arg(&src);
    builder.arg(&weight);
    builder.arg(&bias);
    builder.arg(&dst);
    builder.arg(&c);
    builder.arg(&h);
    builder.arg(&w);
    builder.arg(&o);
    builder.arg(&kh);
    builder.arg(&kw);
    builder.arg(&post_op);
    builder.arg(&relu);
    builder.arg(&full_bias);

    // SAFETY: argument list matches the conv2d kernel signature; pointer
    // validity is the caller's contract.
    unsafe { builder.launch(cfg) }
        .map_err(|e| Error::Internal(format!("CUDA conv2d kernel launch failed: {e:?}")))?;
    Ok(())
}

/// Launch a `(src, dst, c, h, w)` resampling kernel (`pool2x2` or `upsample2x`)
///
/// # Safety
///
/// `src` holds `c*h*w` elements and `dst` the resampled count; they must not overlap.
#[allow(clippy::too_many_arguments)]
pub unsafe fn launch_resample(
    context: &Arc<CudaContext>,
    stream: &CudaStream,
    device_index: usize,
    base: &'static str,
    dtype: DType,
    src: u64,
    dst: u64,
    (c, h, w): (usize, usize, usize),
    dst_elements: usize,
) -> Result<()> {
    if dst_elements == 0 {
        return Ok(());
    }

    let module = get_or_load_module(context, device_index, UNET_MODULE)?;
    let func = get_kernel_function(&module, &kernel_name(base, dtype))?;
    let cfg = elementwise_launch_config(dst_elements);

    let (c, h, w) = (c as u32, h as u32, w as u32);
    let mut builder = stream.launch_builder(&func);
    builder.arg(&src);
    builder.arg(&dst);
    builder.arg(&c);
    builder.arg(&h);
    builder.arg(&w);

    // SAFETY: as launch_conv2d.
    unsafe { builder.launch(cfg) }
        .map_err(|e| Error::Internal(format!("CUDA {base} kernel launch failed: {e:?}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_name() {
        assert_eq!(kernel_name("conv2d", DType::F16), "conv2d_f16");
        assert_eq!(kernel_name("pool2x2", DType::F32), "pool2x2_f32");
    }

    #[test]
    fn test_launch_config_covers_elements() {
        let cfg = elementwise_launch_config(1000);
        assert_eq!(cfg.grid_dim.0 * cfg.block_dim.0 >= 1000, true);
        assert_eq!(cfg.grid_dim.0, 4);
    }

    #[test]
    fn test_conv_dst_elements() {
        let shape = ConvLaunch {
            c: 3,
            h: 16,
            w: 8,
            o: 4,
            kh: 3,
            kw: 3,
            post_op: PostOp::Pool,
            activation: Activation::Relu,
            full_bias: false,
        };
        assert_eq!(shape.dst_elements(), 4 * 8 * 4);
        let up = ConvLaunch {
            post_op: PostOp::Upsample,
            ..shape
        };
        assert_eq!(up.dst_elements(), 4 * 32 * 16);
    }
}
