//! Driver-API helpers: result checking and current-context management

use cudarc::driver::DriverError;
use cudarc::driver::sys::{self, CUcontext, CUresult};
use std::ptr;

use crate::error::Result;

/// Convert a raw driver status into a `Result`
#[inline]
pub(super) fn check(rc: CUresult, op: &'static str) -> Result<()> {
    if rc == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        tracing::debug!(?rc, op, "CUDA driver call failed");
        Err(DriverError(rc).into())
    }
}

/// Context current on the calling thread (null if none)
pub(super) fn current_context() -> Result<CUcontext> {
    let mut ctx: CUcontext = ptr::null_mut();
    // SAFETY: cuCtxGetCurrent only writes the out pointer.
    check(unsafe { sys::cuCtxGetCurrent(&mut ctx) }, "cuCtxGetCurrent")?;
    Ok(ctx)
}

/// Whether the calling thread still has a live context
///
/// Frees issued after the driver tore the context down are skipped; the
/// driver reclaims that memory itself.
pub(super) fn is_cuda_context_valid() -> bool {
    current_context().is_ok_and(|ctx| !ctx.is_null())
}

/// Raw context pointer that may cross threads
///
/// Contexts are process-wide driver objects; only the "current" binding is
/// per thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct RawContext(pub(super) CUcontext);

// SAFETY: a CUcontext handle is valid on any thread of the process.
unsafe impl Send for RawContext {}
// SAFETY: as above; the handle is never dereferenced on the host.
unsafe impl Sync for RawContext {}

/// Make a context current, restoring the previous one on drop
pub(super) struct CudaContextGuard {
    prev_ctx: CUcontext,
    restore: bool,
}

impl CudaContextGuard {
    pub(super) fn make_current(target: CUcontext) -> Result<Self> {
        let prev_ctx = current_context()?;
        if prev_ctx != target {
            // SAFETY: target is a live context owned by the calling device.
            check(unsafe { sys::cuCtxSetCurrent(target) }, "cuCtxSetCurrent")?;
        }
        Ok(Self {
            prev_ctx,
            restore: prev_ctx != target,
        })
    }
}

impl Drop for CudaContextGuard {
    fn drop(&mut self) {
        if self.restore {
            // SAFETY: prev_ctx was current on this thread when the guard was made.
            let rc = unsafe { sys::cuCtxSetCurrent(self.prev_ctx) };
            if rc != CUresult::CUDA_SUCCESS {
                tracing::warn!(?rc, "cuCtxSetCurrent restore failed");
            }
        }
    }
}
