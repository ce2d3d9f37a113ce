//! Engine trait: the ordered work stream of a device

use super::device::{DeviceCaps, DeviceId};
use crate::error::Result;
use crate::graph::ConvDesc;
use crate::runtime::Allocator;
use crate::tensor::{Storage, Tensor};

/// Ordered stream of asynchronous operations on one device
///
/// Operations submitted to one engine execute in submission order. Operations
/// on different engines have no ordering guarantee unless the caller waits.
/// [`wait`](Engine::wait) is the only blocking primitive; transfers that return
/// data to the host complete before returning.
///
/// Device-storage addresses passed to the copy methods are whatever the
/// backend's allocator returned: raw device pointers on CUDA, registry handles
/// on WebGPU.
pub trait Engine: Send + Sync {
    /// Device that owns this engine
    fn device_id(&self) -> DeviceId;

    /// Capabilities of the owning device
    fn caps(&self) -> &DeviceCaps;

    /// Allocator for this engine's memory
    fn allocator(&self) -> &dyn Allocator;

    /// Storage actually used for a requested storage class
    ///
    /// Fails with `InvalidArgument` if the backend cannot provide it.
    fn resolve_storage(&self, requested: Storage) -> Result<Storage>;

    /// Whether addresses in `storage` are opaque handles rather than pointers
    fn is_handle_storage(&self, _storage: Storage) -> bool {
        false
    }

    /// Classify a caller pointer (`Undefined` if the backend cannot tell)
    fn pointer_storage(&self, ptr: *const u8) -> Storage;

    /// Copy host bytes into device storage at `dst + dst_offset`
    fn copy_to_device(&self, src: &[u8], dst: u64, dst_offset: usize) -> Result<()>;

    /// Copy device storage at `src + src_offset` into host bytes
    fn copy_from_device(&self, src: u64, src_offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy between two device-storage regions
    fn copy_within_device(
        &self,
        src: u64,
        src_offset: usize,
        dst: u64,
        dst_offset: usize,
        byte_size: usize,
    ) -> Result<()>;

    /// Create the backend kernel for a validated convolution descriptor
    fn new_conv_kernel(&self, desc: &ConvDesc) -> Result<Box<dyn ConvKernel>>;

    /// Enqueue 2x2 max pooling from `src` into `dst`
    fn submit_pool(&self, src: &Tensor, dst: &Tensor) -> Result<()>;

    /// Enqueue 2x nearest-neighbor upsampling from `src` into `dst`
    fn submit_upsample(&self, src: &Tensor, dst: &Tensor) -> Result<()>;

    /// Block until all submitted work has completed
    fn wait(&self) -> Result<()>;
}

/// Backend state of one convolution node
///
/// The `update_*` hooks run after a node setter has accepted a tensor. They
/// may prepare backend-private state (for example repacked weights) and must
/// tolerate being called any number of times with different tensors.
pub trait ConvKernel: Send + Sync {
    /// Source tensor was bound
    fn update_src(&mut self, _src: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Weight tensor was bound
    fn update_weight(&mut self, _weight: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Bias tensor was bound
    fn update_bias(&mut self, _bias: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Destination tensor was bound
    fn update_dst(&mut self, _dst: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Enqueue the convolution
    fn submit(&self, src: &Tensor, weight: &Tensor, bias: &Tensor, dst: &Tensor) -> Result<()>;
}
