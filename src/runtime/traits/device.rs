//! Device trait: one compute context bound to a physical device

use super::engine::Engine;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{ConvDesc, ConvNode, PoolDesc, PoolNode, UpsampleDesc, UpsampleNode};
use crate::tensor::{Buffer, Storage, Tensor, TensorDesc, TensorLayout};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for unique device IDs
static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a created device
///
/// IDs are unique within a process lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Create a new unique device ID
    #[inline]
    pub(crate) fn new() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Backend family of a device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Host CPU
    Cpu,
    /// NVIDIA GPU through the CUDA driver API
    Cuda,
    /// GPU through WebGPU (Vulkan, Metal, DX12)
    Wgpu,
}

impl DeviceType {
    /// Short lowercase name
    pub const fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Wgpu => "wgpu",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" => Ok(DeviceType::Cuda),
            "wgpu" | "webgpu" => Ok(DeviceType::Wgpu),
            other => Err(Error::invalid_argument(
                "device_type",
                format!("unknown device type '{other}'"),
            )),
        }
    }
}

/// Bit set of external memory handle types a device can import
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ExternalMemoryTypes(u32);

impl ExternalMemoryTypes {
    /// No import support
    pub const NONE: Self = Self(0);
    /// POSIX file descriptor
    pub const OPAQUE_FD: Self = Self(1 << 0);
    /// Linux dma-buf file descriptor
    pub const DMA_BUF: Self = Self(1 << 1);
    /// Win32 NT handle
    pub const OPAQUE_WIN32: Self = Self(1 << 2);
    /// Win32 KMT handle
    pub const OPAQUE_WIN32_KMT: Self = Self(1 << 3);

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every type in `other` is supported
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two sets
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Capabilities discovered when a device is initialized
#[derive(Clone, Debug)]
pub struct DeviceCaps {
    /// Layout of feature-map tensors
    pub tensor_layout: TensorLayout,
    /// Layout of convolution weights
    pub weight_layout: TensorLayout,
    /// Native compute element type
    pub tensor_dtype: DType,
    /// Channel counts are padded to a multiple of this
    pub block_c: usize,
    /// Required alignment of tensor byte offsets within a buffer
    pub buffer_alignment: usize,
    /// Largest single allocation the backend supports
    pub max_allocation_byte_size: usize,
    /// Importable external memory handle types
    pub external_memory_types: ExternalMemoryTypes,
    /// Whether device memory can be mapped through host staging
    pub managed_memory_supported: bool,
    /// Whether convolutions execute pool/upsample post-ops in the same kernel
    pub fused_post_ops: bool,
    /// Storage used for buffers allocated without an explicit storage
    pub default_storage: Storage,
}

/// Runtime configuration of a device
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Verbosity level: 0 quiet, 1 device info, 2 per-tile progress
    pub verbose: u32,
    /// CPU worker threads (`None` uses all cores)
    pub num_threads: Option<usize>,
}

impl DeviceConfig {
    /// Configuration from `DENOISE_VERBOSE` and `DENOISE_NUM_THREADS`
    pub fn from_env() -> Self {
        let parse = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
        };
        Self {
            verbose: parse("DENOISE_VERBOSE").unwrap_or(0) as u32,
            num_threads: parse("DENOISE_NUM_THREADS").filter(|&n| n > 0),
        }
    }

    /// Set the verbosity level
    pub fn with_verbose(mut self, verbose: u32) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the CPU worker thread count
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }
}

/// A compute context bound to exactly one physical device
pub trait Device: Send + Sync {
    /// Unique identifier for this device
    fn id(&self) -> DeviceId;

    /// Backend family
    fn device_type(&self) -> DeviceType;

    /// Human-readable name of the physical device
    fn name(&self) -> &str;

    /// Capabilities discovered at initialization
    fn caps(&self) -> &DeviceCaps;

    /// Configuration the device was created with
    fn config(&self) -> &DeviceConfig;

    /// Engines owned by this device (at least one)
    fn engines(&self) -> &[Arc<dyn Engine>];

    /// Make this device current for the calling thread, saving the previous state
    ///
    /// Fails with `InvalidOperation` if the device is already active. Use
    /// [`scoped_activate`](trait.Device.html#method.scoped_activate) instead of
    /// calling this directly.
    fn begin(&self) -> Result<()>;

    /// Restore the state saved by [`begin`](Device::begin)
    fn end(&self);

    /// Whether the device is active on the calling thread
    fn is_active(&self) -> bool;

    /// Block until all work queued on every engine has completed
    fn wait(&self) -> Result<()> {
        for engine in self.engines() {
            engine.wait()?;
        }
        Ok(())
    }

    /// Bytes currently allocated by this device
    fn allocated_bytes(&self) -> usize {
        self.engines()
            .iter()
            .map(|e| e.allocator().allocated_bytes())
            .sum()
    }
}

/// Guard returned by `scoped_activate`; restores the previous device state on drop
///
/// Activation belongs to the thread that entered it, so the guard is not `Send`.
#[must_use = "the device is deactivated when the guard is dropped"]
pub struct ScopedActivation<'a> {
    device: &'a dyn Device,
    _thread: PhantomData<*const ()>,
}

impl fmt::Debug for ScopedActivation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedActivation")
            .field("device", &self.device.name())
            .finish()
    }
}

impl Drop for ScopedActivation<'_> {
    fn drop(&mut self) {
        self.device.end();
    }
}

impl fmt::Debug for dyn Device + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("type", &self.device_type())
            .field("name", &self.name())
            .finish()
    }
}

impl dyn Device + '_ {
    /// Activate this device until the returned guard is dropped
    pub fn scoped_activate(&self) -> Result<ScopedActivation<'_>> {
        self.begin()?;
        Ok(ScopedActivation {
            device: self,
            _thread: PhantomData,
        })
    }

    /// Activate unless already active; `None` means an outer scope owns activation
    pub(crate) fn ensure_active(&self) -> Result<Option<ScopedActivation<'_>>> {
        if self.is_active() {
            Ok(None)
        } else {
            self.scoped_activate().map(Some)
        }
    }

    /// Primary engine
    pub fn engine(&self) -> &Arc<dyn Engine> {
        // Every backend constructs its device with at least one engine
        &self.engines()[0]
    }

    /// Allocate an owned buffer in the default storage
    pub fn new_buffer(&self, byte_size: usize) -> Result<Buffer> {
        self.new_buffer_with_storage(byte_size, self.caps().default_storage)
    }

    /// Allocate an owned buffer in the given storage
    pub fn new_buffer_with_storage(&self, byte_size: usize, storage: Storage) -> Result<Buffer> {
        let buffer = Buffer::allocate(self.engine(), byte_size, storage)?;
        if self.config().verbose >= 3 {
            tracing::debug!(byte_size, storage = ?buffer.storage(), "Buffer allocated");
        }
        Ok(buffer)
    }

    /// Wrap caller memory in a shared buffer; storage is inferred by probing `ptr`
    ///
    /// # Safety
    /// `ptr` must address `byte_size` valid bytes that outlive the buffer and all
    /// tensors or images created from it.
    pub unsafe fn new_shared_buffer(&self, ptr: *mut u8, byte_size: usize) -> Result<Buffer> {
        let storage = self.engine().pointer_storage(ptr as *const u8);
        // SAFETY: forwarded from the caller.
        unsafe { Buffer::shared(self.engine(), ptr as u64, byte_size, storage) }
    }

    /// Allocate a tensor in a fresh buffer
    pub fn new_tensor(&self, desc: TensorDesc) -> Result<Tensor> {
        let buffer = self.new_buffer(desc.byte_size())?;
        Tensor::new(buffer, desc, 0)
    }

    /// Create a tensor over caller memory
    ///
    /// # Safety
    /// `ptr` must address `desc.byte_size()` valid bytes that outlive the tensor.
    pub unsafe fn new_tensor_from_ptr(&self, desc: TensorDesc, ptr: *mut u8) -> Result<Tensor> {
        // SAFETY: forwarded from the caller.
        let buffer = unsafe { self.new_shared_buffer(ptr, desc.byte_size())? };
        Tensor::new(buffer, desc, 0)
    }

    /// Create a tensor view into an existing buffer of this device
    pub fn new_tensor_in(
        &self,
        buffer: &Buffer,
        desc: TensorDesc,
        byte_offset: usize,
    ) -> Result<Tensor> {
        if buffer.device_id() != self.id() {
            return Err(Error::invalid_argument(
                "buffer",
                "buffer belongs to a different device",
            ));
        }
        Tensor::new(buffer.clone(), desc, byte_offset)
    }

    /// Create a convolution node; the descriptor is validated here
    pub fn new_conv_node(&self, name: &str, desc: ConvDesc) -> Result<ConvNode> {
        let dst_desc = desc.dst_desc()?;
        let kernel = self.engine().new_conv_kernel(&desc)?;
        Ok(ConvNode::new(name, desc, dst_desc, kernel))
    }

    /// Create a 2x2 max-pooling node; the descriptor is validated here
    pub fn new_pool_node(&self, name: &str, desc: PoolDesc) -> Result<PoolNode> {
        let dst_desc = desc.dst_desc()?;
        Ok(PoolNode::new(name, desc, dst_desc, self.engine().clone()))
    }

    /// Create a 2x nearest-neighbor upsampling node; the descriptor is validated here
    pub fn new_upsample_node(&self, name: &str, desc: UpsampleDesc) -> Result<UpsampleNode> {
        let dst_desc = desc.dst_desc()?;
        Ok(UpsampleNode::new(name, desc, dst_desc, self.engine().clone()))
    }
}

/// Global counter for activation flag identities
static NEXT_FLAG_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Flags entered on the current thread
    static ACTIVE_FLAGS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Non-reentrant activation flag shared by backend devices
///
/// Activation is tracked per thread: a device may be active on several
/// threads at once, but never twice on the same thread.
#[derive(Debug)]
pub(crate) struct ActivationFlag {
    id: u64,
}

impl Default for ActivationFlag {
    fn default() -> Self {
        Self {
            id: NEXT_FLAG_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl ActivationFlag {
    /// Mark active on the calling thread; fails if already active there
    pub(crate) fn enter(&self, device: &str) -> Result<()> {
        ACTIVE_FLAGS.with_borrow_mut(|active| {
            if active.contains(&self.id) {
                return Err(Error::invalid_operation(format!(
                    "device '{device}' is already active on this thread"
                )));
            }
            active.push(self.id);
            Ok(())
        })
    }

    /// Mark inactive on the calling thread
    pub(crate) fn exit(&self) {
        ACTIVE_FLAGS.with_borrow_mut(|active| active.retain(|id| *id != self.id));
    }

    /// Whether the flag is entered on the calling thread
    pub(crate) fn is_set(&self) -> bool {
        ACTIVE_FLAGS.with_borrow(|active| active.contains(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_parse() {
        assert_eq!("CUDA".parse::<DeviceType>().unwrap(), DeviceType::Cuda);
        assert_eq!("webgpu".parse::<DeviceType>().unwrap(), DeviceType::Wgpu);
        assert!("metal".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_external_memory_types() {
        let types = ExternalMemoryTypes::OPAQUE_FD.union(ExternalMemoryTypes::DMA_BUF);
        assert!(types.contains(ExternalMemoryTypes::DMA_BUF));
        assert!(!types.contains(ExternalMemoryTypes::OPAQUE_WIN32));
        assert!(types.contains(ExternalMemoryTypes::NONE));
    }

    #[test]
    fn test_activation_flag_not_reentrant() {
        let flag = ActivationFlag::default();
        flag.enter("cpu").unwrap();
        assert!(flag.is_set());
        assert!(flag.enter("cpu").is_err());
        flag.exit();
        assert!(flag.enter("cpu").is_ok());
        flag.exit();
    }

    #[test]
    fn test_activation_flag_is_per_thread() {
        let flag = ActivationFlag::default();
        flag.enter("cpu").unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(!flag.is_set());
                flag.enter("cpu").unwrap();
                assert!(flag.is_set());
                flag.exit();
            });
        });
        assert!(flag.is_set());
        flag.exit();
        assert!(!flag.is_set());
    }
}
