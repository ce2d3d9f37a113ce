//! Buffers: device memory regions with Arc-based sharing
//!
//! A [`Buffer`] is one contiguous memory region addressed by a `u64`: a host
//! pointer, a device pointer, or a backend handle, depending on the backend and
//! the [`Storage`] class. Buffers allocated by a device own their memory and free
//! it when the last clone is dropped. Shared buffers wrap caller memory and never
//! free it.

use crate::error::{Error, Result};
use crate::runtime::{DeviceId, Engine};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Accessibility domain of a memory region
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Storage {
    /// Host memory, directly readable by the CPU
    Host,
    /// Device-only memory
    Device,
    /// Unified memory, accessible from host and device
    Managed,
    /// Memory the backend could not classify (treated as host memory)
    Undefined,
}

impl Storage {
    /// Whether the host can dereference pointers into this storage
    #[inline]
    pub fn is_host_accessible(self) -> bool {
        !matches!(self, Storage::Device)
    }
}

/// Access mode of a buffer mapping
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// Read-only
    Read,
    /// Write-only; unwritten bytes keep their previous contents
    Write,
    /// Read and write
    ReadWrite,
    /// Write-only; previous contents are undefined
    WriteDiscard,
}

impl Access {
    #[inline]
    fn writes(self) -> bool {
        !matches!(self, Access::Read)
    }

    #[inline]
    fn preserves_contents(self) -> bool {
        !matches!(self, Access::WriteDiscard)
    }
}

/// Contiguous memory region owned by a device or shared by the caller
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    /// Raw address (host or device pointer) or backend handle
    ptr: u64,
    /// Size in bytes
    byte_size: usize,
    /// Storage class
    storage: Storage,
    /// Engine that issues transfers for this buffer
    engine: Arc<dyn Engine>,
    /// If true, we own this memory and should deallocate on drop
    owned: bool,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if self.owned {
            self.engine
                .allocator()
                .deallocate(self.ptr, self.byte_size, self.storage);
        }
    }
}

impl Buffer {
    /// Allocate an owned buffer through `engine`
    ///
    /// The requested storage is resolved by the backend first; backends without
    /// a distinct device memory may hand out host memory.
    pub(crate) fn allocate(
        engine: &Arc<dyn Engine>,
        byte_size: usize,
        storage: Storage,
    ) -> Result<Self> {
        if byte_size == 0 {
            return Err(Error::invalid_argument(
                "byte_size",
                "buffer size must be non-zero",
            ));
        }
        let storage = engine.resolve_storage(storage)?;
        let ptr = engine.allocator().allocate(byte_size, storage)?;

        Ok(Self {
            inner: Arc::new(BufferInner {
                ptr,
                byte_size,
                storage,
                engine: engine.clone(),
                owned: true,
            }),
        })
    }

    /// Wrap existing memory without taking ownership
    ///
    /// # Safety
    /// - `ptr` must address at least `byte_size` valid bytes in `storage`
    /// - The memory must remain valid for the lifetime of every clone
    pub(crate) unsafe fn shared(
        engine: &Arc<dyn Engine>,
        ptr: u64,
        byte_size: usize,
        storage: Storage,
    ) -> Result<Self> {
        if ptr == 0 {
            return Err(Error::invalid_argument("ptr", "shared pointer is null"));
        }
        if byte_size == 0 {
            return Err(Error::invalid_argument(
                "byte_size",
                "buffer size must be non-zero",
            ));
        }
        Ok(Self {
            inner: Arc::new(BufferInner {
                ptr,
                byte_size,
                storage,
                engine: engine.clone(),
                owned: false,
            }),
        })
    }

    /// Raw address or handle
    #[inline]
    pub fn ptr(&self) -> u64 {
        self.inner.ptr
    }

    /// Size in bytes
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.inner.byte_size
    }

    /// Storage class
    #[inline]
    pub fn storage(&self) -> Storage {
        self.inner.storage
    }

    /// Device the buffer is bound to
    #[inline]
    pub fn device_id(&self) -> DeviceId {
        self.inner.engine.device_id()
    }

    /// Owning device, `None` for caller-shared memory
    #[inline]
    pub fn owner(&self) -> Option<DeviceId> {
        self.inner.owned.then(|| self.device_id())
    }

    /// Whether the runtime frees this memory
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.inner.owned
    }

    /// Engine that issues transfers for this buffer
    #[inline]
    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    /// Whether both handles refer to the same memory region start
    pub fn same_allocation(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.ptr() == other.ptr()
                && self.storage() == other.storage()
                && self.device_id() == other.device_id())
    }

    /// Absolute address range, `None` if the address is a backend handle
    pub fn address_range(&self) -> Option<Range<u64>> {
        if self.inner.engine.is_handle_storage(self.storage()) {
            None
        } else {
            Some(self.ptr()..self.ptr() + self.byte_size() as u64)
        }
    }

    fn check_range(&self, byte_offset: usize, byte_size: usize) -> Result<()> {
        match byte_offset.checked_add(byte_size) {
            Some(end) if end <= self.byte_size() => Ok(()),
            _ => Err(Error::invalid_argument(
                "byte_offset",
                format!(
                    "range {byte_offset}+{byte_size} exceeds buffer size {}",
                    self.byte_size()
                ),
            )),
        }
    }

    /// Copy bytes out of the buffer, waiting for pending work first
    pub fn read(&self, byte_offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(byte_offset, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }
        if self.storage().is_host_accessible() {
            self.inner.engine.wait()?;
            // SAFETY: range checked above; host-accessible memory is dereferenceable.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (self.ptr() as usize + byte_offset) as *const u8,
                    dst.as_mut_ptr(),
                    dst.len(),
                );
            }
            Ok(())
        } else {
            self.inner
                .engine
                .copy_from_device(self.ptr(), byte_offset, dst)
        }
    }

    /// Copy bytes into the buffer
    pub fn write(&self, byte_offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(byte_offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }
        if self.storage().is_host_accessible() {
            self.inner.engine.wait()?;
            // SAFETY: range checked above; host-accessible memory is dereferenceable.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    (self.ptr() as usize + byte_offset) as *mut u8,
                    src.len(),
                );
            }
            Ok(())
        } else {
            self.inner.engine.copy_to_device(src, self.ptr(), byte_offset)
        }
    }

    /// Map a byte range for host access
    ///
    /// A `byte_size` of 0 maps to the end of the buffer. Host-accessible storage
    /// is mapped in place. Device storage is staged through a host copy when the
    /// device supports managed memory, and fails with `InvalidOperation`
    /// otherwise.
    pub fn map(
        &self,
        access: Access,
        byte_offset: usize,
        byte_size: usize,
    ) -> Result<BufferMapping<'_>> {
        if byte_offset > self.byte_size() {
            return Err(Error::invalid_argument(
                "byte_offset",
                format!(
                    "offset {byte_offset} exceeds buffer size {}",
                    self.byte_size()
                ),
            ));
        }
        let byte_size = if byte_size == 0 {
            self.byte_size() - byte_offset
        } else {
            byte_size
        };
        self.check_range(byte_offset, byte_size)?;

        let data = if self.storage().is_host_accessible() {
            self.inner.engine.wait()?;
            MappedData::Direct {
                ptr: (self.ptr() as usize + byte_offset) as *mut u8,
                len: byte_size,
            }
        } else if self.inner.engine.caps().managed_memory_supported {
            let mut staged = vec![0u8; byte_size];
            if access.preserves_contents() {
                self.inner
                    .engine
                    .copy_from_device(self.ptr(), byte_offset, &mut staged)?;
            }
            MappedData::Staged(staged)
        } else {
            return Err(Error::invalid_operation(
                "cannot map device memory on a device without managed memory support",
            ));
        };

        Ok(BufferMapping {
            buffer: self,
            access,
            byte_offset,
            data,
            finished: false,
        })
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &format_args!("0x{:x}", self.ptr()))
            .field("byte_size", &self.byte_size())
            .field("storage", &self.storage())
            .field("owned", &self.is_owned())
            .finish()
    }
}

enum MappedData {
    Direct { ptr: *mut u8, len: usize },
    Staged(Vec<u8>),
}

/// Host view of a mapped buffer range
///
/// Staged mappings are written back on [`unmap`](BufferMapping::unmap), or on
/// drop if `unmap` was not called.
pub struct BufferMapping<'a> {
    buffer: &'a Buffer,
    access: Access,
    byte_offset: usize,
    data: MappedData,
    finished: bool,
}

impl fmt::Debug for BufferMapping<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMapping")
            .field("access", &self.access)
            .field("byte_offset", &self.byte_offset)
            .field("len", &self.len())
            .field("staged", &matches!(self.data, MappedData::Staged(_)))
            .finish()
    }
}

impl BufferMapping<'_> {
    /// Number of mapped bytes
    pub fn len(&self) -> usize {
        match &self.data {
            MappedData::Direct { len, .. } => *len,
            MappedData::Staged(v) => v.len(),
        }
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access mode
    pub fn access(&self) -> Access {
        self.access
    }

    /// Mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            // SAFETY: the range was validated against the buffer at map time and the
            // buffer outlives the mapping.
            MappedData::Direct { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            MappedData::Staged(v) => v,
        }
    }

    /// Mutable mapped bytes; fails for read-only mappings
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.access.writes() {
            return Err(Error::invalid_operation(
                "mapping was created with read-only access",
            ));
        }
        Ok(match &mut self.data {
            // SAFETY: see as_slice; the mapping holds the only host view of the range.
            MappedData::Direct { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(*ptr, *len)
            },
            MappedData::Staged(v) => v,
        })
    }

    /// Finish the mapping, writing staged data back to the device
    pub fn unmap(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let MappedData::Staged(data) = &self.data
            && self.access.writes()
        {
            self.buffer
                .engine()
                .copy_to_device(data, self.buffer.ptr(), self.byte_offset)?;
        }
        Ok(())
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!(error = %err, "Buffer write-back failed during unmap");
        }
    }
}
