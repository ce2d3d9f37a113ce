//! Tensor: a typed view into a buffer

use super::desc::TensorDesc;
use super::storage::Buffer;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::runtime::DeviceId;

/// Non-owning view of a buffer region described by a [`TensorDesc`]
///
/// Cloning a tensor clones the buffer handle, so the memory stays alive as long
/// as any view of it does. Several tensors may alias one buffer at different
/// offsets.
#[derive(Clone, Debug)]
pub struct Tensor {
    desc: TensorDesc,
    buffer: Buffer,
    byte_offset: usize,
}

impl Tensor {
    /// Bind a descriptor to a buffer region
    ///
    /// Fails with `InvalidArgument` if the required byte span
    /// (`byte_offset + desc.byte_size()`) exceeds the buffer.
    pub fn new(buffer: Buffer, desc: TensorDesc, byte_offset: usize) -> Result<Self> {
        let span = byte_offset.checked_add(desc.byte_size());
        match span {
            Some(end) if end <= buffer.byte_size() => {}
            _ => {
                return Err(Error::invalid_argument(
                    "byte_offset",
                    format!(
                        "tensor {desc} at offset {byte_offset} needs {} bytes, buffer has {}",
                        desc.byte_size(),
                        buffer.byte_size()
                    ),
                ));
            }
        }
        Ok(Self {
            desc,
            buffer,
            byte_offset,
        })
    }

    /// Tensor descriptor
    #[inline]
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    /// Underlying buffer
    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Byte offset into the buffer
    #[inline]
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Size of the viewed region in bytes
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.desc.byte_size()
    }

    /// Device the tensor memory is bound to
    #[inline]
    pub fn device_id(&self) -> DeviceId {
        self.buffer.device_id()
    }

    /// Raw address of the first element (buffer address plus offset)
    ///
    /// Only meaningful on backends whose buffer addresses are pointers.
    #[inline]
    pub fn ptr(&self) -> u64 {
        self.buffer.ptr() + self.byte_offset as u64
    }

    /// Byte range covered inside the buffer
    #[inline]
    pub(crate) fn byte_range(&self) -> std::ops::Range<usize> {
        self.byte_offset..self.byte_offset + self.byte_size()
    }

    /// Whether two tensors share any byte of the same buffer
    pub fn overlaps(&self, other: &Tensor) -> bool {
        if !self.buffer.same_allocation(&other.buffer) {
            return false;
        }
        let a = self.byte_range();
        let b = other.byte_range();
        a.start < b.end && b.start < a.end
    }

    /// Read all elements as f32, in memory order
    pub fn read_f32(&self) -> Result<Vec<f32>> {
        let mut bytes = vec![0u8; self.byte_size()];
        self.buffer.read(self.byte_offset, &mut bytes)?;
        let dtype = self.desc.dtype();
        Ok(bytes
            .chunks_exact(dtype.size_in_bytes())
            .map(|b| dtype.decode(b))
            .collect())
    }

    /// Write all elements from f32 values, in memory order
    pub fn write_f32(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.desc.num_elements() {
            return Err(Error::invalid_argument(
                "data",
                format!(
                    "expected {} elements, got {}",
                    self.desc.num_elements(),
                    data.len()
                ),
            ));
        }
        match self.desc.dtype() {
            DType::F32 => self
                .buffer
                .write(self.byte_offset, bytemuck::cast_slice(data)),
            DType::F16 => {
                let halves: Vec<half::f16> = data.iter().map(|&v| half::f16::from_f32(v)).collect();
                self.buffer
                    .write(self.byte_offset, bytemuck::cast_slice(&halves))
            }
        }
    }
}
