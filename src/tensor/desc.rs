//! Tensor descriptors: dimensions, memory layout and element type

use super::shape::{Dims, MAX_RANK};
use crate::dtype::DType;
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::fmt;

/// Memory layout of a tensor
///
/// The layout fixes the rank: vectors are rank 1, feature maps rank 3 and
/// convolution weights rank 4.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TensorLayout {
    /// Plain vector `[X]`
    X,
    /// Channel-major feature map `[C, H, W]`
    Chw,
    /// Channel-last feature map, dims still `[C, H, W]`
    Hwc,
    /// Weights `[O, I, H, W]` stored in that order
    Oihw,
    /// Weights `[O, I, H, W]` stored as O, H, W, I
    Ohwi,
}

impl TensorLayout {
    /// Rank required by this layout
    pub const fn rank(self) -> usize {
        match self {
            TensorLayout::X => 1,
            TensorLayout::Chw | TensorLayout::Hwc => 3,
            TensorLayout::Oihw | TensorLayout::Ohwi => 4,
        }
    }
}

/// Descriptor of a tensor: dims, layout and element type
///
/// Two descriptors are equal iff all three match.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    dims: Dims,
    layout: TensorLayout,
    dtype: DType,
}

impl TensorDesc {
    /// Create a descriptor, checking that the rank matches the layout
    pub fn new(dims: &[usize], layout: TensorLayout, dtype: DType) -> Result<Self> {
        if dims.is_empty() || dims.len() > MAX_RANK {
            return Err(Error::invalid_argument(
                "dims",
                format!("rank must be between 1 and {MAX_RANK}, got {}", dims.len()),
            ));
        }
        if dims.len() != layout.rank() {
            return Err(Error::invalid_argument(
                "layout",
                format!(
                    "{layout:?} requires rank {}, got rank {}",
                    layout.rank(),
                    dims.len()
                ),
            ));
        }
        if dims.contains(&0) {
            return Err(Error::invalid_argument(
                "dims",
                format!("dimensions must be non-zero, got {dims:?}"),
            ));
        }
        Ok(Self {
            dims: Dims::from(dims),
            layout,
            dtype,
        })
    }

    /// Channel-major feature map descriptor
    pub fn chw(c: usize, h: usize, w: usize, dtype: DType) -> Self {
        Self {
            dims: Dims::from([c, h, w]),
            layout: TensorLayout::Chw,
            dtype,
        }
    }

    /// Vector descriptor
    pub fn vector(x: usize, dtype: DType) -> Self {
        Self {
            dims: Dims::from([x]),
            layout: TensorLayout::X,
            dtype,
        }
    }

    /// Descriptor with the same dims and dtype but a different rank-compatible layout
    pub fn with_layout(&self, layout: TensorLayout) -> Result<Self> {
        Self::new(&self.dims, layout, self.dtype)
    }

    /// Dimensions in logical order
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of dimensions
    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.rank()
    }

    /// Memory layout
    #[inline]
    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    /// Element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Vector length (rank 1)
    pub fn x(&self) -> usize {
        self.dims[0]
    }

    /// Channels (rank 3)
    pub fn c(&self) -> usize {
        self.dims[0]
    }

    /// Height (rank 3 and 4)
    pub fn h(&self) -> usize {
        self.dims[self.rank() - 2]
    }

    /// Width (rank 3 and 4)
    pub fn w(&self) -> usize {
        self.dims[self.rank() - 1]
    }

    /// Output channels (rank 4)
    pub fn o(&self) -> usize {
        self.dims[0]
    }

    /// Input channels (rank 4)
    pub fn i(&self) -> usize {
        self.dims[1]
    }

    /// Total number of elements
    #[inline]
    pub fn num_elements(&self) -> usize {
        self.dims.num_elements()
    }

    /// Total size in bytes
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }

    /// Element strides for each logical dimension, derived from the layout
    pub fn strides(&self) -> SmallVec<[usize; MAX_RANK]> {
        let d = &self.dims;
        let mut strides = SmallVec::new();
        match self.layout {
            TensorLayout::X => strides.push(1),
            TensorLayout::Chw => strides.extend_from_slice(&[d[1] * d[2], d[2], 1]),
            TensorLayout::Hwc => strides.extend_from_slice(&[1, d[2] * d[0], d[0]]),
            TensorLayout::Oihw => {
                strides.extend_from_slice(&[d[1] * d[2] * d[3], d[2] * d[3], d[3], 1])
            }
            TensorLayout::Ohwi => {
                strides.extend_from_slice(&[d[2] * d[3] * d[1], 1, d[3] * d[1], d[1]])
            }
        }
        strides
    }

    /// Element offset of a logical index
    #[inline]
    pub fn offset_of(&self, index: &[usize]) -> usize {
        self.strides()
            .iter()
            .zip(index.iter())
            .map(|(s, i)| s * i)
            .sum()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {}", self.dims, self.layout, self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_layout_check() {
        assert!(TensorDesc::new(&[3, 4, 4], TensorLayout::Chw, DType::F32).is_ok());
        assert!(TensorDesc::new(&[3, 4], TensorLayout::Chw, DType::F32).is_err());
        assert!(TensorDesc::new(&[3, 4, 4], TensorLayout::Oihw, DType::F32).is_err());
        assert!(TensorDesc::new(&[], TensorLayout::X, DType::F32).is_err());
        assert!(TensorDesc::new(&[3, 0, 4], TensorLayout::Chw, DType::F32).is_err());
    }

    #[test]
    fn test_equality() {
        let a = TensorDesc::chw(3, 4, 5, DType::F32);
        assert_eq!(a, TensorDesc::chw(3, 4, 5, DType::F32));
        assert_ne!(a, TensorDesc::chw(3, 4, 5, DType::F16));
        assert_ne!(a, a.with_layout(TensorLayout::Hwc).unwrap());
        assert_ne!(a, TensorDesc::chw(3, 5, 4, DType::F32));
    }

    #[test]
    fn test_strides() {
        let chw = TensorDesc::chw(3, 4, 5, DType::F32);
        assert_eq!(chw.strides().as_slice(), &[20, 5, 1]);
        let hwc = chw.with_layout(TensorLayout::Hwc).unwrap();
        assert_eq!(hwc.strides().as_slice(), &[1, 15, 3]);

        let w = TensorDesc::new(&[8, 6, 3, 3], TensorLayout::Oihw, DType::F32).unwrap();
        assert_eq!(w.strides().as_slice(), &[54, 9, 3, 1]);
        let w = w.with_layout(TensorLayout::Ohwi).unwrap();
        assert_eq!(w.strides().as_slice(), &[54, 1, 18, 6]);
        assert_eq!(w.offset_of(&[1, 2, 0, 1]), 54 + 2 + 6);
    }

    #[test]
    fn test_accessors() {
        let d = TensorDesc::chw(3, 4, 5, DType::F16);
        assert_eq!((d.c(), d.h(), d.w()), (3, 4, 5));
        assert_eq!(d.byte_size(), 3 * 4 * 5 * 2);

        let w = TensorDesc::new(&[8, 6, 3, 1], TensorLayout::Oihw, DType::F32).unwrap();
        assert_eq!((w.o(), w.i(), w.h(), w.w()), (8, 6, 3, 1));
    }
}
