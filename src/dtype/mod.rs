//! Element data types for tensors and images
//!
//! The network computes in one native precision per device; images may be
//! stored in either precision and are converted at the process nodes.

use std::fmt;

/// Element type of a tensor or image channel
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float
    F32,
    /// 16-bit IEEE float
    F16,
}

impl DType {
    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }

    /// Short lowercase name, also used as kernel suffix
    pub const fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
        }
    }

    /// Decode one element from little-endian bytes
    #[inline]
    pub(crate) fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            DType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            DType::F16 => half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
        }
    }

    /// Encode one element into little-endian bytes
    #[inline]
    pub(crate) fn encode(self, value: f32, out: &mut [u8]) {
        match self {
            DType::F32 => out[..4].copy_from_slice(&value.to_le_bytes()),
            DType::F16 => out[..2].copy_from_slice(&half::f16::from_f32(value).to_le_bytes()),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
    }

    #[test]
    fn test_encode_decode() {
        let mut buf = [0u8; 4];
        DType::F32.encode(-3.25, &mut buf);
        assert_eq!(DType::F32.decode(&buf), -3.25);

        DType::F16.encode(0.5, &mut buf);
        assert_eq!(DType::F16.decode(&buf), 0.5);
        // 1/3 is not representable in half precision
        DType::F16.encode(1.0 / 3.0, &mut buf);
        assert!((DType::F16.decode(&buf) - 1.0 / 3.0).abs() < 1e-3);
    }
}
