//! Transfer functions between image values and network values

use std::fmt;

/// Pixel transfer function applied to colour channels
///
/// `forward` maps an image value into the range the network was trained on and
/// `inverse` maps a network value back. Implementations must be pure and
/// `inverse(forward(x)) == x` up to rounding on their domain.
pub trait TransferFunction: Send + Sync + fmt::Debug {
    /// Image value to network value
    fn forward(&self, y: f32) -> f32;

    /// Network value to image value
    fn inverse(&self, x: f32) -> f32;
}

/// Linear scaling transfer function
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LinearTransfer {
    /// Multiplier applied by `forward`
    pub scale: f32,
}

impl LinearTransfer {
    /// Transfer function scaling by `scale`
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl Default for LinearTransfer {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl TransferFunction for LinearTransfer {
    #[inline]
    fn forward(&self, y: f32) -> f32 {
        y * self.scale
    }

    #[inline]
    fn inverse(&self, x: f32) -> f32 {
        x / self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_inverse() {
        let tf = LinearTransfer::new(0.25);
        for v in [0.0f32, 0.5, 3.0, 128.0] {
            assert_eq!(tf.inverse(tf.forward(v)), v);
        }
        assert_eq!(LinearTransfer::default().forward(0.7), 0.7);
    }
}
