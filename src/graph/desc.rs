//! Shape descriptors of the compute nodes and their validation rules

use crate::error::{Error, Result};
use crate::tensor::{TensorDesc, TensorLayout};

/// Operation fused after a convolution
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PostOp {
    /// Plain convolution
    #[default]
    None,
    /// 2x2 max pooling
    Pool,
    /// 2x nearest-neighbor upsampling
    Upsample,
}

/// Activation applied to the convolution result
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Activation {
    /// Identity
    None,
    /// max(x, 0)
    #[default]
    Relu,
}

/// Convolution descriptor
///
/// The kernel uses "same" zero padding, so the spatial kernel size must be odd.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvDesc {
    /// Source feature map `[C, H, W]`
    pub src_desc: TensorDesc,
    /// Weights `[O, I, KH, KW]`
    pub weight_desc: TensorDesc,
    /// Bias `[O]`, or a full tensor with the destination dims
    pub bias_desc: TensorDesc,
    /// Fused post-operation
    pub post_op: PostOp,
    /// Activation
    pub activation: Activation,
}

fn require_feature_map(arg: &'static str, desc: &TensorDesc) -> Result<()> {
    if desc.rank() != 3 {
        return Err(Error::invalid_argument(
            arg,
            format!("expected a rank 3 tensor, got {desc}"),
        ));
    }
    Ok(())
}

fn require_even(arg: &'static str, desc: &TensorDesc) -> Result<()> {
    if desc.h() % 2 != 0 || desc.w() % 2 != 0 {
        return Err(Error::invalid_argument(
            arg,
            format!(
                "pooling requires even height and width, got {}x{}",
                desc.h(),
                desc.w()
            ),
        ));
    }
    Ok(())
}

/// Descriptor with the same layout and dtype as `src` and new dims
fn feature_map_like(src: &TensorDesc, c: usize, h: usize, w: usize) -> Result<TensorDesc> {
    TensorDesc::new(&[c, h, w], src.layout(), src.dtype())
}

impl ConvDesc {
    /// Descriptor with a per-channel bias and ReLU
    pub fn new(src_desc: TensorDesc, weight_desc: TensorDesc, post_op: PostOp) -> Self {
        let bias_desc = TensorDesc::vector(weight_desc.dims()[0], weight_desc.dtype());
        Self {
            src_desc,
            weight_desc,
            bias_desc,
            post_op,
            activation: Activation::Relu,
        }
    }

    /// Replace the activation
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Replace the bias descriptor
    pub fn with_bias(mut self, bias_desc: TensorDesc) -> Self {
        self.bias_desc = bias_desc;
        self
    }

    /// Validate the descriptor and derive the destination descriptor
    pub fn dst_desc(&self) -> Result<TensorDesc> {
        let src = &self.src_desc;
        let weight = &self.weight_desc;
        require_feature_map("src", src)?;

        if weight.rank() != 4 {
            return Err(Error::invalid_argument(
                "weight",
                format!("expected a rank 4 tensor, got {weight}"),
            ));
        }
        if weight.i() != src.c() {
            return Err(Error::invalid_argument(
                "weight",
                format!(
                    "input channels {} do not match source channels {}",
                    weight.i(),
                    src.c()
                ),
            ));
        }
        if weight.h() % 2 == 0 || weight.w() % 2 == 0 {
            return Err(Error::invalid_argument(
                "weight",
                format!(
                    "kernel size must be odd, got {}x{}",
                    weight.h(),
                    weight.w()
                ),
            ));
        }
        if weight.dtype() != src.dtype() {
            return Err(Error::invalid_argument(
                "weight",
                format!("dtype {} does not match source {}", weight.dtype(), src.dtype()),
            ));
        }

        let dst = match self.post_op {
            PostOp::None => feature_map_like(src, weight.o(), src.h(), src.w())?,
            PostOp::Pool => {
                require_even("src", src)?;
                feature_map_like(src, weight.o(), src.h() / 2, src.w() / 2)?
            }
            PostOp::Upsample => feature_map_like(src, weight.o(), src.h() * 2, src.w() * 2)?,
        };

        let bias = &self.bias_desc;
        let bias_ok = match bias.rank() {
            1 => bias.x() == weight.o(),
            3 => bias.dims() == dst.dims(),
            _ => false,
        };
        if !bias_ok {
            return Err(Error::invalid_argument(
                "bias",
                format!(
                    "expected [{}] or {}, got {bias}",
                    weight.o(),
                    dst.dims().iter().map(|d| d.to_string()).collect::<Vec<_>>().join("x")
                ),
            ));
        }
        if bias.dtype() != src.dtype() {
            return Err(Error::invalid_argument(
                "bias",
                format!("dtype {} does not match source {}", bias.dtype(), src.dtype()),
            ));
        }
        Ok(dst)
    }

    /// Whether the bias is a full destination-shaped tensor
    pub fn has_full_bias(&self) -> bool {
        self.bias_desc.rank() == 3
    }
}

/// 2x2 max-pooling descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolDesc {
    /// Source feature map `[C, H, W]`, H and W even
    pub src_desc: TensorDesc,
}

impl PoolDesc {
    /// Create a descriptor
    pub fn new(src_desc: TensorDesc) -> Self {
        Self { src_desc }
    }

    /// Validate and derive `[C, H/2, W/2]`
    pub fn dst_desc(&self) -> Result<TensorDesc> {
        let src = &self.src_desc;
        require_feature_map("src", src)?;
        require_even("src", src)?;
        feature_map_like(src, src.c(), src.h() / 2, src.w() / 2)
    }
}

/// 2x nearest-neighbor upsampling descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpsampleDesc {
    /// Source feature map `[C, H, W]`
    pub src_desc: TensorDesc,
}

impl UpsampleDesc {
    /// Create a descriptor
    pub fn new(src_desc: TensorDesc) -> Self {
        Self { src_desc }
    }

    /// Validate and derive `[C, 2H, 2W]`
    pub fn dst_desc(&self) -> Result<TensorDesc> {
        let src = &self.src_desc;
        require_feature_map("src", src)?;
        feature_map_like(src, src.c(), src.h() * 2, src.w() * 2)
    }
}

/// Weight descriptor `[O, I, KH, KW]` in the given layout
pub fn weight_desc(
    o: usize,
    i: usize,
    kh: usize,
    kw: usize,
    layout: TensorLayout,
    dtype: crate::dtype::DType,
) -> Result<TensorDesc> {
    TensorDesc::new(&[o, i, kh, kw], layout, dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn weights(o: usize, i: usize) -> TensorDesc {
        weight_desc(o, i, 3, 3, TensorLayout::Oihw, DType::F32).unwrap()
    }

    #[test]
    fn test_dst_shapes() {
        let src = TensorDesc::chw(6, 32, 48, DType::F32);
        for (post_op, h, w) in [
            (PostOp::None, 32, 48),
            (PostOp::Pool, 16, 24),
            (PostOp::Upsample, 64, 96),
        ] {
            let desc = ConvDesc::new(src.clone(), weights(8, 6), post_op);
            assert_eq!(desc.dst_desc().unwrap().dims(), &[8, h, w], "{post_op:?}");
        }
    }

    #[test]
    fn test_pool_requires_even() {
        let src = TensorDesc::chw(6, 31, 48, DType::F32);
        let err = ConvDesc::new(src.clone(), weights(8, 6), PostOp::Pool)
            .dst_desc()
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
        assert!(PoolDesc::new(src.clone()).dst_desc().is_err());
        assert!(ConvDesc::new(src, weights(8, 6), PostOp::None).dst_desc().is_ok());
    }

    #[test]
    fn test_bias_rules() {
        let src = TensorDesc::chw(6, 8, 8, DType::F32);
        let base = ConvDesc::new(src, weights(4, 6), PostOp::Pool);

        let full = base.clone().with_bias(TensorDesc::chw(4, 4, 4, DType::F32));
        assert!(full.dst_desc().is_ok());
        assert!(full.has_full_bias());

        let wrong_len = base.clone().with_bias(TensorDesc::vector(5, DType::F32));
        assert!(wrong_len.dst_desc().is_err());

        let wrong_spatial = base.with_bias(TensorDesc::chw(4, 8, 8, DType::F32));
        assert!(wrong_spatial.dst_desc().is_err());
    }

    #[test]
    fn test_channel_and_rank_checks() {
        let src = TensorDesc::chw(6, 8, 8, DType::F32);
        assert!(ConvDesc::new(src.clone(), weights(4, 5), PostOp::None)
            .dst_desc()
            .is_err());

        let even_kernel = weight_desc(4, 6, 2, 2, TensorLayout::Oihw, DType::F32).unwrap();
        assert!(ConvDesc::new(src.clone(), even_kernel, PostOp::None)
            .dst_desc()
            .is_err());

        let vector_src = TensorDesc::vector(6, DType::F32);
        assert!(ConvDesc::new(vector_src, weights(4, 6), PostOp::None)
            .dst_desc()
            .is_err());
    }

    #[test]
    fn test_upsample_and_pool_descs() {
        let src = TensorDesc::chw(3, 5, 7, DType::F32);
        assert_eq!(
            UpsampleDesc::new(src).dst_desc().unwrap().dims(),
            &[3, 10, 14]
        );
        let src = TensorDesc::chw(3, 6, 8, DType::F16);
        let dst = PoolDesc::new(src).dst_desc().unwrap();
        assert_eq!(dst.dims(), &[3, 3, 4]);
        assert_eq!(dst.dtype(), DType::F16);
    }
}
