//! Scalar CPU kernels for the U-Net operators
//!
//! All kernels work on dense CHW f32 slices. Convolutions use "same" zero
//! padding and accumulate every output element in the fixed order input
//! channel, kernel row, kernel column, then add the bias. Results therefore
//! depend only on the input values in the receptive field, never on the
//! tensor size or the thread count.

use crate::graph::{Activation, PostOp};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Shape of a convolution
#[derive(Copy, Clone, Debug)]
pub(super) struct ConvShape {
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub o: usize,
    pub kh: usize,
    pub kw: usize,
}

/// Bias of a convolution
#[derive(Copy, Clone, Debug)]
pub(super) enum Bias<'a> {
    /// One value per output channel
    PerChannel(&'a [f32]),
    /// One value per destination element
    Full(&'a [f32]),
}

impl Bias<'_> {
    #[inline]
    fn at(&self, oc: usize, dst_index: usize) -> f32 {
        match self {
            Bias::PerChannel(b) => b[oc],
            Bias::Full(b) => b[dst_index],
        }
    }
}

#[inline]
fn activate(activation: Activation, v: f32) -> f32 {
    match activation {
        Activation::None => v,
        Activation::Relu => v.max(0.0),
    }
}

/// One row of the convolution without bias into `acc` (length `w`)
fn conv_row(src: &[f32], weight_oc: &[f32], s: &ConvShape, y: usize, acc: &mut [f32]) {
    acc.fill(0.0);
    let (ry, rx) = ((s.kh / 2) as isize, (s.kw / 2) as isize);
    for ic in 0..s.c {
        for ky in 0..s.kh {
            let sy = y as isize + ky as isize - ry;
            if sy < 0 || sy >= s.h as isize {
                continue;
            }
            let row = &src[(ic * s.h + sy as usize) * s.w..][..s.w];
            for kx in 0..s.kw {
                let wv = weight_oc[(ic * s.kh + ky) * s.kw + kx];
                let dx = kx as isize - rx;
                let x0 = (-dx).max(0) as usize;
                let x1 = (s.w as isize - dx).min(s.w as isize).max(0) as usize;
                for x in x0..x1 {
                    acc[x] += row[(x as isize + dx) as usize] * wv;
                }
            }
        }
    }
}

/// Scratch rows reused across the rows one worker computes
fn scratch(w: usize) -> (Vec<f32>, Vec<f32>) {
    (vec![0.0; w], vec![0.0; w])
}

/// Compute one destination row `r` (flattened over output channel and row)
#[allow(clippy::too_many_arguments)]
fn conv_dst_row(
    src: &[f32],
    weight: &[f32],
    bias: Bias<'_>,
    s: &ConvShape,
    post_op: PostOp,
    activation: Activation,
    r: usize,
    row: &mut [f32],
    acc: &mut (Vec<f32>, Vec<f32>),
) {
    let dst_w = row.len();
    let dst_h = match post_op {
        PostOp::None => s.h,
        PostOp::Pool => s.h / 2,
        PostOp::Upsample => s.h * 2,
    };
    let (oc, y) = (r / dst_h, r % dst_h);
    let weight_oc = &weight[oc * s.c * s.kh * s.kw..][..s.c * s.kh * s.kw];
    let base = r * dst_w;
    let (a, b) = acc;

    match post_op {
        PostOp::None => {
            conv_row(src, weight_oc, s, y, a);
            for x in 0..dst_w {
                row[x] = activate(activation, a[x] + bias.at(oc, base + x));
            }
        }
        PostOp::Pool => {
            conv_row(src, weight_oc, s, 2 * y, a);
            conv_row(src, weight_oc, s, 2 * y + 1, b);
            for x in 0..dst_w {
                let m = a[2 * x].max(a[2 * x + 1]).max(b[2 * x].max(b[2 * x + 1]));
                row[x] = activate(activation, m + bias.at(oc, base + x));
            }
        }
        PostOp::Upsample => {
            conv_row(src, weight_oc, s, y / 2, a);
            for x in 0..dst_w {
                row[x] = activate(activation, a[x / 2] + bias.at(oc, base + x));
            }
        }
    }
}

/// Convolution with fused post-op: `dst = act(post(conv(src)) + bias)`
///
/// `weight` is OIHW. `dst` holds the post-op destination shape.
pub(super) fn conv2d(
    src: &[f32],
    weight: &[f32],
    bias: Bias<'_>,
    shape: ConvShape,
    post_op: PostOp,
    activation: Activation,
    dst: &mut [f32],
) {
    let dst_w = match post_op {
        PostOp::None => shape.w,
        PostOp::Pool => shape.w / 2,
        PostOp::Upsample => shape.w * 2,
    };
    if dst_w == 0 {
        return;
    }
    debug_assert_eq!(dst.len() % (shape.o * dst_w), 0);

    #[cfg(feature = "rayon")]
    dst.par_chunks_mut(dst_w).enumerate().for_each_init(
        || scratch(shape.w),
        |acc, (r, row)| {
            conv_dst_row(src, weight, bias, &shape, post_op, activation, r, row, acc);
        },
    );

    #[cfg(not(feature = "rayon"))]
    {
        let mut acc = scratch(shape.w);
        for (r, row) in dst.chunks_mut(dst_w).enumerate() {
            conv_dst_row(src, weight, bias, &shape, post_op, activation, r, row, &mut acc);
        }
    }
}

/// 2x2 max pooling of a `[c, h, w]` tensor
pub(super) fn pool2x2(src: &[f32], h: usize, w: usize, dst: &mut [f32]) {
    let (dh, dw) = (h / 2, w / 2);
    if dw == 0 {
        return;
    }
    let pool_row = |r: usize, row: &mut [f32]| {
        let (c, y) = (r / dh, r % dh);
        let top = &src[(c * h + 2 * y) * w..][..w];
        let bottom = &src[(c * h + 2 * y + 1) * w..][..w];
        for (x, out) in row.iter_mut().enumerate() {
            *out = top[2 * x]
                .max(top[2 * x + 1])
                .max(bottom[2 * x].max(bottom[2 * x + 1]));
        }
    };

    #[cfg(feature = "rayon")]
    dst.par_chunks_mut(dw)
        .enumerate()
        .for_each(|(r, row)| pool_row(r, row));

    #[cfg(not(feature = "rayon"))]
    for (r, row) in dst.chunks_mut(dw).enumerate() {
        pool_row(r, row);
    }
}

/// 2x nearest-neighbor upsampling of a `[c, h, w]` tensor
pub(super) fn upsample2x(src: &[f32], h: usize, w: usize, dst: &mut [f32]) {
    let (dh, dw) = (h * 2, w * 2);
    if dw == 0 {
        return;
    }
    let upsample_row = |r: usize, row: &mut [f32]| {
        let (c, y) = (r / dh, r % dh);
        let src_row = &src[(c * h + y / 2) * w..][..w];
        for (x, out) in row.iter_mut().enumerate() {
            *out = src_row[x / 2];
        }
    };

    #[cfg(feature = "rayon")]
    dst.par_chunks_mut(dw)
        .enumerate()
        .for_each(|(r, row)| upsample_row(r, row));

    #[cfg(not(feature = "rayon"))]
    for (r, row) in dst.chunks_mut(dw).enumerate() {
        upsample_row(r, row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(c: usize, h: usize, w: usize, o: usize) -> ConvShape {
        ConvShape {
            c,
            h,
            w,
            o,
            kh: 3,
            kw: 3,
        }
    }

    #[test]
    fn test_conv_identity_kernel() {
        // Center tap only: output equals input plus bias
        let mut weight = vec![0.0; 9];
        weight[4] = 1.0;
        let src: Vec<f32> = (0..12).map(|v| v as f32 - 6.0).collect();
        let mut dst = vec![0.0; 12];
        conv2d(
            &src,
            &weight,
            Bias::PerChannel(&[0.5]),
            shape(1, 3, 4, 1),
            PostOp::None,
            Activation::None,
            &mut dst,
        );
        let expected: Vec<f32> = src.iter().map(|v| v + 0.5).collect();
        assert_eq!(dst, expected);
    }

    #[test]
    fn test_conv_zero_padding() {
        // All-ones 3x3 kernel counts valid neighbours
        let weight = vec![1.0; 9];
        let src = vec![1.0; 9];
        let mut dst = vec![0.0; 9];
        conv2d(
            &src,
            &weight,
            Bias::PerChannel(&[0.0]),
            shape(1, 3, 3, 1),
            PostOp::None,
            Activation::Relu,
            &mut dst,
        );
        assert_eq!(dst, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_fused_pool_matches_separate() {
        let src: Vec<f32> = (0..2 * 4 * 4).map(|v| ((v * 7) % 11) as f32 - 5.0).collect();
        let weight: Vec<f32> = (0..3 * 2 * 9).map(|v| ((v * 5) % 7) as f32 * 0.1 - 0.3).collect();
        let bias = [0.1, -0.2, 0.3];
        let s = ConvShape {
            c: 2,
            h: 4,
            w: 4,
            o: 3,
            kh: 3,
            kw: 3,
        };

        let mut fused = vec![0.0; 3 * 2 * 2];
        conv2d(&src, &weight, Bias::PerChannel(&bias), s, PostOp::Pool, Activation::Relu, &mut fused);

        let mut full = vec![0.0; 3 * 4 * 4];
        conv2d(&src, &weight, Bias::PerChannel(&bias), s, PostOp::None, Activation::Relu, &mut full);
        let mut pooled = vec![0.0; 3 * 2 * 2];
        pool2x2(&full, 4, 4, &mut pooled);
        assert_eq!(fused, pooled);
    }

    #[test]
    fn test_upsample_and_pool() {
        let src = vec![1.0, 2.0, 3.0, 4.0];
        let mut up = vec![0.0; 16];
        upsample2x(&src, 2, 2, &mut up);
        assert_eq!(&up[..8], &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
        let mut down = vec![0.0; 4];
        pool2x2(&up, 4, 4, &mut down);
        assert_eq!(down, src);
    }
}
