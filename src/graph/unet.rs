//! U-Net topology
//!
//! Five encoder levels with 2x2 pooling, a bottleneck, and four decoder
//! levels that upsample and concatenate the matching encoder output. Channel
//! widths are taken from the weights.

use super::desc::{Activation, PostOp};
use super::graph::{Graph, ValueId};
use crate::error::Result;
use crate::filter::Weights;

/// Network input channels required by a weight set
pub fn input_channels(weights: &Weights) -> Result<usize> {
    let (weight, _) = weights.layer("enc_conv0")?;
    Ok(weight.dims()[1])
}

/// Network output channels produced by a weight set
pub fn output_channels(weights: &Weights) -> Result<usize> {
    let (weight, _) = weights.layer("dec_conv0")?;
    Ok(weight.dims()[0])
}

/// Append the U-Net to `graph` starting from `input`; returns the output value
pub fn build_unet(graph: &mut Graph, weights: &Weights, input: ValueId) -> Result<ValueId> {
    let conv = |graph: &mut Graph, name: &str, src: ValueId, post_op: PostOp| {
        let (w, b) = weights.layer(name)?;
        graph.add_conv(name, src, w, b, post_op, Activation::Relu)
    };
    let concat_conv = |graph: &mut Graph, name: &str, a: ValueId, b: ValueId| {
        let (w, bias) = weights.layer(name)?;
        graph.add_concat_conv(name, a, b, w, bias, PostOp::None, Activation::Relu)
    };

    let x = conv(graph, "enc_conv0", input, PostOp::None)?;
    let pool1 = conv(graph, "enc_conv1", x, PostOp::Pool)?;
    let pool2 = conv(graph, "enc_conv2", pool1, PostOp::Pool)?;
    let pool3 = conv(graph, "enc_conv3", pool2, PostOp::Pool)?;
    let x = conv(graph, "enc_conv4", pool3, PostOp::Pool)?;
    let x = conv(graph, "enc_conv5a", x, PostOp::None)?;
    let up = conv(graph, "enc_conv5b", x, PostOp::Upsample)?;

    let x = concat_conv(graph, "dec_conv4a", up, pool3)?;
    let up = conv(graph, "dec_conv4b", x, PostOp::Upsample)?;
    let x = concat_conv(graph, "dec_conv3a", up, pool2)?;
    let up = conv(graph, "dec_conv3b", x, PostOp::Upsample)?;
    let x = concat_conv(graph, "dec_conv2a", up, pool1)?;
    let up = conv(graph, "dec_conv2b", x, PostOp::Upsample)?;
    let x = concat_conv(graph, "dec_conv1a", up, input)?;
    let x = conv(graph, "dec_conv1b", x, PostOp::None)?;

    let (w, b) = weights.layer("dec_conv0")?;
    graph.add_conv("dec_conv0", x, w, b, PostOp::None, Activation::None)
}
