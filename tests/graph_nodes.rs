//! Compute node and graph tests on the CPU backend

mod common;

use common::{assert_allclose_f32, cpu_device, unet_weights};
use denoise_rt::dtype::DType;
use denoise_rt::filter::{LinearTransfer, TilePlan};
use denoise_rt::graph::{
    Activation, ChannelMapping, ConvDesc, Graph, InputProcess, Node, OutputProcess, PoolDesc,
    PostOp, ProcessConfig, UpsampleDesc, ValueId, unet, weight_desc,
};
use denoise_rt::prelude::*;
use std::sync::Arc;

fn chw(c: usize, h: usize, w: usize) -> TensorDesc {
    TensorDesc::chw(c, h, w, DType::F32)
}

fn tensor(device: &Arc<dyn Device>, desc: TensorDesc, data: &[f32]) -> Tensor {
    let t = device.new_tensor(desc).unwrap();
    t.write_f32(data).unwrap();
    t
}

fn conv_node(
    device: &Arc<dyn Device>,
    src: &Tensor,
    weights: &[f32],
    bias: &[f32],
    o: usize,
    post_op: PostOp,
    activation: Activation,
) -> (denoise_rt::graph::ConvNode, Tensor) {
    let i = src.desc().c();
    let wdesc = weight_desc(o, i, 3, 3, TensorLayout::Oihw, DType::F32).unwrap();
    let desc = ConvDesc::new(src.desc().clone(), wdesc.clone(), post_op).with_activation(activation);
    let mut node = device.new_conv_node("conv", desc).unwrap();
    let dst = device.new_tensor(node.dst_desc().clone()).unwrap();
    node.set_src(src.clone()).unwrap();
    node.set_weight(tensor(device, wdesc, weights)).unwrap();
    node.set_bias(tensor(device, TensorDesc::vector(o, DType::F32), bias)).unwrap();
    node.set_dst(dst.clone()).unwrap();
    (node, dst)
}

#[test]
fn test_conv_same_padding() {
    let device = cpu_device();
    let src = tensor(&device, chw(1, 3, 3), &[1.0; 9]);
    let (node, dst) = conv_node(&device, &src, &[1.0; 9], &[0.5], 1, PostOp::None, Activation::Relu);
    node.submit().unwrap();
    device.wait().unwrap();

    let expected = [4.5, 6.5, 4.5, 6.5, 9.5, 6.5, 4.5, 6.5, 4.5];
    assert_allclose_f32(&dst.read_f32().unwrap(), &expected, 0.0, 1e-6, "3x3 conv");
}

#[test]
fn test_conv_relu_and_identity() {
    let device = cpu_device();
    let src = tensor(&device, chw(1, 2, 2), &[1.0, -2.0, 3.0, -4.0]);
    let mut center = [0.0; 9];
    center[4] = 1.0;

    let (relu, dst) = conv_node(&device, &src, &center, &[0.0], 1, PostOp::None, Activation::Relu);
    relu.submit().unwrap();
    assert_eq!(dst.read_f32().unwrap(), vec![1.0, 0.0, 3.0, 0.0]);

    let (plain, dst) = conv_node(&device, &src, &center, &[0.0], 1, PostOp::None, Activation::None);
    plain.submit().unwrap();
    assert_eq!(dst.read_f32().unwrap(), vec![1.0, -2.0, 3.0, -4.0]);
}

#[test]
fn test_conv_multiple_channels() {
    let device = cpu_device();
    // Two input channels, two outputs: out0 = in0 + in1, out1 = in0 - in1
    let src = tensor(&device, chw(2, 1, 2), &[1.0, 2.0, 10.0, 20.0]);
    let mut w = vec![0.0; 2 * 2 * 9];
    w[4] = 1.0;
    w[9 + 4] = 1.0;
    w[18 + 4] = 1.0;
    w[27 + 4] = -1.0;
    let (node, dst) = conv_node(&device, &src, &w, &[0.0, 100.0], 2, PostOp::None, Activation::None);
    node.submit().unwrap();
    assert_eq!(dst.read_f32().unwrap(), vec![11.0, 22.0, 91.0, 82.0]);
}

#[test]
fn test_fused_pool_matches_separate_pool() {
    let device = cpu_device();
    let data: Vec<f32> = (0..2 * 8 * 6).map(|i| ((i * 37) % 11) as f32 - 5.0).collect();
    let src = tensor(&device, chw(2, 8, 6), &data);
    let w: Vec<f32> = (0..3 * 2 * 9).map(|i| ((i * 7) % 5) as f32 * 0.25 - 0.5).collect();
    let b = [0.1, -0.2, 0.3];

    let (fused, fused_dst) = conv_node(&device, &src, &w, &b, 3, PostOp::Pool, Activation::Relu);
    assert_eq!(fused_dst.desc().dims(), &[3, 4, 3]);
    fused.submit().unwrap();

    let (conv, conv_dst) = conv_node(&device, &src, &w, &b, 3, PostOp::None, Activation::Relu);
    conv.submit().unwrap();
    let mut pool = device.new_pool_node("pool", PoolDesc::new(conv_dst.desc().clone())).unwrap();
    let pool_dst = device.new_tensor(pool.dst_desc().clone()).unwrap();
    pool.set_src(conv_dst).unwrap();
    pool.set_dst(pool_dst.clone()).unwrap();
    pool.submit().unwrap();

    assert_eq!(fused_dst.read_f32().unwrap(), pool_dst.read_f32().unwrap());
}

#[test]
fn test_pool_takes_window_max() {
    let device = cpu_device();
    let src = tensor(
        &device,
        chw(1, 2, 4),
        &[1.0, 5.0, -1.0, -3.0, 2.0, 0.0, -2.0, -4.0],
    );
    let mut node = device.new_pool_node("pool", PoolDesc::new(src.desc().clone())).unwrap();
    let dst = device.new_tensor(node.dst_desc().clone()).unwrap();
    node.set_src(src).unwrap();
    node.set_dst(dst.clone()).unwrap();
    node.submit().unwrap();
    assert_eq!(dst.read_f32().unwrap(), vec![5.0, -1.0]);
}

#[test]
fn test_upsample_nearest() {
    let device = cpu_device();
    let src = tensor(&device, chw(1, 1, 2), &[1.0, 2.0]);
    let mut node = device
        .new_upsample_node("up", UpsampleDesc::new(src.desc().clone()))
        .unwrap();
    assert_eq!(node.dst_desc().dims(), &[1, 2, 4]);
    let dst = device.new_tensor(node.dst_desc().clone()).unwrap();
    node.set_src(src).unwrap();
    node.set_dst(dst.clone()).unwrap();
    node.submit().unwrap();
    assert_eq!(
        dst.read_f32().unwrap(),
        vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]
    );
}

#[test]
fn test_full_bias_tensor() {
    let device = cpu_device();
    let src = tensor(&device, chw(1, 2, 2), &[0.0; 4]);
    let wdesc = weight_desc(1, 1, 3, 3, TensorLayout::Oihw, DType::F32).unwrap();
    let desc = ConvDesc::new(src.desc().clone(), wdesc.clone(), PostOp::None)
        .with_activation(Activation::None)
        .with_bias(chw(1, 2, 2));
    assert!(desc.has_full_bias());
    let mut node = device.new_conv_node("conv", desc).unwrap();
    let dst = device.new_tensor(node.dst_desc().clone()).unwrap();
    node.set_src(src).unwrap();
    node.set_weight(tensor(&device, wdesc, &[0.0; 9])).unwrap();
    node.set_bias(tensor(&device, chw(1, 2, 2), &[1.0, 2.0, 3.0, 4.0]))
        .unwrap();
    node.set_dst(dst.clone()).unwrap();
    node.submit().unwrap();
    assert_eq!(dst.read_f32().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_rejected_binding_keeps_previous() {
    let device = cpu_device();
    let src = tensor(&device, chw(1, 4, 4), &[0.0; 16]);
    let (mut node, dst) = conv_node(&device, &src, &[0.0; 9], &[0.0], 1, PostOp::None, Activation::Relu);

    let wrong = device.new_tensor(chw(1, 4, 8)).unwrap();
    let err = node.set_dst(wrong).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(matches!(err, Error::DescMismatch { arg: "dst", .. }), "{err}");
    assert!(node.dst().unwrap().overlaps(&dst));
}

#[test]
fn test_submit_requires_bindings() {
    let device = cpu_device();
    let node = device
        .new_pool_node("pool", PoolDesc::new(chw(2, 4, 4)))
        .unwrap();
    assert_eq!(node.submit().unwrap_err().kind(), ErrorKind::InvalidOperation);
}

#[test]
fn test_overlapping_source_and_destination_rejected() {
    let device = cpu_device();
    let buffer = device.new_buffer(chw(1, 4, 4).byte_size() * 2).unwrap();
    let src = device.new_tensor_in(&buffer, chw(1, 4, 4), 0).unwrap();
    let mut node = device.new_pool_node("pool", PoolDesc::new(chw(1, 4, 4))).unwrap();
    // Destination starts inside the source
    let dst = device.new_tensor_in(&buffer, chw(1, 2, 2), 16).unwrap();
    node.set_src(src).unwrap();
    node.set_dst(dst).unwrap();
    assert_eq!(node.submit().unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_invalid_descriptors() {
    let device = cpu_device();
    let even_kernel = weight_desc(1, 1, 2, 2, TensorLayout::Oihw, DType::F32).unwrap();
    let desc = ConvDesc::new(chw(1, 4, 4), even_kernel, PostOp::None);
    assert_eq!(
        device.new_conv_node("conv", desc).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    let mismatch = weight_desc(1, 2, 3, 3, TensorLayout::Oihw, DType::F32).unwrap();
    let desc = ConvDesc::new(chw(1, 4, 4), mismatch, PostOp::None);
    assert!(device.new_conv_node("conv", desc).is_err());

    assert!(device.new_pool_node("pool", PoolDesc::new(chw(1, 5, 4))).is_err());
    assert!(device
        .new_upsample_node("up", UpsampleDesc::new(TensorDesc::vector(4, DType::F32)))
        .is_err());
}

fn hdr_config() -> ProcessConfig {
    ProcessConfig {
        mapping: ChannelMapping::Hdr,
        transfer: Arc::new(LinearTransfer::default()),
        input_scale: 1.0,
    }
}

/// Full U-Net graph over square tiles; returns the graph and its input value
fn unet_graph(device: &Arc<dyn Device>, image: Image, tile: usize) -> (Graph, ValueId) {
    let weights = unet_weights(3, 3, 3);
    let mut graph = Graph::new(device.clone());
    let input = InputProcess::new("input", chw(3, tile, tile), hdr_config(), image.clone(), None, None)
        .unwrap();
    let x = graph.add_input_process(input, 3).unwrap();
    let y = unet::build_unet(&mut graph, &weights, x).unwrap();
    let output = OutputProcess::new("output", graph.value_desc(y).unwrap().clone(), hdr_config(), image)
        .unwrap();
    graph.add_output_process(output, y).unwrap();
    (graph, x)
}

#[test]
fn test_unet_graph_structure() {
    let device = cpu_device();
    let image = Image::alloc(device.as_ref(), Format::Float3, 64, 64).unwrap();
    let (graph, _) = unet_graph(&device, image, 64);

    let names = graph.node_names();
    assert_eq!(names.first(), Some(&"input"));
    assert_eq!(names.last(), Some(&"output"));
    assert!(names.contains(&"enc_conv5b"));
    assert!(names.contains(&"dec_conv0"));
    // Every node but the input consumes the output of an earlier node
    let edges = graph.edges();
    assert!(edges.iter().all(|&(p, c)| p < c));
    for consumer in 1..graph.num_nodes() {
        assert!(edges.iter().any(|&(_, c)| c == consumer), "node {consumer} has no input");
    }
}

#[test]
fn test_scratch_memory_is_reused() {
    let device = cpu_device();
    let image = Image::alloc(device.as_ref(), Format::Float3, 128, 128).unwrap();
    let (graph, _) = unet_graph(&device, image.clone(), 128);
    // Full-resolution maps alone would need this much without reuse
    let full_res = 128 * 128 * 4 * (3 + common::EC1 + common::DC2 + common::DC1A + common::DC1B + 3);
    assert!(graph.scratch_byte_size() > 0);
    assert!(
        graph.scratch_byte_size() < full_res,
        "{} >= {full_res}",
        graph.scratch_byte_size()
    );

    // Scratch grows linearly with the tile area
    let (small, _) = unet_graph(&device, image, 64);
    let ratio = graph.scratch_byte_size() as f64 / small.scratch_byte_size() as f64;
    assert!((3.5..=4.5).contains(&ratio), "ratio {ratio}");
}

#[test]
fn test_graph_lifecycle() {
    let device = cpu_device();
    let image = Image::alloc(device.as_ref(), Format::Float3, 64, 64).unwrap();
    let (mut graph, input) = unet_graph(&device, image, 64);
    assert!(!graph.is_finalized());
    assert_eq!(graph.run().unwrap_err().kind(), ErrorKind::InvalidOperation);
    assert_eq!(
        graph.value_tensor(input).unwrap_err().kind(),
        ErrorKind::InvalidOperation
    );

    let before = device.allocated_bytes();
    graph.finalize().unwrap();
    assert!(graph.is_finalized());
    let allocated = device.allocated_bytes() - before;
    assert!(allocated >= graph.scratch_byte_size() + graph.weights_byte_size());
    graph.finalize().unwrap();
    assert_eq!(device.allocated_bytes() - before, allocated);
    assert_eq!(graph.value_tensor(input).unwrap().desc(), &chw(3, 64, 64));

    let plan = TilePlan::new(64, 64, usize::MAX).unwrap();
    let tile = plan.tiles().next().unwrap();
    graph.set_tile(tile.input, tile.output).unwrap();
    graph.run().unwrap();

    let late = graph.add_pool("late", input);
    assert_eq!(late.unwrap_err().kind(), ErrorKind::InvalidOperation);
}

#[test]
fn test_values_from_other_graph_rejected() {
    let device = cpu_device();
    let image = Image::alloc(device.as_ref(), Format::Float3, 32, 32).unwrap();
    let mut a = Graph::new(device.clone());
    let input = InputProcess::new("input", chw(3, 32, 32), hdr_config(), image, None, None).unwrap();
    let x = a.add_input_process(input, 3).unwrap();

    let mut b = Graph::new(device);
    assert_eq!(b.add_pool("pool", x).unwrap_err().kind(), ErrorKind::InvalidArgument);
}
