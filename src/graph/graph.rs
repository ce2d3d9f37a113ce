//! Graph: ordered compute nodes over planned scratch memory
//!
//! Nodes are appended in execution order. Every node output is a value; a
//! value lives from its producer to its last consumer. [`Graph::finalize`]
//! packs all values into one scratch buffer with a first-fit liveness plan,
//! uploads the padded weights into one weights buffer and binds every tensor.

use super::conv::ConvNode;
use super::desc::{Activation, ConvDesc, PoolDesc, PostOp, UpsampleDesc};
use super::node::Node;
use super::pool::PoolNode;
use super::process::{InputProcess, OutputProcess, Tile};
use super::upsample::UpsampleNode;
use crate::error::{Error, Result};
use crate::filter::HostTensor;
use crate::image::Image;
use crate::runtime::Device;
use crate::tensor::{Buffer, Tensor, TensorDesc, TensorLayout};
use crate::util::round_up;
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Handle of a tensor value inside one graph
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueId {
    graph: u64,
    index: usize,
}

/// Real (unpadded) channel counts of the blocks a value is made of
type ChannelGroups = SmallVec<[usize; 2]>;

struct Value {
    desc: TensorDesc,
    alloc: usize,
    /// Byte offset inside the allocation
    offset: usize,
    producers: SmallVec<[usize; 2]>,
    groups: ChannelGroups,
    tensor: Option<Tensor>,
}

#[derive(Clone, Debug)]
struct Alloc {
    byte_size: usize,
    /// First and last node index using the allocation, inclusive
    first: usize,
    last: usize,
    /// Merged into another allocation by a concatenation
    merged: bool,
    members: usize,
}

struct ConvWeights {
    weight_desc: TensorDesc,
    /// OIHW order, padded
    weight: Vec<f32>,
    bias: Vec<f32>,
}

enum GraphNode {
    Input(InputProcess),
    Conv(Box<ConvNode>),
    Pool(PoolNode),
    Upsample(UpsampleNode),
    Output(OutputProcess),
}

impl GraphNode {
    fn as_node(&self) -> &dyn Node {
        match self {
            GraphNode::Input(n) => n,
            GraphNode::Conv(n) => n.as_ref(),
            GraphNode::Pool(n) => n,
            GraphNode::Upsample(n) => n,
            GraphNode::Output(n) => n,
        }
    }
}

struct Entry {
    node: GraphNode,
    input: Option<ValueId>,
    output: Option<ValueId>,
    weights: Option<ConvWeights>,
}

/// Ordered list of compute nodes with planned scratch memory
pub struct Graph {
    id: u64,
    device: Arc<dyn Device>,
    entries: Vec<Entry>,
    values: Vec<Value>,
    allocs: Vec<Alloc>,
    input_index: Option<usize>,
    output_index: Option<usize>,
    scratch: Option<Buffer>,
    weights: Option<Buffer>,
}

/// Reorder and zero-pad weights so input channel groups start on `block_c` boundaries
///
/// `groups` lists the real channel count of each concatenated input block;
/// their sum must equal the weight's input channels. Output channels are padded
/// to a multiple of `block_c` as well. Returns OIHW weights and the bias.
pub fn pad_weights(
    weight: &HostTensor,
    bias: &HostTensor,
    groups: &[usize],
    block_c: usize,
) -> Result<(Vec<f32>, Vec<f32>, [usize; 4])> {
    let [o, i, kh, kw] = match weight.dims() {
        &[o, i, kh, kw] => [o, i, kh, kw],
        dims => {
            return Err(Error::invalid_argument(
                "weight",
                format!("expected [O, I, KH, KW], got {dims:?}"),
            ));
        }
    };
    if groups.iter().sum::<usize>() != i {
        return Err(Error::invalid_argument(
            "weight",
            format!("input channels {i} do not match source channels {groups:?}"),
        ));
    }
    if bias.dims() != [o] {
        return Err(Error::invalid_argument(
            "bias",
            format!("expected [{o}], got {:?}", bias.dims()),
        ));
    }

    let op = round_up(o, block_c);
    let ip: usize = groups.iter().map(|&g| round_up(g, block_c)).sum();
    let ksize = kh * kw;
    let src = weight.data();
    let mut padded = vec![0.0f32; op * ip * ksize];

    for oc in 0..o {
        let mut src_ic = 0;
        let mut dst_ic = 0;
        for &g in groups {
            for k in 0..g {
                let s = (oc * i + src_ic + k) * ksize;
                let d = (oc * ip + dst_ic + k) * ksize;
                padded[d..d + ksize].copy_from_slice(&src[s..s + ksize]);
            }
            src_ic += g;
            dst_ic += round_up(g, block_c);
        }
    }

    let mut padded_bias = vec![0.0f32; op];
    padded_bias[..o].copy_from_slice(bias.data());
    Ok((padded, padded_bias, [op, ip, kh, kw]))
}

impl Graph {
    /// Empty graph on `device`
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            device,
            entries: Vec::new(),
            values: Vec::new(),
            allocs: Vec::new(),
            input_index: None,
            output_index: None,
            scratch: None,
            weights: None,
        }
    }

    /// Device the graph runs on
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Number of nodes
    pub fn num_nodes(&self) -> usize {
        self.entries.len()
    }

    /// Node names in execution order
    pub fn node_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.node.as_node().name()).collect()
    }

    /// Descriptor of a value
    pub fn value_desc(&self, id: ValueId) -> Result<&TensorDesc> {
        Ok(&self.value(id)?.desc)
    }

    /// Tensor bound to a value, available after [`finalize`](Graph::finalize)
    pub fn value_tensor(&self, id: ValueId) -> Result<&Tensor> {
        self.value(id)?.tensor.as_ref().ok_or_else(|| {
            Error::invalid_operation("graph has not been finalized")
        })
    }

    fn value(&self, id: ValueId) -> Result<&Value> {
        if id.graph != self.id {
            return Err(Error::invalid_argument(
                "value",
                "value belongs to a different graph",
            ));
        }
        self.values.get(id.index).ok_or_else(|| {
            Error::invalid_argument("value", format!("value {} has no producer", id.index))
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.scratch.is_some() {
            return Err(Error::invalid_operation(
                "cannot add nodes to a finalized graph",
            ));
        }
        Ok(())
    }

    fn block_c(&self) -> usize {
        self.device.caps().block_c.max(1)
    }

    /// Record a use of `id` by the node about to be appended
    fn consume(&mut self, id: ValueId) -> Result<()> {
        let alloc = self.value(id)?.alloc;
        let node = self.entries.len();
        let alloc = &mut self.allocs[alloc];
        alloc.last = alloc.last.max(node);
        Ok(())
    }

    /// Create the output value of the node about to be appended
    fn produce(&mut self, desc: TensorDesc, groups: ChannelGroups) -> ValueId {
        let node = self.entries.len();
        self.allocs.push(Alloc {
            byte_size: desc.byte_size(),
            first: node,
            last: node,
            merged: false,
            members: 1,
        });
        self.values.push(Value {
            desc,
            alloc: self.allocs.len() - 1,
            offset: 0,
            producers: smallvec![node],
            groups,
            tensor: None,
        });
        ValueId {
            graph: self.id,
            index: self.values.len() - 1,
        }
    }

    fn push(&mut self, node: GraphNode, input: Option<ValueId>, output: Option<ValueId>) {
        self.entries.push(Entry {
            node,
            input,
            output,
            weights: None,
        });
    }

    /// Append the input processing node; returns the network input value
    pub fn add_input_process(&mut self, node: InputProcess, num_channels: usize) -> Result<ValueId> {
        self.check_open()?;
        if self.input_index.is_some() {
            return Err(Error::invalid_operation("graph already has an input process"));
        }
        let desc = node.dst_desc().clone();
        if desc.c() != round_up(num_channels, self.block_c()) {
            return Err(Error::invalid_argument(
                "num_channels",
                format!(
                    "{num_channels} channels padded to {} do not match {desc}",
                    self.block_c()
                ),
            ));
        }
        let out = self.produce(desc, smallvec![num_channels]);
        self.input_index = Some(self.entries.len());
        self.push(GraphNode::Input(node), None, Some(out));
        Ok(out)
    }

    /// Append a convolution of `src` with host weights
    ///
    /// Channels are padded to the device's `block_c`. When the device does not
    /// fuse post-ops the pooling or upsampling becomes a separate node.
    pub fn add_conv(
        &mut self,
        name: &str,
        src: ValueId,
        weight: &HostTensor,
        bias: &HostTensor,
        post_op: PostOp,
        activation: Activation,
    ) -> Result<ValueId> {
        self.check_open()?;
        let caps = self.device.caps().clone();
        let src_value = self.value(src)?;
        let src_desc = src_value.desc.clone();
        let groups = src_value.groups.clone();

        let (padded, padded_bias, dims) = pad_weights(weight, bias, &groups, self.block_c())?;
        let weight_desc = TensorDesc::new(&dims, caps.weight_layout, caps.tensor_dtype)?;
        let fused = post_op == PostOp::None || caps.fused_post_ops;
        let conv_post_op = if fused { post_op } else { PostOp::None };
        let desc = ConvDesc::new(src_desc, weight_desc.clone(), conv_post_op)
            .with_activation(activation);
        let node = self.device.new_conv_node(name, desc)?;

        self.consume(src)?;
        let out = self.produce(node.dst_desc().clone(), smallvec![weight.dims()[0]]);
        self.entries.push(Entry {
            node: GraphNode::Conv(Box::new(node)),
            input: Some(src),
            output: Some(out),
            weights: Some(ConvWeights {
                weight_desc,
                weight: padded,
                bias: padded_bias,
            }),
        });

        if fused {
            return Ok(out);
        }
        match post_op {
            PostOp::Pool => self.add_pool(&format!("{name}_pool"), out),
            PostOp::Upsample => self.add_upsample(&format!("{name}_upsample"), out),
            PostOp::None => Ok(out),
        }
    }

    /// Append a convolution over the channel concatenation of `a` and `b`
    ///
    /// The two values are placed next to each other in memory, so the
    /// concatenation costs no copy. Each value can take part in one
    /// concatenation only.
    #[allow(clippy::too_many_arguments)]
    pub fn add_concat_conv(
        &mut self,
        name: &str,
        a: ValueId,
        b: ValueId,
        weight: &HostTensor,
        bias: &HostTensor,
        post_op: PostOp,
        activation: Activation,
    ) -> Result<ValueId> {
        self.check_open()?;
        let concat = self.concat(a, b)?;
        self.add_conv(name, concat, weight, bias, post_op, activation)
    }

    fn concat(&mut self, a: ValueId, b: ValueId) -> Result<ValueId> {
        let (va, vb) = (self.value(a)?, self.value(b)?);
        if a == b {
            return Err(Error::invalid_argument("b", "cannot concatenate a value with itself"));
        }
        let (da, db) = (&va.desc, &vb.desc);
        if da.layout() != TensorLayout::Chw || db.layout() != TensorLayout::Chw {
            return Err(Error::unsupported_hardware(
                "channel concatenation requires the Chw tensor layout",
            ));
        }
        if da.h() != db.h() || da.w() != db.w() || da.dtype() != db.dtype() {
            return Err(Error::invalid_argument(
                "b",
                format!("cannot concatenate {da} with {db}"),
            ));
        }
        if self.allocs[va.alloc].members != 1 || self.allocs[vb.alloc].members != 1 {
            return Err(Error::invalid_argument(
                "b",
                "value is already part of a concatenation",
            ));
        }

        let desc = TensorDesc::new(&[da.c() + db.c(), da.h(), da.w()], da.layout(), da.dtype())?;
        let offset_b = da.byte_size();
        let (alloc_a, alloc_b) = (va.alloc, vb.alloc);
        let mut groups = va.groups.clone();
        groups.extend_from_slice(&vb.groups);
        let mut producers = va.producers.clone();
        producers.extend_from_slice(&vb.producers);

        let merged = Alloc {
            byte_size: offset_b + db.byte_size(),
            first: self.allocs[alloc_a].first.min(self.allocs[alloc_b].first),
            last: self.allocs[alloc_a].last.max(self.allocs[alloc_b].last),
            merged: false,
            members: 3,
        };
        self.allocs[alloc_a].merged = true;
        self.allocs[alloc_b].merged = true;
        self.allocs.push(merged);
        let alloc = self.allocs.len() - 1;

        self.values[a.index].alloc = alloc;
        self.values[a.index].offset = 0;
        self.values[b.index].alloc = alloc;
        self.values[b.index].offset = offset_b;
        self.values.push(Value {
            desc,
            alloc,
            offset: 0,
            producers,
            groups,
            tensor: None,
        });
        Ok(ValueId {
            graph: self.id,
            index: self.values.len() - 1,
        })
    }

    /// Append a 2x2 max-pooling node
    pub fn add_pool(&mut self, name: &str, src: ValueId) -> Result<ValueId> {
        self.check_open()?;
        let value = self.value(src)?;
        let groups = value.groups.clone();
        let node = self.device.new_pool_node(name, PoolDesc::new(value.desc.clone()))?;
        self.consume(src)?;
        let out = self.produce(node.dst_desc().clone(), groups);
        self.push(GraphNode::Pool(node), Some(src), Some(out));
        Ok(out)
    }

    /// Append a 2x nearest-neighbor upsampling node
    pub fn add_upsample(&mut self, name: &str, src: ValueId) -> Result<ValueId> {
        self.check_open()?;
        let value = self.value(src)?;
        let groups = value.groups.clone();
        let node = self
            .device
            .new_upsample_node(name, UpsampleDesc::new(value.desc.clone()))?;
        self.consume(src)?;
        let out = self.produce(node.dst_desc().clone(), groups);
        self.push(GraphNode::Upsample(node), Some(src), Some(out));
        Ok(out)
    }

    /// Append the output processing node reading `src`
    pub fn add_output_process(&mut self, node: OutputProcess, src: ValueId) -> Result<()> {
        self.check_open()?;
        if self.output_index.is_some() {
            return Err(Error::invalid_operation("graph already has an output process"));
        }
        let desc = &self.value(src)?.desc;
        if node.src_desc() != desc {
            return Err(Error::desc_mismatch("src", node.src_desc(), desc));
        }
        self.consume(src)?;
        self.output_index = Some(self.entries.len());
        self.push(GraphNode::Output(node), Some(src), None);
        Ok(())
    }

    /// Producer to consumer node index pairs, ordered by consumer
    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut edges = Vec::new();
        for (consumer, entry) in self.entries.iter().enumerate() {
            if let Some(input) = entry.input {
                for &producer in &self.values[input.index].producers {
                    edges.push((producer, consumer));
                }
            }
        }
        edges
    }

    /// Offsets of all live allocations and the total scratch size
    fn plan(&self) -> (Vec<usize>, usize) {
        let alignment = self.device.caps().buffer_alignment.max(1);
        let mut order: Vec<usize> = (0..self.allocs.len())
            .filter(|&i| !self.allocs[i].merged)
            .collect();
        order.sort_by_key(|&i| (self.allocs[i].first, std::cmp::Reverse(self.allocs[i].byte_size)));

        let mut offsets = vec![0usize; self.allocs.len()];
        let mut placed: Vec<usize> = Vec::with_capacity(order.len());
        let mut total = 0;

        for &i in &order {
            let alloc = &self.allocs[i];
            let mut busy: Vec<(usize, usize)> = placed
                .iter()
                .filter(|&&j| {
                    let other = &self.allocs[j];
                    other.first <= alloc.last && alloc.first <= other.last
                })
                .map(|&j| (offsets[j], offsets[j] + self.allocs[j].byte_size))
                .collect();
            busy.sort_unstable();

            let mut offset = 0;
            for (start, end) in busy {
                if offset + alloc.byte_size <= start {
                    break;
                }
                offset = offset.max(round_up(end, alignment));
            }
            offsets[i] = offset;
            total = total.max(offset + alloc.byte_size);
            placed.push(i);
        }
        (offsets, round_up(total, alignment))
    }

    /// Scratch bytes `finalize` will allocate
    pub fn scratch_byte_size(&self) -> usize {
        self.plan().1
    }

    /// Weight bytes `finalize` will allocate
    pub fn weights_byte_size(&self) -> usize {
        let alignment = self.device.caps().buffer_alignment.max(1);
        self.entries
            .iter()
            .filter_map(|e| e.weights.as_ref())
            .map(|w| {
                let dtype = w.weight_desc.dtype();
                round_up(w.weight_desc.byte_size(), alignment)
                    + round_up(w.bias.len() * dtype.size_in_bytes(), alignment)
            })
            .sum()
    }

    /// Whether memory has been allocated and tensors bound
    pub fn is_finalized(&self) -> bool {
        self.scratch.is_some()
    }

    /// Allocate scratch and weight memory and bind every tensor
    pub fn finalize(&mut self) -> Result<()> {
        if self.is_finalized() {
            return Ok(());
        }
        let alignment = self.device.caps().buffer_alignment.max(1);
        let (offsets, scratch_size) = self.plan();
        let scratch = self.device.new_buffer(scratch_size.max(alignment))?;
        let weights_size = self.weights_byte_size();
        let weights = self.device.new_buffer(weights_size.max(alignment))?;

        for value in &mut self.values {
            let offset = offsets[value.alloc] + value.offset;
            value.tensor = Some(Tensor::new(scratch.clone(), value.desc.clone(), offset)?);
        }

        let mut weight_offset = 0;
        for index in 0..self.entries.len() {
            let input = self.entries[index].input.map(|id| self.values[id.index].tensor.clone());
            let output = self.entries[index].output.map(|id| self.values[id.index].tensor.clone());
            let input = input.flatten();
            let output = output.flatten();

            let entry = &mut self.entries[index];
            let uploaded = match &entry.weights {
                Some(w) => Some(upload_weights(&weights, &mut weight_offset, w, alignment)?),
                None => None,
            };

            match &mut entry.node {
                GraphNode::Input(node) => {
                    if let Some(dst) = output {
                        node.set_dst(dst)?;
                    }
                }
                GraphNode::Conv(node) => {
                    if let Some((weight, bias)) = uploaded {
                        node.set_weight(weight)?;
                        node.set_bias(bias)?;
                    }
                    if let Some(src) = input {
                        node.set_src(src)?;
                    }
                    if let Some(dst) = output {
                        node.set_dst(dst)?;
                    }
                }
                GraphNode::Pool(node) => {
                    if let Some(src) = input {
                        node.set_src(src)?;
                    }
                    if let Some(dst) = output {
                        node.set_dst(dst)?;
                    }
                }
                GraphNode::Upsample(node) => {
                    if let Some(src) = input {
                        node.set_src(src)?;
                    }
                    if let Some(dst) = output {
                        node.set_dst(dst)?;
                    }
                }
                GraphNode::Output(node) => {
                    if let Some(src) = input {
                        node.set_src(src)?;
                    }
                }
            }
        }

        tracing::debug!(
            nodes = self.entries.len(),
            scratch_bytes = scratch_size,
            weight_bytes = weights_size,
            "Graph finalized"
        );
        self.scratch = Some(scratch);
        self.weights = Some(weights);
        Ok(())
    }

    /// Set the copy regions of the process nodes for the next run
    pub fn set_tile(&mut self, input: Tile, output: Tile) -> Result<()> {
        if let Some(GraphNode::Input(node)) = self.input_index.map(|i| &mut self.entries[i].node) {
            node.set_tile(input)?;
        }
        if let Some(GraphNode::Output(node)) = self.output_index.map(|i| &mut self.entries[i].node) {
            node.set_tile(output)?;
        }
        Ok(())
    }

    /// Redirect the output process to another image of the same size
    pub fn set_output_image(&mut self, image: Image) -> Result<()> {
        match self.output_index.map(|i| &mut self.entries[i].node) {
            Some(GraphNode::Output(node)) => node.set_output(image),
            _ => Err(Error::invalid_operation("graph has no output process")),
        }
    }

    /// Submit every node in order
    pub fn run(&self) -> Result<()> {
        if !self.is_finalized() {
            return Err(Error::invalid_operation("graph has not been finalized"));
        }
        for entry in &self.entries {
            let node = entry.node.as_node();
            tracing::trace!(node = node.name(), "Submitting node");
            node.submit()?;
        }
        Ok(())
    }
}

/// Write padded weights into the weights buffer in the device layout
fn upload_weights(
    buffer: &Buffer,
    offset: &mut usize,
    w: &ConvWeights,
    alignment: usize,
) -> Result<(Tensor, Tensor)> {
    let desc = &w.weight_desc;
    let dtype = desc.dtype();
    let elem = dtype.size_in_bytes();
    let [o, i, kh, kw] = [desc.o(), desc.i(), desc.h(), desc.w()];

    let mut bytes = vec![0u8; desc.byte_size()];
    let mut src = w.weight.iter();
    for oc in 0..o {
        for ic in 0..i {
            for y in 0..kh {
                for x in 0..kw {
                    let v = src.next().copied().unwrap_or_default();
                    let at = desc.offset_of(&[oc, ic, y, x]) * elem;
                    dtype.encode(v, &mut bytes[at..]);
                }
            }
        }
    }
    buffer.write(*offset, &bytes)?;
    let weight = Tensor::new(buffer.clone(), desc.clone(), *offset)?;
    *offset += round_up(bytes.len(), alignment);

    let bias_desc = TensorDesc::vector(w.bias.len(), dtype);
    let mut bytes = vec![0u8; bias_desc.byte_size()];
    for (k, &v) in w.bias.iter().enumerate() {
        dtype.encode(v, &mut bytes[k * elem..]);
    }
    buffer.write(*offset, &bytes)?;
    let bias = Tensor::new(buffer.clone(), bias_desc, *offset)?;
    *offset += round_up(bytes.len(), alignment);
    Ok((weight, bias))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_weights_groups() {
        // 1 output, inputs 2 + 1 real channels, block 4
        let weight = HostTensor::new(&[1, 3, 1, 1], vec![1.0, 2.0, 3.0]).unwrap();
        let bias = HostTensor::new(&[1], vec![0.5]).unwrap();
        let (w, b, dims) = pad_weights(&weight, &bias, &[2, 1], 4).unwrap();
        assert_eq!(dims, [4, 8, 1, 1]);
        assert_eq!(&w[..8], &[1.0, 2.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0]);
        assert!(w[8..].iter().all(|&v| v == 0.0));
        assert_eq!(b, vec![0.5, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_pad_weights_rejects_channel_mismatch() {
        let weight = HostTensor::new(&[1, 3, 1, 1], vec![0.0; 3]).unwrap();
        let bias = HostTensor::new(&[1], vec![0.0]).unwrap();
        assert!(pad_weights(&weight, &bias, &[2, 2], 1).is_err());
        let bias2 = HostTensor::new(&[2], vec![0.0; 2]).unwrap();
        assert!(pad_weights(&weight, &bias2, &[3], 1).is_err());
    }
}
