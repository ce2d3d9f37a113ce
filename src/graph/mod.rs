//! Compute graph: node descriptors, nodes and the graph container

mod conv;
mod desc;
#[allow(clippy::module_inception)]
mod graph;
mod node;
mod pool;
mod process;
pub mod unet;
mod upsample;

pub use conv::ConvNode;
pub use desc::{Activation, ConvDesc, PoolDesc, PostOp, UpsampleDesc, weight_desc};
pub use graph::{Graph, ValueId, pad_weights};
pub use node::Node;
pub use pool::PoolNode;
pub(crate) use process::CHANNELS_PER_IMAGE;
pub use process::{ChannelMapping, InputProcess, OutputProcess, ProcessConfig, Tile};
pub use upsample::UpsampleNode;
