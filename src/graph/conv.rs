//! Convolution node

use super::desc::ConvDesc;
use super::node::{Node, bound, check_binding};
use crate::error::Result;
use crate::runtime::ConvKernel;
use crate::tensor::{Tensor, TensorDesc};

/// Convolution with optional fused post-op and activation
///
/// Created by `Device::new_conv_node`, which validates the descriptor. Each
/// setter checks the tensor descriptor, runs the backend hook, and only then
/// replaces the previous binding; a rejected tensor leaves the node unchanged.
pub struct ConvNode {
    name: String,
    desc: ConvDesc,
    dst_desc: TensorDesc,
    kernel: Box<dyn ConvKernel>,
    src: Option<Tensor>,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    dst: Option<Tensor>,
}

impl std::fmt::Debug for ConvNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvNode")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .field("dst_desc", &self.dst_desc)
            .field("src_bound", &self.src.is_some())
            .field("weight_bound", &self.weight.is_some())
            .field("bias_bound", &self.bias.is_some())
            .field("dst_bound", &self.dst.is_some())
            .finish()
    }
}

impl ConvNode {
    pub(crate) fn new(
        name: &str,
        desc: ConvDesc,
        dst_desc: TensorDesc,
        kernel: Box<dyn ConvKernel>,
    ) -> Self {
        Self {
            name: name.to_string(),
            desc,
            dst_desc,
            kernel,
            src: None,
            weight: None,
            bias: None,
            dst: None,
        }
    }

    /// Convolution descriptor
    pub fn desc(&self) -> &ConvDesc {
        &self.desc
    }

    /// Derived destination descriptor
    pub fn dst_desc(&self) -> &TensorDesc {
        &self.dst_desc
    }

    /// Bind the source tensor
    pub fn set_src(&mut self, src: Tensor) -> Result<()> {
        check_binding("src", &self.desc.src_desc, &src)?;
        self.kernel.update_src(&src)?;
        self.src = Some(src);
        Ok(())
    }

    /// Bind the weight tensor
    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        check_binding("weight", &self.desc.weight_desc, &weight)?;
        self.kernel.update_weight(&weight)?;
        self.weight = Some(weight);
        Ok(())
    }

    /// Bind the bias tensor
    pub fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        check_binding("bias", &self.desc.bias_desc, &bias)?;
        self.kernel.update_bias(&bias)?;
        self.bias = Some(bias);
        Ok(())
    }

    /// Bind the destination tensor
    pub fn set_dst(&mut self, dst: Tensor) -> Result<()> {
        check_binding("dst", &self.dst_desc, &dst)?;
        self.kernel.update_dst(&dst)?;
        self.dst = Some(dst);
        Ok(())
    }

    /// Currently bound source
    pub fn src(&self) -> Option<&Tensor> {
        self.src.as_ref()
    }

    /// Currently bound weights
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// Currently bound bias
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Currently bound destination
    pub fn dst(&self) -> Option<&Tensor> {
        self.dst.as_ref()
    }
}

impl Node for ConvNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self) -> Result<()> {
        let src = bound(&self.name, "src", &self.src)?;
        let weight = bound(&self.name, "weight", &self.weight)?;
        let bias = bound(&self.name, "bias", &self.bias)?;
        let dst = bound(&self.name, "dst", &self.dst)?;
        self.kernel.submit(src, weight, bias, dst)
    }
}
