//! 2x nearest-neighbor upsampling node

use super::desc::UpsampleDesc;
use super::node::{Node, bound, check_binding};
use crate::error::Result;
use crate::runtime::Engine;
use crate::tensor::{Tensor, TensorDesc};
use std::sync::Arc;

/// Nearest-neighbor upsampling, doubling height and width
pub struct UpsampleNode {
    name: String,
    desc: UpsampleDesc,
    dst_desc: TensorDesc,
    engine: Arc<dyn Engine>,
    src: Option<Tensor>,
    dst: Option<Tensor>,
}

impl std::fmt::Debug for UpsampleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsampleNode")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .field("dst_desc", &self.dst_desc)
            .field("src_bound", &self.src.is_some())
            .field("dst_bound", &self.dst.is_some())
            .finish()
    }
}

impl UpsampleNode {
    pub(crate) fn new(
        name: &str,
        desc: UpsampleDesc,
        dst_desc: TensorDesc,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            name: name.to_string(),
            desc,
            dst_desc,
            engine,
            src: None,
            dst: None,
        }
    }

    /// Upsampling descriptor
    pub fn desc(&self) -> &UpsampleDesc {
        &self.desc
    }

    /// Derived destination descriptor
    pub fn dst_desc(&self) -> &TensorDesc {
        &self.dst_desc
    }

    /// Bind the source tensor
    pub fn set_src(&mut self, src: Tensor) -> Result<()> {
        check_binding("src", &self.desc.src_desc, &src)?;
        self.src = Some(src);
        Ok(())
    }

    /// Bind the destination tensor
    pub fn set_dst(&mut self, dst: Tensor) -> Result<()> {
        check_binding("dst", &self.dst_desc, &dst)?;
        self.dst = Some(dst);
        Ok(())
    }
}

impl Node for UpsampleNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self) -> Result<()> {
        let src = bound(&self.name, "src", &self.src)?;
        let dst = bound(&self.name, "dst", &self.dst)?;
        self.engine.submit_upsample(src, dst)
    }
}
