//! 2x2 max-pooling node

use super::desc::PoolDesc;
use super::node::{Node, bound, check_binding};
use crate::error::Result;
use crate::runtime::Engine;
use crate::tensor::{Tensor, TensorDesc};
use std::sync::Arc;

/// 2x2 max pooling, halving height and width
pub struct PoolNode {
    name: String,
    desc: PoolDesc,
    dst_desc: TensorDesc,
    engine: Arc<dyn Engine>,
    src: Option<Tensor>,
    dst: Option<Tensor>,
}

impl std::fmt::Debug for PoolNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolNode")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .field("dst_desc", &self.dst_desc)
            .field("src_bound", &self.src.is_some())
            .field("dst_bound", &self.dst.is_some())
            .finish()
    }
}

impl PoolNode {
    pub(crate) fn new(
        name: &str,
        desc: PoolDesc,
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

    /// Pooling descriptor
    pub fn desc(&self) -> &PoolDesc {
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

    /// Currently bound source
    pub fn src(&self) -> Option<&Tensor> {
        self.src.as_ref()
    }

    /// Currently bound destination
    pub fn dst(&self) -> Option<&Tensor> {
        self.dst.as_ref()
    }
}

impl Node for PoolNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self) -> Result<()> {
        let src = bound(&self.name, "src", &self.src)?;
        let dst = bound(&self.name, "dst", &self.dst)?;
        self.engine.submit_pool(src, dst)
    }
}
