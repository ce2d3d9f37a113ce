//! Node trait shared by all compute nodes

use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorDesc};

/// A compute node of the graph
pub trait Node: Send + Sync {
    /// Node name, unique within a graph
    fn name(&self) -> &str;

    /// Enqueue the node's work on its engine
    ///
    /// Fails with `InvalidOperation` if a required tensor is not bound.
    fn submit(&self) -> Result<()>;
}

/// Check a tensor against the descriptor a binding slot expects
pub(crate) fn check_binding(arg: &'static str, expected: &TensorDesc, tensor: &Tensor) -> Result<()> {
    if tensor.desc() != expected {
        return Err(Error::desc_mismatch(arg, expected, tensor.desc()));
    }
    Ok(())
}

/// Fetch a bound tensor or fail with `InvalidOperation`
pub(crate) fn bound<'a>(node: &str, arg: &str, slot: &'a Option<Tensor>) -> Result<&'a Tensor> {
    slot.as_ref().ok_or_else(|| {
        Error::invalid_operation(format!("node '{node}' has no {arg} tensor bound"))
    })
}
