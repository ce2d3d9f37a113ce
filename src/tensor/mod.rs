//! Tensor descriptors, buffers and tensor views
//!
//! This module provides the memory model: [`Buffer`] regions with a
//! [`Storage`] class, [`TensorDesc`] shape descriptors, and [`Tensor`] views
//! that bind a descriptor to a buffer offset.

mod core;
mod desc;
mod shape;
mod storage;

pub use core::Tensor;
pub use desc::{TensorDesc, TensorLayout};
pub use shape::Dims;
pub use storage::{Access, Buffer, BufferMapping, Storage};
