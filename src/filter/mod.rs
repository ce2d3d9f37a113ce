//! Denoising filters and their collaborators
//!
//! A [`UNetFilter`] binds images, options and weights, plans tiles under a
//! memory budget at [`commit`](UNetFilter::commit), and runs the network tile
//! by tile at [`execute`](UNetFilter::execute).

mod options;
pub mod tiling;
mod transfer;
mod unet;
mod weights;

pub use options::{AliasingMode, Options, Quality, SyncMode};
pub use tiling::{AxisSpan, PlannedTile, TileAxis, TilePlan};
pub use transfer::{LinearTransfer, TransferFunction};
pub use unet::{ImageSlot, UNetFilter};
pub use weights::{HostTensor, Weights, WeightsKey};
