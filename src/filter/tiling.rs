//! Tile geometry for images larger than one network pass
//!
//! Tiles overlap by [`OVERLAP`] pixels on every side that borders another
//! tile, which exceeds the dependency radius of the network. Tile origins and
//! the placement of each tile's pixels inside its tensor are multiples of
//! [`ALIGNMENT`], so every pixel sees the same pooling grid and padding as in
//! a single pass over the whole image. Only each tile's interior is written
//! back. Interiors cover the image exactly once.

use crate::graph::Tile;
use crate::util::{isqrt, round_down, round_up};

/// Receptive field of the network in pixels
pub const RECEPTIVE_FIELD: usize = 174;

/// Tile dimensions and origins are multiples of this (four 2x2 poolings)
pub const ALIGNMENT: usize = 16;

/// Overlap between neighbouring tiles
pub const OVERLAP: usize = round_up(RECEPTIVE_FIELD / 2, ALIGNMENT);

/// Smallest tile dimension along a split axis
pub const MIN_TILE_SIZE: usize = 3 * OVERLAP;

/// Default cap on the pixels of one tile
pub const DEFAULT_MAX_TILE_PIXELS: usize = 2160 * 2160;

/// Tile height and width for an image under a pixel cap
///
/// Returns `None` when the image must be split and the cap leaves a split
/// dimension below [`MIN_TILE_SIZE`].
pub fn tile_size(height: usize, width: usize, max_tile_pixels: usize) -> Option<(usize, usize)> {
    let (hp, wp) = (round_up(height, ALIGNMENT), round_up(width, ALIGNMENT));
    if hp.saturating_mul(wp) <= max_tile_pixels {
        return Some((hp, wp));
    }

    let side = round_down(isqrt(max_tile_pixels), ALIGNMENT);
    let (th, tw) = if hp <= side {
        (hp, round_down(max_tile_pixels / hp, ALIGNMENT))
    } else if wp <= side {
        (round_down(max_tile_pixels / wp, ALIGNMENT), wp)
    } else {
        (side, side)
    };

    let split_ok = |t: usize, full: usize| t == full || t >= MIN_TILE_SIZE;
    (split_ok(th, hp) && split_ok(tw, wp)).then_some((th, tw))
}

/// Smallest pixel cap for which [`tile_size`] succeeds
pub fn min_tile_pixels(height: usize, width: usize) -> usize {
    let (hp, wp) = (round_up(height, ALIGNMENT), round_up(width, ALIGNMENT));
    let full = hp * wp;
    full.min(MIN_TILE_SIZE * hp.min(wp).min(MIN_TILE_SIZE))
}

/// Tiles along one image axis
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TileAxis {
    extent: usize,
    tile_size: usize,
    step: usize,
    count: usize,
}

/// One tile along an axis, in image coordinates
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AxisSpan {
    /// First image pixel loaded
    pub start: usize,
    /// Image pixels loaded
    pub size: usize,
    /// First pixel written to the output
    pub interior_start: usize,
    /// One past the last pixel written to the output
    pub interior_end: usize,
    /// Tensor position of the first loaded pixel
    pub align_offset: usize,
}

impl AxisSpan {
    /// Tensor position of the first interior pixel
    pub fn interior_offset(&self) -> usize {
        self.interior_start - self.start + self.align_offset
    }

    /// Pixels written to the output
    pub fn interior_size(&self) -> usize {
        self.interior_end - self.interior_start
    }
}

impl TileAxis {
    /// Lay out tiles of at most `max_size` pixels over `extent` pixels
    pub fn new(extent: usize, max_size: usize) -> Self {
        let padded = round_up(extent, ALIGNMENT);
        if padded <= max_size || extent <= 2 * OVERLAP {
            return Self {
                extent,
                tile_size: padded,
                step: padded,
                count: 1,
            };
        }
        let inner = extent - 2 * OVERLAP;
        let count = inner.div_ceil(max_size - 2 * OVERLAP);
        let step = round_up(inner.div_ceil(count), ALIGNMENT);
        let count = inner.div_ceil(step);
        Self {
            extent,
            tile_size: step + 2 * OVERLAP,
            step,
            count,
        }
    }

    /// Image pixels along the axis
    pub fn extent(&self) -> usize {
        self.extent
    }

    /// Tensor size along the axis
    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    /// Distance between tile origins
    pub fn step(&self) -> usize {
        self.step
    }

    /// Number of tiles
    pub fn count(&self) -> usize {
        self.count
    }

    /// Tile `i` of the axis
    pub fn span(&self, i: usize) -> AxisSpan {
        let start = i * self.step;
        let size = (self.extent - start).min(self.tile_size);
        let last = i + 1 == self.count;
        AxisSpan {
            start,
            size,
            interior_start: if i > 0 { start + OVERLAP } else { start },
            interior_end: if last { start + size } else { start + size - OVERLAP },
            align_offset: self.tile_size - round_up(size, ALIGNMENT),
        }
    }
}

/// One tile of an image plan
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlannedTile {
    /// Tile row
    pub row: usize,
    /// Tile column
    pub col: usize,
    /// Image region into the tile tensor
    pub input: Tile,
    /// Tile tensor interior into the image
    pub output: Tile,
}

/// Tile layout of a whole image
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TilePlan {
    rows: TileAxis,
    cols: TileAxis,
}

impl TilePlan {
    /// Plan tiles for an image under a pixel cap; `None` if infeasible
    pub fn new(height: usize, width: usize, max_tile_pixels: usize) -> Option<Self> {
        let (th, tw) = tile_size(height, width, max_tile_pixels)?;
        Some(Self {
            rows: TileAxis::new(height, th),
            cols: TileAxis::new(width, tw),
        })
    }

    /// Vertical axis
    pub fn rows(&self) -> &TileAxis {
        &self.rows
    }

    /// Horizontal axis
    pub fn cols(&self) -> &TileAxis {
        &self.cols
    }

    /// Tensor height of every tile
    pub fn tile_height(&self) -> usize {
        self.rows.tile_size
    }

    /// Tensor width of every tile
    pub fn tile_width(&self) -> usize {
        self.cols.tile_size
    }

    /// Total number of tiles
    pub fn num_tiles(&self) -> usize {
        self.rows.count * self.cols.count
    }

    /// Tiles in row-major order
    pub fn tiles(&self) -> impl Iterator<Item = PlannedTile> + '_ {
        (0..self.rows.count).flat_map(move |row| {
            let ys = self.rows.span(row);
            (0..self.cols.count).map(move |col| {
                let xs = self.cols.span(col);
                PlannedTile {
                    row,
                    col,
                    input: Tile {
                        src_y: ys.start,
                        src_x: xs.start,
                        dst_y: ys.align_offset,
                        dst_x: xs.align_offset,
                        height: ys.size,
                        width: xs.size,
                    },
                    output: Tile {
                        src_y: ys.interior_offset(),
                        src_x: xs.interior_offset(),
                        dst_y: ys.interior_start,
                        dst_x: xs.interior_start,
                        height: ys.interior_size(),
                        width: xs.interior_size(),
                    },
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_axis_covers(axis: &TileAxis) {
        let mut next = 0;
        for i in 0..axis.count() {
            let span = axis.span(i);
            assert_eq!(span.interior_start, next, "gap or overlap at tile {i}");
            assert!(span.interior_end > span.interior_start);
            assert_eq!(span.start % ALIGNMENT, 0);
            assert_eq!(span.align_offset % ALIGNMENT, 0);
            assert!(span.align_offset + span.size <= axis.tile_size());
            if i > 0 {
                assert!(span.interior_start - span.start >= OVERLAP);
            }
            if i + 1 < axis.count() {
                assert!(span.start + span.size - span.interior_end >= OVERLAP);
            }
            next = span.interior_end;
        }
        assert_eq!(next, axis.extent());
    }

    #[test]
    fn test_constants() {
        assert_eq!(OVERLAP, 96);
        assert_eq!(MIN_TILE_SIZE, 288);
        assert!(MIN_TILE_SIZE >= RECEPTIVE_FIELD);
    }

    #[test]
    fn test_single_tile() {
        let plan = TilePlan::new(1080, 1920, DEFAULT_MAX_TILE_PIXELS).unwrap();
        assert_eq!(plan.num_tiles(), 1);
        assert_eq!((plan.tile_height(), plan.tile_width()), (1088, 1920));
        let tile = plan.tiles().next().unwrap();
        assert_eq!(tile.input.height, 1080);
        assert_eq!(tile.output.width, 1920);
        assert_eq!((tile.input.dst_y, tile.output.src_y), (0, 0));
    }

    #[test]
    fn test_4k_image_gives_2x2_tiles() {
        let plan = TilePlan::new(3000, 4000, DEFAULT_MAX_TILE_PIXELS).unwrap();
        assert_eq!((plan.rows().count(), plan.cols().count()), (2, 2));
        assert_eq!((plan.tile_height(), plan.tile_width()), (1600, 2096));
        assert!(plan.tile_height() * plan.tile_width() <= DEFAULT_MAX_TILE_PIXELS);
        assert_axis_covers(plan.rows());
        assert_axis_covers(plan.cols());
    }

    #[test]
    fn test_strip_tiles() {
        // Full-height strips when the height fits the square side
        let plan = TilePlan::new(200, 500, 208 * 288).unwrap();
        assert_eq!(plan.rows().count(), 1);
        assert_eq!(plan.tile_height(), 208);
        assert_eq!((plan.cols().count(), plan.tile_width()), (4, 272));
        assert_axis_covers(plan.cols());
    }

    #[test]
    fn test_coverage_across_sizes() {
        for &(h, w, max) in &[
            (500, 500, 288 * 288),
            (320, 600, 320 * 320),
            (1001, 777, 400 * 400),
            (4321, 97, 300 * 128),
        ] {
            let plan = TilePlan::new(h, w, max).unwrap();
            assert_axis_covers(plan.rows());
            assert_axis_covers(plan.cols());
            let area: usize = plan
                .tiles()
                .map(|t| t.output.width * t.output.height)
                .sum();
            assert_eq!(area, h * w);
        }
        let plan = TilePlan::new(500, 500, 288 * 288).unwrap();
        assert_eq!(plan.num_tiles(), 16);
        assert_eq!(plan.tile_width(), 272);
    }

    #[test]
    fn test_infeasible_cap() {
        assert!(TilePlan::new(1000, 1000, 287 * 287).is_none());
        assert!(TilePlan::new(200, 5000, 208 * 200).is_none());
        assert_eq!(min_tile_pixels(1000, 1000), 288 * 288);
        assert_eq!(min_tile_pixels(200, 5000), 208 * 288);
        assert!(TilePlan::new(1000, 1000, min_tile_pixels(1000, 1000)).is_some());
        assert!(TilePlan::new(200, 5000, min_tile_pixels(200, 5000)).is_some());
    }

    #[test]
    fn test_tile_order_is_row_major() {
        let plan = TilePlan::new(700, 700, 300 * 300).unwrap();
        let order: Vec<(usize, usize)> = plan.tiles().map(|t| (t.row, t.col)).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert_eq!(order.len(), plan.num_tiles());
    }
}
