//! Input and output processing nodes
//!
//! These nodes move pixels between external [`Image`]s and the network's tile
//! tensors. They work through host staging: the input node reads the tile
//! region of every source image, maps the values into network range and
//! uploads the whole tile tensor (zeros outside the region). The output node
//! downloads the tile tensor, which synchronizes its engine, maps the values
//! back and writes only the tile region of the destination image.

use super::node::{Node, bound, check_binding};
use crate::error::{Error, Result};
use crate::filter::TransferFunction;
use crate::image::Image;
use crate::tensor::{Tensor, TensorDesc};
use std::sync::Arc;

/// Network channels produced from one image
pub(crate) const CHANNELS_PER_IMAGE: usize = 3;

/// Copy rectangle between an image and a tile tensor
///
/// For the input node the source is the image and the destination the tile
/// tensor; for the output node it is the other way around.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Tile {
    /// Source row of the first copied pixel
    pub src_y: usize,
    /// Source column of the first copied pixel
    pub src_x: usize,
    /// Destination row of the first copied pixel
    pub dst_y: usize,
    /// Destination column of the first copied pixel
    pub dst_x: usize,
    /// Rows copied
    pub height: usize,
    /// Columns copied
    pub width: usize,
}

/// How image values of one source map to network values
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelMapping {
    /// High dynamic range colour through the transfer function
    Hdr,
    /// Low dynamic range colour, clamped to [0, 1]
    Ldr,
    /// Albedo in [0, 1]
    Albedo,
    /// Normals in [-1, 1], remapped to [0, 1]
    Normal,
    /// Signed directional values in [-1, 1], remapped to [0, 1]
    Directional,
}

/// Values shared by both process nodes
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Mapping of the main image (colour, or the auxiliary image being filtered)
    pub mapping: ChannelMapping,
    /// Transfer function for colour mappings
    pub transfer: Arc<dyn TransferFunction>,
    /// Scale applied to colour before the transfer function
    pub input_scale: f32,
}

impl ProcessConfig {
    fn forward(&self, mapping: ChannelMapping, v: f32) -> f32 {
        let v = if v.is_finite() { v } else { 0.0 };
        match mapping {
            ChannelMapping::Hdr => self.transfer.forward((v * self.input_scale).max(0.0)),
            ChannelMapping::Ldr => self
                .transfer
                .forward((v * self.input_scale).clamp(0.0, 1.0)),
            ChannelMapping::Albedo => v.clamp(0.0, 1.0),
            ChannelMapping::Normal => v.clamp(-1.0, 1.0) * 0.5 + 0.5,
            ChannelMapping::Directional => (v * self.input_scale).clamp(-1.0, 1.0) * 0.5 + 0.5,
        }
    }

    fn inverse(&self, v: f32) -> f32 {
        let v = if v.is_finite() { v } else { 0.0 };
        match self.mapping {
            ChannelMapping::Hdr => self.transfer.inverse(v).max(0.0) / self.input_scale,
            ChannelMapping::Ldr => self.transfer.inverse(v).clamp(0.0, 1.0) / self.input_scale,
            ChannelMapping::Albedo => v.clamp(0.0, 1.0),
            ChannelMapping::Normal => (v * 2.0 - 1.0).clamp(-1.0, 1.0),
            ChannelMapping::Directional => (v * 2.0 - 1.0).clamp(-1.0, 1.0) / self.input_scale,
        }
    }
}

fn check_tile(
    tile: &Tile,
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Result<()> {
    let fits = tile.src_x + tile.width <= src_w
        && tile.src_y + tile.height <= src_h
        && tile.dst_x + tile.width <= dst_w
        && tile.dst_y + tile.height <= dst_h;
    if !fits {
        return Err(Error::invalid_argument(
            "tile",
            format!("{tile:?} exceeds source {src_w}x{src_h} or destination {dst_w}x{dst_h}"),
        ));
    }
    Ok(())
}

/// Images into the network input tensor
pub struct InputProcess {
    name: String,
    dst_desc: TensorDesc,
    config: ProcessConfig,
    main: Image,
    albedo: Option<Image>,
    normal: Option<Image>,
    tile: Option<Tile>,
    dst: Option<Tensor>,
}

impl InputProcess {
    /// Create an input node writing tensors of `dst_desc`
    ///
    /// Network channels are filled in order: main image, albedo, normal, then
    /// zeros up to `dst_desc.c()`.
    pub fn new(
        name: &str,
        dst_desc: TensorDesc,
        config: ProcessConfig,
        main: Image,
        albedo: Option<Image>,
        normal: Option<Image>,
    ) -> Result<Self> {
        if dst_desc.rank() != 3 {
            return Err(Error::invalid_argument(
                "dst_desc",
                format!("expected a rank 3 tensor, got {dst_desc}"),
            ));
        }
        let images = 1 + albedo.is_some() as usize + normal.is_some() as usize;
        if images * CHANNELS_PER_IMAGE > dst_desc.c() {
            return Err(Error::invalid_argument(
                "dst_desc",
                format!(
                    "{} channels cannot hold {images} images",
                    dst_desc.c()
                ),
            ));
        }
        for image in std::iter::once(&main).chain(albedo.iter()).chain(normal.iter()) {
            if image.format().num_channels() < CHANNELS_PER_IMAGE {
                return Err(Error::invalid_argument(
                    "image",
                    format!("format {:?} has fewer than 3 channels", image.format()),
                ));
            }
        }
        Ok(Self {
            name: name.to_string(),
            dst_desc,
            config,
            main,
            albedo,
            normal,
            tile: None,
            dst: None,
        })
    }

    /// Descriptor of the produced tensor
    pub fn dst_desc(&self) -> &TensorDesc {
        &self.dst_desc
    }

    /// Select the image region copied by the next submission
    pub fn set_tile(&mut self, tile: Tile) -> Result<()> {
        check_tile(
            &tile,
            self.main.width(),
            self.main.height(),
            self.dst_desc.w(),
            self.dst_desc.h(),
        )?;
        self.tile = Some(tile);
        Ok(())
    }

    /// Bind the destination tensor
    pub fn set_dst(&mut self, dst: Tensor) -> Result<()> {
        check_binding("dst", &self.dst_desc, &dst)?;
        self.dst = Some(dst);
        Ok(())
    }

    fn sources(&self) -> impl Iterator<Item = (&Image, ChannelMapping)> {
        std::iter::once((&self.main, self.config.mapping))
            .chain(self.albedo.iter().map(|i| (i, ChannelMapping::Albedo)))
            .chain(self.normal.iter().map(|i| (i, ChannelMapping::Normal)))
    }
}

impl Node for InputProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self) -> Result<()> {
        let dst = bound(&self.name, "dst", &self.dst)?;
        let tile = self.tile.ok_or_else(|| {
            Error::invalid_operation(format!("node '{}' has no tile set", self.name))
        })?;

        let desc = dst.desc();
        let strides = desc.strides();
        let (sc, sh, sw) = (strides[0], strides[1], strides[2]);
        let mut values = vec![0.0f32; desc.num_elements()];

        for (k, (image, mapping)) in self.sources().enumerate() {
            let pixels = image.read_pixels(tile.src_x, tile.src_y, tile.width, tile.height)?;
            let nc = image.format().num_channels();
            for (i, pixel) in pixels.chunks_exact(nc).enumerate() {
                let y = tile.dst_y + i / tile.width;
                let x = tile.dst_x + i % tile.width;
                for c in 0..CHANNELS_PER_IMAGE {
                    let idx = (k * CHANNELS_PER_IMAGE + c) * sc + y * sh + x * sw;
                    values[idx] = self.config.forward(mapping, pixel[c]);
                }
            }
        }
        dst.write_f32(&values)
    }
}

/// Network output tensor into an image
pub struct OutputProcess {
    name: String,
    src_desc: TensorDesc,
    config: ProcessConfig,
    output: Image,
    tile: Option<Tile>,
    src: Option<Tensor>,
}

impl OutputProcess {
    /// Create an output node reading tensors of `src_desc`
    pub fn new(
        name: &str,
        src_desc: TensorDesc,
        config: ProcessConfig,
        output: Image,
    ) -> Result<Self> {
        if src_desc.rank() != 3 || src_desc.c() < CHANNELS_PER_IMAGE {
            return Err(Error::invalid_argument(
                "src_desc",
                format!("expected a rank 3 tensor with at least 3 channels, got {src_desc}"),
            ));
        }
        if output.format().num_channels() < CHANNELS_PER_IMAGE {
            return Err(Error::invalid_argument(
                "output",
                format!("format {:?} has fewer than 3 channels", output.format()),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            src_desc,
            config,
            output,
            tile: None,
            src: None,
        })
    }

    /// Descriptor of the consumed tensor
    pub fn src_desc(&self) -> &TensorDesc {
        &self.src_desc
    }

    /// Destination image
    pub fn output(&self) -> &Image {
        &self.output
    }

    /// Replace the destination image; it must have the same size
    pub fn set_output(&mut self, output: Image) -> Result<()> {
        if !output.same_size(&self.output) {
            return Err(Error::invalid_argument(
                "output",
                "replacement image must keep the same size",
            ));
        }
        self.output = output;
        Ok(())
    }

    /// Select the tensor region written by the next submission
    pub fn set_tile(&mut self, tile: Tile) -> Result<()> {
        check_tile(
            &tile,
            self.src_desc.w(),
            self.src_desc.h(),
            self.output.width(),
            self.output.height(),
        )?;
        self.tile = Some(tile);
        Ok(())
    }

    /// Bind the source tensor
    pub fn set_src(&mut self, src: Tensor) -> Result<()> {
        check_binding("src", &self.src_desc, &src)?;
        self.src = Some(src);
        Ok(())
    }
}

impl Node for OutputProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self) -> Result<()> {
        let src = bound(&self.name, "src", &self.src)?;
        let tile = self.tile.ok_or_else(|| {
            Error::invalid_operation(format!("node '{}' has no tile set", self.name))
        })?;
        if tile.width == 0 || tile.height == 0 {
            return Ok(());
        }

        let values = src.read_f32()?;
        let strides = src.desc().strides();
        let (sc, sh, sw) = (strides[0], strides[1], strides[2]);

        let mut pixels = Vec::with_capacity(tile.width * tile.height * CHANNELS_PER_IMAGE);
        for y in tile.src_y..tile.src_y + tile.height {
            for x in tile.src_x..tile.src_x + tile.width {
                for c in 0..CHANNELS_PER_IMAGE {
                    pixels.push(self.config.inverse(values[c * sc + y * sh + x * sw]));
                }
            }
        }
        self.output.write_pixels(
            tile.dst_x,
            tile.dst_y,
            tile.width,
            tile.height,
            CHANNELS_PER_IMAGE,
            &pixels,
        )
    }
}
