//! U-Net denoising filter: commit/execute lifecycle and the tile loop

use super::options::{AliasingMode, Options, SyncMode};
use super::tiling::{self, DEFAULT_MAX_TILE_PIXELS, TilePlan};
use super::transfer::{LinearTransfer, TransferFunction};
use super::weights::{Weights, WeightsKey};
use crate::error::{Error, ErrorKind, Result};
use crate::graph::{CHANNELS_PER_IMAGE, ChannelMapping, Graph, InputProcess, OutputProcess, ProcessConfig, unet};
use crate::image::{Format, Image};
use crate::runtime::Device;
use crate::tensor::TensorDesc;
use crate::util::round_up;
use std::collections::HashMap;
use std::sync::Arc;

/// Tile edge of the graph used to measure bytes per pixel
const PROBE_TILE_SIZE: usize = 512;

/// Bytes moved per chunk when copying the temporary output back
const COPY_BACK_CHUNK_BYTES: usize = 4 << 20;

/// Image slots of a filter
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageSlot {
    /// Noisy colour (or directional) input
    Color,
    /// Albedo auxiliary input
    Albedo,
    /// Normal auxiliary input
    Normal,
    /// Denoised output
    Output,
}

impl ImageSlot {
    /// Parameter name of the slot
    pub const fn name(self) -> &'static str {
        match self {
            ImageSlot::Color => "color",
            ImageSlot::Albedo => "albedo",
            ImageSlot::Normal => "normal",
            ImageSlot::Output => "output",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "color" => Some(ImageSlot::Color),
            "albedo" => Some(ImageSlot::Albedo),
            "normal" => Some(ImageSlot::Normal),
            "output" => Some(ImageSlot::Output),
            _ => None,
        }
    }
}

/// State produced by a successful commit
struct Committed {
    key: Option<WeightsKey>,
    plan: TilePlan,
    graph: Graph,
    output: Image,
    /// Full-size output written by the tiles when executing in place
    temp_output: Option<Image>,
    byte_size: usize,
}

/// Everything a graph build needs, resolved from the bound images and options
struct Setup {
    weights: Arc<Weights>,
    key: Option<WeightsKey>,
    config: ProcessConfig,
    main: Image,
    albedo: Option<Image>,
    normal: Option<Image>,
    output: Image,
    aliased: bool,
}

/// Memory accounting of one candidate plan
struct Sizing {
    plan: TilePlan,
    graph: Graph,
    bytes: usize,
}

/// Denoising filter running a U-Net over tiles of the bound images
pub struct UNetFilter {
    device: Arc<dyn Device>,
    color: Option<Image>,
    albedo: Option<Image>,
    normal: Option<Image>,
    output: Option<Image>,
    options: Options,
    weights: HashMap<WeightsKey, Arc<Weights>>,
    user_weights: Option<Arc<Weights>>,
    transfer: Arc<dyn TransferFunction>,
    aliasing: AliasingMode,
    dirty: bool,
    committed: Option<Committed>,
}

fn check_color_format(slot: ImageSlot, image: &Image) -> Result<()> {
    match image.format() {
        Format::Float3 | Format::Float4 | Format::Half3 | Format::Half4 => Ok(()),
        other => Err(Error::invalid_argument(
            slot.name(),
            format!("unsupported image format {other:?}"),
        )),
    }
}

impl UNetFilter {
    /// Filter on `device` with no images, weights or options set
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            color: None,
            albedo: None,
            normal: None,
            output: None,
            options: Options::default(),
            weights: HashMap::new(),
            user_weights: None,
            transfer: Arc::new(LinearTransfer::default()),
            aliasing: AliasingMode::Detect,
            dirty: true,
            committed: None,
        }
    }

    /// Device the filter runs on
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    fn slot_mut(&mut self, slot: ImageSlot) -> &mut Option<Image> {
        match slot {
            ImageSlot::Color => &mut self.color,
            ImageSlot::Albedo => &mut self.albedo,
            ImageSlot::Normal => &mut self.normal,
            ImageSlot::Output => &mut self.output,
        }
    }

    /// Bound image of a slot
    pub fn image(&self, slot: ImageSlot) -> Option<&Image> {
        match slot {
            ImageSlot::Color => self.color.as_ref(),
            ImageSlot::Albedo => self.albedo.as_ref(),
            ImageSlot::Normal => self.normal.as_ref(),
            ImageSlot::Output => self.output.as_ref(),
        }
    }

    /// Bind an image by parameter name; unknown names are ignored with a warning
    pub fn set_image(&mut self, name: &str, image: Image) {
        match ImageSlot::from_name(name) {
            Some(slot) => {
                *self.slot_mut(slot) = Some(image);
                self.dirty = true;
            }
            None => tracing::warn!(parameter = name, "Unknown image parameter ignored"),
        }
    }

    /// Unbind an image by parameter name
    pub fn unset_image(&mut self, name: &str) {
        match ImageSlot::from_name(name) {
            Some(slot) => {
                if self.slot_mut(slot).take().is_some() {
                    self.dirty = true;
                }
            }
            None => tracing::warn!(parameter = name, "Unknown image parameter ignored"),
        }
    }

    /// Set an integer option
    pub fn set_int(&mut self, name: &str, value: i32) -> Result<()> {
        if self.options.set_int(name, value)? {
            self.dirty = true;
        }
        Ok(())
    }

    /// Get an integer option
    pub fn get_int(&self, name: &str) -> Result<i32> {
        self.options.get_int(name)
    }

    /// Set a float option
    pub fn set_float(&mut self, name: &str, value: f32) -> Result<()> {
        if self.options.set_float(name, value)? {
            self.dirty = true;
        }
        Ok(())
    }

    /// Get a float option
    pub fn get_float(&self, name: &str) -> Result<f32> {
        self.options.get_float(name)
    }

    /// Current options
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Register the weights used for a capability combination
    pub fn set_weights(&mut self, key: WeightsKey, weights: Weights) {
        self.weights.insert(key, Arc::new(weights));
        self.dirty = true;
    }

    /// Weights used regardless of the capability combination (`None` clears)
    pub fn set_user_weights(&mut self, weights: Option<Weights>) {
        self.user_weights = weights.map(Arc::new);
        self.dirty = true;
    }

    /// Replace the colour transfer function
    pub fn set_transfer_function(&mut self, transfer: Arc<dyn TransferFunction>) {
        self.transfer = transfer;
        self.dirty = true;
    }

    /// Override aliasing detection between inputs and output
    pub fn set_aliasing_mode(&mut self, mode: AliasingMode) {
        self.aliasing = mode;
        self.dirty = true;
    }

    /// Whether the filter is committed and unchanged since
    pub fn is_committed(&self) -> bool {
        self.committed.is_some() && !self.dirty
    }

    /// Tile plan of the last commit
    pub fn tile_plan(&self) -> Option<&TilePlan> {
        self.committed.as_ref().map(|c| &c.plan)
    }

    /// Whether the last commit routes tiles through a temporary output
    pub fn is_in_place(&self) -> bool {
        self.committed
            .as_ref()
            .is_some_and(|c| c.temp_output.is_some())
    }

    /// Weights key picked by the last commit (`None` for user weights)
    pub fn weights_key(&self) -> Option<WeightsKey> {
        self.committed.as_ref().and_then(|c| c.key)
    }

    /// Device bytes held by the last commit
    pub fn committed_byte_size(&self) -> usize {
        self.committed.as_ref().map_or(0, |c| c.byte_size)
    }

    /// Validate the configuration, plan tiles under the memory budget and
    /// allocate the network
    pub fn commit(&mut self) -> Result<()> {
        self.committed = None;
        let setup = self.setup()?;
        let committed = {
            let _active = self.device.ensure_active()?;
            self.build(&setup)?
        };

        tracing::info!(
            device = self.device.name(),
            width = setup.output.width(),
            height = setup.output.height(),
            tiles = committed.plan.num_tiles(),
            tile_height = committed.plan.tile_height(),
            tile_width = committed.plan.tile_width(),
            bytes = committed.byte_size,
            in_place = committed.temp_output.is_some(),
            weights = committed.key.map_or("user", WeightsKey::name),
            "Filter committed"
        );
        self.committed = Some(committed);
        self.dirty = false;
        Ok(())
    }

    fn setup(&self) -> Result<Setup> {
        self.options.validate()?;
        let output = self
            .output
            .clone()
            .ok_or_else(|| Error::invalid_argument("output", "no output image bound"))?;
        check_color_format(ImageSlot::Output, &output)?;

        let inputs = [
            (ImageSlot::Color, self.color.as_ref()),
            (ImageSlot::Albedo, self.albedo.as_ref()),
            (ImageSlot::Normal, self.normal.as_ref()),
        ];
        for (slot, image) in inputs {
            if let Some(image) = image {
                check_color_format(slot, image)?;
                if !image.same_size(&output) {
                    return Err(Error::invalid_argument(
                        slot.name(),
                        format!(
                            "image is {}x{}, output is {}x{}",
                            image.width(),
                            image.height(),
                            output.width(),
                            output.height()
                        ),
                    ));
                }
            }
        }
        if output.is_empty() {
            return Err(Error::invalid_argument("output", "image size is zero"));
        }

        let has_color = self.color.is_some();
        if has_color && self.normal.is_some() && self.albedo.is_none() {
            return Err(Error::invalid_argument(
                "normal",
                "a normal image requires an albedo image",
            ));
        }
        if self.options.directional && (self.albedo.is_some() || self.normal.is_some()) {
            return Err(Error::invalid_argument(
                "directional",
                "directional filtering does not take auxiliary images",
            ));
        }

        let key = WeightsKey::select(
            has_color,
            self.albedo.is_some(),
            self.normal.is_some(),
            self.options.hdr,
            self.options.directional,
            self.options.clean_aux,
        )?;
        let (weights, key) = match &self.user_weights {
            Some(weights) => (weights.clone(), None),
            None => {
                let weights = self.weights.get(&key).ok_or_else(|| {
                    Error::invalid_argument("weights", format!("no weights registered for '{key}'"))
                })?;
                (weights.clone(), Some(key))
            }
        };

        let (main, albedo, normal, mapping) = match (&self.color, key) {
            (Some(color), _) => {
                let mapping = if self.options.directional {
                    ChannelMapping::Directional
                } else if self.options.hdr {
                    ChannelMapping::Hdr
                } else {
                    ChannelMapping::Ldr
                };
                (color.clone(), self.albedo.clone(), self.normal.clone(), mapping)
            }
            (None, _) => match (&self.albedo, &self.normal) {
                (Some(albedo), None) => (albedo.clone(), None, None, ChannelMapping::Albedo),
                (None, Some(normal)) => (normal.clone(), None, None, ChannelMapping::Normal),
                // Rejected by WeightsKey::select
                _ => return Err(Error::invalid_argument("color", "no colour image bound")),
            },
        };

        let aliased = match self.aliasing {
            AliasingMode::Detect => [self.color.as_ref(), self.albedo.as_ref(), self.normal.as_ref()]
                .into_iter()
                .flatten()
                .any(|input| input.overlaps(&output)),
            AliasingMode::AssumeDisjoint => false,
            AliasingMode::AssumeAliased => true,
        };

        Ok(Setup {
            weights,
            key,
            config: ProcessConfig {
                mapping,
                transfer: self.transfer.clone(),
                input_scale: self.options.effective_input_scale(),
            },
            main,
            albedo,
            normal,
            output,
            aliased,
        })
    }

    /// Build the full network for tiles of `tile_h x tile_w`
    fn build_graph(&self, setup: &Setup, tile_h: usize, tile_w: usize, output: Image) -> Result<Graph> {
        let caps = self.device.caps();
        let in_channels = unet::input_channels(&setup.weights)?;
        let out_channels = unet::output_channels(&setup.weights)?;
        let block_c = caps.block_c.max(1);

        let mut graph = Graph::new(self.device.clone());
        let input_desc = TensorDesc::new(
            &[round_up(in_channels, block_c), tile_h, tile_w],
            caps.tensor_layout,
            caps.tensor_dtype,
        )?;
        let input = InputProcess::new(
            "input",
            input_desc,
            setup.config.clone(),
            setup.main.clone(),
            setup.albedo.clone(),
            setup.normal.clone(),
        )?;
        let x = graph.add_input_process(input, in_channels)?;
        let y = unet::build_unet(&mut graph, &setup.weights, x)?;

        let output_desc = graph.value_desc(y)?.clone();
        if output_desc.c() < round_up(out_channels, block_c) {
            return Err(Error::Internal(format!(
                "network output {output_desc} is narrower than {out_channels} channels"
            )));
        }
        let output = OutputProcess::new("output", output_desc, setup.config.clone(), output)?;
        graph.add_output_process(output, y)?;
        Ok(graph)
    }

    /// Scratch bytes per tile pixel and weight bytes, measured on a probe-sized graph
    fn probe(&self, setup: &Setup) -> Result<(usize, usize)> {
        let probe = self.build_graph(setup, PROBE_TILE_SIZE, PROBE_TILE_SIZE, setup.output.clone())?;
        let pixels = PROBE_TILE_SIZE * PROBE_TILE_SIZE;
        let bytes_per_pixel = probe.scratch_byte_size().div_ceil(pixels).max(1);
        Ok((bytes_per_pixel, probe.weights_byte_size()))
    }

    fn temp_byte_size(output: &Image) -> usize {
        output.width() * output.height() * output.format().byte_size()
    }

    /// Plan under `max_pixels` and measure the exact byte total
    fn size_plan(&self, setup: &Setup, max_pixels: usize, infeasible: Error) -> Result<Sizing> {
        let (h, w) = (setup.output.height(), setup.output.width());
        let plan = TilePlan::new(h, w, max_pixels).ok_or(infeasible)?;
        let graph =
            self.build_graph(setup, plan.tile_height(), plan.tile_width(), setup.output.clone())?;
        let temp = if setup.aliased && plan.num_tiles() > 1 {
            Self::temp_byte_size(&setup.output)
        } else {
            0
        };
        let bytes = graph.scratch_byte_size() + graph.weights_byte_size() + temp;
        Ok(Sizing { plan, graph, bytes })
    }

    fn build(&self, setup: &Setup) -> Result<Committed> {
        let caps = self.device.caps();
        let (h, w) = (setup.output.height(), setup.output.width());
        let (bpp, weight_bytes) = self.probe(setup)?;
        let fixed = weight_bytes
            + if setup.aliased {
                Self::temp_byte_size(&setup.output)
            } else {
                0
            };
        let required = fixed + tiling::min_tile_pixels(h, w) * bpp;
        let budget = self.options.max_memory_bytes();
        let infeasible = |available: usize| Error::BudgetExceeded {
            available,
            required,
        };

        let mut max_pixels = DEFAULT_MAX_TILE_PIXELS.min(caps.max_allocation_byte_size / bpp);
        if self.options.max_tile_pixels > 0 {
            max_pixels = max_pixels.min(self.options.max_tile_pixels);
        }
        if let Some(budget) = budget {
            if budget < fixed {
                return Err(infeasible(budget));
            }
            max_pixels = max_pixels.min((budget - fixed) / bpp);
        }
        let available = budget.unwrap_or(fixed + max_pixels * bpp);

        let mut sizing = self.size_plan(setup, max_pixels, infeasible(available))?;
        if let Some(budget) = budget
            && sizing.bytes > budget
        {
            // Alignment slack pushed the exact total over the estimate
            let shrunk = (max_pixels as u128 * (budget - fixed) as u128
                / sizing.bytes.saturating_sub(fixed).max(1) as u128) as usize;
            tracing::debug!(
                max_pixels,
                shrunk,
                bytes = sizing.bytes,
                budget,
                "Plan over budget, shrinking tiles"
            );
            max_pixels = shrunk.min(max_pixels - 1);
            sizing = self.size_plan(setup, max_pixels, infeasible(budget))?;
            if sizing.bytes > budget {
                return Err(infeasible(budget));
            }
        }

        match self.allocate(setup, sizing) {
            Err(e) if e.kind() == ErrorKind::OutOfMemory => {
                max_pixels /= 2;
                tracing::warn!(max_pixels, error = %e, "Allocation failed, retrying with smaller tiles");
                let sizing = self.size_plan(setup, max_pixels, infeasible(available))?;
                self.allocate(setup, sizing)
            }
            result => result,
        }
    }

    fn allocate(&self, setup: &Setup, sizing: Sizing) -> Result<Committed> {
        let Sizing {
            plan,
            mut graph,
            bytes,
        } = sizing;
        let temp_output = if setup.aliased && plan.num_tiles() > 1 {
            let output = &setup.output;
            let temp =
                Image::alloc(self.device.as_ref(), output.format(), output.width(), output.height())?;
            graph.set_output_image(temp.clone())?;
            tracing::debug!(
                bytes = Self::temp_byte_size(output),
                "In-place filtering through a temporary output"
            );
            Some(temp)
        } else {
            None
        };
        graph.finalize()?;
        Ok(Committed {
            key: setup.key,
            plan,
            graph,
            output: setup.output.clone(),
            temp_output,
            byte_size: bytes,
        })
    }

    /// Run the committed filter over every tile
    ///
    /// With [`SyncMode::Async`] the call returns once all work is submitted;
    /// the caller must wait on the device before reading the output.
    pub fn execute(&mut self, sync: SyncMode) -> Result<()> {
        if self.dirty {
            return Err(Error::invalid_operation(
                "filter changed since the last commit",
            ));
        }
        let verbose = self.device.config().verbose;
        let device = self.device.clone();
        let committed = self
            .committed
            .as_mut()
            .ok_or_else(|| Error::invalid_operation("filter has not been committed"))?;
        let _active = device.ensure_active()?;
        let engine = device.engine().clone();

        let total = committed.plan.num_tiles();
        let tiles: Vec<_> = committed.plan.tiles().collect();
        for (i, tile) in tiles.into_iter().enumerate() {
            if i > 0 {
                // The single model instance is reused for every tile
                engine.wait()?;
            }
            committed.graph.set_tile(tile.input, tile.output)?;
            committed.graph.run()?;
            if verbose >= 2 {
                tracing::info!(tile = i + 1, total, row = tile.row, col = tile.col, "Tile submitted");
            } else {
                tracing::debug!(tile = i + 1, total, row = tile.row, col = tile.col, "Tile submitted");
            }
        }

        if let Some(temp) = &committed.temp_output {
            engine.wait()?;
            let row_bytes = temp.width() * temp.format().byte_size();
            let rows = (COPY_BACK_CHUNK_BYTES / row_bytes.max(1)).max(1);
            // Only the network channels; alpha stays as the caller left it
            committed
                .output
                .copy_channels_from(temp, CHANNELS_PER_IMAGE, rows)?;
        }

        if sync == SyncMode::Sync {
            device.wait()?;
        }
        Ok(())
    }
}
