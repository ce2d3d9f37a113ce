//! WGSL operator shaders and compute pipeline infrastructure
//!
//! Every storage binding is declared `read_write`: convolution sources and
//! destinations are ranges of one scratch buffer, and WebGPU only allows a
//! buffer in several bindings of a dispatch when all usages are writable.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, BindingResource, BindingType, Buffer, BufferBinding, BufferBindingType,
    ComputePipeline, ComputePipelineDescriptor, Device, PipelineLayoutDescriptor,
    ShaderModuleDescriptor, ShaderSource, ShaderStages,
};

/// Invocations per workgroup
pub const WORKGROUP_SIZE: u32 = 256;

/// Per-dimension dispatch limit guaranteed by WebGPU
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

const CONV2D_BODY: &str = r#"
struct ConvParams {
    c: u32,
    h: u32,
    w: u32,
    o: u32,
    kh: u32,
    kw: u32,
    post_op: u32,
    flags: u32,
}

@group(0) @binding(0) var<storage, read_write> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> weight: array<f32>;
@group(0) @binding(2) var<storage, read_write> bias: array<f32>;
@group(0) @binding(3) var<storage, read_write> dst: array<f32>;
@group(0) @binding(4) var<uniform> params: ConvParams;

// Convolution without bias at source position (y, x); weights are OIHW
fn conv_at(oc: u32, y: i32, x: i32) -> f32 {
    let plane = params.h * params.w;
    let ry = i32(params.kh / 2u);
    let rx = i32(params.kw / 2u);
    var acc = 0.0;
    for (var ky = 0u; ky < params.kh; ky += 1u) {
        let sy = y + i32(ky) - ry;
        if (sy < 0 || sy >= i32(params.h)) {
            continue;
        }
        for (var kx = 0u; kx < params.kw; kx += 1u) {
            let sx = x + i32(kx) - rx;
            if (sx < 0 || sx >= i32(params.w)) {
                continue;
            }
            let s = u32(sy) * params.w + u32(sx);
            for (var ic = 0u; ic < params.c; ic += 1u) {
                let wi = ((oc * params.c + ic) * params.kh + ky) * params.kw + kx;
                acc += src[ic * plane + s] * weight[wi];
            }
        }
    }
    return acc;
}

@compute @workgroup_size(WORKGROUP_SIZE)
fn conv2d(@builtin(global_invocation_id) gid: vec3<u32>,
          @builtin(num_workgroups) nwg: vec3<u32>) {
    let idx = gid.x + gid.y * nwg.x * WORKGROUP_SIZE;
    var dh = params.h;
    var dw = params.w;
    if (params.post_op == 1u) {
        dh = params.h / 2u;
        dw = params.w / 2u;
    } else if (params.post_op == 2u) {
        dh = params.h * 2u;
        dw = params.w * 2u;
    }
    let plane = dh * dw;
    if (idx >= params.o * plane) {
        return;
    }
    let oc = idx / plane;
    let rem = idx % plane;
    let dy = i32(rem / dw);
    let dx = i32(rem % dw);

    var v: f32;
    if (params.post_op == 1u) {
        let a = conv_at(oc, 2 * dy, 2 * dx);
        let b = conv_at(oc, 2 * dy, 2 * dx + 1);
        let c = conv_at(oc, 2 * dy + 1, 2 * dx);
        let d = conv_at(oc, 2 * dy + 1, 2 * dx + 1);
        v = max(max(a, b), max(c, d));
    } else if (params.post_op == 2u) {
        v = conv_at(oc, dy / 2, dx / 2);
    } else {
        v = conv_at(oc, dy, dx);
    }
    if ((params.flags & 2u) != 0u) {
        v += bias[idx];
    } else {
        v += bias[oc];
    }
    if ((params.flags & 1u) != 0u) {
        v = max(v, 0.0);
    }
    dst[idx] = v;
}
"#;

const RESAMPLE_BODY: &str = r#"
struct ResampleParams {
    c: u32,
    h: u32,
    w: u32,
    total: u32,
}

@group(0) @binding(0) var<storage, read_write> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;
@group(0) @binding(2) var<uniform> params: ResampleParams;

@compute @workgroup_size(WORKGROUP_SIZE)
fn pool2x2(@builtin(global_invocation_id) gid: vec3<u32>,
           @builtin(num_workgroups) nwg: vec3<u32>) {
    let idx = gid.x + gid.y * nwg.x * WORKGROUP_SIZE;
    if (idx >= params.total) {
        return;
    }
    let dh = params.h / 2u;
    let dw = params.w / 2u;
    let ch = idx / (dh * dw);
    let rem = idx % (dh * dw);
    let y = rem / dw;
    let x = rem % dw;
    let base = (ch * params.h + 2u * y) * params.w + 2u * x;
    dst[idx] = max(max(src[base], src[base + 1u]),
                   max(src[base + params.w], src[base + params.w + 1u]));
}

@compute @workgroup_size(WORKGROUP_SIZE)
fn upsample2x(@builtin(global_invocation_id) gid: vec3<u32>,
              @builtin(num_workgroups) nwg: vec3<u32>) {
    let idx = gid.x + gid.y * nwg.x * WORKGROUP_SIZE;
    if (idx >= params.total) {
        return;
    }
    let dh = params.h * 2u;
    let dw = params.w * 2u;
    let ch = idx / (dh * dw);
    let rem = idx % (dh * dw);
    let y = rem / dw;
    let x = rem % dw;
    dst[idx] = src[(ch * params.h + y / 2u) * params.w + x / 2u];
}
"#;

/// Uniform parameters of `conv2d`
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConvParams {
    /// Input channels
    pub c: u32,
    /// Input height
    pub h: u32,
    /// Input width
    pub w: u32,
    /// Output channels
    pub o: u32,
    /// Kernel height
    pub kh: u32,
    /// Kernel width
    pub kw: u32,
    /// 0 none, 1 pool, 2 upsample
    pub post_op: u32,
    /// Bit 0: ReLU, bit 1: full bias
    pub flags: u32,
}

/// Uniform parameters of `pool2x2` and `upsample2x`
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ResampleParams {
    /// Channels
    pub c: u32,
    /// Source height
    pub h: u32,
    /// Source width
    pub w: u32,
    /// Destination elements
    pub total: u32,
}

/// Shader module of an operator family
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    /// `conv2d`: 4 storage buffers + params
    Conv,
    /// `pool2x2` / `upsample2x`: 2 storage buffers + params
    Resample,
}

impl ShaderKind {
    fn source(self) -> String {
        let body = match self {
            ShaderKind::Conv => CONV2D_BODY,
            ShaderKind::Resample => RESAMPLE_BODY,
        };
        format!("const WORKGROUP_SIZE: u32 = {WORKGROUP_SIZE}u;\n{body}")
    }

    fn num_storage_buffers(self) -> u32 {
        match self {
            ShaderKind::Conv => 4,
            ShaderKind::Resample => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ShaderKind::Conv => "conv2d",
            ShaderKind::Resample => "resample",
        }
    }
}

/// Cached pipeline and its bind group layout
#[derive(Clone)]
pub struct Pipeline {
    /// Compute pipeline
    pub pipeline: Arc<ComputePipeline>,
    /// Layout of group 0
    pub layout: Arc<BindGroupLayout>,
}

/// Cache for compute pipelines keyed by entry point
pub struct PipelineCache {
    device: Arc<Device>,
    layouts: Mutex<HashMap<ShaderKind, Arc<BindGroupLayout>>>,
    pipelines: Mutex<HashMap<&'static str, Pipeline>>,
}

impl PipelineCache {
    /// Create an empty cache for `device`
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            layouts: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    fn layout(&self, kind: ShaderKind) -> Arc<BindGroupLayout> {
        let mut layouts = self.layouts.lock();
        if let Some(layout) = layouts.get(&kind) {
            return layout.clone();
        }

        let storage = kind.num_storage_buffers();
        let mut entries: Vec<BindGroupLayoutEntry> = (0..storage)
            .map(|binding| BindGroupLayoutEntry {
                binding,
                visibility: ShaderStages::COMPUTE,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(BindGroupLayoutEntry {
            binding: storage,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        let layout = Arc::new(
            self.device
                .create_bind_group_layout(&BindGroupLayoutDescriptor {
                    label: Some(kind.name()),
                    entries: &entries,
                }),
        );
        layouts.insert(kind, layout.clone());
        layout
    }

    /// Get or create the pipeline of an entry point
    pub fn pipeline(&self, kind: ShaderKind, entry_point: &'static str) -> Pipeline {
        let mut pipelines = self.pipelines.lock();
        if let Some(pipeline) = pipelines.get(entry_point) {
            return pipeline.clone();
        }

        let layout = self.layout(kind);
        let module = self.device.create_shader_module(ShaderModuleDescriptor {
            label: Some(kind.name()),
            source: ShaderSource::Wgsl(kind.source().into()),
        });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some(&format!("{entry_point}_layout")),
                bind_group_layouts: &[&layout],
                immediate_size: 0,
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        let entry = Pipeline {
            pipeline: Arc::new(pipeline),
            layout,
        };
        pipelines.insert(entry_point, entry.clone());
        entry
    }
}

/// A storage binding: a byte range of a registered buffer
pub struct BufferRange<'a> {
    /// Backing buffer
    pub buffer: &'a Buffer,
    /// Byte offset (storage-offset aligned)
    pub offset: u64,
    /// Byte size
    pub size: u64,
}

/// Bind storage ranges followed by the uniform parameters
pub fn create_bind_group(
    device: &Device,
    layout: &BindGroupLayout,
    storage: &[BufferRange<'_>],
    params: &Buffer,
) -> BindGroup {
    let mut entries: Vec<BindGroupEntry> = storage
        .iter()
        .enumerate()
        .map(|(i, range)| BindGroupEntry {
            binding: i as u32,
            resource: BindingResource::Buffer(BufferBinding {
                buffer: range.buffer,
                offset: range.offset,
                size: std::num::NonZeroU64::new(range.size),
            }),
        })
        .collect();
    entries.push(BindGroupEntry {
        binding: storage.len() as u32,
        resource: params.as_entire_binding(),
    });

    device.create_bind_group(&BindGroupDescriptor {
        label: Some("unet_bind_group"),
        layout,
        entries: &entries,
    })
}

/// 2D workgroup grid covering `n` invocations
#[inline]
pub fn workgroup_grid(n: usize) -> (u32, u32) {
    let groups = (n as u32).div_ceil(WORKGROUP_SIZE).max(1);
    let x = groups.min(MAX_WORKGROUPS_PER_DIM);
    (x, groups.div_ceil(x))
}
