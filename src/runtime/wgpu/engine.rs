//! WebGPU engine, buffer registry and convolution kernel
//!
//! WebGPU does not expose raw GPU pointers, so buffer addresses handed to the
//! rest of the runtime are registry handles mapping to `wgpu::Buffer`s.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use wgpu::{BufferDescriptor, BufferUsages, COPY_BUFFER_ALIGNMENT};

use super::shaders::{
    BufferRange, ConvParams, PipelineCache, ResampleParams, ShaderKind, create_bind_group,
    workgroup_grid,
};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{Activation, ConvDesc, PostOp};
use crate::runtime::{Allocator, ConvKernel, DeviceCaps, DeviceId, Engine, TrackingAllocator};
use crate::tensor::{Storage, Tensor, TensorLayout};

/// Longest a blocking poll waits for the GPU
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Global buffer registry mapping handles to buffers
static BUFFER_REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<wgpu::Buffer>>>> = OnceLock::new();

/// Counter for generating unique buffer handles (0 is never used)
static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<u64, Arc<wgpu::Buffer>>> {
    BUFFER_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up a buffer by handle
pub(crate) fn get_buffer(handle: u64) -> Result<Arc<wgpu::Buffer>> {
    registry()
        .lock()
        .get(&handle)
        .cloned()
        .ok_or_else(|| Error::backend(format!("unknown WebGPU buffer handle {handle}")))
}

/// State shared by the engine, allocator and kernels of one device
pub(crate) struct WgpuShared {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: Arc<wgpu::Queue>,
    pub(crate) pipelines: PipelineCache,
}

impl WgpuShared {
    /// Block until all submitted work has completed
    fn poll_wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(POLL_TIMEOUT),
            })
            .map_err(|e| Error::backend(format!("GPU poll failed: {e}")))?;
        Ok(())
    }

    fn uniform<T: bytemuck::Pod>(&self, label: &str, value: &T) -> wgpu::Buffer {
        let buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size: std::mem::size_of::<T>() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue
            .write_buffer(&buffer, 0, bytemuck::bytes_of(value));
        buffer
    }

    fn dispatch(
        &self,
        kind: ShaderKind,
        entry_point: &'static str,
        storage: &[BufferRange<'_>],
        params: &wgpu::Buffer,
        invocations: usize,
    ) {
        let pipeline = self.pipelines.pipeline(kind, entry_point);
        let bind_group = create_bind_group(&self.device, &pipeline.layout, storage, params);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(entry_point),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry_point),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (x, y) = workgroup_grid(invocations);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Host copy of an aligned device range
    fn read_aligned(&self, src: &wgpu::Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("readback_staging"),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("copy_from_device"),
            });
        encoder.copy_buffer_to_buffer(src, offset, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.poll_wait()?;
        receiver
            .recv()
            .map_err(|_| Error::backend("map_async callback was not invoked during buffer read"))?
            .map_err(|e| Error::backend(format!("map_async failed during buffer read: {e}")))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

/// Range widened to `COPY_BUFFER_ALIGNMENT`
fn aligned_range(offset: usize, len: usize) -> (u64, u64) {
    let start = offset as u64 / COPY_BUFFER_ALIGNMENT * COPY_BUFFER_ALIGNMENT;
    let end = (offset + len) as u64;
    let end = end.div_ceil(COPY_BUFFER_ALIGNMENT) * COPY_BUFFER_ALIGNMENT;
    (start, end - start)
}

/// Storage-buffer allocator; buffer sizes are padded to 4 bytes
pub struct WgpuAllocator {
    shared: Arc<WgpuShared>,
    max_buffer_size: u64,
}

impl Allocator for WgpuAllocator {
    fn allocate(&self, byte_size: usize, _storage: Storage) -> Result<u64> {
        let size = (byte_size as u64).div_ceil(COPY_BUFFER_ALIGNMENT) * COPY_BUFFER_ALIGNMENT;
        if size > self.max_buffer_size {
            return Err(Error::OutOfMemory { size: byte_size });
        }
        let buffer = self.shared.device.create_buffer(&BufferDescriptor {
            label: Some("denoise buffer"),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        registry().lock().insert(id, Arc::new(buffer));
        Ok(id)
    }

    fn deallocate(&self, ptr: u64, _byte_size: usize, _storage: Storage) {
        // Dropping the last reference releases GPU memory once queued work is done
        registry().lock().remove(&ptr);
    }
}

/// WebGPU engine: one queue, submissions execute in order
pub struct WgpuEngine {
    device_id: DeviceId,
    caps: DeviceCaps,
    shared: Arc<WgpuShared>,
    allocator: TrackingAllocator<WgpuAllocator>,
}

impl WgpuEngine {
    pub(super) fn new(
        device_id: DeviceId,
        caps: DeviceCaps,
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        max_buffer_size: u64,
    ) -> Self {
        let shared = Arc::new(WgpuShared {
            pipelines: PipelineCache::new(device.clone()),
            device,
            queue,
        });
        let allocator = TrackingAllocator::new(WgpuAllocator {
            shared: shared.clone(),
            max_buffer_size,
        });
        Self {
            device_id,
            caps,
            shared,
            allocator,
        }
    }

    /// Peak bytes allocated by this engine
    pub fn peak_bytes(&self) -> usize {
        self.allocator.peak_bytes()
    }

    fn submit_resample(&self, entry_point: &'static str, src: &Tensor, dst: &Tensor) -> Result<()> {
        let s = bind_tensor("src", src, &self.caps)?;
        let d = bind_tensor("dst", dst, &self.caps)?;
        check_disjoint(src, dst)?;
        let total = dst.desc().num_elements();
        if total == 0 {
            return Ok(());
        }
        let desc = src.desc();
        let params = self.shared.uniform(
            "resample_params",
            &ResampleParams {
                c: desc.c() as u32,
                h: desc.h() as u32,
                w: desc.w() as u32,
                total: total as u32,
            },
        );
        self.shared.dispatch(
            ShaderKind::Resample,
            entry_point,
            &[s.range(), d.range()],
            &params,
            total,
        );
        Ok(())
    }
}

/// A tensor resolved to its registered buffer
struct BoundTensor {
    buffer: Arc<wgpu::Buffer>,
    offset: u64,
    size: u64,
}

impl BoundTensor {
    fn range(&self) -> BufferRange<'_> {
        BufferRange {
            buffer: &self.buffer,
            offset: self.offset,
            size: self.size,
        }
    }
}

fn bind_tensor(arg: &'static str, tensor: &Tensor, caps: &DeviceCaps) -> Result<BoundTensor> {
    if tensor.desc().dtype() != DType::F32 {
        return Err(Error::unsupported_hardware(format!(
            "WebGPU kernels compute in f32, '{arg}' is {}",
            tensor.desc().dtype()
        )));
    }
    if tensor.buffer().storage() != Storage::Device {
        return Err(Error::invalid_argument(
            arg,
            "tensor memory is not a WebGPU buffer",
        ));
    }
    if tensor.byte_offset() % caps.buffer_alignment != 0 {
        return Err(Error::invalid_argument(
            arg,
            format!(
                "tensor offset {} is not a multiple of {}",
                tensor.byte_offset(),
                caps.buffer_alignment
            ),
        ));
    }
    Ok(BoundTensor {
        buffer: get_buffer(tensor.buffer().ptr())?,
        offset: tensor.byte_offset() as u64,
        size: tensor.byte_size() as u64,
    })
}

fn check_disjoint(src: &Tensor, dst: &Tensor) -> Result<()> {
    if src.overlaps(dst) {
        return Err(Error::invalid_argument(
            "dst",
            "destination overlaps the source tensor",
        ));
    }
    Ok(())
}

impl Engine for WgpuEngine {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn allocator(&self) -> &dyn Allocator {
        &self.allocator
    }

    fn resolve_storage(&self, requested: Storage) -> Result<Storage> {
        match requested {
            Storage::Device => Ok(Storage::Device),
            other => Err(Error::invalid_argument(
                "storage",
                format!("WebGPU devices only allocate device memory, not {other:?}"),
            )),
        }
    }

    fn is_handle_storage(&self, storage: Storage) -> bool {
        storage == Storage::Device
    }

    fn pointer_storage(&self, _ptr: *const u8) -> Storage {
        // Host pointers cannot be classified; they are not GPU visible either way
        Storage::Undefined
    }

    fn copy_to_device(&self, src: &[u8], dst: u64, dst_offset: usize) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let buffer = get_buffer(dst)?;
        let (start, size) = aligned_range(dst_offset, src.len());
        if start == dst_offset as u64 && size == src.len() as u64 {
            self.shared.queue.write_buffer(&buffer, start, src);
        } else {
            // Read-modify-write the covering aligned words
            let mut words = self.shared.read_aligned(&buffer, start, size)?;
            let head = dst_offset - start as usize;
            words[head..head + src.len()].copy_from_slice(src);
            self.shared.queue.write_buffer(&buffer, start, &words);
        }
        Ok(())
    }

    fn copy_from_device(&self, src: u64, src_offset: usize, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let buffer = get_buffer(src)?;
        let (start, size) = aligned_range(src_offset, dst.len());
        let words = self.shared.read_aligned(&buffer, start, size)?;
        let head = src_offset - start as usize;
        dst.copy_from_slice(&words[head..head + dst.len()]);
        Ok(())
    }

    fn copy_within_device(
        &self,
        src: u64,
        src_offset: usize,
        dst: u64,
        dst_offset: usize,
        byte_size: usize,
    ) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        let align = COPY_BUFFER_ALIGNMENT as usize;
        let aligned =
            src_offset % align == 0 && dst_offset % align == 0 && byte_size % align == 0;
        if src == dst || !aligned {
            let mut staged = vec![0u8; byte_size];
            self.copy_from_device(src, src_offset, &mut staged)?;
            return self.copy_to_device(&staged, dst, dst_offset);
        }

        let (src_buffer, dst_buffer) = (get_buffer(src)?, get_buffer(dst)?);
        let mut encoder =
            self.shared
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("copy_within_device"),
                });
        encoder.copy_buffer_to_buffer(
            &src_buffer,
            src_offset as u64,
            &dst_buffer,
            dst_offset as u64,
            byte_size as u64,
        );
        self.shared.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn new_conv_kernel(&self, desc: &ConvDesc) -> Result<Box<dyn ConvKernel>> {
        if desc.src_desc.dtype() != DType::F32 {
            return Err(Error::unsupported_hardware(format!(
                "WebGPU convolution computes in f32, got {}",
                desc.src_desc.dtype()
            )));
        }
        if desc.src_desc.layout() != TensorLayout::Chw
            || desc.weight_desc.layout() != TensorLayout::Oihw
        {
            return Err(Error::unsupported_hardware(format!(
                "WebGPU convolution requires Chw tensors and Oihw weights, got {:?} and {:?}",
                desc.src_desc.layout(),
                desc.weight_desc.layout()
            )));
        }
        let post_op = match desc.post_op {
            PostOp::None => 0,
            PostOp::Pool => 1,
            PostOp::Upsample => 2,
        };
        let flags = u32::from(desc.activation == Activation::Relu)
            | (u32::from(desc.has_full_bias()) << 1);
        Ok(Box::new(WgpuConvKernel {
            shared: self.shared.clone(),
            caps: self.caps.clone(),
            params: ConvParams {
                c: desc.src_desc.c() as u32,
                h: desc.src_desc.h() as u32,
                w: desc.src_desc.w() as u32,
                o: desc.weight_desc.o() as u32,
                kh: desc.weight_desc.h() as u32,
                kw: desc.weight_desc.w() as u32,
                post_op,
                flags,
            },
            params_buffer: None,
        }))
    }

    fn submit_pool(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        self.submit_resample("pool2x2", src, dst)
    }

    fn submit_upsample(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        self.submit_resample("upsample2x", src, dst)
    }

    fn wait(&self) -> Result<()> {
        self.shared.poll_wait()
    }
}

/// Direct convolution; the parameter block is uploaded once when bound
struct WgpuConvKernel {
    shared: Arc<WgpuShared>,
    caps: DeviceCaps,
    params: ConvParams,
    params_buffer: Option<wgpu::Buffer>,
}

impl ConvKernel for WgpuConvKernel {
    fn update_dst(&mut self, _dst: &Tensor) -> Result<()> {
        if self.params_buffer.is_none() {
            self.params_buffer = Some(self.shared.uniform("conv2d_params", &self.params));
        }
        Ok(())
    }

    fn submit(&self, src: &Tensor, weight: &Tensor, bias: &Tensor, dst: &Tensor) -> Result<()> {
        check_disjoint(src, dst)?;
        let bound = [
            bind_tensor("src", src, &self.caps)?,
            bind_tensor("weight", weight, &self.caps)?,
            bind_tensor("bias", bias, &self.caps)?,
            bind_tensor("dst", dst, &self.caps)?,
        ];
        let total = dst.desc().num_elements();
        if total == 0 {
            return Ok(());
        }
        let uploaded;
        let params = match &self.params_buffer {
            Some(buffer) => buffer,
            None => {
                uploaded = self.shared.uniform("conv2d_params", &self.params);
                &uploaded
            }
        };
        let ranges: Vec<BufferRange<'_>> = bound.iter().map(BoundTensor::range).collect();
        self.shared
            .dispatch(ShaderKind::Conv, "conv2d", &ranges, params, total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_range() {
        assert_eq!(aligned_range(0, 8), (0, 8));
        assert_eq!(aligned_range(2, 4), (0, 8));
        assert_eq!(aligned_range(6, 6), (4, 8));
        assert_eq!(aligned_range(12, 1), (12, 4));
    }

    #[test]
    fn test_unknown_handle_is_backend_error() {
        let err = get_buffer(u64::MAX).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unknown);
    }
}
