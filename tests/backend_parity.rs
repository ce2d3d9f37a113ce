//! GPU backends against the CPU reference
//!
//! Every test returns early when its backend finds no device.
#![cfg(any(feature = "cuda", feature = "wgpu"))]

mod common;

use common::{
    assert_allclose_f32, assert_bits_eq, cpu_device, filled_image, image_pixels, random_pixels,
    unet_weights,
};
use denoise_rt::dtype::DType;
use denoise_rt::prelude::*;
use std::sync::Arc;

const W: usize = 400;
const H: usize = 320;

fn denoise(device: &Arc<dyn Device>, pixels: &[f32], max_tile_pixels: i32) -> Vec<f32> {
    let color = filled_image(device.as_ref(), Format::Float3, W, H, pixels);
    let output = Image::alloc(device.as_ref(), Format::Float3, W, H).unwrap();
    let mut filter = UNetFilter::new(device.clone());
    filter.set_weights(WeightsKey::Hdr, unet_weights(11, 3, 3));
    filter.set_image("color", color);
    filter.set_image("output", output.clone());
    filter.set_int("hdr", 1).unwrap();
    filter.set_int("maxTilePixels", max_tile_pixels).unwrap();
    filter.commit().unwrap();
    filter.execute(SyncMode::Sync).unwrap();
    image_pixels(&output)
}

/// Filter output on `device` matches the CPU within the precision of its dtype
fn check_filter_parity(device: Arc<dyn Device>) {
    let pixels = random_pixels(40, W, H, 3, 0.0, 2.0);
    let reference = denoise(&cpu_device(), &pixels, 0);
    let result = denoise(&device, &pixels, 0);
    let tol = match device.caps().tensor_dtype {
        DType::F16 => 3e-2,
        DType::F32 => 1e-4,
    };
    assert_allclose_f32(&result, &reference, tol, tol, device.name());

    let tiled = denoise(&device, &pixels, 300 * 300);
    assert_bits_eq(&tiled, &result, "tiled vs single pass");
}

fn check_buffer_round_trip(device: Arc<dyn Device>) {
    let buffer = device.new_buffer(1024).unwrap();
    let data: Vec<u8> = (0..=255).cycle().take(1024).collect();
    buffer.write(0, &data).unwrap();
    // Unaligned partial write
    buffer.write(5, &[0xEE; 7]).unwrap();
    let mut out = vec![0u8; 1024];
    buffer.read(0, &mut out).unwrap();
    assert_eq!(&out[..5], &data[..5]);
    assert_eq!(&out[5..12], &[0xEE; 7]);
    assert_eq!(&out[12..], &data[12..]);

    let mut tail = [0u8; 3];
    buffer.read(1021, &mut tail).unwrap();
    assert_eq!(&tail, &data[1021..]);
}

fn check_in_place(device: Arc<dyn Device>) {
    let pixels = random_pixels(41, W, H, 3, 0.0, 1.0);
    let expected = denoise(&device, &pixels, 300 * 300);

    let color = filled_image(device.as_ref(), Format::Float3, W, H, &pixels);
    let mut filter = UNetFilter::new(device.clone());
    filter.set_weights(WeightsKey::Hdr, unet_weights(11, 3, 3));
    filter.set_image("color", color.clone());
    filter.set_image("output", color.clone());
    filter.set_int("hdr", 1).unwrap();
    filter.set_int("maxTilePixels", 300 * 300).unwrap();
    filter.commit().unwrap();
    assert!(filter.is_in_place());
    filter.execute(SyncMode::Sync).unwrap();
    assert_bits_eq(&image_pixels(&color), &expected, "in place");
}

#[cfg(feature = "cuda")]
mod cuda {
    use super::*;
    use common::cuda_device;

    #[test]
    fn test_cuda_filter_matches_cpu() {
        let Some(device) = cuda_device() else {
            return;
        };
        check_filter_parity(device);
    }

    #[test]
    fn test_cuda_buffer_round_trip() {
        let Some(device) = cuda_device() else {
            return;
        };
        check_buffer_round_trip(device);
    }

    #[test]
    fn test_cuda_in_place() {
        let Some(device) = cuda_device() else {
            return;
        };
        check_in_place(device);
    }

    #[test]
    fn test_cuda_managed_buffer_is_host_accessible() {
        let Some(device) = cuda_device() else {
            return;
        };
        if !device.caps().managed_memory_supported {
            return;
        }
        let buffer = device.new_buffer_with_storage(64, Storage::Managed).unwrap();
        assert_eq!(buffer.storage(), Storage::Managed);
        buffer.write(0, &[3; 64]).unwrap();
        let map = buffer.map(denoise_rt::tensor::Access::Read, 0, 0).unwrap();
        assert!(map.as_slice().iter().all(|&b| b == 3));
    }

    #[test]
    fn test_cuda_activation_restores_context() {
        let Some(device) = cuda_device() else {
            return;
        };
        let _guard = device.scoped_activate().unwrap();
        assert!(device.is_active());
        assert!(device.scoped_activate().is_err());
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use super::*;
    use common::wgpu_device;

    #[test]
    fn test_wgpu_filter_matches_cpu() {
        let Some(device) = wgpu_device() else {
            return;
        };
        check_filter_parity(device);
    }

    #[test]
    fn test_wgpu_buffer_round_trip() {
        let Some(device) = wgpu_device() else {
            return;
        };
        check_buffer_round_trip(device);
    }

    #[test]
    fn test_wgpu_in_place() {
        let Some(device) = wgpu_device() else {
            return;
        };
        check_in_place(device);
    }

    #[test]
    fn test_wgpu_device_memory_cannot_be_mapped() {
        let Some(device) = wgpu_device() else {
            return;
        };
        let buffer = device.new_buffer(64).unwrap();
        assert_eq!(buffer.storage(), Storage::Device);
        assert!(buffer.address_range().is_none());
        let err = buffer
            .map(denoise_rt::tensor::Access::Read, 0, 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert_eq!(
            device
                .new_buffer_with_storage(64, Storage::Host)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
    }
}
