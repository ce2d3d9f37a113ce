//! Common test utilities
#![allow(dead_code)]

use denoise_rt::prelude::*;
use denoise_rt::runtime::{create_device, enumerate_physical_devices};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Channel widths of the test network, far narrower than production weights
pub const EC1: usize = 4;
pub const EC2: usize = 6;
pub const EC3: usize = 6;
pub const EC4: usize = 8;
pub const EC5: usize = 8;
pub const DC4: usize = 8;
pub const DC3: usize = 6;
pub const DC2: usize = 6;
pub const DC1A: usize = 4;
pub const DC1B: usize = 4;

/// Create a CPU device for testing
pub fn cpu_device() -> Arc<dyn Device> {
    CpuDevice::create(DeviceConfig::default()).expect("CPU device")
}

/// Create a device of `device_type`, returning None if none is available
pub fn device_of_type(device_type: DeviceType) -> Option<Arc<dyn Device>> {
    let physical = enumerate_physical_devices()
        .into_iter()
        .find(|d| d.device_type == device_type)?;
    create_device(&physical, DeviceConfig::default()).ok()
}

/// Create a CUDA device, returning None if CUDA is unavailable
#[cfg(feature = "cuda")]
pub fn cuda_device() -> Option<Arc<dyn Device>> {
    device_of_type(DeviceType::Cuda)
}

/// Create a WebGPU device, returning None if WebGPU is unavailable
#[cfg(feature = "wgpu")]
pub fn wgpu_device() -> Option<Arc<dyn Device>> {
    device_of_type(DeviceType::Wgpu)
}

fn random_tensor(rng: &mut StdRng, dims: &[usize], scale: f32) -> HostTensor {
    let n: usize = dims.iter().product();
    let data = (0..n).map(|_| rng.random_range(-scale..scale)).collect();
    HostTensor::new(dims, data).expect("host tensor")
}

fn add_layer(weights: &mut Weights, rng: &mut StdRng, name: &str, o: usize, i: usize) {
    // He-style scale keeps activations from vanishing through the ReLUs
    let scale = (2.0 / (i * 9) as f32).sqrt();
    let weight = random_tensor(rng, &[o, i, 3, 3], scale);
    let bias = random_tensor(rng, &[o], 0.05);
    weights.insert_layer(name, weight, bias);
}

/// Random U-Net weights mapping `in_channels` to `out_channels`
pub fn unet_weights(seed: u64, in_channels: usize, out_channels: usize) -> Weights {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut w = Weights::new();
    let layers = [
        ("enc_conv0", EC1, in_channels),
        ("enc_conv1", EC1, EC1),
        ("enc_conv2", EC2, EC1),
        ("enc_conv3", EC3, EC2),
        ("enc_conv4", EC4, EC3),
        ("enc_conv5a", EC5, EC4),
        ("enc_conv5b", EC5, EC5),
        ("dec_conv4a", DC4, EC5 + EC3),
        ("dec_conv4b", DC4, DC4),
        ("dec_conv3a", DC3, DC4 + EC2),
        ("dec_conv3b", DC3, DC3),
        ("dec_conv2a", DC2, DC3 + EC1),
        ("dec_conv2b", DC2, DC2),
        ("dec_conv1a", DC1A, DC2 + in_channels),
        ("dec_conv1b", DC1B, DC1A),
        ("dec_conv0", out_channels, DC1B),
    ];
    for (name, o, i) in layers {
        add_layer(&mut w, &mut rng, name, o, i);
    }
    w
}

/// Interleaved pixel values in `[lo, hi)` for a `width x height` image
pub fn random_pixels(seed: u64, width: usize, height: usize, channels: usize, lo: f32, hi: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..width * height * channels)
        .map(|_| rng.random_range(lo..hi))
        .collect()
}

/// Allocate an image and fill all its channels
pub fn filled_image(device: &dyn Device, format: Format, width: usize, height: usize, data: &[f32]) -> Image {
    let image = Image::alloc(device, format, width, height).expect("image alloc");
    image
        .write_pixels(0, 0, width, height, format.num_channels(), data)
        .expect("image write");
    image
}

/// Read every pixel of an image
pub fn image_pixels(image: &Image) -> Vec<f32> {
    image
        .read_pixels(0, 0, image.width(), image.height())
        .expect("image read")
}

/// Assert two f32 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Assert two f32 slices are bit-identical
pub fn assert_bits_eq(a: &[f32], b: &[f32], msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            x.to_bits() == y.to_bits(),
            "{}: element {} differs: {} vs {}",
            msg,
            i,
            x,
            y
        );
    }
}
