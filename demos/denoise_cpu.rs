//! Denoising a synthetic image on the CPU
//!
//! This example builds a small U-Net with random weights, denoises a noisy
//! gradient image under a memory budget and compares the tiled result with a
//! single unbounded pass.
//!
//! Key concepts demonstrated:
//! - Device selection and configuration
//! - Binding images and weights to a `UNetFilter`
//! - `commit()` planning tiles under `maxMemoryMB`
//! - Tiled execution matching a single pass
//!
//! Run with:
//! ```sh
//! RUST_LOG=debug cargo run --example denoise_cpu
//! ```

use denoise_rt::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

const WIDTH: usize = 1024;
const HEIGHT: usize = 768;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Random weights for a narrow U-Net taking and producing 3 channels
fn random_weights(rng: &mut StdRng) -> Result<Weights> {
    let (ec1, ec2, ec3, ec4, ec5) = (8, 12, 16, 16, 16);
    let (dc4, dc3, dc2, dc1a, dc1b) = (16, 12, 12, 8, 8);
    let layers = [
        ("enc_conv0", ec1, 3),
        ("enc_conv1", ec1, ec1),
        ("enc_conv2", ec2, ec1),
        ("enc_conv3", ec3, ec2),
        ("enc_conv4", ec4, ec3),
        ("enc_conv5a", ec5, ec4),
        ("enc_conv5b", ec5, ec5),
        ("dec_conv4a", dc4, ec5 + ec3),
        ("dec_conv4b", dc4, dc4),
        ("dec_conv3a", dc3, dc4 + ec2),
        ("dec_conv3b", dc3, dc3),
        ("dec_conv2a", dc2, dc3 + ec1),
        ("dec_conv2b", dc2, dc2),
        ("dec_conv1a", dc1a, dc2 + 3),
        ("dec_conv1b", dc1b, dc1a),
        ("dec_conv0", 3, dc1b),
    ];

    let mut weights = Weights::new();
    for (name, o, i) in layers {
        let scale = (2.0 / (i * 9) as f32).sqrt();
        let w = (0..o * i * 9).map(|_| rng.random_range(-scale..scale)).collect();
        let b = (0..o).map(|_| rng.random_range(-0.01..0.01)).collect();
        weights.insert_layer(
            name,
            HostTensor::new(&[o, i, 3, 3], w)?,
            HostTensor::new(&[o], b)?,
        );
    }
    Ok(weights)
}

fn run(device: &std::sync::Arc<dyn Device>, weights: &Weights, color: &Image, budget_mb: i32) -> Result<Vec<f32>> {
    let output = Image::alloc(device.as_ref(), Format::Float3, WIDTH, HEIGHT)?;
    let mut filter = UNetFilter::new(device.clone());
    filter.set_weights(WeightsKey::Hdr, weights.clone());
    filter.set_image("color", color.clone());
    filter.set_image("output", output.clone());
    filter.set_int("hdr", 1)?;
    filter.set_int("maxMemoryMB", budget_mb)?;
    filter.commit()?;

    let start = Instant::now();
    filter.execute(SyncMode::Sync)?;
    let plan = filter.tile_plan().map_or(0, |p| p.num_tiles());
    println!(
        "budget {:>4} MB: {} tile(s), {:.1} MB committed, {:.2?}",
        budget_mb,
        plan,
        filter.committed_byte_size() as f64 / (1024.0 * 1024.0),
        start.elapsed()
    );
    output.read_pixels(0, 0, WIDTH, HEIGHT)
}

fn main() -> Result<()> {
    init_tracing();

    // -----------------------------------------------------------------------
    // 1. Pick the CPU device
    // -----------------------------------------------------------------------
    let device = new_device(&DeviceSelector::Type(DeviceType::Cpu))?;
    println!("device: {}", device.name());

    // -----------------------------------------------------------------------
    // 2. A noisy HDR gradient
    // -----------------------------------------------------------------------
    let mut rng = StdRng::seed_from_u64(42);
    let mut pixels = Vec::with_capacity(WIDTH * HEIGHT * 3);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let base = [x as f32 / WIDTH as f32, y as f32 / HEIGHT as f32, 0.5];
            for v in base {
                pixels.push((v * 4.0 + rng.random_range(-0.5..0.5)).max(0.0));
            }
        }
    }
    let color = Image::alloc(device.as_ref(), Format::Float3, WIDTH, HEIGHT)?;
    color.write_pixels(0, 0, WIDTH, HEIGHT, 3, &pixels)?;

    // -----------------------------------------------------------------------
    // 3. Filter unbounded, then under a budget that forces tiling
    // -----------------------------------------------------------------------
    let weights = random_weights(&mut rng)?;
    let single = run(&device, &weights, &color, -1)?;
    let tiled = run(&device, &weights, &color, 48)?;

    let mismatches = single
        .iter()
        .zip(&tiled)
        .filter(|(a, b)| a.to_bits() != b.to_bits())
        .count();
    println!("pixels differing between single pass and tiled: {mismatches}");
    Ok(())
}
