use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use denoise_rt::filter::TilePlan;
use denoise_rt::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const SEED: u64 = 0xDE_1015E;

// (name, out, in) with the input width left to the caller
const LAYERS: [(&str, usize, usize); 16] = [
    ("enc_conv0", 8, 0),
    ("enc_conv1", 8, 8),
    ("enc_conv2", 12, 8),
    ("enc_conv3", 16, 12),
    ("enc_conv4", 16, 16),
    ("enc_conv5a", 16, 16),
    ("enc_conv5b", 16, 16),
    ("dec_conv4a", 16, 16 + 16),
    ("dec_conv4b", 16, 16),
    ("dec_conv3a", 12, 16 + 12),
    ("dec_conv3b", 12, 12),
    ("dec_conv2a", 12, 12 + 8),
    ("dec_conv2b", 12, 12),
    ("dec_conv1a", 8, 12),
    ("dec_conv1b", 8, 8),
    ("dec_conv0", 3, 8),
];

fn bench_weights() -> Weights {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut weights = Weights::new();
    for (name, o, i) in LAYERS {
        let i = match name {
            "enc_conv0" => 3,
            "dec_conv1a" => i + 3,
            _ => i,
        };
        let scale = (2.0 / (i * 9) as f32).sqrt();
        let w = (0..o * i * 9).map(|_| rng.random_range(-scale..scale)).collect();
        let b = (0..o).map(|_| rng.random_range(-0.05..0.05)).collect();
        weights.insert_layer(
            name,
            HostTensor::new(&[o, i, 3, 3], w).expect("weight"),
            HostTensor::new(&[o], b).expect("bias"),
        );
    }
    weights
}

fn image(device: &Arc<dyn Device>, width: usize, height: usize) -> Image {
    let image = Image::alloc(device.as_ref(), Format::Float3, width, height).expect("image");
    let mut rng = StdRng::seed_from_u64(SEED);
    let pixels: Vec<f32> = (0..width * height * 3).map(|_| rng.random_range(0.0..2.0)).collect();
    image
        .write_pixels(0, 0, width, height, 3, &pixels)
        .expect("pixels");
    image
}

fn filter(device: &Arc<dyn Device>, width: usize, height: usize, max_tile_pixels: i32) -> UNetFilter {
    let mut filter = UNetFilter::new(device.clone());
    filter.set_weights(WeightsKey::Hdr, bench_weights());
    filter.set_image("color", image(device, width, height));
    filter.set_image(
        "output",
        Image::alloc(device.as_ref(), Format::Float3, width, height).expect("output"),
    );
    filter.set_int("hdr", 1).expect("hdr");
    filter
        .set_int("maxTilePixels", max_tile_pixels)
        .expect("maxTilePixels");
    filter
}

fn plan_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_plan");
    for (w, h) in [(1920, 1080), (3840, 2160), (7680, 4320)] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{w}x{h}")), &(w, h), |b, &(w, h)| {
            b.iter(|| {
                let plan = TilePlan::new(black_box(h), black_box(w), 1024 * 1024).expect("plan");
                black_box(plan.tiles().map(|t| t.output.width * t.output.height).sum::<usize>())
            })
        });
    }
    group.finish();
}

fn commit_benchmarks(c: &mut Criterion) {
    let device = CpuDevice::create(DeviceConfig::default()).expect("CPU device");
    let mut group = c.benchmark_group("commit");
    for budget_mb in [-1, 256, 64] {
        let mut f = filter(&device, 1280, 720, 0);
        f.set_int("maxMemoryMB", budget_mb).expect("maxMemoryMB");
        group.bench_function(BenchmarkId::from_parameter(budget_mb), |b| {
            b.iter(|| f.commit().expect("commit"))
        });
    }
    group.finish();
}

fn execute_benchmarks(c: &mut Criterion) {
    let device = CpuDevice::create(DeviceConfig::default()).expect("CPU device");
    let mut group = c.benchmark_group("execute_cpu_512");
    group.sample_size(10);
    for (label, max_tile_pixels) in [("single", 0), ("tiled", 320 * 320)] {
        let mut f = filter(&device, 512, 512, max_tile_pixels);
        f.commit().expect("commit");
        group.bench_function(label, |b| b.iter(|| f.execute(SyncMode::Sync).expect("execute")));
    }
    group.finish();
}

criterion_group!(tiling_benches, plan_benchmarks, commit_benchmarks, execute_benchmarks);
criterion_main!(tiling_benches);
