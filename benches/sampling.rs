//! Criterion benchmarks for the sampling hot paths.
//!
//! Run with: cargo bench --bench sampling
//!
//! - choose_crop() on a BraTS-sized label with sparse foreground
//! - crop + normalize of one modality
//! - augmentation of a four-modality sample
//! - reload of a cached crop

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{s, Array3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use volseg::data::choose_crop;
use volseg::transforms::intensity::normalize;
use volseg::transforms::{crop, AugmentationPipeline, Normalization, NormalizationStats};
use volseg::volume::{load_volume, save_volume, IDENTITY_AFFINE};

const FULL: (usize, usize, usize) = (240, 240, 155);

/// Tumour-like block of foreground in the middle of an empty label.
fn sparse_label() -> Array3<f32> {
    let mut label = Array3::zeros(FULL);
    label.slice_mut(s![100..140, 90..150, 60..100]).fill(1.0);
    label
}

fn bench_choose_crop(c: &mut Criterion) {
    let mut group = c.benchmark_group("choose_crop");
    let label = sparse_label();

    for &size in &[32usize, 64, 128] {
        group.bench_with_input(BenchmarkId::new("threshold_0.1", size), &size, |b, &size| {
            let mut rng = ChaCha8Rng::seed_from_u64(0);
            b.iter(|| {
                let choice = choose_crop(label.view(), [size; 3], 0.1, 100, &mut rng);
                black_box(choice)
            })
        });
    }
    group.finish();
}

fn bench_crop_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("crop_normalize");
    let volume = Array3::from_shape_fn(FULL, |(i, j, k)| ((i * 7 + j * 3 + k) % 500) as f32);
    let full_stats = NormalizationStats::compute(volume.view());

    for mode in [Normalization::FullVolumeMean, Normalization::Mean, Normalization::Brats] {
        group.throughput(Throughput::Elements(64 * 64 * 64));
        group.bench_function(format!("{mode:?}"), |b| {
            b.iter(|| {
                let mut region = crop(volume.view(), [80, 80, 40], [64, 64, 64]);
                normalize(&mut region, mode, &full_stats);
                black_box(region)
            })
        });
    }
    group.finish();
}

fn bench_augment(c: &mut Criterion) {
    let mut group = c.benchmark_group("augment");
    let pipeline = AugmentationPipeline::builder().prob(1.0).build();

    for &size in &[32usize, 64] {
        let modalities: Vec<_> = (0..4)
            .map(|m| Array3::from_elem((size, size, size), m as f32))
            .collect();
        let label = Array3::from_shape_fn((size, size, size), |(i, _, _)| (i % 4) as f32);
        group.throughput(Throughput::Elements((4 * size * size * size) as u64));
        group.bench_with_input(BenchmarkId::new("four_modalities", size), &size, |b, _| {
            b.iter(|| {
                let out = pipeline
                    .apply(modalities.clone(), label.clone(), Some(7))
                    .unwrap();
                black_box(out)
            })
        });
    }
    group.finish();
}

fn bench_cached_reload(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crop.nii");
    let data = Array3::from_shape_fn((64, 64, 64), |(i, j, k)| (i + j + k) as f32);
    save_volume(&path, data.view(), IDENTITY_AFFINE).unwrap();

    let mut group = c.benchmark_group("cached_reload");
    group.throughput(Throughput::Bytes((64 * 64 * 64 * 4) as u64));
    group.bench_function("64x64x64", |b| {
        b.iter(|| black_box(load_volume(black_box(&path)).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_choose_crop,
    bench_crop_normalize,
    bench_augment,
    bench_cached_reload
);
criterion_main!(benches);
