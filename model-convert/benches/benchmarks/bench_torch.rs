use criterion::{black_box, criterion_group, Criterion};
use model_convert::torch::rebuild;
use std::time::Duration;

use super::conv_classifier;

fn bench_serialization(c: &mut Criterion) {
    let onnx = conv_classifier();
    let dir = tempfile::tempdir().unwrap();

    let mut group = c.benchmark_group("Torch");
    group.measurement_time(Duration::from_secs(10));
    group.bench_function("Rebuild", |b| b.iter(|| rebuild(black_box(&onnx)).unwrap()));
    let model = rebuild(&onnx).unwrap().eval();
    group.bench_function("Save state dict", |b| {
        b.iter(|| model.save_state_dict(dir.path().join("model.pth")).unwrap())
    });
    group.finish();
}

criterion_group!(torch, bench_serialization,);
