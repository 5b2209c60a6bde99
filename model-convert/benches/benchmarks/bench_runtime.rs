use criterion::{black_box, criterion_group, Criterion};
use model_convert::providers::{NaiveProvider, ParNaiveProvider, Provider};
use model_convert::session::{Session, SessionConfig};
use model_convert::tensor::TensorData;
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;
use std::time::Duration;

use super::conv_classifier;

fn forward<P: Provider>(session: &Session) -> Vec<usize> {
    let x = ArrayD::<f32>::from_elem(IxDyn(&[1, 3, 64, 64]), 0.5);
    let outputs = session
        .run_with_provider::<P>(HashMap::from([(String::from("x"), TensorData::Float(x))]))
        .unwrap();
    outputs[0].1.shape().to_vec()
}

fn bench_forward(c: &mut Criterion) {
    let single = Session::new(conv_classifier(), SessionConfig { num_threads: 1 }).unwrap();
    let pooled = Session::new(conv_classifier(), SessionConfig { num_threads: 4 }).unwrap();

    let mut group = c.benchmark_group("Runtime");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));
    group.bench_function("Conv classifier naive", |b| {
        b.iter(|| forward::<NaiveProvider>(black_box(&single)))
    });
    group.bench_function("Conv classifier parallel", |b| {
        b.iter(|| forward::<ParNaiveProvider>(black_box(&pooled)))
    });
    group.finish();
}

criterion_group!(runtime, bench_forward,);
