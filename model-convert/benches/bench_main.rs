use benchmarks::{bench_runtime::runtime, bench_torch::torch};
use criterion::criterion_main;
mod benchmarks;

criterion_main!(runtime, torch);
