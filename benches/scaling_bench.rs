//! Parameter scaling benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use optiforge::scaling::{scale, ScalingMode};
use optiforge::types::{IndicatorParameter, ParamType, ParamValue};

fn parameters(n: usize) -> Vec<IndicatorParameter> {
    (0..n)
        .map(|i| {
            let mut p = IndicatorParameter::new(&format!("p{}", i), ParamValue::Int(10));
            p.min = Some(1.0);
            p.max = Some(200.0 + i as f64 * 50.0);
            p.step = Some(1.0);
            p.optimise = true;
            if i % 2 == 1 {
                p.default = ParamValue::Float(0.5);
                p.min = Some(0.1);
                p.max = Some(5.0);
                p.step = Some(0.01);
                p.declared_type = Some(ParamType::Float);
            }
            p
        })
        .collect()
}

fn bench_scale(c: &mut Criterion) {
    let small = parameters(3);
    let large = parameters(12);

    c.bench_function("scale_grid_3_params", |b| {
        b.iter(|| {
            let _ = black_box(scale(black_box(&small), 10_000, ScalingMode::Grid));
        });
    });

    c.bench_function("scale_grid_12_params", |b| {
        b.iter(|| {
            let _ = black_box(scale(black_box(&large), 10_000, ScalingMode::Grid));
        });
    });

    c.bench_function("scale_per_param_12_params", |b| {
        b.iter(|| {
            let _ = black_box(scale(black_box(&large), 50, ScalingMode::PerParameter));
        });
    });
}

criterion_group!(benches, bench_scale);
criterion_main!(benches);
