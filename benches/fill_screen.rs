// Run with:  cargo bench --bench fill_screen --features host

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use mbi5153_driver::greyscale::GreyscaleBuffer;
use mbi5153_driver::{Mbi5153Panel78, PanelLayout};
use std::hint::black_box;
use std::time::Duration;

// Number of iterations to target ~1-5ms per measurement
const ITERATIONS: usize = 100;

fn configure_criterion() -> Criterion {
    Criterion::default()
        .sample_size(100)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(3))
}

fn fill_screen(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_screen");
    group.throughput(Throughput::Elements(
        (Mbi5153Panel78::WIDTH * Mbi5153Panel78::HEIGHT * ITERATIONS) as u64,
    ));

    group.bench_function("fill", |b| {
        let mut buffer = GreyscaleBuffer::<Mbi5153Panel78>::new().unwrap();

        b.iter(|| {
            for i in 0..ITERATIONS {
                let level = black_box(i as u8);
                black_box(&mut buffer).fill(level, 255 - level, 64);
            }
        });
    });

    group.bench_function("clear", |b| {
        let mut buffer = GreyscaleBuffer::<Mbi5153Panel78>::new().unwrap();
        buffer.fill(255, 255, 255);

        b.iter(|| {
            for _ in 0..ITERATIONS {
                black_box(&mut buffer).clear();
            }
        });
    });

    group.finish();
}

criterion_group!(name = benches; config = configure_criterion(); targets = fill_screen);
criterion_main!(benches);
