use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use simlink::{Component, ComponentId, ComponentKind, Port, TopologyBuilder, TopologyConfig};

/// A straight pipe run: each pipe's outlet sits on the next pipe's inlet.
fn pipe_run(count: usize) -> Vec<Component> {
    (0..count)
        .map(|i| {
            let x = i as f64 * 2.0;
            Component::new(ComponentId::new(format!("pipe-{i}")).unwrap(), ComponentKind::Pipe)
                .with_port(Port::at(x, 0.0, 0.0))
                .with_port(Port::at(x + 2.0, 0.0, 0.0))
        })
        .collect()
}

fn bench_connect(c: &mut Criterion) {
    let builder = TopologyBuilder::new(TopologyConfig::default()).unwrap();
    let mut group = c.benchmark_group("topology/connect");

    for count in [64usize, 256, 1024] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || pipe_run(count),
                |mut components| {
                    let report = builder.connect(&mut components);
                    assert_eq!(report.new_connections, count - 1);
                    report
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_reconnect(c: &mut Criterion) {
    let builder = TopologyBuilder::new(TopologyConfig::default()).unwrap();
    let mut connected = pipe_run(256);
    builder.connect(&mut connected);

    // Second passes find nothing new but still visit every pair.
    c.bench_function("topology/reconnect_256", |b| {
        b.iter_batched(
            || connected.clone(),
            |mut components| builder.connect(&mut components),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_connect, bench_reconnect);
criterion_main!(benches);
