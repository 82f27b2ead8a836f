//! Diff engine benchmarks.
//!
//! Measures reconciliation cost for address lists of growing size with a
//! fixed share of churn between snapshots.

use beacon::{diff, AddressSet};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn addrs(range: std::ops::Range<usize>) -> Vec<String> {
    range
        .map(|i| format!("10.{}.{}.{}:9000", i >> 16, (i >> 8) & 0xff, i & 0xff))
        .collect()
}

/// Benchmark diffing two snapshots that share 90% of their addresses.
fn bench_diff_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_churn");

    for size in [16usize, 256, 4096] {
        let churn = (size / 10).max(1);
        let prev = addrs(0..size);
        let curr = addrs(churn..size + churn);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(diff(black_box(&prev), black_box(&curr))));
        });
    }

    group.finish();
}

/// Benchmark diffing identical snapshots, the common steady-state case.
fn bench_diff_unchanged(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_unchanged");

    for size in [16usize, 256, 4096] {
        let snapshot = addrs(0..size);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(diff(black_box(&snapshot), black_box(&snapshot))));
        });
    }

    group.finish();
}

/// Benchmark applying an update batch to a consumer's address set.
fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_set_apply");

    for size in [16usize, 256, 4096] {
        let churn = (size / 10).max(1);
        let prev = addrs(0..size);
        let updates = diff(&prev, &addrs(churn..size + churn));
        let base: AddressSet = prev.iter().cloned().collect();

        group.throughput(Throughput::Elements(updates.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut set = base.clone();
                set.apply(black_box(&updates));
                black_box(set.len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_diff_churn, bench_diff_unchanged, bench_apply);
criterion_main!(benches);
