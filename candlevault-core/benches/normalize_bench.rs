//! Criterion benchmarks for the per-batch hot path.
//!
//! Benchmarks:
//! 1. Normalization of a full upstream page (string-encoded prices)
//! 2. Normalization with duplicate open times (keep-last path)
//! 3. Year partitioning of a batch that spans a year boundary

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use candlevault_core::sink::partition_by_year;
use candlevault_core::{normalize, RawCandle};

// ── Helpers ──────────────────────────────────────────────────────────

const HOUR_MS: i64 = 3_600_000;
/// 2023-12-31T00:00:00Z, so a 1000-hour page crosses into 2024.
const DEC_31_2023: i64 = 1_703_980_800_000;

fn make_page(n: usize, start_ms: i64) -> Vec<RawCandle> {
    (0..n)
        .map(|i| {
            let t = start_ms + i as i64 * HOUR_MS;
            let close = 40_000.0 + (i as f64 * 0.1).sin() * 500.0;
            RawCandle(vec![
                json!(t),
                json!(format!("{:.2}", close - 10.0)),
                json!(format!("{:.2}", close + 25.0)),
                json!(format!("{:.2}", close - 25.0)),
                json!(format!("{close:.2}")),
                json!(format!("{:.5}", 1000.0 + i as f64)),
                json!(t + HOUR_MS - 1),
                json!("0"),
                json!(100),
                json!("0"),
                json!("0"),
                json!("0"),
            ])
        })
        .collect()
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    for &page in &[100, 500, 1000] {
        let batch = make_page(page, DEC_31_2023);
        group.bench_with_input(BenchmarkId::new("unique", page), &page, |b, _| {
            b.iter(|| normalize(black_box(&batch)))
        });
    }

    let mut with_dupes = make_page(1000, DEC_31_2023);
    let tail = with_dupes[..100].to_vec();
    with_dupes.extend(tail);
    group.bench_function("keep_last_1100", |b| {
        b.iter(|| normalize(black_box(&with_dupes)))
    });

    group.finish();
}

fn bench_partition(c: &mut Criterion) {
    let records = normalize(&make_page(1000, DEC_31_2023)).unwrap_or_default();
    c.bench_function("partition_by_year_1000", |b| {
        b.iter(|| partition_by_year(black_box(&records)))
    });
}

criterion_group!(benches, bench_normalize, bench_partition);
criterion_main!(benches);
