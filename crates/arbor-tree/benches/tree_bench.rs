//! Benchmarks for Arbor tree geometry
//!
//! Measures performance of:
//! - Tree mapper at increasing depth
//! - Routing-table position computation
//! - Parent/children arithmetic

use arbor_tree::{
    left_routing_positions, right_routing_positions, routing_sequence, tree_mapper,
    LogicalPosition,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark horizontal value computation by depth
fn bench_tree_mapper(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_mapper");

    for &level in &[0u32, 4, 8, 16, 24, 31] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("fanout2", level), &level, |b, &lvl| {
            let number = if lvl == 0 { 0 } else { (1u32 << lvl.min(31)) - 1 };
            b.iter(|| tree_mapper(black_box(lvl), black_box(number), black_box(2)))
        });
    }
    group.finish();
}

/// Benchmark routing sequence and table construction
fn bench_routing_tables(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_tables");

    for &(level, fanout) in &[(4u32, 2u32), (10, 2), (20, 2), (5, 4), (8, 8)] {
        let pos = LogicalPosition::new(level, 1, fanout).unwrap();
        group.bench_with_input(
            BenchmarkId::new("sequence", format!("{}x{}", level, fanout)),
            &(level, fanout),
            |b, &(l, f)| b.iter(|| routing_sequence(black_box(l), black_box(f))),
        );
        group.bench_with_input(
            BenchmarkId::new("left_right", format!("{}x{}", level, fanout)),
            &pos,
            |b, p| {
                b.iter(|| {
                    let l = left_routing_positions(black_box(p));
                    let r = right_routing_positions(black_box(p));
                    l.len() + r.len()
                })
            },
        );
    }
    group.finish();
}

/// Benchmark walking from a deep position up to the root
fn bench_parent_walk(c: &mut Criterion) {
    c.bench_function("parent_walk_depth_20", |b| {
        let start = LogicalPosition::new(20, 123_456, 2).unwrap();
        b.iter(|| {
            let mut cur = black_box(start);
            let mut hops = 0;
            while let Some(p) = cur.parent() {
                cur = p;
                hops += 1;
            }
            hops
        })
    });
}

criterion_group!(
    benches,
    bench_tree_mapper,
    bench_routing_tables,
    bench_parent_walk,
);
criterion_main!(benches);
