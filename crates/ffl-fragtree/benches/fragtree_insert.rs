//! Benchmark: fragment tree insertion patterns.
//!
//! Sequential appends model streaming writes; random overwrites model a
//! database-style workload that keeps splitting existing fragments.

use criterion::{Criterion, criterion_group, criterion_main};
use ffl_fragtree::FragTree;
use ffl_types::NodeRefId;
use std::hint::black_box;

fn bench_sequential_append(c: &mut Criterion) {
    c.bench_function("fragtree_append_4k_x1024", |b| {
        b.iter(|| {
            let mut tree = FragTree::new();
            for i in 0..1024_u32 {
                let _ = tree.add_full_dnode(NodeRefId(i), i * 4096, 4096);
            }
            black_box(tree.frag_count())
        });
    });
}

fn bench_random_overwrite(c: &mut Criterion) {
    // Deterministic LCG so every iteration sees the same offsets.
    let offsets: Vec<u32> = (0..1024_u32)
        .scan(0x2545_F491_u32, |state, _| {
            *state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            Some(*state % (4 * 1024 * 1024))
        })
        .collect();

    c.bench_function("fragtree_overwrite_random_x1024", |b| {
        b.iter(|| {
            let mut tree = FragTree::new();
            let _ = tree.add_full_dnode(NodeRefId(0), 0, 4 * 1024 * 1024);
            for (i, ofs) in offsets.iter().enumerate() {
                let _ = tree.add_full_dnode(NodeRefId(i as u32 + 1), black_box(*ofs), 1500);
            }
            black_box(tree.frag_count())
        });
    });
}

criterion_group!(benches, bench_sequential_append, bench_random_overwrite);
criterion_main!(benches);
