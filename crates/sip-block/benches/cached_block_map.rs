#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sip_block::{CacheOptions, CachedBlockMap};
use sip_types::{ArrayId, BlockId, BlockShape};

const BLOCK_ELEMS: usize = 1024;

fn id(array: u32, index: i32) -> BlockId {
    BlockId::from_indices(ArrayId(array), &[index]).expect("id")
}

fn make_map(blocks_in_budget: usize) -> CachedBlockMap {
    CachedBlockMap::new(
        16,
        CacheOptions {
            max_allocatable_bytes: blocks_in_budget * BLOCK_ELEMS * 8,
        },
    )
    .expect("map")
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_cache_hit(c: &mut Criterion) {
    let shape = BlockShape::from_dims(&[32, 32]).expect("shape");
    let mut map = make_map(4);
    let block = map.create_block(shape, true).expect("create");
    map.insert_block(id(0, 1), block).expect("insert");

    c.bench_function("cached_block_map_promote_and_demote", |b| {
        b.iter(|| {
            map.cached_delete_block(black_box(&id(0, 1))).expect("demote");
            let found = map.block(black_box(&id(0, 1))).expect("lookup");
            black_box(found.is_some());
        });
    });
}

fn bench_evicting_allocation(c: &mut Criterion) {
    let shape = BlockShape::from_dims(&[32, 32]).expect("shape");
    let mut map = make_map(8);
    let mut next = 0_i32;

    c.bench_function("cached_block_map_allocate_with_eviction", |b| {
        b.iter(|| {
            next += 1;
            let array = u32::try_from(next % 16).unwrap_or(0);
            let block_id = id(array, next);
            let block = map.create_block(shape, true).expect("create");
            map.insert_block(block_id.clone(), block).expect("insert");
            map.cached_delete_block(&block_id).expect("demote");
        });
    });
}

criterion_group!(benches, bench_cache_hit, bench_evicting_allocation);
criterion_main!(benches);
