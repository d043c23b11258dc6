#![forbid(unsafe_code)]
//! Worker cache under a tight memory budget.
//!
//! Simulates the block traffic of a loop that reads a working set larger
//! than the budget: blocks are created, used, demoted to the cache and
//! later requested again. The budget must hold at every step and hot blocks
//! must survive eviction of colder arrays.

use sip_block::{Block, CacheOptions, CachedBlockMap, transfer_channel};
use sip_error::SipError;
use sip_types::{ArrayId, BlockId, BlockShape};

const BLOCK_ELEMS: usize = 16;
const BLOCK_BYTES: usize = BLOCK_ELEMS * 8;

fn id(array: u32, index: i32) -> BlockId {
    BlockId::from_indices(ArrayId(array), &[index]).expect("id")
}

fn shape() -> BlockShape {
    BlockShape::from_dims(&[4, 4]).expect("shape")
}

fn map(blocks_in_budget: usize) -> CachedBlockMap {
    let options = CacheOptions::from_json(&format!(
        r#"{{"max_allocatable_bytes": {}}}"#,
        blocks_in_budget * BLOCK_BYTES
    ))
    .expect("options");
    CachedBlockMap::new(8, options).expect("map")
}

fn produce(map: &mut CachedBlockMap, block_id: &BlockId, value: f64) {
    let mut block = map.create_block(shape(), true).expect("create");
    block.fill(value).expect("fill");
    map.insert_block(block_id.clone(), block).expect("insert");
}

#[test]
fn streaming_working_set_stays_within_budget() {
    let mut map = map(4);
    for round in 0..3 {
        for array in 0..6_u32 {
            let block_id = id(array, round);
            produce(&mut map, &block_id, f64::from(array));
            map.cached_delete_block(&block_id).expect("demote");
            assert!(map.allocated_bytes() <= map.max_allocatable_bytes());
        }
    }
    assert!(map.total_blocks() <= 4);
    assert_eq!(map.allocated_bytes(), map.total_blocks() * BLOCK_BYTES);
}

#[test]
fn recently_cached_array_survives_eviction() {
    let mut map = map(3);
    produce(&mut map, &id(0, 1), 0.0);
    produce(&mut map, &id(1, 1), 1.0);
    produce(&mut map, &id(2, 1), 2.0);
    map.cached_delete_block(&id(0, 1)).expect("demote 0");
    map.cached_delete_block(&id(1, 1)).expect("demote 1");
    map.cached_delete_block(&id(2, 1)).expect("demote 2");

    // Re-use array 0 so that array 1 becomes the coldest.
    let block = map.block(&id(0, 1)).expect("lookup").expect("cached");
    assert_eq!(block.data().expect("data")[0], 0.0);
    map.cached_delete_block(&id(0, 1)).expect("demote 0 again");

    produce(&mut map, &id(3, 1), 3.0);
    assert!(map.is_cached(&id(0, 1)));
    assert!(!map.is_cached(&id(1, 1)));
    assert!(map.is_cached(&id(2, 1)));
    assert!(map.is_active(&id(3, 1)));
}

#[test]
fn promoted_block_keeps_its_data() {
    let mut map = map(2);
    produce(&mut map, &id(5, 7), 42.0);
    map.cached_delete_block(&id(5, 7)).expect("demote");
    let block = map.block(&id(5, 7)).expect("lookup").expect("present");
    assert!(block.data().expect("data").iter().all(|&v| v == 42.0));
}

#[test]
fn in_flight_block_is_not_reclaimed_until_complete() {
    let mut map = map(2);
    produce(&mut map, &id(0, 1), 1.0);
    produce(&mut map, &id(0, 2), 2.0);

    let (completer, pending) = transfer_channel();
    map.block(&id(0, 1))
        .expect("lookup")
        .expect("present")
        .set_pending(Box::new(pending));
    map.delete_block(&id(0, 1)).expect("delete");
    assert_eq!(map.pending_list_size(), 1);

    // id(0, 2) is active, so the only reclaimable bytes are the pending block.
    let waiter = std::thread::spawn(move || completer.complete());
    let extra: Block = map.create_block(shape(), true).expect("reclaims pending");
    waiter.join().expect("completer");
    assert_eq!(map.pending_list_size(), 0);
    assert_eq!(extra.size(), BLOCK_ELEMS);
}

#[test]
fn exhausted_budget_reports_out_of_memory() {
    let mut map = map(2);
    produce(&mut map, &id(0, 1), 1.0);
    produce(&mut map, &id(0, 2), 2.0);
    let err = map.create_block(shape(), true).expect_err("no room");
    assert!(err.is_resource_exhausted());
    assert!(matches!(err, SipError::OutOfMemory { .. }));
    assert_eq!(map.allocated_bytes(), 2 * BLOCK_BYTES);
}
