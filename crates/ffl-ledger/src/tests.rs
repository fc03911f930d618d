use super::*;
use ffl_error::FflError;
use proptest::prelude::*;

const SECTOR: u32 = 4096;
const CLEANMARKER: u32 = 12;

fn geometry() -> FlashGeometry {
    FlashGeometry::new(8 * SECTOR, SECTOR, 256).expect("geometry")
}

/// A ledger whose blocks have all been erased and marked.
fn erased_ledger() -> Ledger {
    let mut ledger = Ledger::new(geometry(), 168);
    for block in ledger.blocks_in(BlockState::ErasePending) {
        ledger.begin_erase(block).expect("begin");
        ledger.erase_succeeded(block).expect("done");
        ledger.mark_erased(block, CLEANMARKER).expect("marked");
    }
    ledger.check_accounting().expect("accounting");
    ledger
}

/// Take the first free block as the write target and obsolete its marker.
fn open_nextblock(ledger: &mut Ledger) -> BlockIndex {
    let block = ledger.first_in(BlockState::Free).expect("free block");
    ledger
        .file_block(block, BlockState::Nextblock, ListEnd::Tail)
        .expect("nextblock");
    let marker = ledger.block(block).and_then(Eraseblock::first_node).expect("marker");
    ledger.mark_obsolete(marker, false).expect("obsolete marker");
    block
}

fn append(ledger: &mut Ledger, block: BlockIndex, len: u32, owner: u32) -> NodeRefId {
    let frontier = ledger.frontier(block).expect("frontier");
    ledger
        .link_node_ref(block, frontier, len, RefState::Normal, Some(InodeNumber(owner)))
        .expect("link")
}

#[test]
fn new_ledger_needs_erasing() {
    let ledger = Ledger::new(geometry(), 168);
    assert_eq!(ledger.count(BlockState::ErasePending), 8);
    assert_eq!(ledger.totals().dirty_size, 8 * SECTOR);
    ledger.check_accounting().expect("accounting");
}

#[test]
fn erased_blocks_carry_cleanmarker() {
    let ledger = erased_ledger();
    assert_eq!(ledger.count(BlockState::Free), 8);
    let totals = ledger.totals();
    assert_eq!(totals.used_size, 8 * CLEANMARKER);
    assert_eq!(totals.free_size, 8 * (SECTOR - CLEANMARKER));
    assert_eq!(totals.erasing_size, 0);
}

#[test]
fn link_outside_frontier_is_fatal() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let frontier = ledger.frontier(block).expect("frontier");
    let err = ledger
        .link_node_ref(block, frontier + 4, 64, RefState::Normal, None)
        .expect_err("must reject");
    assert!(matches!(err, FflError::Inconsistent(_)));
    assert!(err.is_fatal());
}

#[test]
fn implicit_length_follows_neighbours() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let a = append(&mut ledger, block, 100, 1);
    let b = append(&mut ledger, block, 48, 1);
    assert_eq!(ledger.ref_totlen(a).expect("len"), 100);
    assert_eq!(ledger.ref_totlen(b).expect("len"), 48);
    assert_eq!(ledger.inode(InodeNumber(1)).expect("cache").node_count(), 2);
}

#[test]
fn obsoleting_everything_makes_block_erasable() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let a = append(&mut ledger, block, 100, 1);
    let b = append(&mut ledger, block, 200, 1);
    let c = append(&mut ledger, block, 300, 1);
    ledger.close_nextblock().expect("close");
    assert_eq!(ledger.block(block).expect("block").state, BlockState::Clean);

    for id in [a, b] {
        ledger.mark_obsolete(id, false).expect("obsolete");
    }
    let last = ledger.mark_obsolete(c, false).expect("obsolete");
    assert_eq!(last.refiled, Some(BlockState::Erasable));

    let blk = ledger.block(block).expect("block");
    assert_eq!(blk.used_size, 0);
    assert_eq!(blk.dirty_size, CLEANMARKER + 600);
    assert_eq!(blk.free_size, SECTOR - CLEANMARKER - 600);
    ledger.check_accounting().expect("accounting");
}

#[test]
fn single_node_block_without_cleanmarker() {
    let mut ledger = Ledger::new(geometry(), 168);
    let block = BlockIndex(0);
    ledger.begin_erase(block).expect("begin");
    ledger.erase_succeeded(block).expect("done");
    ledger.mark_erased(block, 0).expect("marked");
    ledger
        .file_block(block, BlockState::Nextblock, ListEnd::Tail)
        .expect("nextblock");

    let start = ledger.block(block).expect("block").offset;
    assert_eq!(ledger.frontier(block).expect("frontier"), start);
    let id = ledger
        .link_node_ref(block, start, 100, RefState::Normal, Some(InodeNumber(1)))
        .expect("link");
    let blk = ledger.block(block).expect("block");
    assert_eq!((blk.used_size, blk.free_size), (100, 3996));

    ledger.close_nextblock().expect("close");
    let out = ledger.mark_obsolete(id, false).expect("obsolete");
    assert_eq!(out.refiled, Some(BlockState::Erasable));
    let blk = ledger.block(block).expect("block");
    assert_eq!((blk.used_size, blk.dirty_size), (0, 100));
    assert_eq!(blk.state, BlockState::Erasable);
    ledger.check_accounting().expect("accounting");
}

#[test]
fn pending_flush_defers_erasable() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let a = append(&mut ledger, block, 64, 1);
    ledger.close_nextblock().expect("close");
    let out = ledger.mark_obsolete(a, true).expect("obsolete");
    assert_eq!(out.refiled, Some(BlockState::ErasablePendingFlush));
    assert_eq!(ledger.release_flush_waiters().expect("release").len(), 1);
    assert_eq!(ledger.block(block).expect("block").state, BlockState::Erasable);
}

#[test]
fn mark_obsolete_is_idempotent() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let a = append(&mut ledger, block, 128, 3);
    append(&mut ledger, block, 128, 3);
    let first = ledger.mark_obsolete(a, false).expect("first");
    let before = ledger.totals();
    let second = ledger.mark_obsolete(a, false).expect("second");
    assert!(first.changed);
    assert!(!second.changed);
    assert_eq!(before, ledger.totals());
}

#[test]
fn obsolete_in_nextblock_is_wasted_until_close() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let a = append(&mut ledger, block, 400, 1);
    append(&mut ledger, block, 400, 1);
    ledger.mark_obsolete(a, false).expect("obsolete");
    let blk = ledger.block(block).expect("block");
    assert_eq!(blk.wasted_size, CLEANMARKER + 400);
    assert_eq!(blk.dirty_size, 0);

    let state = ledger.close_nextblock().expect("close");
    assert_eq!(state, Some(BlockState::Dirty));
    let blk = ledger.block(block).expect("block");
    assert_eq!(blk.wasted_size, 0);
    assert_eq!(blk.dirty_size, CLEANMARKER + 400);
    assert_eq!(ledger.nextblock(), None);
    ledger.check_accounting().expect("accounting");
}

#[test]
fn dirtiness_thresholds_refile_upwards() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let small = append(&mut ledger, block, 100, 1);
    let medium = append(&mut ledger, block, 200, 1);
    let large = append(&mut ledger, block, 2048, 1);
    append(&mut ledger, block, 1024, 1);
    ledger.close_nextblock().expect("close");
    assert_eq!(ledger.block(block).expect("b").state, BlockState::Clean);

    ledger.mark_obsolete(small, false).expect("small");
    assert_eq!(ledger.block(block).expect("b").state, BlockState::Clean);
    ledger.mark_obsolete(medium, false).expect("medium");
    assert_eq!(ledger.block(block).expect("b").state, BlockState::Dirty);
    ledger.mark_obsolete(large, false).expect("large");
    assert_eq!(ledger.block(block).expect("b").state, BlockState::VeryDirty);
}

#[test]
fn gc_relocation_keeps_handle_and_empties_source() {
    let mut ledger = erased_ledger();
    let source = open_nextblock(&mut ledger);
    let a = append(&mut ledger, source, 256, 9);
    ledger.close_nextblock().expect("close");
    ledger
        .file_block(source, BlockState::GcSource, ListEnd::Tail)
        .expect("gc source");

    let dest = open_nextblock(&mut ledger);
    let frontier = ledger.frontier(dest).expect("frontier");
    let out = ledger
        .relocate_ref(a, dest, frontier, Relocation::GarbageCollect, false)
        .expect("relocate")
        .expect("obsoleted placeholder");
    assert_eq!(out.refiled, Some(BlockState::Erasable));
    assert_eq!(ledger.gcblock(), None);

    let moved = ledger.node(a).expect("node");
    assert_eq!(moved.block, dest);
    assert_eq!(moved.offset(), frontier);
    assert_eq!(moved.owner, Some(InodeNumber(9)));
    assert_eq!(ledger.ref_totlen(a).expect("len"), 256);
    assert!(ledger.inode(InodeNumber(9)).expect("ic").nodes().any(|n| n == a));
    ledger.check_accounting().expect("accounting");
}

#[test]
fn recovery_relocation_accounts_old_copy_as_dirty() {
    let mut ledger = erased_ledger();
    let failed = open_nextblock(&mut ledger);
    let a = append(&mut ledger, failed, 64, 2);
    let b = append(&mut ledger, failed, 64, 2);
    let state = ledger.refile_failed_block(failed).expect("refile");
    assert_eq!(state, BlockState::BadUsed);
    assert_eq!(ledger.nextblock(), None);

    let dest = open_nextblock(&mut ledger);
    for id in [a, b] {
        let frontier = ledger.frontier(dest).expect("frontier");
        let out = ledger
            .relocate_ref(id, dest, frontier, Relocation::Recovery, false)
            .expect("relocate");
        assert!(out.is_none());
    }
    let old = ledger.block(failed).expect("old");
    assert_eq!(old.used_size, 0);
    assert_eq!(old.state, BlockState::BadUsed);
    assert_eq!(old.dirty_size, 128);
    assert_eq!(old.wasted_size, SECTOR - 128);
    ledger.check_accounting().expect("accounting");
}

#[test]
fn erase_failures_retry_then_retire() {
    let mut ledger = Ledger::new(geometry(), 168);
    let block = BlockIndex(3);
    ledger.begin_erase(block).expect("begin");
    assert!(!ledger.erase_failed(block, 2).expect("first failure"));
    assert_eq!(ledger.block(block).expect("b").state, BlockState::ErasePending);
    ledger.check_accounting().expect("accounting");

    ledger.begin_erase(block).expect("begin again");
    assert!(ledger.erase_failed(block, 2).expect("second failure"));
    assert_eq!(ledger.block(block).expect("b").state, BlockState::Bad);
    assert_eq!(ledger.totals().bad_size, SECTOR);
    ledger.check_accounting().expect("accounting");
}

#[test]
fn unchecked_promotion_moves_bytes() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let frontier = ledger.frontier(block).expect("frontier");
    let id = ledger
        .link_node_ref(block, frontier, 80, RefState::Unchecked, Some(InodeNumber(4)))
        .expect("link");
    assert_eq!(ledger.totals().unchecked_size, 80);
    assert!(ledger.set_ref_state(id, RefState::Normal).expect("promote"));
    assert_eq!(ledger.totals().unchecked_size, 0);
    assert!(ledger.set_ref_state(id, RefState::Unchecked).is_err());
    ledger.check_accounting().expect("accounting");
}

#[test]
fn deleted_inode_cache_released_with_last_node() {
    let mut ledger = erased_ledger();
    let block = open_nextblock(&mut ledger);
    let a = append(&mut ledger, block, 64, 6);
    {
        let ic = ledger.inode_mut(InodeNumber(6)).expect("cache");
        ic.state = InodeState::CheckedAbsent;
    }
    ledger.mark_obsolete(a, false).expect("obsolete");
    assert!(ledger.inode(InodeNumber(6)).is_none());
}

#[test]
fn stats_serialize() {
    let ledger = erased_ledger();
    let json = serde_json::to_string(&ledger.stats()).expect("json");
    assert!(json.contains("\"Free\":8"));
}

#[derive(Debug, Clone)]
enum Op {
    Append { len: u32, owner: u32 },
    Obsolete { pick: usize },
    Close,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (1_u32..100, 1_u32..4).prop_map(|(words, owner)| Op::Append { len: words * 4, owner }),
        4 => any::<usize>().prop_map(|pick| Op::Obsolete { pick }),
        1 => Just(Op::Close),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Counters stay exact through any mix of appends, obsoletes and closes.
    #[test]
    fn counters_always_balance(ops in proptest::collection::vec(op_strategy(), 1..120)) {
        let mut ledger = erased_ledger();
        let mut live: Vec<NodeRefId> = Vec::new();
        let mut dead = std::collections::BTreeSet::new();

        for op in ops {
            match op {
                Op::Append { len, owner } => {
                    let block = match ledger.nextblock() {
                        Some(b) if ledger.block(b).expect("b").free_size >= len => b,
                        Some(_) => {
                            ledger.close_nextblock().expect("close");
                            match ledger.first_in(BlockState::Free) {
                                Some(_) => open_nextblock(&mut ledger),
                                None => continue,
                            }
                        }
                        None => match ledger.first_in(BlockState::Free) {
                            Some(_) => open_nextblock(&mut ledger),
                            None => continue,
                        },
                    };
                    live.push(append(&mut ledger, block, len, owner));
                }
                Op::Obsolete { pick } => {
                    if live.is_empty() {
                        continue;
                    }
                    let id = live.swap_remove(pick % live.len());
                    let out = ledger.mark_obsolete(id, false).expect("obsolete");
                    prop_assert!(out.changed);
                    dead.insert(id);
                }
                Op::Close => {
                    ledger.close_nextblock().expect("close");
                }
            }
            ledger.check_accounting().map_err(|e| TestCaseError::fail(e.to_string()))?;
        }
        for id in dead {
            prop_assert!(ledger.node(id).expect("still linked").is_obsolete());
        }
    }
}
