use super::*;
use ffl_device::MemFlash;
use ffl_ledger::{InodeCache, NodeRef};
use ffl_ondisk::{CLEANMARKER_SIZE, DataNode, NodeHeader, parse_summary};

const SECTOR: u32 = 4096;
const PAGE: u32 = 512;

fn geometry(blocks: u32) -> FlashGeometry {
    FlashGeometry::new(blocks * SECTOR, SECTOR, PAGE).expect("geometry")
}

fn volume_on(flash: &Arc<MemFlash>, config: VolumeConfig) -> Volume {
    Volume::format(Arc::clone(flash) as Arc<dyn FlashDevice>, config).expect("format")
}

fn volume(blocks: u32) -> (Arc<MemFlash>, Volume) {
    let flash = Arc::new(MemFlash::new(geometry(blocks)));
    let vol = volume_on(&flash, VolumeConfig::default());
    (flash, vol)
}

fn node_offset(vol: &Volume, id: NodeRefId) -> u32 {
    vol.with_ledger(|l| l.node(id).map(|n| n.offset()))
        .expect("node exists")
}

fn first_node(vol: &Volume, ino: InodeNumber) -> NodeRefId {
    vol.fragments(ino).expect("fragments")[0]
        .node
        .expect("backed by a node")
}

// ── Format ──────────────────────────────────────────────────────────────────

#[test]
fn format_erases_and_marks_every_block() {
    let (flash, vol) = volume(8);
    let stats = vol.stats();
    assert_eq!(stats.space.blocks.get("Free"), Some(&8));
    assert_eq!(stats.space.totals.used_size, 8 * CLEANMARKER_SIZE);
    assert_eq!(flash.stats().erases, 8);
    let marker = flash.snapshot(SECTOR..SECTOR + 12);
    assert!(ffl_ondisk::is_cleanmarker(&marker));
    vol.check_accounting().expect("accounting");
}

#[test]
fn format_refuses_medium_below_write_reserve() {
    let flash = Arc::new(MemFlash::new(geometry(8)));
    flash.with_faults(|plan| {
        for block in 0..6 {
            plan.erase_failures.insert(block, 2);
        }
    });
    let err = Volume::format(Arc::clone(&flash) as Arc<dyn FlashDevice>, VolumeConfig::default())
        .expect_err("too many bad blocks");
    assert!(matches!(err, FflError::NoSpace));
    assert_eq!(flash.bad_blocks().len(), 6);
}

// ── Obsolete marking ────────────────────────────────────────────────────────

#[test]
fn overwritten_node_loses_accurate_bit_on_flash() {
    let (flash, vol) = volume(8);
    let ino = InodeNumber(1);
    vol.write_data(ino, 0, &[0xAB; 100]).expect("write");
    vol.sync().expect("sync");
    let old = first_node(&vol, ino);
    let at = node_offset(&vol, old);

    vol.write_data(ino, 0, &[0xCD; 100]).expect("overwrite");
    vol.sync().expect("sync");

    let header = NodeHeader::parse(&flash.snapshot(at..at + 12)).expect("header still parses");
    assert!(!header.is_accurate());
    assert!(vol.with_ledger(|l| l.node(old).is_some_and(NodeRef::is_obsolete)));
    assert_eq!(vol.read_data(ino, 0, 100).expect("read"), vec![0xCD; 100]);
    vol.check_accounting().expect("accounting");
}

#[test]
fn staged_node_is_invalidated_in_the_buffer() {
    let (flash, vol) = volume(8);
    let ino = InodeNumber(1);
    vol.write_data(ino, 0, &[1; 60]).expect("write");
    let old = first_node(&vol, ino);
    let at = node_offset(&vol, old);
    assert!(vol.wbuf.read().is_dirty());

    vol.write_data(ino, 0, &[2; 60]).expect("overwrite");
    assert_eq!(flash.snapshot(at..at + 12), vec![0xFF; 12], "nothing flushed yet");
    vol.sync().expect("sync");

    let header = NodeHeader::parse(&flash.snapshot(at..at + 12)).expect("header");
    assert!(!header.is_accurate());
}

#[test]
fn headers_stay_accurate_without_obsolete_marking() {
    let flash = Arc::new(MemFlash::new(geometry(8)).without_obsolete_marking());
    let vol = volume_on(&flash, VolumeConfig::default());
    let ino = InodeNumber(4);
    vol.write_data(ino, 0, &[3; 100]).expect("write");
    vol.sync().expect("sync");
    let at = node_offset(&vol, first_node(&vol, ino));

    vol.write_data(ino, 0, &[4; 100]).expect("overwrite");
    vol.sync().expect("sync");

    let header = NodeHeader::parse(&flash.snapshot(at..at + 12)).expect("header");
    assert!(header.is_accurate());
}

#[test]
fn mark_obsolete_is_idempotent() {
    let (_flash, vol) = volume(8);
    let ino = InodeNumber(2);
    vol.write_data(ino, 0, &[5; 200]).expect("write");
    let id = first_node(&vol, ino);
    vol.delete_inode(ino).expect("delete");
    let before = vol.with_ledger(|l| l.totals());
    assert!(!vol.mark_obsolete(id).expect("second obsolete"));
    assert_eq!(vol.with_ledger(|l| l.totals()), before);
}

// ── Reservation ─────────────────────────────────────────────────────────────

#[test]
fn first_reservation_obsoletes_the_clean_marker() {
    let (_flash, vol) = volume(8);
    let res = vol.reserve_space(100, Priority::Normal).expect("reserve");
    assert_eq!(res.block(), BlockIndex(0));
    assert_eq!(res.offset(), CLEANMARKER_SIZE);
    assert_eq!(res.len(), SECTOR - CLEANMARKER_SIZE);
    res.complete();

    let block = vol.with_ledger(|l| l.block(BlockIndex(0)).cloned()).expect("block");
    assert_eq!(block.state, BlockState::Nextblock);
    assert_eq!(block.used_size, 0);
    assert_eq!(block.wasted_size, CLEANMARKER_SIZE);
}

#[test]
fn reservation_outside_a_block_is_rejected() {
    let (_flash, vol) = volume(8);
    assert!(matches!(
        vol.reserve_space(0, Priority::Normal),
        Err(FflError::Config(_))
    ));
    assert!(matches!(
        vol.reserve_space(SECTOR, Priority::Normal),
        Err(FflError::Config(_))
    ));
    assert!(!vol.is_read_only());
}

#[test]
fn reservation_writes_caller_nodes() {
    let (flash, vol) = volume(8);
    let ino = InodeNumber(9);
    let node = DataNode {
        ino: 9,
        version: 1,
        isize: 32,
        offset: 0,
        dsize: 32,
    };
    let bytes = node.encode(&[0x5A; 32]).expect("encode");

    let mut res = vol.reserve_space(200, Priority::Normal).expect("reserve");
    let start = res.offset();
    let first = res.write_node(&bytes, RefState::Normal, Some(ino)).expect("first");
    assert_eq!(res.offset(), start + 72);
    let second = res.write_node(&bytes, RefState::Normal, Some(ino)).expect("second");
    res.complete();
    vol.sync().expect("sync");

    assert_eq!(node_offset(&vol, first), start);
    assert_eq!(node_offset(&vol, second), start + 72);
    assert_eq!(flash.snapshot(start..start + 72), bytes);
    let owned = vol.with_ledger(|l| l.inode(ino).map(InodeCache::node_count));
    assert_eq!(owned, Some(2));
    vol.check_accounting().expect("accounting");
}

#[test]
fn full_nextblock_is_closed_and_replaced() {
    let (_flash, vol) = volume(8);
    let ino = InodeNumber(1);
    // Four 1 KiB nodes overflow one 4 KiB block.
    for page in 0..4 {
        vol.write_data(ino, page * 1024, &[page as u8; 1024]).expect("write");
    }
    vol.sync().expect("sync");
    let (closed, next) = vol.with_ledger(|l| {
        (
            l.block(BlockIndex(0)).map(|b| (b.state, b.free_size)),
            l.nextblock(),
        )
    });
    let (state, free) = closed.expect("block 0");
    assert_eq!(free, 0);
    assert!(matches!(state, BlockState::Clean | BlockState::Dirty));
    assert_eq!(next, Some(BlockIndex(1)));
    for page in 0..4 {
        let data = vol.read_data(ino, page * 1024, 1024).expect("read");
        assert_eq!(data, vec![page as u8; 1024]);
    }
    vol.check_accounting().expect("accounting");
}

#[test]
fn summary_is_written_before_a_block_closes() {
    let flash = Arc::new(MemFlash::new(geometry(8)));
    let config = VolumeConfig {
        summary: true,
        ..VolumeConfig::default()
    };
    let vol = volume_on(&flash, config);
    let ino = InodeNumber(3);
    for i in 0..6 {
        vol.write_data(ino, i * 1000, &[i as u8; 1000]).expect("write");
    }
    vol.sync().expect("sync");

    let entries = parse_summary(&flash.snapshot(0..SECTOR)).expect("summary of block 0");
    assert!(entries.len() >= 3);
    assert!(entries.iter().all(|e| e.ino == 3));
    for entry in &entries {
        let at = entry.offset;
        let header = NodeHeader::parse(&flash.snapshot(at..at + 12)).expect("entry points at a node");
        assert_eq!(header.totlen, entry.totlen);
    }
    vol.check_accounting().expect("accounting");
}

// ── Unchecked nodes ─────────────────────────────────────────────────────────

#[test]
fn checking_promotes_valid_and_obsoletes_garbage() {
    let (flash, vol) = volume(8);
    let ino = InodeNumber(5);
    let bytes = DataNode {
        ino: 5,
        version: 1,
        isize: 16,
        offset: 0,
        dsize: 16,
    }
    .encode(&[7; 16])
    .expect("encode");
    flash.write(CLEANMARKER_SIZE, &bytes).expect("program");

    let good = vol
        .add_node(BlockIndex(0), CLEANMARKER_SIZE, bytes.len() as u32, RefState::Unchecked, Some(ino))
        .expect("import node");
    let garbage_at = CLEANMARKER_SIZE + 56;
    let bad = vol
        .add_node(BlockIndex(0), garbage_at, 64, RefState::Unchecked, Some(ino))
        .expect("import garbage");
    assert_eq!(vol.with_ledger(|l| l.totals().unchecked_size), 120);

    {
        let mut txn = vol.txn().expect("txn");
        assert!(txn.check_ref(good).expect("check good"));
        assert!(!txn.check_ref(bad).expect("check bad"));
    }
    vol.with_ledger(|l| {
        assert_eq!(l.node(good).map(NodeRef::state), Some(RefState::Normal));
        assert!(l.node(bad).is_some_and(NodeRef::is_obsolete));
        assert_eq!(l.totals().unchecked_size, 0);
    });
    vol.check_accounting().expect("accounting");
}

#[test]
fn import_into_staged_block_is_fatal() {
    let (_flash, vol) = volume(8);
    vol.write_data(InodeNumber(1), 0, &[1; 50]).expect("write");
    let frontier = vol.with_ledger(|l| l.frontier(BlockIndex(0))).expect("frontier");
    let err = vol
        .add_node(BlockIndex(0), frontier, 16, RefState::Normal, None)
        .expect_err("staged block");
    assert!(matches!(err, FflError::Inconsistent(_)));
    assert!(vol.is_read_only());
    assert!(matches!(
        vol.write_data(InodeNumber(1), 0, &[2; 10]),
        Err(FflError::ReadOnly)
    ));
}

// ── Readers ─────────────────────────────────────────────────────────────────

#[test]
fn readers_share_the_file_table_and_buffer() {
    let (_flash, vol) = volume(8);
    let ino = InodeNumber(1);
    vol.write_data(ino, 0, &[3; 200]).expect("write");

    let _files = vol.files.read();
    let _wbuf = vol.wbuf.read();
    assert_eq!(vol.read_data(ino, 0, 200).expect("read"), vec![3; 200]);
    assert_eq!(vol.file_size(ino), Some(200));
    assert_eq!(vol.fragments(ino).expect("fragments").len(), 1);
}

// ── Garbage collection ──────────────────────────────────────────────────────

#[test]
fn collecting_a_node_shorter_than_its_fragments_is_corruption() {
    let (_flash, vol) = volume(8);
    let ino = InodeNumber(1);
    vol.write_data(ino, 0, &[1; 1000]).expect("write");
    let whole = first_node(&vol, ino);
    vol.write_data(ino, 200, &[2; 100]).expect("patch");
    let patch = vol.fragments(ino).expect("fragments")[1]
        .node
        .expect("backed");

    // The tree claims twice the bytes the node on flash carries.
    {
        let mut files = vol.files.write();
        let file = files.get_mut(&ino).expect("file");
        let mut tree = FragTree::new();
        tree.add_full_dnode(whole, 0, 2000).expect("add");
        tree.add_full_dnode(patch, 200, 100).expect("add");
        file.tree = tree;
    }

    let mut txn = vol.txn().expect("txn");
    let err = txn.gc_node(whole).expect_err("short node");
    assert!(matches!(err, FflError::Corruption { .. }), "{err}");
}

// ── Erase ───────────────────────────────────────────────────────────────────

#[test]
fn erase_verify_failure_requeues_block() {
    let flash = Arc::new(MemFlash::new(geometry(8)));
    let config = VolumeConfig {
        erase_defer_interval: 0,
        ..VolumeConfig::default()
    };
    let vol = volume_on(&flash, config);
    let ino = InodeNumber(1);
    vol.write_data(ino, 0, &[1; 3000]).expect("write");
    vol.write_data(ino, 0, &[2; 3000]).expect("overwrite");
    vol.delete_inode(ino).expect("delete");
    vol.sync().expect("sync");

    let block = vol
        .with_ledger(|l| l.first_in(BlockState::ErasePending))
        .expect("block 0 emptied and queued");
    assert_eq!(block, BlockIndex(0));
    // The read-back after erase fails once.
    let start = vol.geometry().block_start(block);
    flash.with_faults(|plan| plan.unreadable.push(start..start + 1));
    assert_eq!(vol.erase_pending_blocks(1).expect("erase"), 0);
    flash.with_faults(|plan| plan.unreadable.clear());

    let (state, failures) = vol
        .with_ledger(|l| l.block(block).map(|b| (b.state, b.bad_count)))
        .expect("block");
    assert_eq!(state, BlockState::ErasePending);
    assert_eq!(failures, 1);
    vol.check_accounting().expect("accounting");

    assert_eq!(vol.erase_pending_blocks(1).expect("erase"), 1);
    let state = vol.with_ledger(|l| l.block(block).map(|b| b.state));
    assert_eq!(state, Some(BlockState::Free));
    vol.check_accounting().expect("accounting");
}
