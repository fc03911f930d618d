#![forbid(unsafe_code)]
//! FrankenFlash engine.
//!
//! [`Volume`] owns a flash device and the in-memory model of what is on it:
//! the node ledger, the space allocator, the write buffer and one fragment
//! tree per file. Every operation that writes goes through a single
//! transaction that holds the allocation lock for its whole duration, so
//! reservations, garbage collection and write-buffer recovery never
//! interleave.
//!
//! ## Locks
//!
//! Locks are always taken in this order; any of them may be skipped.
//!
//! | Lock | Protects | Held by |
//! |------|----------|---------|
//! | `alloc` | reservation, GC and recovery sequencing | every writer, for the whole operation |
//! | `files` | fragment trees and file versions | writers (exclusive), readers (shared) |
//! | `wbuf` | the staged page | writers (exclusive), readers (shared) |
//! | `erase_free` | node invalidation against block erase | obsoleting nodes, starting erases |
//! | `space` | ledger, allocator state, summary collector | everyone, briefly |
//!
//! A transaction holds both write guards, so readers run alongside each
//! other but never alongside a writer.
//!
//! Device erases run with no lock held. A reservation that finds nothing to
//! erase and no free block waits on `erase_wait`, which every finished or
//! failed erase signals.
//!
//! ## Failure handling
//!
//! A page write that fails triggers write-buffer recovery: the failed block
//! is refiled and every live node that was staged or partly programmed is
//! rewritten elsewhere. Errors classified as fatal
//! ([`FflError::is_fatal`]) mark the volume read-only; later writes fail
//! with [`FflError::ReadOnly`].

mod config;
mod erase;
mod file;
mod gc;
mod io;
mod obsolete;
mod reclaim;
mod reserve;

pub use config::{MIN_DATA_LEN, VolumeConfig};
pub use ffl_alloc::Priority;
pub use file::FragmentInfo;
pub use reclaim::ReclaimThread;
pub use reserve::Reservation;

use ffl_alloc::{Allocator, ReserveLevels, SummaryCollector};
use ffl_device::{FlashDevice, ReadStatus};
use ffl_error::{FflError, Result};
use ffl_fragtree::FragTree;
use ffl_ledger::{BlockState, InodeState, Ledger, ListEnd, SpaceStats};
use ffl_types::{BlockIndex, FlashGeometry, InodeNumber, NodeRefId, ParseError, RefState, pad4};
use ffl_wbuf::{WbufState, WbufStats, WriteBuffer};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use reclaim::ReclaimSignal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ── Shared state ────────────────────────────────────────────────────────────

/// Everything behind the `space` lock.
pub(crate) struct SpaceState {
    pub(crate) ledger: Ledger,
    pub(crate) alloc: Allocator,
    pub(crate) summary: SummaryCollector,
}

/// Per-file state behind the `files` lock.
#[derive(Debug, Default)]
pub(crate) struct FileState {
    pub(crate) tree: FragTree,
    /// Highest node version written for the file.
    pub(crate) version: u32,
    /// File size recorded in the newest node.
    pub(crate) isize: u32,
    /// Latest data-less node carrying the size after a truncate.
    pub(crate) meta: Option<NodeRefId>,
}

impl FileState {
    pub(crate) fn size(&self) -> u32 {
        self.isize.max(self.tree.size())
    }
}

/// Serializable snapshot of a volume for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub space: SpaceStats,
    pub levels: ReserveLevels,
    pub wbuf: WbufStats,
    pub wbuf_state: WbufState,
    pub files: usize,
    pub read_only: bool,
}

pub(crate) fn corrupt(offset: u32, err: &ParseError) -> FflError {
    FflError::Corruption {
        offset,
        detail: err.to_string(),
    }
}

/// Read from the medium with staged write-buffer bytes applied on top.
pub(crate) fn read_overlaid(
    device: &dyn FlashDevice,
    wbuf: &WriteBuffer,
    offset: u32,
    buf: &mut [u8],
) -> Result<ReadStatus> {
    let status = device.read(offset, buf)?;
    wbuf.overlay(offset, buf);
    Ok(status)
}

// ── Volume ──────────────────────────────────────────────────────────────────

pub struct Volume {
    device: Arc<dyn FlashDevice>,
    geometry: FlashGeometry,
    config: VolumeConfig,
    alloc_lock: Mutex<()>,
    files: RwLock<BTreeMap<InodeNumber, FileState>>,
    wbuf: RwLock<WriteBuffer>,
    erase_free: Mutex<()>,
    space: Mutex<SpaceState>,
    erase_wait: Condvar,
    reclaim: ReclaimSignal,
    interrupted: AtomicBool,
    read_only: AtomicBool,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geometry)
            .field("config", &self.config)
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}

/// One writer's hold on the volume: the allocation lock, the file table
/// and exclusive access to the write buffer.
pub(crate) struct Txn<'a> {
    pub(crate) vol: &'a Volume,
    pub(crate) files: RwLockWriteGuard<'a, BTreeMap<InodeNumber, FileState>>,
    pub(crate) wbuf: RwLockWriteGuard<'a, WriteBuffer>,
    _alloc: MutexGuard<'a, ()>,
}

impl Volume {
    /// Erase the whole medium and start with an empty volume.
    ///
    /// Blocks that fail to erase `max_erase_failures` times are retired as
    /// bad on the way.
    pub fn format(device: Arc<dyn FlashDevice>, config: VolumeConfig) -> Result<Self> {
        let geometry = device.geometry();
        config.validate(geometry)?;
        let levels = config.reserve_levels(geometry, device.can_mark_obsolete())?;
        let ledger = Ledger::new(geometry, config.dirty_threshold);
        let volume = Self {
            geometry,
            alloc_lock: Mutex::new(()),
            files: RwLock::new(BTreeMap::new()),
            wbuf: RwLock::new(WriteBuffer::new(geometry)),
            erase_free: Mutex::new(()),
            space: Mutex::new(SpaceState {
                ledger,
                alloc: Allocator::new(levels, config.erase_defer_interval),
                summary: SummaryCollector::new(config.summary),
            }),
            erase_wait: Condvar::new(),
            reclaim: ReclaimSignal::default(),
            interrupted: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            device,
            config,
        };

        let mut erased = 0;
        while volume.with_ledger(|l| l.count(BlockState::ErasePending)) > 0 {
            erased += volume.erase_pending_blocks(1)?;
        }
        let (free, bad) = volume.with_ledger(|l| (l.count(BlockState::Free), l.count(BlockState::Bad)));
        tracing::info!(
            target: "ffl::core",
            blocks = geometry.block_count(),
            sector_size = geometry.sector_size,
            page_size = geometry.page_size,
            erased,
            free,
            bad,
            "volume_formatted"
        );
        if free <= levels.resv_blocks_write {
            return Err(FflError::NoSpace);
        }
        Ok(volume)
    }

    #[must_use]
    pub fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &dyn FlashDevice {
        &*self.device
    }

    /// True once a fatal error has shut down writes.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Abort the next (or current) wait for an erase to finish with
    /// [`FflError::Interrupted`].
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _space = self.space.lock();
        self.erase_wait.notify_all();
    }

    /// Run `f` against the ledger under the space lock.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&Ledger) -> R) -> R {
        f(&self.space.lock().ledger)
    }

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        let files = self.files.read().len();
        let (wbuf, wbuf_state) = {
            let wbuf = self.wbuf.read();
            (wbuf.stats(), wbuf.state())
        };
        let space = self.space.lock();
        VolumeStats {
            space: space.ledger.stats(),
            levels: *space.alloc.levels(),
            wbuf,
            wbuf_state,
            files,
            read_only: self.is_read_only(),
        }
    }

    /// Cross-check the ledger, every fragment tree, and the links between
    /// them.
    pub fn check_accounting(&self) -> Result<()> {
        let files = self.files.read();
        let space = self.space.lock();
        space.ledger.check_accounting()?;
        for (ino, file) in files.iter() {
            file.tree
                .check_coverage()
                .map_err(|detail| FflError::Inconsistent(format!("inode {ino}: {detail}")))?;
            if file.tree.size() != file.size() {
                return Err(FflError::Inconsistent(format!(
                    "inode {ino}: fragments cover {:#x} bytes of a {:#x}-byte file",
                    file.tree.size(),
                    file.size()
                )));
            }
            let raws = file
                .tree
                .dnodes()
                .map(|(_, dn)| dn.raw)
                .chain(file.meta);
            for raw in raws {
                let node = space.ledger.node(raw).ok_or_else(|| {
                    FflError::Inconsistent(format!("inode {ino} refers to released node {raw}"))
                })?;
                if node.is_obsolete() || node.owner != Some(*ino) {
                    return Err(FflError::Inconsistent(format!(
                        "inode {ino} refers to node {raw} in state {:?} owned by {:?}",
                        node.state(),
                        node.owner
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record a node the caller placed on flash itself.
    ///
    /// `offset` must be the write frontier of `block`. A free block becomes
    /// the write target. Unchecked nodes create their inode cache in the
    /// unchecked state so the collector verifies them.
    pub fn add_node(
        &self,
        block: BlockIndex,
        offset: u32,
        len: u32,
        state: RefState,
        owner: Option<InodeNumber>,
    ) -> Result<NodeRefId> {
        self.run(|txn| txn.import_node(block, offset, len, state, owner))
    }

    /// Mark a node obsolete. Returns false if it already was.
    pub fn mark_obsolete(&self, id: NodeRefId) -> Result<bool> {
        self.run(|txn| txn.obsolete_ref(id)).map(|out| out.changed)
    }

    // ── Transactions ────────────────────────────────────────────────────────

    pub(crate) fn txn(&self) -> Result<Txn<'_>> {
        if self.is_read_only() {
            return Err(FflError::ReadOnly);
        }
        let alloc = self.alloc_lock.lock();
        let files = self.files.write();
        let wbuf = self.wbuf.write();
        Ok(Txn {
            vol: self,
            files,
            wbuf,
            _alloc: alloc,
        })
    }

    /// Run a write operation in a transaction, then let the reclaimer know
    /// if there is work for it.
    pub(crate) fn run<T>(&self, op: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let result = {
            let mut txn = self.txn()?;
            op(&mut txn)
        };
        self.note_result(&result);
        self.trigger_reclaim();
        result
    }

    pub(crate) fn note_result<T>(&self, result: &Result<T>) {
        if let Err(err) = result {
            if err.is_fatal() && !self.read_only.swap(true, Ordering::AcqRel) {
                tracing::error!(target: "ffl::core", error = %err, "volume_read_only");
            }
        }
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }
}

impl Txn<'_> {
    fn import_node(
        &mut self,
        block: BlockIndex,
        offset: u32,
        len: u32,
        state: RefState,
        owner: Option<InodeNumber>,
    ) -> Result<NodeRefId> {
        if self.wbuf.is_dirty() {
            if self.wbuf.block() == Some(block) {
                return Err(FflError::Inconsistent(format!(
                    "node imported into block {block} while its page is staged"
                )));
            }
        } else {
            self.wbuf.discard();
        }

        let mut space = self.vol.space.lock();
        let SpaceState { ledger, summary, .. } = &mut *space;
        let current = ledger
            .block(block)
            .map(|b| b.state)
            .ok_or_else(|| FflError::NotFound(format!("block {block}")))?;
        if current == BlockState::Free {
            if let Some(next) = ledger.nextblock() {
                return Err(FflError::Config(format!(
                    "block {block} is free while block {next} receives writes"
                )));
            }
            ledger.file_block(block, BlockState::Nextblock, ListEnd::Tail)?;
            summary.reset(block);
        }
        if summary.block() == Some(block) {
            summary.disable();
        }
        if let (RefState::Unchecked, Some(ino)) = (state, owner) {
            ledger.ensure_inode(ino, InodeState::Unchecked);
        }
        let id = ledger.link_node_ref(block, offset, pad4(len), state, owner)?;
        tracing::debug!(
            target: "ffl::core",
            node = id.0,
            block = block.0,
            offset,
            len,
            state = ?state,
            "node_imported"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests;
