//! Blockstore engine core
//!
//! Owns the object index, allocator, journal and operation table, and drives
//! them from a shared submission/completion ring. Everything here runs on one
//! execution context: the caller interleaves `loop_once` (or the finer
//! stepping methods) with its own work, and completion callbacks are invoked
//! synchronously from it.
//!
//! The submit queue drains head-first. A head operation that cannot proceed
//! parks with a wait reason and blocks the queue; the reason is re-tested
//! every cycle, so the queue resumes as soon as the named resource frees up.

use crate::allocator::DataAllocator;
use crate::flush::Flusher;
use crate::index::ObjectIndex;
use crate::journal::Journal;
use crate::layout::{Geometry, RegionInput, SECTOR_SIZE};
use crate::op::{OpHandle, OpKind, OpTable, Operation, WaitReason};
use crate::raw_io::{DISK_ALIGNMENT, RawFile};
use crate::ring::{Completion, FileHandle, RingLoop, Target};
use blockio_common::{Error, Result, StoreConfig};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info};

/// Dirty-entry flag: a device error was reported for this version's I/O
pub(crate) const FLAG_FAILED: u32 = 1;

/// Outcome of one dequeue attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dequeue {
    /// Could not proceed; `op.wait` names the missing resource
    Parked,
    /// Submissions issued; the operation lives on in the table
    Started,
    /// Reached a terminal state synchronously; fire the callback
    Done,
}

/// Plain operation counters
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStats {
    pub ops_enqueued: u64,
    pub ops_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub journal_trims: u64,
    pub flush_jobs: u64,
}

/// A journaled object blockstore on raw devices
pub struct Blockstore {
    pub(crate) geometry: Geometry,
    pub(crate) ring: Rc<RefCell<RingLoop>>,
    pub(crate) data_file: FileHandle,
    pub(crate) meta_file: FileHandle,
    pub(crate) journal_file: FileHandle,

    pub(crate) index: ObjectIndex,
    pub(crate) alloc: DataAllocator,
    pub(crate) journal: Journal,
    /// Authoritative copy of the metadata slot array
    pub(crate) meta_image: Vec<u8>,

    pub(crate) ops: OpTable,
    pub(crate) submit_queue: VecDeque<OpHandle>,
    /// Completed-but-unsynced writes, captured by the next sync
    pub(crate) unsynced_big: Vec<blockio_common::ObjVer>,
    pub(crate) unsynced_small: Vec<blockio_common::ObjVer>,

    pub(crate) flusher: Flusher,
    pub(crate) stats: StoreStats,
}

impl Blockstore {
    /// Open (or create) a blockstore over the configured regions and run
    /// crash recovery. The ring is shared with the caller, who drives it.
    pub fn open(cfg: &StoreConfig, ring: Rc<RefCell<RingLoop>>) -> Result<Self> {
        cfg.validate()?;

        let data_path = cfg.data_device.clone();
        let meta_path = cfg.meta_device.clone().unwrap_or_else(|| data_path.clone());
        let journal_path = cfg
            .journal_device
            .clone()
            .unwrap_or_else(|| meta_path.clone());

        let open = |path: &PathBuf| RawFile::open(path, cfg.direct_io, cfg.disable_fsync);

        let data = open(&data_path)?;
        let meta_on_data = meta_path == data_path;
        let journal_on_data = journal_path == data_path;
        let journal_on_meta = journal_path == meta_path;

        let meta = if meta_on_data { None } else { Some(open(&meta_path)?) };
        let journal_dev = if journal_on_data {
            None
        } else if journal_on_meta {
            None
        } else {
            Some(open(&journal_path)?)
        };

        let input = RegionInput {
            data_file_size: data.size(),
            meta_file_size: meta.as_ref().map_or(data.size(), RawFile::size),
            journal_file_size: journal_dev.as_ref().map_or_else(
                || meta.as_ref().map_or(data.size(), RawFile::size),
                RawFile::size,
            ),
            meta_on_data,
            journal_on_data,
            journal_on_meta,
        };
        let geometry = Geometry::compute(cfg, &input)?;

        info!(
            data = %data_path.display(),
            meta = %meta_path.display(),
            journal = %journal_path.display(),
            block_size = geometry.block_size,
            block_count = geometry.block_count,
            journal_len = geometry.journal_len,
            "opening blockstore"
        );

        let (data_file, meta_file, journal_file) = {
            let mut r = ring.borrow_mut();
            let data_file = r.register_file(data);
            let meta_file = match meta {
                Some(f) => r.register_file(f),
                None => data_file,
            };
            let journal_file = match journal_dev {
                Some(f) => r.register_file(f),
                None if journal_on_data => data_file,
                None => meta_file,
            };
            (data_file, meta_file, journal_file)
        };

        let mut store = Self {
            geometry,
            ring,
            data_file,
            meta_file,
            journal_file,
            index: ObjectIndex::new(),
            alloc: DataAllocator::new(geometry.block_count),
            journal: Journal::new(geometry.journal_len, cfg.journal_sector_buffer_count),
            meta_image: vec![0; (geometry.block_count * 32) as usize],
            ops: OpTable::new(),
            submit_queue: VecDeque::new(),
            unsynced_big: Vec::new(),
            unsynced_small: Vec::new(),
            flusher: Flusher::new(),
            stats: StoreStats::default(),
        };
        store.recover()?;
        info!(
            clean = store.index.clean.len(),
            dirty = store.index.dirty.len(),
            used_start = store.journal.used_start,
            next_free = store.journal.next_free,
            "blockstore recovered"
        );
        Ok(store)
    }

    /// Hand an operation to the engine.
    ///
    /// Returns an error only for malformed operations; the operation is then
    /// dropped without its callback firing. Accepted operations always reach
    /// a terminal state and fire their callback.
    pub fn enqueue(&mut self, op: Operation) -> Result<()> {
        self.validate(&op)?;
        let handle = self.ops.insert(op);
        self.submit_queue.push_back(handle);
        self.stats.ops_enqueued += 1;
        Ok(())
    }

    fn validate(&self, op: &Operation) -> Result<()> {
        let block_size = self.geometry.block_size;
        match op.kind {
            OpKind::Read | OpKind::ReadDirty => {
                if op.len != 0
                    && (op.offset as usize % DISK_ALIGNMENT != 0
                        || op.len as usize % DISK_ALIGNMENT != 0)
                {
                    return Err(Error::invalid_argument("unaligned read range"));
                }
                if op.offset.saturating_add(op.len) > block_size {
                    return Err(Error::invalid_argument("read beyond object end"));
                }
            }
            OpKind::Write => {
                if op.len == 0
                    || op.offset as usize % DISK_ALIGNMENT != 0
                    || op.len as usize % DISK_ALIGNMENT != 0
                {
                    return Err(Error::invalid_argument("unaligned write range"));
                }
                if op.offset.saturating_add(op.len) > block_size {
                    return Err(Error::invalid_argument("write beyond object end"));
                }
                if op.buf.len() != op.len as usize {
                    return Err(Error::invalid_argument("write buffer length mismatch"));
                }
                if op.version == 0 {
                    return Err(Error::invalid_argument("write version must be non-zero"));
                }
            }
            OpKind::Delete | OpKind::Stable | OpKind::Rollback => {
                if op.version == 0 {
                    return Err(Error::invalid_argument("version must be non-zero"));
                }
            }
            OpKind::Sync => {}
        }
        Ok(())
    }

    /// One engine cycle: drain the submit queue, progress the flusher,
    /// submit queued I/O and dispatch every available completion.
    ///
    /// Returns whether anything moved; `false` means the engine is idle or
    /// every queued operation is parked on back-pressure.
    pub fn loop_once(&mut self) -> Result<bool> {
        let mut progress = false;
        progress |= self.drain_queue()?;
        progress |= self.flusher_progress()?;
        progress |= self.submit_io()? > 0;
        while self.complete_one()? {
            progress = true;
        }
        Ok(progress)
    }

    /// Drive the engine until nothing can make progress
    pub fn run(&mut self) -> Result<()> {
        while self.loop_once()? {}
        Ok(())
    }

    /// Flush queued submissions to the devices
    pub fn submit_io(&mut self) -> Result<usize> {
        self.ring.borrow_mut().submit()
    }

    /// Dispatch a single completion, if one is available
    pub fn complete_one(&mut self) -> Result<bool> {
        let completion = self.ring.borrow_mut().try_complete();
        match completion {
            Some(c) => {
                self.handle_completion(c)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Attempt to dequeue operations from the head of the submit queue
    pub fn drain_queue(&mut self) -> Result<bool> {
        let mut progress = false;
        while let Some(&handle) = self.submit_queue.front() {
            let mut op = self.ops.take(handle).expect("queued operation");
            if op.wait != WaitReason::None {
                if self.wait_satisfied(&op) {
                    debug!(?op, "resuming parked operation");
                    op.wait = WaitReason::None;
                } else {
                    // Journal waits resolve through the flusher; keep it
                    // demanded for as long as the head is parked on one
                    if matches!(
                        op.wait,
                        WaitReason::Journal(_) | WaitReason::JournalBuffer
                    ) {
                        self.flusher.request();
                    }
                    self.ops.put(handle, op);
                    break;
                }
            }
            match self.dequeue_op(handle, &mut op)? {
                Dequeue::Parked => {
                    debug_assert_ne!(op.wait, WaitReason::None);
                    self.ops.put(handle, op);
                    break;
                }
                Dequeue::Started => {
                    self.submit_queue.pop_front();
                    self.ops.put(handle, op);
                    progress = true;
                }
                Dequeue::Done => {
                    self.submit_queue.pop_front();
                    self.finish_op(handle, op);
                    progress = true;
                }
            }
        }
        Ok(progress)
    }

    fn dequeue_op(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        match op.kind {
            OpKind::Read | OpKind::ReadDirty => self.dequeue_read(handle, op),
            OpKind::Write => self.dequeue_write(handle, op),
            OpKind::Sync => self.dequeue_sync(handle, op),
            OpKind::Stable | OpKind::Rollback => self.dequeue_marker(handle, op),
            OpKind::Delete => self.dequeue_delete(handle, op),
        }
    }

    fn wait_satisfied(&self, op: &Operation) -> bool {
        match op.wait {
            WaitReason::None => true,
            WaitReason::Sqe => self.ring.borrow().sqe_left() > 0,
            WaitReason::InFlight(ov) => self
                .index
                .dirty
                .get(&ov)
                .is_none_or(|e| !e.state.is_in_flight()),
            WaitReason::Journal(bytes) => self.journal.free_space() > bytes,
            WaitReason::JournalBuffer => {
                let next = (self.journal.cur_sector + 1) % self.journal.sectors.len();
                self.journal.sectors[next].usage_count == 0
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        match completion.payload.target {
            Target::Op(handle) => self.handle_op_event(handle, completion),
            Target::Flush(job) => self.handle_flush_event(job, completion),
        }
    }

    fn handle_op_event(&mut self, handle: OpHandle, completion: Completion) -> Result<()> {
        let Some(op) = self.ops.take(handle) else {
            // Stale completion for an operation that already finished
            return Ok(());
        };
        match op.kind {
            OpKind::Read | OpKind::ReadDirty => self.on_read_event(handle, op, completion),
            OpKind::Write => self.on_write_event(handle, op, completion),
            OpKind::Sync => self.on_sync_event(handle, op, completion),
            OpKind::Stable | OpKind::Rollback => self.on_marker_event(handle, op, completion),
            OpKind::Delete => self.on_delete_event(handle, op, completion),
        }
    }

    /// Fire the callback of a terminal operation and drop it
    pub(crate) fn finish_op(&mut self, handle: OpHandle, mut op: Operation) {
        self.stats.ops_completed += 1;
        if let Some(mut callback) = op.callback.take() {
            callback(&mut op);
        }
        self.ops.release(handle);
    }

    /// Re-queue an in-flight operation at the head, parked on `wait`
    pub(crate) fn park_front(&mut self, handle: OpHandle, mut op: Operation, wait: WaitReason) {
        op.wait = wait;
        self.submit_queue.push_front(handle);
        self.ops.put(handle, op);
    }

    /// Release the journal sector buffers pinned by an operation
    pub(crate) fn release_sectors(&mut self, op: &mut Operation) {
        for sector in op.used_sectors.drain(..) {
            let s = &mut self.journal.sectors[sector];
            debug_assert!(s.usage_count > 0);
            s.usage_count = s.usage_count.saturating_sub(1);
        }
    }

    /// Absolute device offset of a journal-region position
    pub(crate) fn journal_pos(&self, pos: u64) -> u64 {
        self.geometry.journal_offset + pos
    }

    /// Absolute device offset of a data-region location
    pub(crate) fn data_pos(&self, location: u64) -> u64 {
        self.geometry.data_offset + location
    }

    /// True when no operations are queued or in flight
    pub fn is_idle(&self) -> bool {
        self.ops.is_empty() && !self.ring.borrow().has_work() && !self.flusher.busy()
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.geometry.block_count
    }

    pub fn free_block_count(&self) -> u64 {
        self.alloc.free_count()
    }

    pub fn journal_used_start(&self) -> u64 {
        self.journal.used_start
    }

    pub fn journal_next_free(&self) -> u64 {
        self.journal.next_free
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Log engine state at info level
    pub fn dump_diagnostics(&self) {
        info!(
            queued = self.submit_queue.len(),
            live_ops = self.ops.len(),
            clean = self.index.clean.len(),
            dirty = self.index.dirty.len(),
            free_blocks = self.alloc.free_count(),
            journal_used_start = self.journal.used_start,
            journal_next_free = self.journal.next_free,
            journal_free = self.journal.free_space(),
            "blockstore diagnostics"
        );
    }

    /// Sector-aligned chunk of the metadata image covering `slot`, as an
    /// `(offset-within-region, bytes)` pair ready for a device write
    pub(crate) fn meta_slot_chunk(&self, slot: u64) -> (u64, bytes::Bytes) {
        let slot_off = self.geometry.meta_slot_offset(slot);
        let chunk_off = slot_off / SECTOR_SIZE * SECTOR_SIZE;
        // Image is indexed from the first slot, which sits one sector into
        // the region
        let image_start = (chunk_off - SECTOR_SIZE) as usize;
        let image_end = (image_start + SECTOR_SIZE as usize).min(self.meta_image.len());
        let mut chunk = vec![0u8; SECTOR_SIZE as usize];
        chunk[..image_end - image_start].copy_from_slice(&self.meta_image[image_start..image_end]);
        (chunk_off, bytes::Bytes::from(chunk))
    }
}
