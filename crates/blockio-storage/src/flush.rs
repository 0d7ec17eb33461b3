//! Journal flusher
//!
//! A demand-driven background sweep that migrates stable versions out of the
//! journal and into the data region, then advances the journal window. One
//! job consolidates one object: it reads the base block (clean entry or the
//! newest stable full-block write) and every stable journal payload above
//! it, composes the full block newest-wins, writes it to a freshly allocated
//! block, rewrites the object's metadata slot and fsyncs data then metadata.
//! A stable full-block write with nothing above it skips the copy and only
//! commits its slot; a stable delete collapses the object.
//!
//! Retiring a job unpins its journal records; the segment FIFO then pops in
//! order, which is the only way `used_start` advances. The rewritten journal
//! header is persisted (write + fsync) before the job counts as done, so
//! replay never starts inside reclaimed space.

use crate::index::{BigStage, CleanEntry, DelStage, DirtyEntry, JournalStage, VersionState};
use crate::layout::SECTOR_SIZE;
use crate::ring::{Completion, IoOp, Payload, Submission, Target};
use crate::store::Blockstore;
use blockio_common::{ObjVer, ObjectId, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// What a flush job does to its object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushKind {
    /// Compose journal payloads over a base block into a new block
    Consolidate,
    /// Commit the metadata slot of a stable full-block write
    CommitBig,
    /// Collapse the object: zero its slot, free its block
    Collapse,
}

/// Current step of a job; completions advance it, the progress pump submits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushPhase {
    Read,
    WriteData,
    FsyncData,
    WriteMeta,
    FsyncMeta,
    WriteHeader,
    FsyncHeader,
}

/// One stable journal payload to migrate
struct FlushRead {
    version: u64,
    offset: u32,
    len: u32,
    location: u64,
    data: Option<Bytes>,
}

struct FlushJob {
    id: u64,
    oid: ObjectId,
    target: u64,
    kind: FlushKind,
    phase: FlushPhase,
    pending: u32,
    /// Stable versions up to `target`, oldest first; erased when the job
    /// finishes
    chain: Vec<(u64, DirtyEntry)>,
    reads: Vec<FlushRead>,
    /// Data-region location of the base block, if any
    base_location: Option<u64>,
    base_data: Option<Bytes>,
    /// Destination location being promoted to clean
    new_location: Option<u64>,
    /// Journal window persisted by the header phases
    header_snapshot: Option<crate::layout::JournalHeader>,
    failed: bool,
}

/// Flush scheduling state
pub(crate) struct Flusher {
    queue: VecDeque<ObjVer>,
    active: Option<FlushJob>,
    /// Demand latch: an operation parked on journal back-pressure
    requested: bool,
    next_job: u64,
}

impl Flusher {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            active: None,
            requested: false,
            next_job: 0,
        }
    }

    /// Ask the sweep to run at the next opportunity
    pub(crate) fn request(&mut self) {
        self.requested = true;
    }

    /// Schedule an object for flushing up to `ov.version`
    pub(crate) fn enqueue(&mut self, ov: ObjVer) {
        for queued in &mut self.queue {
            if queued.oid == ov.oid {
                queued.version = queued.version.max(ov.version);
                return;
            }
        }
        self.queue.push_back(ov);
    }

    pub(crate) fn busy(&self) -> bool {
        self.active.is_some()
    }
}

/// Outcome of trying to submit the current phase
enum PhaseAction {
    /// I/O submitted; wait for completions
    Submitted,
    /// Phase needed no I/O; moved on
    Advanced,
    /// Resources unavailable; retry next cycle
    Blocked,
}

impl Blockstore {
    /// Progress pump: start a job when due and submit its current phase
    /// whenever no completions are outstanding.
    pub(crate) fn flusher_progress(&mut self) -> Result<bool> {
        let mut progress = false;
        if self.flusher.active.is_none() {
            progress |= self.flusher_start_next();
        }
        while self
            .flusher
            .active
            .as_ref()
            .is_some_and(|job| job.pending == 0)
        {
            match self.flush_submit_phase()? {
                PhaseAction::Submitted | PhaseAction::Advanced => progress = true,
                PhaseAction::Blocked => break,
            }
            if self.flusher.active.is_none() {
                progress |= self.flusher_start_next();
            }
        }
        Ok(progress)
    }

    /// Pick the next job: a queued object if the sweep is due, else a bare
    /// header rewrite if a trim left the header dirty.
    fn flusher_start_next(&mut self) -> bool {
        loop {
            let due = self.flusher.requested
                || self.journal.free_space() < self.journal.capacity() / 2;
            if self.flusher.queue.is_empty() || !due {
                if self.flusher.queue.is_empty() {
                    self.flusher.requested = false;
                }
                if self.journal.header_dirty {
                    let id = self.flusher.next_job;
                    self.flusher.next_job += 1;
                    self.flusher.active = Some(FlushJob {
                        id,
                        oid: ObjectId::new(0, 0),
                        target: 0,
                        kind: FlushKind::Collapse,
                        phase: FlushPhase::WriteHeader,
                        pending: 0,
                        chain: Vec::new(),
                        reads: Vec::new(),
                        base_location: None,
                        base_data: None,
                        new_location: None,
                        header_snapshot: None,
                        failed: false,
                    });
                    return true;
                }
                return false;
            }
            let ov = self.flusher.queue.pop_front().expect("non-empty queue");
            if let Some(job) = self.flush_plan(ov) {
                debug!(oid = %job.oid, target = job.target, kind = ?job.kind, "flush job start");
                self.stats.flush_jobs += 1;
                self.flusher.active = Some(job);
                return true;
            }
            // Superseded entry; a trim alone may still be possible
            if self.journal.trim() {
                self.stats.journal_trims += 1;
            }
        }
    }

    /// Build a job for every stable version of `ov.oid` up to `ov.version`
    fn flush_plan(&mut self, ov: ObjVer) -> Option<FlushJob> {
        let chain: Vec<(u64, DirtyEntry)> = self
            .index
            .dirty
            .range(ObjVer::new(ov.oid, 0)..=ov)
            .filter(|(_, e)| e.state.is_stable())
            .map(|(k, e)| (k.version, *e))
            .collect();
        let (target, top) = chain.last().copied()?;

        let kind = if top.state.is_delete() {
            FlushKind::Collapse
        } else if top.state.is_big() {
            FlushKind::CommitBig
        } else {
            FlushKind::Consolidate
        };

        // Base for consolidation: the newest stable full-block write or
        // tombstone below the smalls, else the clean entry
        let mut base_location = None;
        let mut cut = 0u64;
        if kind == FlushKind::Consolidate {
            for (version, entry) in chain.iter().rev().skip(1) {
                if entry.state.is_big() {
                    base_location = Some(entry.location);
                    cut = *version;
                    break;
                }
                if entry.state.is_delete() {
                    cut = *version;
                    break;
                }
            }
            if cut == 0 && base_location.is_none() {
                base_location = self.index.clean.get(&ov.oid).map(|c| c.location);
            }
        }

        let reads: Vec<FlushRead> = if kind == FlushKind::Consolidate {
            chain
                .iter()
                .filter(|(v, e)| *v > cut && e.state.is_journal())
                .map(|(v, e)| FlushRead {
                    version: *v,
                    offset: e.offset,
                    len: e.len,
                    location: e.location,
                    data: None,
                })
                .collect()
        } else {
            Vec::new()
        };

        let id = self.flusher.next_job;
        self.flusher.next_job += 1;
        Some(FlushJob {
            id,
            oid: ov.oid,
            target,
            phase: match kind {
                FlushKind::Consolidate => FlushPhase::Read,
                FlushKind::CommitBig | FlushKind::Collapse => FlushPhase::WriteMeta,
            },
            kind,
            pending: 0,
            chain,
            reads,
            base_location,
            base_data: None,
            new_location: match kind {
                FlushKind::CommitBig => Some(top.location),
                _ => None,
            },
            header_snapshot: None,
            failed: false,
        })
    }

    fn flush_submit_phase(&mut self) -> Result<PhaseAction> {
        let job = self.flusher.active.as_mut().expect("active job");
        let job_id = job.id;
        let payload = |index: u32| Payload {
            target: Target::Flush(job_id),
            buf_offset: index,
        };

        match job.phase {
            FlushPhase::Read => {
                let needed = job.reads.len() + usize::from(job.base_location.is_some());
                if needed == 0 {
                    job.phase = FlushPhase::WriteData;
                    return Ok(PhaseAction::Advanced);
                }
                if self.ring.borrow().sqe_left() < needed {
                    return Ok(PhaseAction::Blocked);
                }
                let mut ring = self.ring.borrow_mut();
                for (i, read) in job.reads.iter().enumerate() {
                    ring.push(Submission {
                        op: IoOp::ReadAt {
                            file: self.journal_file,
                            offset: self.geometry.journal_offset + read.location,
                            len: read.len,
                        },
                        payload: payload(i as u32),
                    })
                    .expect("slots checked");
                }
                if let Some(base) = job.base_location {
                    ring.push(Submission {
                        op: IoOp::ReadAt {
                            file: self.data_file,
                            offset: self.geometry.data_offset + base,
                            len: self.geometry.block_size,
                        },
                        payload: payload(u32::MAX),
                    })
                    .expect("slots checked");
                }
                job.pending = needed as u32;
                Ok(PhaseAction::Submitted)
            }

            FlushPhase::WriteData => {
                let Some(block) = self.alloc.find_free() else {
                    // Out of space: put the job back and retry later; new big
                    // writes fail with ENOSPC while small writes stay parked
                    warn!(oid = %job.oid, "flush stalled: data region full");
                    let ov = ObjVer::new(job.oid, job.target);
                    self.flusher.active = None;
                    self.flusher.queue.push_back(ov);
                    self.flusher.requested = false;
                    return Ok(PhaseAction::Blocked);
                };
                if self.ring.borrow().sqe_left() < 1 {
                    return Ok(PhaseAction::Blocked);
                }
                let mut compose = vec![0u8; self.geometry.block_size as usize];
                if let Some(base) = &job.base_data {
                    compose.copy_from_slice(base);
                }
                for read in &job.reads {
                    let data = read.data.as_ref().expect("read completed");
                    let at = read.offset as usize;
                    compose[at..at + read.len as usize].copy_from_slice(data);
                }
                let location = block << self.geometry.block_order;
                self.alloc.set(block, true);
                job.new_location = Some(location);
                self.ring
                    .borrow_mut()
                    .push(Submission {
                        op: IoOp::WriteAt {
                            file: self.data_file,
                            offset: self.geometry.data_offset + location,
                            data: Bytes::from(compose),
                        },
                        payload: payload(0),
                    })
                    .expect("slot checked");
                job.pending = 1;
                trace!(oid = %job.oid, block, "flush: compose written");
                Ok(PhaseAction::Submitted)
            }

            FlushPhase::FsyncData => {
                if self.ring.borrow().sqe_left() < 1 {
                    return Ok(PhaseAction::Blocked);
                }
                self.ring
                    .borrow_mut()
                    .push(Submission {
                        op: IoOp::Fsync {
                            file: self.data_file,
                        },
                        payload: payload(0),
                    })
                    .expect("slot checked");
                job.pending = 1;
                Ok(PhaseAction::Submitted)
            }

            FlushPhase::WriteMeta => {
                // Mutate the metadata image, then write the touched sectors
                let old_clean = self.index.clean.get(&job.oid).copied();
                let mut slots: Vec<u64> = Vec::new();
                if let Some(new_location) = job.new_location {
                    let slot = new_location >> self.geometry.block_order;
                    let entry = crate::layout::CleanDiskEntry {
                        oid: job.oid,
                        version: job.target,
                        flags: 0,
                    };
                    let at = (slot * 32) as usize;
                    self.meta_image[at..at + 32].copy_from_slice(&entry.to_bytes());
                    slots.push(slot);
                }
                if let Some(old) = old_clean
                    && Some(old.location) != job.new_location
                {
                    let slot = old.location >> self.geometry.block_order;
                    let at = (slot * 32) as usize;
                    self.meta_image[at..at + 32].fill(0);
                    slots.push(slot);
                }

                let mut chunks: Vec<u64> = slots
                    .iter()
                    .map(|slot| self.geometry.meta_slot_offset(*slot) / SECTOR_SIZE * SECTOR_SIZE)
                    .collect();
                chunks.sort_unstable();
                chunks.dedup();
                if chunks.is_empty() {
                    // Collapse of an object that never had a clean entry
                    self.finish_flush_job()?;
                    return Ok(PhaseAction::Advanced);
                }
                if self.ring.borrow().sqe_left() < chunks.len() {
                    return Ok(PhaseAction::Blocked);
                }
                let writes: Vec<(u64, Bytes)> = chunks
                    .iter()
                    .map(|&chunk_off| {
                        let slot = (chunk_off - SECTOR_SIZE) / 32;
                        self.meta_slot_chunk(slot)
                    })
                    .collect();
                let count = writes.len() as u32;
                {
                    let mut ring = self.ring.borrow_mut();
                    for (offset, data) in writes {
                        ring.push(Submission {
                            op: IoOp::WriteAt {
                                file: self.meta_file,
                                offset: self.geometry.meta_offset + offset,
                                data,
                            },
                            payload: payload(0),
                        })
                        .expect("slots checked");
                    }
                }
                let job = self.flusher.active.as_mut().expect("active job");
                job.pending = count;
                Ok(PhaseAction::Submitted)
            }

            FlushPhase::FsyncMeta => {
                if self.ring.borrow().sqe_left() < 1 {
                    return Ok(PhaseAction::Blocked);
                }
                self.ring
                    .borrow_mut()
                    .push(Submission {
                        op: IoOp::Fsync {
                            file: self.meta_file,
                        },
                        payload: payload(0),
                    })
                    .expect("slot checked");
                job.pending = 1;
                Ok(PhaseAction::Submitted)
            }

            FlushPhase::WriteHeader => {
                if self.ring.borrow().sqe_left() < 1 {
                    return Ok(PhaseAction::Blocked);
                }
                let header = self.journal.header();
                let sector = Bytes::from(header.to_sector());
                self.ring
                    .borrow_mut()
                    .push(Submission {
                        op: IoOp::WriteAt {
                            file: self.journal_file,
                            offset: self.geometry.journal_offset,
                            data: sector,
                        },
                        payload: payload(0),
                    })
                    .expect("slot checked");
                let job = self.flusher.active.as_mut().expect("active job");
                job.header_snapshot = Some(header);
                job.pending = 1;
                Ok(PhaseAction::Submitted)
            }

            FlushPhase::FsyncHeader => {
                if self.ring.borrow().sqe_left() < 1 {
                    return Ok(PhaseAction::Blocked);
                }
                self.ring
                    .borrow_mut()
                    .push(Submission {
                        op: IoOp::Fsync {
                            file: self.journal_file,
                        },
                        payload: payload(0),
                    })
                    .expect("slot checked");
                job.pending = 1;
                Ok(PhaseAction::Submitted)
            }
        }
    }

    pub(crate) fn handle_flush_event(&mut self, job_id: u64, completion: Completion) -> Result<()> {
        let (phase, oid, kind, target, flushed, header_snapshot) = {
            let Some(job) = self.flusher.active.as_mut() else {
                return Ok(());
            };
            if job.id != job_id {
                return Ok(());
            }
            if completion.result < 0 {
                job.failed = true;
            } else if let Some(data) = completion.data {
                match completion.payload.buf_offset {
                    u32::MAX => job.base_data = Some(data),
                    index => job.reads[index as usize].data = Some(data),
                }
            }
            job.pending -= 1;
            if job.pending > 0 {
                return Ok(());
            }
            let flushed: Vec<u64> = job.reads.iter().map(|r| r.version).collect();
            (
                job.phase,
                job.oid,
                job.kind,
                job.target,
                flushed,
                job.header_snapshot,
            )
        };

        if self.flusher.active.as_ref().is_some_and(|j| j.failed) {
            // Leave the journal window untouched; the entries replay fine
            warn!(%oid, ?phase, "flush job failed, dropping");
            self.flusher.active = None;
            return Ok(());
        }

        let set_phase = |store: &mut Self, phase: FlushPhase| {
            store.flusher.active.as_mut().expect("active job").phase = phase;
        };
        match phase {
            FlushPhase::Read => set_phase(self, FlushPhase::WriteData),
            FlushPhase::WriteData => {
                set_phase(self, FlushPhase::FsyncData);
                for version in flushed {
                    if let Some(entry) = self.index.dirty.get_mut(&ObjVer::new(oid, version)) {
                        entry.state = VersionState::Journal(JournalStage::Moved);
                    }
                }
            }
            FlushPhase::FsyncData => {
                set_phase(self, FlushPhase::WriteMeta);
                for version in flushed {
                    if let Some(entry) = self.index.dirty.get_mut(&ObjVer::new(oid, version)) {
                        entry.state = VersionState::Journal(JournalStage::MoveSynced);
                    }
                }
            }
            FlushPhase::WriteMeta => {
                set_phase(self, FlushPhase::FsyncMeta);
                if kind == FlushKind::CommitBig
                    && let Some(entry) = self.index.dirty.get_mut(&ObjVer::new(oid, target))
                {
                    entry.state = VersionState::Big(BigStage::MetaMoved);
                }
            }
            FlushPhase::FsyncMeta => {
                self.finish_flush_job()?;
            }
            FlushPhase::WriteHeader => set_phase(self, FlushPhase::FsyncHeader),
            FlushPhase::FsyncHeader => {
                let header = header_snapshot.expect("header written");
                self.journal.commit_trim(header);
                self.flusher.active = None;
            }
        }
        Ok(())
    }

    /// Promote the flushed object, erase its retired versions, advance the
    /// journal window.
    fn finish_flush_job(&mut self) -> Result<()> {
        let job = self.flusher.active.take().expect("active job");
        let old_clean = self.index.clean.get(&job.oid).copied();

        match job.kind {
            FlushKind::Consolidate | FlushKind::CommitBig => {
                let location = job.new_location.expect("promoted location");
                if job.kind == FlushKind::CommitBig
                    && let Some(entry) = self
                        .index
                        .dirty
                        .get_mut(&ObjVer::new(job.oid, job.target))
                {
                    entry.state = VersionState::Big(BigStage::MetaCommitted);
                }
                self.index.clean.insert(
                    job.oid,
                    CleanEntry {
                        version: job.target,
                        location,
                    },
                );
            }
            FlushKind::Collapse => {
                if let Some(entry) = self
                    .index
                    .dirty
                    .get_mut(&ObjVer::new(job.oid, job.target))
                {
                    entry.state = VersionState::Del(DelStage::Moved);
                }
                self.index.clean.remove(&job.oid);
            }
        }

        if let Some(old) = old_clean
            && Some(old.location) != job.new_location
        {
            self.alloc
                .set(old.location >> self.geometry.block_order, false);
        }

        for (version, entry) in &job.chain {
            self.index.dirty.remove(&ObjVer::new(job.oid, *version));
            if let Some(seg) = entry.journal_seg {
                self.journal.dec_live(seg);
            }
            if entry.state.is_big() && Some(entry.location) != job.new_location {
                self.alloc
                    .set(entry.location >> self.geometry.block_order, false);
            }
        }

        if self.journal.trim() {
            self.stats.journal_trims += 1;
        }
        debug!(oid = %job.oid, target = job.target, used_start = self.journal.used_start,
               "flush job done");

        if self.journal.header_dirty {
            self.flusher.active = Some(FlushJob {
                phase: FlushPhase::WriteHeader,
                pending: 0,
                ..job
            });
        }
        Ok(())
    }
}
