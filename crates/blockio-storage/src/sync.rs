//! Sync path
//!
//! A sync fences everything whose write callback has already fired. The
//! captured set is partitioned by the least-advanced big write among it:
//!
//! 1. some big write still `Big(Written)`: fsync the data device first;
//! 2. big writes synced but unrecorded: emit one journal metadata entry per
//!    big write, batch-checked for space before anything is appended;
//! 3. always: fsync the journal.
//!
//! On the final fsync every captured version moves to its `*Synced` state.
//! A sync with nothing captured degenerates to a bare journal fsync of step
//! three. The phases are driven by completions; a phase that cannot get its
//! resources re-parks the operation at the queue head and is retried by the
//! drain cycle.

use crate::index::{BigStage, DelStage, JournalStage, VersionState};
use crate::journal::{BIG_WRITE_ENTRY_SIZE, JournalEntry, JournalWait};
use crate::op::{OpHandle, OpPhase, Operation, WaitReason};
use crate::ring::{Completion, IoOp, Payload, Submission, Target};
use crate::store::{Blockstore, Dequeue};
use blockio_common::{ObjVer, Result};
use bytes::Bytes;
use tracing::trace;

impl Blockstore {
    pub(crate) fn dequeue_sync(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        match op.phase {
            OpPhase::None => {
                if self.unsynced_big.is_empty() && self.unsynced_small.is_empty() {
                    op.retval = 0;
                    return Ok(Dequeue::Done);
                }
                // Reserve the first submission before capturing, so a full
                // ring cannot strand an already-captured set
                if self.ring.borrow().sqe_left() == 0 {
                    op.wait = WaitReason::Sqe;
                    return Ok(Dequeue::Parked);
                }
                op.sync_big = std::mem::take(&mut self.unsynced_big);
                op.sync_small = std::mem::take(&mut self.unsynced_small);

                let need_data_fsync = op.sync_big.iter().any(|ov| {
                    matches!(
                        self.index.dirty.get(ov).map(|e| e.state),
                        Some(VersionState::Big(BigStage::Written))
                    )
                });
                if need_data_fsync {
                    self.push_fsync(self.data_file, handle, OpPhase::SyncDataFsync, op)
                        .expect("slot reserved");
                    trace!(
                        big = op.sync_big.len(),
                        small = op.sync_small.len(),
                        "sync: data fsync"
                    );
                    Ok(Dequeue::Started)
                } else {
                    self.sync_emit_meta(handle, op)
                }
            }
            // Retry paths for phases parked on back-pressure
            OpPhase::SyncMetaWrite => self.sync_emit_meta(handle, op),
            OpPhase::SyncJournalFsync => self.sync_journal_fsync(handle, op),
            _ => unreachable!("sync op in foreign phase"),
        }
    }

    /// Queue one fsync submission and set the phase; `None` if the ring is
    /// full
    fn push_fsync(
        &mut self,
        file: crate::ring::FileHandle,
        handle: OpHandle,
        phase: OpPhase,
        op: &mut Operation,
    ) -> Option<()> {
        self.ring.borrow_mut().push(Submission {
            op: IoOp::Fsync { file },
            payload: Payload {
                target: Target::Op(handle),
                buf_offset: 0,
            },
        })?;
        op.phase = phase;
        op.pending_ops = 1;
        Some(())
    }

    /// Step two: record the captured big writes in the journal
    fn sync_emit_meta(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        op.phase = OpPhase::SyncMetaWrite;
        let pending: Vec<ObjVer> = op
            .sync_big
            .iter()
            .copied()
            .filter(|ov| {
                matches!(
                    self.index.dirty.get(ov).map(|e| e.state),
                    Some(VersionState::Big(BigStage::Synced))
                )
            })
            .collect();
        if pending.is_empty() {
            return self.sync_journal_fsync(handle, op);
        }

        let batch: Vec<(usize, u32)> = pending.iter().map(|_| (BIG_WRITE_ENTRY_SIZE, 0)).collect();
        match self.journal.check_space(&batch) {
            Err(JournalWait::Buffer) => {
                op.wait = WaitReason::JournalBuffer;
                self.flusher.request();
                return Ok(Dequeue::Parked);
            }
            Err(JournalWait::Space(needed)) => {
                op.wait = WaitReason::Journal(needed);
                self.flusher.request();
                return Ok(Dequeue::Parked);
            }
            Ok(()) => {}
        }
        // Worst case every entry opens a sector, plus the one already open
        if self.ring.borrow().sqe_left() < pending.len() + 1 {
            op.wait = WaitReason::Sqe;
            return Ok(Dequeue::Parked);
        }

        let mut touched: Vec<usize> = Vec::new();
        for ov in &pending {
            let location = self.index.dirty.get(ov).map(|e| e.location).unwrap_or(0);
            let out = self.journal.append(
                &JournalEntry::BigWrite {
                    oid: ov.oid,
                    version: ov.version,
                    location,
                },
                0,
            );
            if !touched.contains(&out.sector) {
                touched.push(out.sector);
            }
            if let Some(entry) = self.index.dirty.get_mut(ov) {
                entry.journal_seg = self.journal.current_segment();
            }
        }

        for &sector in &touched {
            let s = &mut self.journal.sectors[sector];
            let data = Bytes::copy_from_slice(&s.buf);
            let offset = self.geometry.journal_offset + s.offset;
            s.usage_count += 1;
            op.used_sectors.push(sector);
            self.ring
                .borrow_mut()
                .push(Submission {
                    op: IoOp::WriteAt {
                        file: self.journal_file,
                        offset,
                        data,
                    },
                    payload: Payload {
                        target: Target::Op(handle),
                        buf_offset: 0,
                    },
                })
                .expect("slots reserved");
        }
        op.pending_ops = touched.len() as u32;
        trace!(entries = pending.len(), sectors = touched.len(), "sync: meta entries");
        Ok(Dequeue::Started)
    }

    /// Step three: make the journal durable
    fn sync_journal_fsync(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        op.phase = OpPhase::SyncJournalFsync;
        if self
            .push_fsync(self.journal_file, handle, OpPhase::SyncJournalFsync, op)
            .is_none()
        {
            op.wait = WaitReason::Sqe;
            return Ok(Dequeue::Parked);
        }
        Ok(Dequeue::Started)
    }

    pub(crate) fn on_sync_event(
        &mut self,
        handle: OpHandle,
        mut op: Operation,
        completion: Completion,
    ) -> Result<()> {
        if completion.result < 0 && op.retval >= 0 {
            op.retval = completion.result;
        }
        op.pending_ops -= 1;
        if op.pending_ops > 0 {
            self.ops.put(handle, op);
            return Ok(());
        }
        if op.retval < 0 {
            // Durability is unknown after a failed fsync; report and stop
            // without advancing any state
            self.release_sectors(&mut op);
            self.finish_op(handle, op);
            return Ok(());
        }

        match op.phase {
            OpPhase::SyncDataFsync => {
                for ov in &op.sync_big {
                    if let Some(entry) = self.index.dirty.get_mut(ov)
                        && entry.state == VersionState::Big(BigStage::Written)
                    {
                        entry.state = VersionState::Big(BigStage::Synced);
                    }
                }
                match self.sync_emit_meta(handle, &mut op)? {
                    Dequeue::Parked => {
                        let wait = op.wait;
                        op.wait = WaitReason::None;
                        self.park_front(handle, op, wait);
                    }
                    _ => self.ops.put(handle, op),
                }
            }
            OpPhase::SyncMetaWrite => {
                for ov in &op.sync_big {
                    if let Some(entry) = self.index.dirty.get_mut(ov)
                        && entry.state == VersionState::Big(BigStage::Synced)
                    {
                        entry.state = VersionState::Big(BigStage::MetaWritten);
                    }
                }
                match self.sync_journal_fsync(handle, &mut op)? {
                    Dequeue::Parked => {
                        let wait = op.wait;
                        op.wait = WaitReason::None;
                        self.park_front(handle, op, wait);
                    }
                    _ => self.ops.put(handle, op),
                }
            }
            OpPhase::SyncJournalFsync => {
                self.finalize_sync(handle, op);
            }
            _ => unreachable!("sync completion in foreign phase"),
        }
        Ok(())
    }

    fn finalize_sync(&mut self, handle: OpHandle, mut op: Operation) {
        for ov in &op.sync_big {
            if let Some(entry) = self.index.dirty.get_mut(ov)
                && matches!(
                    entry.state,
                    VersionState::Big(BigStage::MetaWritten) | VersionState::Big(BigStage::Synced)
                )
            {
                entry.state = VersionState::Big(BigStage::MetaSynced);
            }
        }
        for ov in &op.sync_small {
            if let Some(entry) = self.index.dirty.get_mut(ov) {
                match entry.state {
                    VersionState::Journal(JournalStage::Written) => {
                        entry.state = VersionState::Journal(JournalStage::Synced);
                    }
                    VersionState::Del(DelStage::Written) => {
                        entry.state = VersionState::Del(DelStage::Synced);
                    }
                    _ => {}
                }
            }
        }
        self.release_sectors(&mut op);
        op.retval = 0;
        trace!(
            big = op.sync_big.len(),
            small = op.sync_small.len(),
            "sync completed"
        );
        self.finish_op(handle, op);
    }
}
