//! Stabilize, rollback and delete
//!
//! Stabilize declares a synced version permanent: a marker entry goes into
//! the journal and is fsynced, then the version (and every synced version
//! below it) becomes stable and the object is handed to the flusher.
//! Rollback is the inverse for versions nothing has committed to: a marker
//! is journaled and fsynced, then the discarded versions are erased and
//! their resources freed. Delete rides the small-write path with a
//! payload-less tombstone entry.

use crate::index::{BigStage, DelStage, DirtyEntry, JournalStage, VersionState};
use crate::journal::{JournalEntry, JournalWait, MARKER_ENTRY_SIZE};
use crate::op::{OpHandle, OpKind, OpPhase, Operation, WaitReason};
use crate::ring::{Completion, IoOp, Payload, Submission, Target};
use crate::store::{Blockstore, Dequeue};
use blockio_common::{ObjVer, Result, error::errno};
use bytes::Bytes;
use tracing::{debug, trace};

impl Blockstore {
    /// Dequeue a stabilize or rollback: both journal one marker entry and
    /// fsync it before mutating the index.
    pub(crate) fn dequeue_marker(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        match op.phase {
            OpPhase::None => {
                let ready = match op.kind {
                    OpKind::Stable => self.validate_stable(op),
                    _ => self.validate_rollback(op),
                };
                match ready {
                    Validation::Done(retval) => {
                        op.retval = retval;
                        Ok(Dequeue::Done)
                    }
                    Validation::Proceed => self.submit_marker(handle, op),
                }
            }
            OpPhase::MarkerFsync => self.submit_marker_fsync(handle, op),
            _ => unreachable!("marker op in foreign phase"),
        }
    }

    fn validate_stable(&self, op: &Operation) -> Validation {
        let ov = op.objver();
        if let Some(entry) = self.index.dirty.get(&ov) {
            // A synced tombstone is already read-visible, but still needs the
            // marker to reach the flusher's collapse
            if matches!(entry.state, VersionState::Del(DelStage::Synced)) {
                Validation::Proceed
            } else if entry.state.is_stable() {
                // Stabilizing twice is a no-op
                Validation::Done(0)
            } else if entry.state.is_synced() {
                Validation::Proceed
            } else {
                Validation::Done(-errno::EBUSY)
            }
        } else if self
            .index
            .clean
            .get(&op.oid)
            .is_some_and(|c| c.version >= op.version)
        {
            // Already promoted past this version
            Validation::Done(0)
        } else {
            Validation::Done(-errno::ENOENT)
        }
    }

    fn validate_rollback(&self, op: &Operation) -> Validation {
        let range = ObjVer::new(op.oid, op.version)..=ObjVer::new(op.oid, u64::MAX);
        let mut any = false;
        for (_, entry) in self.index.dirty.range(range) {
            any = true;
            if entry.state.is_stable() {
                // Committed versions can never be rolled back
                return Validation::Done(-errno::EBUSY);
            }
            if entry.state.is_in_flight() {
                return Validation::Done(-errno::EBUSY);
            }
        }
        if any {
            Validation::Proceed
        } else {
            Validation::Done(-errno::ENOENT)
        }
    }

    fn submit_marker(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        match self.journal.check_space(&[(MARKER_ENTRY_SIZE, 0)]) {
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
        if self.ring.borrow().sqe_left() < 1 {
            op.wait = WaitReason::Sqe;
            return Ok(Dequeue::Parked);
        }

        let entry = match op.kind {
            OpKind::Stable => JournalEntry::Stable {
                oid: op.oid,
                version: op.version,
            },
            _ => JournalEntry::Rollback {
                oid: op.oid,
                version: op.version,
            },
        };
        let out = self.journal.append(&entry, 0);
        let sector = &mut self.journal.sectors[out.sector];
        let data = Bytes::copy_from_slice(&sector.buf);
        let offset = self.geometry.journal_offset + sector.offset;
        sector.usage_count += 1;
        op.used_sectors.push(out.sector);
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
            .expect("slot reserved");
        op.phase = OpPhase::MarkerWrite;
        op.pending_ops = 1;
        trace!(ov = %op.objver(), kind = ?op.kind, "marker submitted");
        Ok(Dequeue::Started)
    }

    fn submit_marker_fsync(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        // Phase first: a park here must retry the fsync, not the marker
        op.phase = OpPhase::MarkerFsync;
        let pushed = self.ring.borrow_mut().push(Submission {
            op: IoOp::Fsync {
                file: self.journal_file,
            },
            payload: Payload {
                target: Target::Op(handle),
                buf_offset: 0,
            },
        });
        if pushed.is_none() {
            op.wait = WaitReason::Sqe;
            return Ok(Dequeue::Parked);
        }
        op.pending_ops = 1;
        Ok(Dequeue::Started)
    }

    pub(crate) fn on_marker_event(
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
            self.release_sectors(&mut op);
            self.finish_op(handle, op);
            return Ok(());
        }

        match op.phase {
            OpPhase::MarkerWrite => match self.submit_marker_fsync(handle, &mut op)? {
                Dequeue::Parked => {
                    let wait = op.wait;
                    op.wait = WaitReason::None;
                    self.park_front(handle, op, wait);
                }
                _ => self.ops.put(handle, op),
            },
            OpPhase::MarkerFsync => {
                self.release_sectors(&mut op);
                let ov = op.objver();
                if op.kind == OpKind::Stable {
                    self.mark_stable(ov);
                } else {
                    self.mark_rolled_back(ov);
                }
                op.retval = 0;
                self.finish_op(handle, op);
            }
            _ => unreachable!("marker completion in foreign phase"),
        }
        Ok(())
    }

    /// Make `ov` (and every synced version below it) stable and schedule the
    /// object for flushing.
    pub(crate) fn mark_stable(&mut self, ov: ObjVer) {
        let range = ObjVer::new(ov.oid, 0)..=ov;
        let mut flushable = false;
        for (_, entry) in self.index.dirty.range_mut(range) {
            match entry.state {
                VersionState::Journal(JournalStage::Synced) => {
                    entry.state = VersionState::Journal(JournalStage::Stable);
                    flushable = true;
                }
                VersionState::Big(BigStage::MetaSynced) => {
                    entry.state = VersionState::Big(BigStage::Stable);
                    flushable = true;
                }
                VersionState::Del(DelStage::Synced) => {
                    entry.state = VersionState::Del(DelStage::Stable);
                    flushable = true;
                }
                _ => {}
            }
        }
        if flushable {
            self.flusher.enqueue(ov);
            trace!(%ov, "stabilized");
        }
    }

    /// Erase the discarded versions of a rollback and free their resources
    pub(crate) fn mark_rolled_back(&mut self, ov: ObjVer) {
        let range = ov..=ObjVer::new(ov.oid, u64::MAX);
        let discarded: Vec<(ObjVer, DirtyEntry)> = self
            .index
            .dirty
            .range(range)
            .map(|(k, e)| (*k, *e))
            .collect();
        for (key, entry) in discarded {
            self.index.dirty.remove(&key);
            if entry.state.is_big() {
                self.alloc
                    .set(entry.location >> self.geometry.block_order, false);
            }
            if let Some(seg) = entry.journal_seg {
                self.journal.dec_live(seg);
            }
            debug!(ov = %key, "rolled back");
        }
        // Let the flusher trim and persist the journal window
        self.flusher.request();
    }

    /// Dequeue a delete: a tombstone record through the small-write path
    pub(crate) fn dequeue_delete(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        let Some(max) = self.index.max_version(op.oid) else {
            op.retval = -errno::ENOENT;
            return Ok(Dequeue::Done);
        };
        if op.version <= max {
            op.retval = -errno::EINVAL;
            return Ok(Dequeue::Done);
        }

        match self.journal.check_space(&[(MARKER_ENTRY_SIZE, 0)]) {
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
        if self.ring.borrow().sqe_left() < 1 {
            op.wait = WaitReason::Sqe;
            return Ok(Dequeue::Parked);
        }

        let out = self.journal.append(
            &JournalEntry::Delete {
                oid: op.oid,
                version: op.version,
            },
            0,
        );
        let sector = &mut self.journal.sectors[out.sector];
        let data = Bytes::copy_from_slice(&sector.buf);
        let offset = self.geometry.journal_offset + sector.offset;
        sector.usage_count += 1;
        op.used_sectors.push(out.sector);
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
            .expect("slot reserved");

        // A tombstone covers the whole object with zeroes
        self.index.dirty.insert(
            op.objver(),
            DirtyEntry {
                state: VersionState::InFlight,
                flags: 0,
                location: 0,
                offset: 0,
                len: self.geometry.block_size,
                journal_seg: self.journal.current_segment(),
            },
        );
        op.pending_ops = 1;
        trace!(ov = %op.objver(), "delete submitted");
        Ok(Dequeue::Started)
    }

    pub(crate) fn on_delete_event(
        &mut self,
        handle: OpHandle,
        mut op: Operation,
        completion: Completion,
    ) -> Result<()> {
        if completion.result < 0 && op.retval >= 0 {
            op.retval = completion.result;
        }
        op.pending_ops -= 1;
        debug_assert_eq!(op.pending_ops, 0);

        self.release_sectors(&mut op);
        let ov = op.objver();
        if op.retval < 0 {
            if let Some(entry) = self.index.dirty.get_mut(&ov) {
                entry.flags |= crate::store::FLAG_FAILED;
            }
            self.finish_op(handle, op);
            return Ok(());
        }
        if let Some(entry) = self.index.dirty.get_mut(&ov) {
            entry.state = VersionState::Del(DelStage::Written);
        }
        self.unsynced_small.push(ov);
        op.retval = 0;
        self.finish_op(handle, op);
        Ok(())
    }
}

enum Validation {
    /// Terminal immediately, with this retval
    Done(i64),
    /// Journal the marker
    Proceed,
}
