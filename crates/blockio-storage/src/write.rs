//! Write path
//!
//! Two sub-paths chosen by length. A full-block write redirects to a freshly
//! allocated data block and never touches existing data. A partial write is
//! journaled: its record and payload go into the circular journal, and the
//! flusher migrates the data into the data region once the version is
//! stable.
//!
//! The dirty entry is created at dequeue in `InFlight` state; reads of the
//! version park until the write's completions land.

use crate::index::{BigStage, DirtyEntry, JournalStage, VersionState};
use crate::journal::{JournalEntry, JournalWait, SMALL_WRITE_ENTRY_SIZE};
use crate::op::{OpHandle, Operation, WaitReason};
use crate::ring::{Completion, IoOp, Payload, Submission, Target};
use crate::store::{Blockstore, Dequeue, FLAG_FAILED};
use blockio_common::{Result, error::errno};
use bytes::Bytes;
use tracing::trace;

impl Blockstore {
    pub(crate) fn dequeue_write(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        // Versions are caller-assigned and must be monotonic per object
        if self
            .index
            .max_version(op.oid)
            .is_some_and(|max| op.version <= max)
        {
            op.retval = -errno::EINVAL;
            return Ok(Dequeue::Done);
        }

        if op.len == self.geometry.block_size {
            self.dequeue_big_write(handle, op)
        } else {
            self.dequeue_small_write(handle, op)
        }
    }

    /// Big (redirect) write: one submission into a fresh data block
    fn dequeue_big_write(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        let Some(block) = self.alloc.find_free() else {
            op.retval = -errno::ENOSPC;
            return Ok(Dequeue::Done);
        };
        let location = block << self.geometry.block_order;

        let pushed = self.ring.borrow_mut().push(Submission {
            op: IoOp::WriteAt {
                file: self.data_file,
                offset: self.data_pos(location),
                data: Bytes::from(op.buf.clone()),
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

        self.alloc.set(block, true);
        self.index.dirty.insert(
            op.objver(),
            DirtyEntry {
                state: VersionState::InFlight,
                flags: 0,
                location,
                offset: 0,
                len: op.len,
                journal_seg: None,
            },
        );
        op.pending_ops = 1;
        trace!(ov = %op.objver(), block, "big write submitted");
        Ok(Dequeue::Started)
    }

    /// Small (journaled) write: a journal record plus the payload, two
    /// submissions
    fn dequeue_small_write(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        match self
            .journal
            .check_space(&[(SMALL_WRITE_ENTRY_SIZE, op.len)])
        {
            Err(JournalWait::Buffer) => {
                op.wait = WaitReason::JournalBuffer;
                self.flusher.request();
                return Ok(Dequeue::Parked);
            }
            Err(JournalWait::Space(needed)) => {
                if needed >= self.journal.capacity() {
                    // Cannot fit even an empty journal; not a waitable state
                    op.retval = -errno::ENOSPC;
                    return Ok(Dequeue::Done);
                }
                op.wait = WaitReason::Journal(needed);
                self.flusher.request();
                return Ok(Dequeue::Parked);
            }
            Ok(()) => {}
        }
        if self.ring.borrow().sqe_left() < 2 {
            op.wait = WaitReason::Sqe;
            return Ok(Dequeue::Parked);
        }

        let entry = JournalEntry::SmallWrite {
            oid: op.oid,
            version: op.version,
            offset: op.offset,
            len: op.len,
            data_offset: 0, // assigned by the journal
            crc32_data: crc32c::crc32c(&op.buf),
        };
        let out = self.journal.append(&entry, op.len);
        let data_offset = out.data_offset.expect("small write reserves payload space");

        let sector = &mut self.journal.sectors[out.sector];
        let sector_write = Submission {
            op: IoOp::WriteAt {
                file: self.journal_file,
                offset: self.geometry.journal_offset + sector.offset,
                data: Bytes::copy_from_slice(&sector.buf),
            },
            payload: Payload {
                target: Target::Op(handle),
                buf_offset: 0,
            },
        };
        sector.usage_count += 1;
        op.used_sectors.push(out.sector);

        let payload_write = Submission {
            op: IoOp::WriteAt {
                file: self.journal_file,
                offset: self.journal_pos(data_offset),
                data: Bytes::from(op.buf.clone()),
            },
            payload: Payload {
                target: Target::Op(handle),
                buf_offset: 0,
            },
        };
        {
            let mut ring = self.ring.borrow_mut();
            ring.push(sector_write).expect("slot reserved");
            ring.push(payload_write).expect("slot reserved");
        }

        self.index.dirty.insert(
            op.objver(),
            DirtyEntry {
                state: VersionState::InFlight,
                flags: 0,
                location: data_offset,
                offset: op.offset,
                len: op.len,
                journal_seg: self.journal.current_segment(),
            },
        );
        op.pending_ops = 2;
        trace!(ov = %op.objver(), data_offset, "small write submitted");
        Ok(Dequeue::Started)
    }

    pub(crate) fn on_write_event(
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

        self.release_sectors(&mut op);
        let ov = op.objver();
        let big = op.len == self.geometry.block_size;

        if op.retval < 0 {
            // Leave the version in a terminal failed state; reads of it
            // report the error
            if let Some(entry) = self.index.dirty.get_mut(&ov) {
                entry.flags |= FLAG_FAILED;
            }
            self.finish_op(handle, op);
            return Ok(());
        }

        if let Some(entry) = self.index.dirty.get_mut(&ov) {
            entry.state = if big {
                VersionState::Big(BigStage::Written)
            } else {
                VersionState::Journal(JournalStage::Written)
            };
            // Becomes fence-able from this point on
            if big {
                self.unsynced_big.push(ov);
            } else {
                self.unsynced_small.push(ov);
            }
        }

        self.stats.bytes_written += u64::from(op.len);
        op.retval = i64::from(op.len);
        trace!(%ov, big, "write completed");
        self.finish_op(handle, op);
        Ok(())
    }
}
