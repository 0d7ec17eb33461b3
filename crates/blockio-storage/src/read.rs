//! Read path
//!
//! An object is reconstructed by scattering reads over its versions: the
//! dirty chain is walked newest-first, each visible version contributes the
//! parts of its range not already covered, the clean entry fills what is
//! left, and any bytes no version covers are zeroed synchronously.
//!
//! Covered sub-ranges are tracked in the operation's `read_vec`. Deletion
//! tombstones cover their range with zeroes. If a covering version is still
//! in flight the whole read parks until that write lands; if the submission
//! queue runs out mid-scatter, everything queued for this operation is
//! rolled back and the read parks; partial scatters are never submitted.

use crate::index::{DirtyEntry, ObjectIndex, VersionState};
use crate::op::{OpHandle, OpKind, Operation, WaitReason};
use crate::ring::{Completion, IoOp, Payload, Submission, Target};
use crate::store::{Blockstore, Dequeue, FLAG_FAILED};
use blockio_common::{ObjVer, Result, error::errno};
use tracing::trace;

impl Blockstore {
    pub(crate) fn dequeue_read(&mut self, handle: OpHandle, op: &mut Operation) -> Result<Dequeue> {
        let max_version = if op.version == 0 { u64::MAX } else { op.version };
        op.read_vec.clear();

        let clean = self.index.clean.get(&op.oid).copied();
        let chain: Vec<(ObjVer, DirtyEntry)> = self
            .index
            .dirty
            .range(ObjectIndex::oid_range(op.oid))
            .rev()
            .map(|(ov, e)| (*ov, *e))
            .collect();

        if clean.is_none() && chain.is_empty() {
            // Object unknown: a read returns zeroes
            op.buf.fill(0);
            op.retval = i64::from(op.len);
            op.version = 0;
            return Ok(Dequeue::Done);
        }

        let sq_snapshot = self.ring.borrow().sq_tail();
        let mut submitted = 0u32;
        let mut observed_version = 0u64;

        for (ov, entry) in chain {
            if ov.version > max_version {
                continue;
            }
            if op.kind != OpKind::ReadDirty && !entry.state.is_stable() {
                continue;
            }
            if observed_version == 0 {
                observed_version = ov.version;
            }
            if entry.flags & FLAG_FAILED != 0
                && ranges_intersect(entry.offset, entry.len, op.offset, op.len)
            {
                // The version's write failed on the device; its data is
                // undefined
                self.ring.borrow_mut().rollback_sq(sq_snapshot);
                op.read_vec.clear();
                op.retval = -errno::EIO;
                return Ok(Dequeue::Done);
            }
            if let Err(wait) = self.fulfill_read(
                handle,
                op,
                entry.offset,
                entry.offset + entry.len,
                entry.state,
                ov,
                entry.location,
                &mut submitted,
            ) {
                self.ring.borrow_mut().rollback_sq(sq_snapshot);
                op.read_vec.clear();
                op.wait = wait;
                return Ok(Dequeue::Parked);
            }
        }

        if let Some(clean) = clean
            && clean.version <= max_version
        {
            if observed_version == 0 {
                observed_version = clean.version;
            }
            if let Err(wait) = self.fulfill_read(
                handle,
                op,
                0,
                self.geometry.block_size,
                VersionState::Current,
                ObjVer::new(op.oid, clean.version),
                clean.location,
                &mut submitted,
            ) {
                self.ring.borrow_mut().rollback_sq(sq_snapshot);
                op.read_vec.clear();
                op.wait = wait;
                return Ok(Dequeue::Parked);
            }
        }

        // Zero-fill every hole left in the window
        let mut cursor = op.offset;
        let end = op.offset + op.len;
        let covered: Vec<(u32, u32)> = op.read_vec.iter().map(|(s, l)| (*s, *l)).collect();
        for (start, len) in covered {
            if start >= end {
                break;
            }
            if start > cursor {
                let (a, b) = (
                    (cursor - op.offset) as usize,
                    (start.min(end) - op.offset) as usize,
                );
                op.buf[a..b].fill(0);
            }
            cursor = cursor.max(start + len);
        }
        if cursor < end {
            let a = (cursor - op.offset) as usize;
            op.buf[a..].fill(0);
        }

        op.version = observed_version;
        if submitted == 0 {
            op.retval = i64::from(op.len);
            return Ok(Dequeue::Done);
        }
        op.pending_ops = submitted;
        trace!(oid = %op.oid, version = observed_version, submitted, "read scattered");
        Ok(Dequeue::Started)
    }

    /// Contribute one version's `[item_start, item_end)` range to the read,
    /// splitting around sub-ranges newer versions already covered.
    #[allow(clippy::too_many_arguments)]
    fn fulfill_read(
        &mut self,
        handle: OpHandle,
        op: &mut Operation,
        item_start: u32,
        item_end: u32,
        state: VersionState,
        ov: ObjVer,
        location: u64,
        submitted: &mut u32,
    ) -> std::result::Result<(), WaitReason> {
        let mut cur = item_start.max(op.offset);
        let end = item_end.min(op.offset + op.len);
        if cur >= end {
            return Ok(());
        }

        let covered: Vec<(u32, u32)> = op
            .read_vec
            .range(..end)
            .map(|(s, l)| (*s, *l))
            .collect();
        for (start, len) in covered {
            if start + len <= cur {
                continue;
            }
            if start > cur {
                self.fulfill_read_push(
                    handle, op, item_start, state, ov, location, cur,
                    start.min(end), submitted,
                )?;
            }
            cur = cur.max(start + len);
            if cur >= end {
                return Ok(());
            }
        }
        self.fulfill_read_push(handle, op, item_start, state, ov, location, cur, end, submitted)
    }

    /// Record `[cur_start, cur_end)` as covered and issue its submission
    #[allow(clippy::too_many_arguments)]
    fn fulfill_read_push(
        &mut self,
        handle: OpHandle,
        op: &mut Operation,
        item_start: u32,
        state: VersionState,
        ov: ObjVer,
        location: u64,
        cur_start: u32,
        cur_end: u32,
        submitted: &mut u32,
    ) -> std::result::Result<(), WaitReason> {
        if cur_end <= cur_start {
            return Ok(());
        }
        if state.is_in_flight() {
            // Pause until it is written somewhere
            return Err(WaitReason::InFlight(ov));
        }
        if state.is_delete() {
            // Tombstones cover their range with zeroes
            let (a, b) = (
                (cur_start - op.offset) as usize,
                (cur_end - op.offset) as usize,
            );
            op.buf[a..b].fill(0);
            op.read_vec.insert(cur_start, cur_end - cur_start);
            return Ok(());
        }

        let (file, base) = if state.is_journal() {
            (self.journal_file, self.geometry.journal_offset)
        } else {
            (self.data_file, self.geometry.data_offset)
        };
        let pushed = self.ring.borrow_mut().push(Submission {
            op: IoOp::ReadAt {
                file,
                offset: base + location + u64::from(cur_start - item_start),
                len: cur_end - cur_start,
            },
            payload: Payload {
                target: Target::Op(handle),
                buf_offset: cur_start - op.offset,
            },
        });
        if pushed.is_none() {
            return Err(WaitReason::Sqe);
        }
        op.read_vec.insert(cur_start, cur_end - cur_start);
        *submitted += 1;
        Ok(())
    }

    pub(crate) fn on_read_event(
        &mut self,
        handle: OpHandle,
        mut op: Operation,
        completion: Completion,
    ) -> Result<()> {
        if completion.result < 0 {
            if op.retval >= 0 {
                op.retval = completion.result;
            }
        } else if let Some(data) = completion.data {
            let at = completion.payload.buf_offset as usize;
            op.buf[at..at + data.len()].copy_from_slice(&data);
        }

        op.pending_ops -= 1;
        if op.pending_ops > 0 {
            self.ops.put(handle, op);
            return Ok(());
        }
        if op.retval >= 0 {
            op.retval = i64::from(op.len);
            self.stats.bytes_read += u64::from(op.len);
        }
        self.finish_op(handle, op);
        Ok(())
    }
}

fn ranges_intersect(a_off: u32, a_len: u32, b_off: u32, b_len: u32) -> bool {
    a_off < b_off + b_len && b_off < a_off + a_len
}
