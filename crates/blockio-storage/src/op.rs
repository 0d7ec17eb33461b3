//! Operation records and the handle table
//!
//! Callers allocate an [`Operation`], fill in the public fields and hand it
//! to the engine. The engine owns accepted operations in an [`OpTable`] and
//! addresses them from I/O completions by [`OpHandle`], a slot index plus a
//! generation, so a recycled slot can never be confused with the operation
//! that used to live there.

use blockio_common::{ObjVer, ObjectId};
use std::collections::BTreeMap;
use std::fmt;

/// Operation kinds accepted by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Read stable data
    Read,
    /// Read including unstable (synced or merely written) versions
    ReadDirty,
    Write,
    Sync,
    Stable,
    Rollback,
    Delete,
}

/// Why a dequeued operation is parked.
///
/// A waiting operation stays at the head of the submit queue; the engine
/// re-tests the named resource each drain cycle and retries the dequeue once
/// it is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WaitReason {
    #[default]
    None,
    /// No free submission slots; retried after completions are reaped
    Sqe,
    /// A covering version is still in flight; retried when it lands
    InFlight(ObjVer),
    /// The journal lacks this many free bytes; retried after a trim
    Journal(u64),
    /// The next in-memory journal sector buffer is still in use
    JournalBuffer,
}

/// Continuation tag for multi-phase operations.
///
/// The engine dispatches completions on this tag instead of per-op closures;
/// single-submission-set operations (read, write, delete) stay at `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum OpPhase {
    #[default]
    None,
    /// Sync: waiting for the data-device fsync
    SyncDataFsync,
    /// Sync: waiting for big-write metadata entries to land in the journal
    SyncMetaWrite,
    /// Sync: waiting for the journal fsync
    SyncJournalFsync,
    /// Stabilize/rollback: waiting for the marker sector write
    MarkerWrite,
    /// Stabilize/rollback: waiting for the journal fsync
    MarkerFsync,
}

/// Completion callback; receives the finished operation with `retval` set
pub type OpCallback = Box<dyn FnMut(&mut Operation)>;

/// One blockstore operation
pub struct Operation {
    pub kind: OpKind,
    pub oid: ObjectId,
    /// Requested version. Writes and deletes: the version to create.
    /// Reads: upper bound, 0 meaning "newest visible". Updated on completion
    /// to the version actually observed or written.
    pub version: u64,
    /// Byte offset within the object
    pub offset: u32,
    /// Byte length of the request
    pub len: u32,
    /// Payload (writes) or destination (reads)
    pub buf: Vec<u8>,
    /// Bytes transferred on success, negative errno on failure
    pub retval: i64,

    pub(crate) callback: Option<OpCallback>,
    pub(crate) pending_ops: u32,
    pub(crate) wait: WaitReason,
    pub(crate) phase: OpPhase,
    /// Covered sub-ranges of a read, keyed by start offset
    pub(crate) read_vec: BTreeMap<u32, u32>,
    /// In-memory journal sector buffers this operation pinned
    pub(crate) used_sectors: Vec<usize>,
    /// Unsynced big writes captured by a sync
    pub(crate) sync_big: Vec<ObjVer>,
    /// Unsynced small writes and deletes captured by a sync
    pub(crate) sync_small: Vec<ObjVer>,
}

impl Operation {
    fn new(kind: OpKind, oid: ObjectId, version: u64, callback: OpCallback) -> Self {
        Self {
            kind,
            oid,
            version,
            offset: 0,
            len: 0,
            buf: Vec::new(),
            retval: 0,
            callback: Some(callback),
            pending_ops: 0,
            wait: WaitReason::None,
            phase: OpPhase::None,
            read_vec: BTreeMap::new(),
            used_sectors: Vec::new(),
            sync_big: Vec::new(),
            sync_small: Vec::new(),
        }
    }

    /// Read stable data, newest version not above `version` (0 = newest)
    pub fn read(
        oid: ObjectId,
        version: u64,
        offset: u32,
        len: u32,
        callback: OpCallback,
    ) -> Self {
        let mut op = Self::new(OpKind::Read, oid, version, callback);
        op.offset = offset;
        op.len = len;
        op.buf = vec![0; len as usize];
        op
    }

    /// Read including unstable versions
    pub fn read_dirty(
        oid: ObjectId,
        version: u64,
        offset: u32,
        len: u32,
        callback: OpCallback,
    ) -> Self {
        let mut op = Self::read(oid, version, offset, len, callback);
        op.kind = OpKind::ReadDirty;
        op
    }

    /// Write `data` as version `version` of the object
    pub fn write(
        oid: ObjectId,
        version: u64,
        offset: u32,
        data: Vec<u8>,
        callback: OpCallback,
    ) -> Self {
        let mut op = Self::new(OpKind::Write, oid, version, callback);
        op.offset = offset;
        op.len = data.len() as u32;
        op.buf = data;
        op
    }

    /// Fence everything written (and completed) so far
    pub fn sync(callback: OpCallback) -> Self {
        Self::new(OpKind::Sync, ObjectId::new(0, 0), 0, callback)
    }

    /// Declare a synced version permanent
    pub fn stable(oid: ObjectId, version: u64, callback: OpCallback) -> Self {
        Self::new(OpKind::Stable, oid, version, callback)
    }

    /// Discard non-stable versions at and above `version`
    pub fn rollback(oid: ObjectId, version: u64, callback: OpCallback) -> Self {
        Self::new(OpKind::Rollback, oid, version, callback)
    }

    /// Write a deletion tombstone as version `version`
    pub fn delete(oid: ObjectId, version: u64, callback: OpCallback) -> Self {
        Self::new(OpKind::Delete, oid, version, callback)
    }

    pub(crate) fn objver(&self) -> ObjVer {
        ObjVer::new(self.oid, self.version)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("oid", &self.oid)
            .field("version", &self.version)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("retval", &self.retval)
            .field("pending_ops", &self.pending_ops)
            .field("wait", &self.wait)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Stable reference to an operation owned by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpHandle {
    slot: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    live: bool,
    op: Option<Operation>,
}

/// Slot-and-generation table of engine-owned operations.
///
/// `take`/`put` temporarily move an operation out of its slot so the engine
/// can mutate it and itself without aliasing; the slot stays reserved until
/// `put` or `release`.
#[derive(Default)]
pub struct OpTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl OpTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, op: Operation) -> OpHandle {
        self.live += 1;
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.live = true;
            s.op = Some(op);
            return OpHandle {
                slot,
                generation: s.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            live: true,
            op: Some(op),
        });
        OpHandle {
            slot: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn slot(&self, handle: OpHandle) -> Option<&Slot> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.live && s.generation == handle.generation)
    }

    pub fn get(&self, handle: OpHandle) -> Option<&Operation> {
        self.slot(handle).and_then(|s| s.op.as_ref())
    }

    pub fn get_mut(&mut self, handle: OpHandle) -> Option<&mut Operation> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.live && s.generation == handle.generation)
            .and_then(|s| s.op.as_mut())
    }

    /// Move the operation out, keeping its slot reserved
    pub fn take(&mut self, handle: OpHandle) -> Option<Operation> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.live && s.generation == handle.generation)
            .and_then(|s| s.op.take())
    }

    /// Return a taken operation to its slot
    pub fn put(&mut self, handle: OpHandle, op: Operation) {
        let s = &mut self.slots[handle.slot as usize];
        debug_assert!(s.live && s.generation == handle.generation && s.op.is_none());
        s.op = Some(op);
    }

    /// Free the slot of a taken (terminal) operation
    pub fn release(&mut self, handle: OpHandle) {
        let s = &mut self.slots[handle.slot as usize];
        debug_assert!(s.live && s.generation == handle.generation && s.op.is_none());
        s.live = false;
        s.generation = s.generation.wrapping_add(1);
        self.free.push(handle.slot);
        self.live -= 1;
    }

    /// Number of live operations
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> OpCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_insert_get_remove() {
        let mut table = OpTable::new();
        let h = table.insert(Operation::sync(noop()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(h).unwrap().kind, OpKind::Sync);

        let op = table.take(h).unwrap();
        assert!(table.get(h).is_none());
        drop(op);
        table.release(h);
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut table = OpTable::new();
        let h = table.insert(Operation::sync(noop()));
        table.take(h).unwrap();
        table.release(h);

        // Slot is recycled with a new generation
        let h2 = table.insert(Operation::sync(noop()));
        assert!(table.get(h).is_none());
        assert!(table.get(h2).is_some());
        assert_ne!(h, h2);
    }

    #[test]
    fn test_take_put_roundtrip() {
        let mut table = OpTable::new();
        let oid = ObjectId::new(1, 0);
        let h = table.insert(Operation::write(oid, 1, 0, vec![0; 512], noop()));

        let mut op = table.take(h).unwrap();
        op.retval = 512;
        table.put(h, op);
        assert_eq!(table.get(h).unwrap().retval, 512);
    }
}
