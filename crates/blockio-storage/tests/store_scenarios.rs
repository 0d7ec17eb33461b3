//! End-to-end engine scenarios on file-backed disk images
//!
//! Each store lives in one temp file carrying all three regions:
//! journal at offset 0, metadata after it, data last. Tests drive the
//! engine with `run` (to quiescence) or the stepping methods when the
//! point is to observe back-pressure.

use blockio_common::{ObjectId, StoreConfig};
use blockio_storage::{Blockstore, OpCallback, Operation, RingLoop};
use std::cell::RefCell;
use std::rc::Rc;
use tempfile::NamedTempFile;

#[derive(Default)]
struct OpResult {
    retval: Option<i64>,
    version: u64,
    data: Vec<u8>,
}

type Done = Rc<RefCell<OpResult>>;

fn capture() -> (Done, OpCallback) {
    let done: Done = Done::default();
    let slot = done.clone();
    let callback = Box::new(move |op: &mut Operation| {
        let mut result = slot.borrow_mut();
        result.retval = Some(op.retval);
        result.version = op.version;
        result.data = std::mem::take(&mut op.buf);
    });
    (done, callback)
}

fn retval(done: &Done) -> i64 {
    done.borrow().retval.expect("operation completed")
}

struct Fixture {
    cfg: StoreConfig,
    file: NamedTempFile,
}

impl Fixture {
    fn new(block_order: u32, blocks: u64, journal_size: u64) -> Self {
        let file = NamedTempFile::new().unwrap();
        let block_size = 1u64 << block_order;
        let meta_len = 512 + (blocks * 32).div_ceil(512) * 512;
        let data_offset = journal_size + meta_len;
        file.as_file()
            .set_len(data_offset + blocks * block_size)
            .unwrap();

        let cfg = StoreConfig {
            data_device: file.path().to_path_buf(),
            meta_device: None,
            journal_device: None,
            data_offset,
            data_size: blocks * block_size,
            meta_offset: journal_size,
            meta_size: 0,
            journal_offset: 0,
            journal_size,
            block_order,
            journal_sector_buffer_count: 4,
            sq_entries: 64,
            disable_fsync: false,
            direct_io: false,
        };
        Self { cfg, file }
    }

    fn open(&self) -> Blockstore {
        let ring = Rc::new(RefCell::new(RingLoop::new(self.cfg.sq_entries)));
        Blockstore::open(&self.cfg, ring).unwrap()
    }
}

fn oid(stripe: u64) -> ObjectId {
    ObjectId::new(1, stripe << 4)
}

fn write(bs: &mut Blockstore, oid: ObjectId, version: u64, offset: u32, data: Vec<u8>) -> Done {
    let (done, cb) = capture();
    bs.enqueue(Operation::write(oid, version, offset, data, cb)).unwrap();
    done
}

fn sync(bs: &mut Blockstore) -> Done {
    let (done, cb) = capture();
    bs.enqueue(Operation::sync(cb)).unwrap();
    done
}

fn stable(bs: &mut Blockstore, oid: ObjectId, version: u64) -> Done {
    let (done, cb) = capture();
    bs.enqueue(Operation::stable(oid, version, cb)).unwrap();
    done
}

fn read(bs: &mut Blockstore, oid: ObjectId, version: u64, offset: u32, len: u32) -> Done {
    let (done, cb) = capture();
    bs.enqueue(Operation::read(oid, version, offset, len, cb)).unwrap();
    done
}

fn read_dirty(bs: &mut Blockstore, oid: ObjectId, offset: u32, len: u32) -> Done {
    let (done, cb) = capture();
    bs.enqueue(Operation::read_dirty(oid, 0, offset, len, cb)).unwrap();
    done
}

/// Write + sync + stabilize, driving each step to completion
fn put_stable(bs: &mut Blockstore, oid: ObjectId, version: u64, offset: u32, data: Vec<u8>) {
    let len = data.len() as i64;
    let w = write(bs, oid, version, offset, data);
    bs.run().unwrap();
    assert_eq!(retval(&w), len);
    let s = sync(bs);
    bs.run().unwrap();
    assert_eq!(retval(&s), 0);
    let st = stable(bs, oid, version);
    bs.run().unwrap();
    assert_eq!(retval(&st), 0);
}

#[test]
fn test_aligned_big_write_roundtrip() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();
    let block = bs.block_size();
    let pattern = vec![0xa5u8; block as usize];

    put_stable(&mut bs, oid(1), 1, 0, pattern.clone());

    let r = read(&mut bs, oid(1), 0, 0, block);
    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    assert_eq!(r.borrow().version, 1);
    assert_eq!(r.borrow().data, pattern);
}

#[test]
fn test_small_write_hole_fill() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();
    let block = bs.block_size();
    let payload = vec![0xb6u8; 4096];

    put_stable(&mut bs, oid(1), 1, 4096, payload.clone());

    let r = read(&mut bs, oid(1), 0, 0, block);
    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    let data = &r.borrow().data;
    assert!(data[..4096].iter().all(|&b| b == 0));
    assert_eq!(&data[4096..8192], payload.as_slice());
    assert!(data[8192..].iter().all(|&b| b == 0));
}

#[test]
fn test_overlapping_versions() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();
    let block = bs.block_size();
    let base = vec![0xaau8; block as usize];
    let overlay = vec![0xccu8; 4096];

    put_stable(&mut bs, oid(1), 1, 0, base.clone());
    put_stable(&mut bs, oid(1), 2, 0, overlay.clone());

    let r = read(&mut bs, oid(1), 0, 0, block);
    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    assert_eq!(r.borrow().version, 2);
    let data = &r.borrow().data;
    assert_eq!(&data[..4096], overlay.as_slice());
    assert!(data[4096..].iter().all(|&b| b == 0xaa));
}

#[test]
fn test_read_parks_on_in_flight_write() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();
    let block = bs.block_size();
    let pattern = vec![0x42u8; block as usize];

    // Submit the write but do not dispatch its completion
    let w = write(&mut bs, oid(1), 1, 0, pattern.clone());
    bs.drain_queue().unwrap();
    bs.submit_io().unwrap();

    // The read must park on the in-flight version
    let r = read_dirty(&mut bs, oid(1), 0, block);
    bs.drain_queue().unwrap();
    bs.submit_io().unwrap();
    assert!(w.borrow().retval.is_none());
    assert!(r.borrow().retval.is_none());

    // One completion lands the write; the read then unparks and finishes
    assert!(bs.complete_one().unwrap());
    assert_eq!(retval(&w), i64::from(block));
    assert!(r.borrow().retval.is_none());

    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    assert_eq!(r.borrow().data, pattern);
}

#[test]
fn test_journal_full_parks_until_flush() {
    // 24 KiB journal: two 8 KiB journaled writes fit, the third must wait
    // for the flusher to migrate the stable ones and advance the window
    let fx = Fixture::new(17, 8, 24 * 1024);
    let mut bs = fx.open();
    let block = bs.block_size();

    let pattern = |byte: u8| vec![byte; 8192];
    let w1 = write(&mut bs, oid(1), 1, 0, pattern(0x11));
    bs.run().unwrap();
    assert_eq!(retval(&w1), 8192);
    let w2 = write(&mut bs, oid(1), 2, 8192, pattern(0x22));
    bs.run().unwrap();
    assert_eq!(retval(&w2), 8192);
    let s = sync(&mut bs);
    bs.run().unwrap();
    assert_eq!(retval(&s), 0);

    // Queue the stabilize and the third write together: the write parks on
    // journal space while the stabilize is still journaling its marker
    let st = stable(&mut bs, oid(1), 2);
    let w3 = write(&mut bs, oid(1), 3, 16384, pattern(0x33));
    assert!(bs.loop_once().unwrap());
    assert!(w3.borrow().retval.is_none());

    bs.run().unwrap();
    assert_eq!(retval(&st), 0);
    assert_eq!(retval(&w3), 8192);
    // The flusher advanced the window past the migrated entries
    assert!(bs.journal_used_start() > 512 || bs.journal_next_free() > bs.journal_used_start());

    let w4 = write(&mut bs, oid(1), 4, 24576, pattern(0x44));
    bs.run().unwrap();
    assert_eq!(retval(&w4), 8192);
    let s = sync(&mut bs);
    bs.run().unwrap();
    assert_eq!(retval(&s), 0);
    let st = stable(&mut bs, oid(1), 4);
    bs.run().unwrap();
    assert_eq!(retval(&st), 0);

    let r = read(&mut bs, oid(1), 0, 0, block);
    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    let data = r.borrow().data.clone();
    assert!(data[..8192].iter().all(|&b| b == 0x11));
    assert!(data[8192..16384].iter().all(|&b| b == 0x22));
    assert!(data[16384..24576].iter().all(|&b| b == 0x33));
    assert!(data[24576..32768].iter().all(|&b| b == 0x44));
    assert!(data[32768..].iter().all(|&b| b == 0));

    // Everything survives a reopen, consolidated or replayed
    drop(bs);
    let mut bs = fx.open();
    let r = read(&mut bs, oid(1), 0, 0, block);
    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    assert_eq!(r.borrow().data, data);
}

#[test]
fn test_crc_truncation_ends_replay() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();

    // Three journaled writes in one entry sector: entries at 512, 576, 640;
    // payloads at 1024, 5120, 9216
    for (version, byte) in [(1u64, 0x01u8), (2, 0x02), (3, 0x03)] {
        let w = write(&mut bs, oid(1), version, (version as u32 - 1) * 4096, vec![byte; 4096]);
        bs.run().unwrap();
        assert_eq!(retval(&w), 4096);
    }
    let s = sync(&mut bs);
    bs.run().unwrap();
    assert_eq!(retval(&s), 0);
    drop(bs);

    // Corrupt the last byte of the third entry
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = fx.file.reopen().unwrap();
        f.seek(SeekFrom::Start(512 + 3 * 64 - 1)).unwrap();
        f.write_all(&[0xff]).unwrap();
        f.sync_all().unwrap();
    }

    let mut bs = fx.open();
    // Replay stops after the second entry: its payload ends at 9216
    assert_eq!(bs.journal_next_free(), 9216);

    let block = bs.block_size();
    let r = read_dirty(&mut bs, oid(1), 0, block);
    bs.run().unwrap();
    assert_eq!(r.borrow().version, 2);
    let data = &r.borrow().data;
    assert!(data[..4096].iter().all(|&b| b == 0x01));
    assert!(data[4096..8192].iter().all(|&b| b == 0x02));
    assert!(data[8192..12288].iter().all(|&b| b == 0));

    // The discarded version number is assignable again
    let w = write(&mut bs, oid(1), 3, 8192, vec![0x33; 4096]);
    bs.run().unwrap();
    assert_eq!(retval(&w), 4096);
}

#[test]
fn test_crash_recovery_roundtrip() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let block;
    let pattern = vec![0x5au8; 4096];
    {
        let mut bs = fx.open();
        block = bs.block_size();
        put_stable(&mut bs, oid(7), 1, 0, vec![0x77; block as usize]);

        let w = write(&mut bs, oid(7), 2, 4096, pattern.clone());
        bs.run().unwrap();
        assert_eq!(retval(&w), 4096);
        let s = sync(&mut bs);
        bs.run().unwrap();
        assert_eq!(retval(&s), 0);
        // Dropped without stabilizing v2 or flushing anything
    }

    let mut bs = fx.open();
    // v1 was stabilized before the crash and must be readable
    let r = read(&mut bs, oid(7), 1, 0, block);
    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    assert!(r.borrow().data.iter().all(|&b| b == 0x77));

    // v2 was synced; the replayed journal carries it whole, never torn
    let r = read_dirty(&mut bs, oid(7), 0, block);
    bs.run().unwrap();
    assert_eq!(r.borrow().version, 2);
    let data = &r.borrow().data;
    assert!(data[..4096].iter().all(|&b| b == 0x77));
    assert_eq!(&data[4096..8192], pattern.as_slice());
    assert!(data[8192..].iter().all(|&b| b == 0x77));
}

#[test]
fn test_stabilize_is_idempotent() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();

    put_stable(&mut bs, oid(1), 1, 0, vec![0x99; 4096]);

    let again = stable(&mut bs, oid(1), 1);
    bs.run().unwrap();
    assert_eq!(retval(&again), 0);

    let r = read(&mut bs, oid(1), 0, 0, 4096);
    bs.run().unwrap();
    assert_eq!(retval(&r), 4096);
    assert!(r.borrow().data.iter().all(|&b| b == 0x99));
}

#[test]
fn test_rollback_discards_only_unstable_versions() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();

    put_stable(&mut bs, oid(1), 1, 0, vec![0x10; 4096]);

    // v2 is written and synced but never stabilized
    let w = write(&mut bs, oid(1), 2, 4096, vec![0x20; 4096]);
    bs.run().unwrap();
    assert_eq!(retval(&w), 4096);
    let s = sync(&mut bs);
    bs.run().unwrap();
    assert_eq!(retval(&s), 0);

    let (rb, cb) = capture();
    bs.enqueue(Operation::rollback(oid(1), 2, cb)).unwrap();
    bs.run().unwrap();
    assert_eq!(retval(&rb), 0);

    // Older versions and the clean entry are untouched
    let r = read_dirty(&mut bs, oid(1), 0, 8192);
    bs.run().unwrap();
    assert_eq!(r.borrow().version, 1);
    let data = &r.borrow().data;
    assert!(data[..4096].iter().all(|&b| b == 0x10));
    assert!(data[4096..].iter().all(|&b| b == 0));

    // A stable version can never be rolled back
    let (rb, cb) = capture();
    bs.enqueue(Operation::rollback(oid(1), 1, cb)).unwrap();
    bs.run().unwrap();
    assert_eq!(retval(&rb), -(libc::EBUSY as i64));
}

#[test]
fn test_delete_reads_as_zeroes_and_survives_reopen() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let block;
    {
        let mut bs = fx.open();
        block = bs.block_size();
        put_stable(&mut bs, oid(3), 1, 0, vec![0xdd; block as usize]);

        let (del, cb) = capture();
        bs.enqueue(Operation::delete(oid(3), 2, cb)).unwrap();
        bs.run().unwrap();
        assert_eq!(retval(&del), 0);
        let s = sync(&mut bs);
        bs.run().unwrap();
        assert_eq!(retval(&s), 0);
        let st = stable(&mut bs, oid(3), 2);
        bs.run().unwrap();
        assert_eq!(retval(&st), 0);

        let r = read(&mut bs, oid(3), 0, 0, block);
        bs.run().unwrap();
        assert_eq!(retval(&r), i64::from(block));
        assert!(r.borrow().data.iter().all(|&b| b == 0));
    }

    let mut bs = fx.open();
    let r = read(&mut bs, oid(3), 0, 0, block);
    bs.run().unwrap();
    assert_eq!(retval(&r), i64::from(block));
    assert!(r.borrow().data.iter().all(|&b| b == 0));
}

#[test]
fn test_versioned_read_sees_older_version() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();

    put_stable(&mut bs, oid(1), 1, 0, vec![0x01; 4096]);
    put_stable(&mut bs, oid(1), 2, 0, vec![0x02; 4096]);

    let r = read(&mut bs, oid(1), 1, 0, 4096);
    bs.run().unwrap();
    assert_eq!(r.borrow().version, 1);
    assert!(r.borrow().data.iter().all(|&b| b == 0x01));

    let r = read(&mut bs, oid(1), 0, 0, 4096);
    bs.run().unwrap();
    assert_eq!(r.borrow().version, 2);
    assert!(r.borrow().data.iter().all(|&b| b == 0x02));
}

#[test]
fn test_out_of_space_fails_big_write() {
    let fx = Fixture::new(17, 2, 1024 * 1024);
    let mut bs = fx.open();
    let block = bs.block_size() as usize;

    for stripe in 1..=2u64 {
        let w = write(&mut bs, oid(stripe), 1, 0, vec![0xee; block]);
        bs.run().unwrap();
        assert_eq!(retval(&w), block as i64);
    }
    let w = write(&mut bs, oid(3), 1, 0, vec![0xee; block]);
    bs.run().unwrap();
    assert_eq!(retval(&w), -(libc::ENOSPC as i64));
    assert_eq!(bs.free_block_count(), 0);
}

#[test]
fn test_version_ordering_is_enforced() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();

    let w = write(&mut bs, oid(1), 2, 0, vec![0x01; 4096]);
    bs.run().unwrap();
    assert_eq!(retval(&w), 4096);

    // An equal or lower version is rejected
    let w = write(&mut bs, oid(1), 2, 4096, vec![0x02; 4096]);
    bs.run().unwrap();
    assert_eq!(retval(&w), -(libc::EINVAL as i64));
    let w = write(&mut bs, oid(1), 1, 4096, vec![0x02; 4096]);
    bs.run().unwrap();
    assert_eq!(retval(&w), -(libc::EINVAL as i64));

    // Malformed shapes are rejected at enqueue, before any callback exists
    let (_, cb) = capture();
    assert!(
        bs.enqueue(Operation::write(oid(1), 3, 100, vec![0x03; 4096], cb))
            .is_err()
    );
}

#[test]
fn test_unknown_object_reads_zeroes() {
    let fx = Fixture::new(17, 8, 1024 * 1024);
    let mut bs = fx.open();

    let r = read(&mut bs, oid(9), 0, 0, 8192);
    bs.run().unwrap();
    assert_eq!(retval(&r), 8192);
    assert_eq!(r.borrow().version, 0);
    assert!(r.borrow().data.iter().all(|&b| b == 0));
}
