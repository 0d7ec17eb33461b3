//! Submission/completion ring
//!
//! A single-threaded asynchronous I/O provider shared by the engine and its
//! caller. Submissions target files registered up front and carry a small
//! payload naming the originating operation (or flusher job) and the byte
//! offset inside its buffer; completions hand the payload back together with
//! the result and, for reads, the bytes read.
//!
//! The submission queue is bounded. Capacity is held from the moment a
//! submission is queued until its completion is reaped, so a full queue
//! drains as the consumer processes completions. This is the back-pressure
//! signal the engine turns into `WaitReason::Sqe`.
//!
//! I/O is performed in submission order during [`RingLoop::submit`]. A
//! failure of the provider itself (an unregistered file, a poisoned queue)
//! is fatal and returned as `Err`; per-I/O device errors are reported as
//! negative completion results, mirroring errno.

use crate::op::OpHandle;
use crate::raw_io::{AlignedBuffer, RawFile};
use blockio_common::{Error, Result, error::errno};
use bytes::Bytes;
use std::collections::VecDeque;

/// Index of a file registered with the ring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(usize);

/// One I/O request
#[derive(Debug)]
pub enum IoOp {
    ReadAt {
        file: FileHandle,
        offset: u64,
        len: u32,
    },
    WriteAt {
        file: FileHandle,
        offset: u64,
        data: Bytes,
    },
    Fsync {
        file: FileHandle,
    },
}

/// Who a completion belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// An engine operation
    Op(OpHandle),
    /// A flusher job, identified by its sequence number
    Flush(u64),
}

/// Per-submission payload, handed back verbatim on completion
#[derive(Clone, Copy, Debug)]
pub struct Payload {
    pub target: Target,
    /// Byte offset into the originating operation's buffer (reads)
    pub buf_offset: u32,
}

/// A queued I/O request
#[derive(Debug)]
pub struct Submission {
    pub op: IoOp,
    pub payload: Payload,
}

/// A finished I/O request
#[derive(Debug)]
pub struct Completion {
    pub payload: Payload,
    /// Bytes transferred, or a negative errno
    pub result: i64,
    /// Data read, for `ReadAt` submissions
    pub data: Option<Bytes>,
}

/// The shared submission/completion queue
pub struct RingLoop {
    files: Vec<RawFile>,
    sq: Vec<Submission>,
    cq: VecDeque<Completion>,
    sq_entries: usize,
}

impl RingLoop {
    #[must_use]
    pub fn new(sq_entries: usize) -> Self {
        Self {
            files: Vec::new(),
            sq: Vec::new(),
            cq: VecDeque::new(),
            sq_entries,
        }
    }

    /// Register a file; submissions reference it by the returned handle
    pub fn register_file(&mut self, file: RawFile) -> FileHandle {
        self.files.push(file);
        FileHandle(self.files.len() - 1)
    }

    /// Direct access to a registered file (used by synchronous recovery)
    pub fn file(&self, handle: FileHandle) -> &RawFile {
        &self.files[handle.0]
    }

    /// Free submission slots. Zero means the engine must park on `Sqe`.
    pub fn sqe_left(&self) -> usize {
        self.sq_entries
            .saturating_sub(self.sq.len() + self.cq.len())
    }

    /// Snapshot of the submission queue tail, for scatter rollback
    pub fn sq_tail(&self) -> usize {
        self.sq.len()
    }

    /// Drop submissions queued after `tail`. Only valid before `submit`.
    pub fn rollback_sq(&mut self, tail: usize) {
        self.sq.truncate(tail);
    }

    /// Queue a submission; `None` signals a full queue
    #[must_use]
    pub fn push(&mut self, submission: Submission) -> Option<()> {
        if self.sqe_left() == 0 {
            return None;
        }
        self.sq.push(submission);
        Some(())
    }

    /// Perform all queued I/O in order, queuing one completion each.
    ///
    /// Returns the number of submissions consumed.
    pub fn submit(&mut self) -> Result<usize> {
        let batch: Vec<Submission> = self.sq.drain(..).collect();
        let count = batch.len();
        for sub in batch {
            let completion = self.perform(sub)?;
            self.cq.push_back(completion);
        }
        Ok(count)
    }

    fn perform(&mut self, sub: Submission) -> Result<Completion> {
        let file_of = |h: FileHandle| -> Result<&RawFile> {
            self.files
                .get(h.0)
                .ok_or_else(|| Error::storage(format!("unregistered file handle {}", h.0)))
        };
        let (result, data) = match sub.op {
            IoOp::ReadAt { file, offset, len } => {
                let f = file_of(file)?;
                let mut buf = AlignedBuffer::new(len as usize);
                match f.read_at(offset, &mut buf.as_mut_slice()[..len as usize]) {
                    Ok(()) => (
                        i64::from(len),
                        Some(Bytes::copy_from_slice(&buf.as_slice()[..len as usize])),
                    ),
                    Err(_) => (-errno::EIO, None),
                }
            }
            IoOp::WriteAt { file, offset, data } => {
                let f = file_of(file)?;
                match f.write_at(offset, &data) {
                    Ok(()) => (data.len() as i64, None),
                    Err(_) => (-errno::EIO, None),
                }
            }
            IoOp::Fsync { file } => {
                let f = file_of(file)?;
                match f.sync() {
                    Ok(()) => (0, None),
                    Err(_) => (-errno::EIO, None),
                }
            }
        };
        Ok(Completion {
            payload: sub.payload,
            result,
            data,
        })
    }

    /// Block until a completion is available.
    ///
    /// With an idle ring there is nothing that could ever complete; that is
    /// a driving-loop bug and reported as an error rather than a hang.
    pub fn wait(&mut self) -> Result<Completion> {
        self.cq
            .pop_front()
            .ok_or_else(|| Error::storage("wait on an idle ring"))
    }

    /// Pop one completion if available
    pub fn try_complete(&mut self) -> Option<Completion> {
        self.cq.pop_front()
    }

    /// True if submissions are queued or completions are unreaped
    pub fn has_work(&self) -> bool {
        !self.sq.is_empty() || !self.cq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn ring_with_file(size: u64, sq_entries: usize) -> (RingLoop, FileHandle, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(size).unwrap();
        let file = RawFile::open(temp.path(), false, true).unwrap();
        let mut ring = RingLoop::new(sq_entries);
        let handle = ring.register_file(file);
        (ring, handle, temp)
    }

    fn payload() -> Payload {
        Payload {
            target: Target::Flush(0),
            buf_offset: 0,
        }
    }

    #[test]
    fn test_write_then_read() {
        let (mut ring, file, _temp) = ring_with_file(8192, 8);

        let data = Bytes::from(vec![0xabu8; 512]);
        ring.push(Submission {
            op: IoOp::WriteAt {
                file,
                offset: 1024,
                data,
            },
            payload: payload(),
        })
        .unwrap();
        ring.submit().unwrap();
        let c = ring.wait().unwrap();
        assert_eq!(c.result, 512);

        ring.push(Submission {
            op: IoOp::ReadAt {
                file,
                offset: 1024,
                len: 512,
            },
            payload: payload(),
        })
        .unwrap();
        ring.submit().unwrap();
        let c = ring.wait().unwrap();
        assert_eq!(c.result, 512);
        assert!(c.data.unwrap().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_backpressure_frees_on_reap() {
        let (mut ring, file, _temp) = ring_with_file(8192, 2);

        for _ in 0..2 {
            ring.push(Submission {
                op: IoOp::Fsync { file },
                payload: payload(),
            })
            .unwrap();
        }
        // Queue full: slots stay held until completions are reaped
        assert!(
            ring.push(Submission {
                op: IoOp::Fsync { file },
                payload: payload(),
            })
            .is_none()
        );
        ring.submit().unwrap();
        assert_eq!(ring.sqe_left(), 0);
        ring.wait().unwrap();
        assert_eq!(ring.sqe_left(), 1);
    }

    #[test]
    fn test_rollback_discards_queued() {
        let (mut ring, file, _temp) = ring_with_file(8192, 8);

        let tail = ring.sq_tail();
        ring.push(Submission {
            op: IoOp::Fsync { file },
            payload: payload(),
        })
        .unwrap();
        ring.push(Submission {
            op: IoOp::Fsync { file },
            payload: payload(),
        })
        .unwrap();
        ring.rollback_sq(tail);
        assert_eq!(ring.submit().unwrap(), 0);
        assert!(ring.try_complete().is_none());
    }

    #[test]
    fn test_wait_on_idle_ring_is_an_error() {
        let (mut ring, _file, _temp) = ring_with_file(4096, 4);
        assert!(ring.wait().is_err());
    }
}
