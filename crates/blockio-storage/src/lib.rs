//! BlockIO storage engine
//!
//! A local blockstore for a distributed block-storage cluster. It persists
//! fixed-size objects identified by `(inode, stripe)` pairs on a raw block
//! device and keeps a separate circular journal for small writes and crash
//! consistency. The engine is single-threaded and asynchronous: callers
//! enqueue operations and drive a submission/completion ring; completions
//! advance per-operation state machines and fire callbacks.
//!
//! Region layout:
//! ```text
//! data device     +-----------------------------------------+
//!                 |  block 0 | block 1 | ...                 |  raw objects
//!                 +-----------------------------------------+
//! meta device     +--------+--------------------------------+
//!                 | header | 32-byte slot per data block     |
//!                 +--------+--------------------------------+
//! journal device  +--------+--------------------------------+
//!                 | header | circular: entry sectors + data  |
//!                 +--------+--------------------------------+
//! ```

pub mod allocator;
pub mod flush;
pub mod index;
pub mod init;
pub mod journal;
pub mod layout;
pub mod op;
pub mod raw_io;
pub mod read;
pub mod ring;
pub mod stable;
pub mod store;
pub mod sync;
pub mod write;

// Re-exports
pub use allocator::DataAllocator;
pub use index::{BigStage, DelStage, DirtyEntry, JournalStage, ObjectIndex, VersionState};
pub use op::{OpCallback, OpKind, Operation, WaitReason};
pub use raw_io::{AlignedBuffer, DISK_ALIGNMENT, RawFile};
pub use ring::{Completion, FileHandle, IoOp, Payload, RingLoop, Target};
pub use store::{Blockstore, StoreStats};
