//! On-disk layout: region geometry and metadata codecs
//!
//! Metadata region:
//! ```text
//! +----------------+  meta_offset
//! | header sector  |  512 B - magic, version, block_order, block_count
//! +----------------+
//! | slot 0 (32 B)  |  describes data block 0
//! | slot 1 (32 B)  |  describes data block 1
//! | ...            |  zero oid = free slot
//! +----------------+
//! ```
//!
//! The journal header sector (same shape, different magic) carries the
//! replay anchor: the `used_start` position and the CRC of the last entry
//! trimmed before it.

use blockio_common::{Error, ObjectId, Result, StoreConfig};
use bytes::{Buf, BufMut, BytesMut};

/// Journal/metadata sector size; the granularity of all region offsets
pub const SECTOR_SIZE: u64 = 512;

/// Metadata header magic ("BLKIOMET")
pub const META_MAGIC: u64 = 0x5445_4D4F_494B_4C42;

/// Journal header magic ("BLKIOJNL")
pub const JOURNAL_MAGIC: u64 = 0x4C4E_4A4F_494B_4C42;

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Bytes per clean-entry slot
pub const CLEAN_ENTRY_SIZE: u64 = 32;

/// Smallest usable journal: header plus a handful of sectors
pub const MIN_JOURNAL_SIZE: u64 = 8 * SECTOR_SIZE;

/// Round `value` up to a multiple of `align`
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Metadata region header, one sector at `meta_offset`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaHeader {
    pub block_order: u32,
    pub block_count: u64,
}

impl MetaHeader {
    /// Serialize into a full zero-padded sector
    #[must_use]
    pub fn to_sector(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SECTOR_SIZE as usize);
        buf.put_u64_le(META_MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(self.block_order);
        buf.put_u64_le(self.block_count);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.resize(SECTOR_SIZE as usize, 0);
        buf.to_vec()
    }

    /// Parse and verify a header sector
    pub fn from_sector(data: &[u8]) -> Result<Self> {
        if data.len() < 28 {
            return Err(Error::DataCorruption("metadata header too short".into()));
        }
        let mut buf = &data[..];
        let magic = buf.get_u64_le();
        if magic != META_MAGIC {
            return Err(Error::DataCorruption("bad metadata header magic".into()));
        }
        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::DataCorruption(format!(
                "unsupported metadata format version {version}"
            )));
        }
        let block_order = buf.get_u32_le();
        let block_count = buf.get_u64_le();
        let stored = buf.get_u32_le();
        let actual = crc32c::crc32c(&data[..24]);
        if stored != actual {
            return Err(Error::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(Self {
            block_order,
            block_count,
        })
    }
}

/// Journal region header, one sector at `journal_offset`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalHeader {
    /// Oldest live position in the circular area
    pub used_start: u64,
    /// CRC chain anchor: `crc32_prev` expected of the entry at `used_start`
    pub crc32_anchor: u32,
}

impl JournalHeader {
    #[must_use]
    pub fn to_sector(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SECTOR_SIZE as usize);
        buf.put_u64_le(JOURNAL_MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u64_le(self.used_start);
        buf.put_u32_le(self.crc32_anchor);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.resize(SECTOR_SIZE as usize, 0);
        buf.to_vec()
    }

    pub fn from_sector(data: &[u8]) -> Result<Self> {
        if data.len() < 28 {
            return Err(Error::DataCorruption("journal header too short".into()));
        }
        let mut buf = &data[..];
        let magic = buf.get_u64_le();
        if magic != JOURNAL_MAGIC {
            return Err(Error::DataCorruption("bad journal header magic".into()));
        }
        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::DataCorruption(format!(
                "unsupported journal format version {version}"
            )));
        }
        let used_start = buf.get_u64_le();
        let crc32_anchor = buf.get_u32_le();
        let stored = buf.get_u32_le();
        let actual = crc32c::crc32c(&data[..24]);
        if stored != actual {
            return Err(Error::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(Self {
            used_start,
            crc32_anchor,
        })
    }
}

/// One clean-entry slot: the durable latest version of the object living in
/// the data block with the same index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanDiskEntry {
    pub oid: ObjectId,
    pub version: u64,
    pub flags: u8,
}

impl CleanDiskEntry {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CLEAN_ENTRY_SIZE as usize] {
        let mut buf = [0u8; CLEAN_ENTRY_SIZE as usize];
        buf[..16].copy_from_slice(&self.oid.to_bytes());
        buf[16..24].copy_from_slice(&self.version.to_le_bytes());
        buf[24] = self.flags;
        buf
    }

    /// Parse one slot; a zero oid yields `None` (free slot)
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let oid = ObjectId::from_bytes(&data[..16]);
        if oid.is_zero() {
            return None;
        }
        let version = u64::from_le_bytes(data[16..24].try_into().unwrap());
        Some(Self {
            oid,
            version,
            flags: data[24],
        })
    }
}

/// Computed region geometry
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub block_order: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub data_offset: u64,
    pub data_len: u64,
    pub meta_offset: u64,
    /// Header sector plus the slot array, sector-aligned
    pub meta_len: u64,
    pub journal_offset: u64,
    pub journal_len: u64,
}

/// Device sizes and colocation facts needed to compute the geometry
#[derive(Clone, Copy, Debug)]
pub struct RegionInput {
    pub data_file_size: u64,
    pub meta_file_size: u64,
    pub journal_file_size: u64,
    pub meta_on_data: bool,
    pub journal_on_data: bool,
    pub journal_on_meta: bool,
}

impl Geometry {
    /// Compute region sizes from configuration and device sizes
    pub fn compute(cfg: &StoreConfig, input: &RegionInput) -> Result<Self> {
        let block_size = cfg.block_size();

        if cfg.data_offset >= input.data_file_size {
            return Err(Error::config("data_offset beyond device end"));
        }
        let avail = input.data_file_size - cfg.data_offset;
        let data_len = if cfg.data_size == 0 {
            avail / u64::from(block_size) * u64::from(block_size)
        } else if cfg.data_size <= avail {
            cfg.data_size
        } else {
            return Err(Error::config("data_size beyond device end"));
        };
        let block_count = data_len / u64::from(block_size);
        if block_count == 0 {
            return Err(Error::config("data region smaller than one block"));
        }

        let meta_needed = SECTOR_SIZE + align_up(block_count * CLEAN_ENTRY_SIZE, SECTOR_SIZE);
        let meta_len = if cfg.meta_size == 0 {
            meta_needed
        } else if cfg.meta_size >= meta_needed {
            cfg.meta_size
        } else {
            return Err(Error::config(format!(
                "meta_size {} below required {}",
                cfg.meta_size, meta_needed
            )));
        };
        if cfg.meta_offset + meta_len > input.meta_file_size {
            return Err(Error::config("metadata region beyond device end"));
        }

        let journal_len = cfg.journal_size;
        if journal_len < MIN_JOURNAL_SIZE {
            return Err(Error::config(format!(
                "journal_size {} below minimum {}",
                journal_len, MIN_JOURNAL_SIZE
            )));
        }
        if cfg.journal_offset + journal_len > input.journal_file_size {
            return Err(Error::config("journal region beyond device end"));
        }

        let geometry = Self {
            block_order: cfg.block_order,
            block_size,
            block_count,
            data_offset: cfg.data_offset,
            data_len,
            meta_offset: cfg.meta_offset,
            meta_len,
            journal_offset: cfg.journal_offset,
            journal_len,
        };
        geometry.check_overlaps(input)?;
        Ok(geometry)
    }

    fn check_overlaps(&self, input: &RegionInput) -> Result<()> {
        let overlaps = |a_off: u64, a_len: u64, b_off: u64, b_len: u64| {
            a_off < b_off + b_len && b_off < a_off + a_len
        };
        if input.meta_on_data
            && overlaps(self.meta_offset, self.meta_len, self.data_offset, self.data_len)
        {
            return Err(Error::config("metadata region overlaps data region"));
        }
        if input.journal_on_data
            && overlaps(
                self.journal_offset,
                self.journal_len,
                self.data_offset,
                self.data_len,
            )
        {
            return Err(Error::config("journal region overlaps data region"));
        }
        if input.journal_on_meta
            && overlaps(
                self.journal_offset,
                self.journal_len,
                self.meta_offset,
                self.meta_len,
            )
        {
            return Err(Error::config("journal region overlaps metadata region"));
        }
        Ok(())
    }

    /// Byte offset of a clean-entry slot within the metadata region
    #[must_use]
    pub const fn meta_slot_offset(&self, slot: u64) -> u64 {
        SECTOR_SIZE + slot * CLEAN_ENTRY_SIZE
    }
}
