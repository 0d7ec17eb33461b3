//! Engine configuration
//!
//! The engine is configured with byte-granular regions on up to three
//! devices. The metadata and journal regions may colocate with the data
//! device by offset; leaving `meta_device`/`journal_device` unset selects the
//! previous device in the chain (journal → meta → data).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Default block order: 1 << 17 = 128 KiB objects
pub const DEFAULT_BLOCK_ORDER: u32 = 17;

/// Allowed object size range: 4 KiB .. 128 MiB
pub const MIN_BLOCK_ORDER: u32 = 12;
pub const MAX_BLOCK_ORDER: u32 = 27;

/// Default capacity of the in-memory journal sector ring
pub const DEFAULT_SECTOR_BUFFER_COUNT: usize = 32;

/// Default submission queue depth
pub const DEFAULT_SQ_ENTRIES: usize = 512;

/// Engine configuration
///
/// All offsets and sizes are bytes and must be 512-byte aligned. A size of
/// zero means "to the end of the device" (data) or "computed from the block
/// count" (metadata).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the data device or file
    pub data_device: PathBuf,
    /// Metadata device; defaults to the data device
    pub meta_device: Option<PathBuf>,
    /// Journal device; defaults to the metadata device
    pub journal_device: Option<PathBuf>,

    pub data_offset: u64,
    pub data_size: u64,
    pub meta_offset: u64,
    pub meta_size: u64,
    pub journal_offset: u64,
    pub journal_size: u64,

    /// Object size is `1 << block_order`
    pub block_order: u32,
    /// Capacity of the in-memory journal sector ring
    pub journal_sector_buffer_count: usize,
    /// Submission queue depth of the I/O ring
    pub sq_entries: usize,
    /// Testing only: downgrade fsyncs to no-ops
    pub disable_fsync: bool,
    /// Bypass the page cache (O_DIRECT)
    pub direct_io: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_device: PathBuf::new(),
            meta_device: None,
            journal_device: None,
            data_offset: 0,
            data_size: 0,
            meta_offset: 0,
            meta_size: 0,
            journal_offset: 0,
            journal_size: 16 * 1024 * 1024,
            block_order: DEFAULT_BLOCK_ORDER,
            journal_sector_buffer_count: DEFAULT_SECTOR_BUFFER_COUNT,
            sq_entries: DEFAULT_SQ_ENTRIES,
            disable_fsync: false,
            direct_io: true,
        }
    }
}

impl StoreConfig {
    /// Object size in bytes
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        1 << self.block_order
    }

    /// Build a configuration from a string option map.
    ///
    /// Unrecognized keys are rejected so that typos do not silently fall back
    /// to defaults.
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "data_device" => cfg.data_device = PathBuf::from(value),
                "meta_device" => cfg.meta_device = Some(PathBuf::from(value)),
                "journal_device" => cfg.journal_device = Some(PathBuf::from(value)),
                "data_offset" => cfg.data_offset = parse_u64(key, value)?,
                "data_size" => cfg.data_size = parse_u64(key, value)?,
                "meta_offset" => cfg.meta_offset = parse_u64(key, value)?,
                "meta_size" => cfg.meta_size = parse_u64(key, value)?,
                "journal_offset" => cfg.journal_offset = parse_u64(key, value)?,
                "journal_size" => cfg.journal_size = parse_u64(key, value)?,
                "block_order" => cfg.block_order = parse_u64(key, value)? as u32,
                "journal_sector_buffer_count" => {
                    cfg.journal_sector_buffer_count = parse_u64(key, value)? as usize;
                }
                "sq_entries" => cfg.sq_entries = parse_u64(key, value)? as usize,
                "disable_fsync" => cfg.disable_fsync = parse_bool(key, value)?,
                "direct_io" => cfg.direct_io = parse_bool(key, value)?,
                _ => {
                    return Err(Error::config(format!("unknown option: {key}")));
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check internal consistency; called by `from_map` and by the engine at
    /// open time for configurations built directly.
    pub fn validate(&self) -> Result<()> {
        if self.data_device.as_os_str().is_empty() {
            return Err(Error::config("data_device is required"));
        }
        if !(MIN_BLOCK_ORDER..=MAX_BLOCK_ORDER).contains(&self.block_order) {
            return Err(Error::config(format!(
                "block_order {} out of range {}..={}",
                self.block_order, MIN_BLOCK_ORDER, MAX_BLOCK_ORDER
            )));
        }
        if self.journal_sector_buffer_count < 2 {
            return Err(Error::config(
                "journal_sector_buffer_count must be at least 2",
            ));
        }
        if self.sq_entries == 0 {
            return Err(Error::config("sq_entries must be non-zero"));
        }
        for (name, value) in [
            ("data_offset", self.data_offset),
            ("data_size", self.data_size),
            ("meta_offset", self.meta_offset),
            ("meta_size", self.meta_size),
            ("journal_offset", self.journal_offset),
            ("journal_size", self.journal_size),
        ] {
            if value % 512 != 0 {
                return Err(Error::config(format!("{name} must be 512-byte aligned")));
            }
        }
        Ok(())
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::config(format!("{key}: expected an integer, got {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{key}: expected a boolean, got {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_map_defaults() {
        let cfg = StoreConfig::from_map(&map(&[("data_device", "/dev/sdb")])).unwrap();
        assert_eq!(cfg.block_order, DEFAULT_BLOCK_ORDER);
        assert_eq!(cfg.block_size(), 128 * 1024);
        assert!(cfg.meta_device.is_none());
    }

    #[test]
    fn test_from_map_rejects_unknown_keys() {
        let err = StoreConfig::from_map(&map(&[
            ("data_device", "/dev/sdb"),
            ("journal_sectors", "16"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("journal_sectors"));
    }

    #[test]
    fn test_from_map_parses_options() {
        let cfg = StoreConfig::from_map(&map(&[
            ("data_device", "/dev/sdb"),
            ("journal_device", "/dev/nvme0n1"),
            ("block_order", "12"),
            ("journal_size", "1048576"),
            ("disable_fsync", "true"),
        ]))
        .unwrap();
        assert_eq!(cfg.block_size(), 4096);
        assert_eq!(cfg.journal_size, 1 << 20);
        assert!(cfg.disable_fsync);
        assert_eq!(
            cfg.journal_device.as_deref(),
            Some(std::path::Path::new("/dev/nvme0n1"))
        );
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut cfg = StoreConfig {
            data_device: PathBuf::from("/dev/sdb"),
            ..StoreConfig::default()
        };
        cfg.block_order = 30;
        assert!(cfg.validate().is_err());
        cfg.block_order = 17;
        cfg.data_offset = 100;
        assert!(cfg.validate().is_err());
    }
}
