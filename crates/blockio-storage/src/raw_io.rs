//! Raw device I/O
//!
//! Positional reads and writes on files or block devices, optionally
//! bypassing the page cache with O_DIRECT. Every region offset, operation
//! offset and operation length in the engine is a multiple of
//! [`DISK_ALIGNMENT`], so the alignment checks here double as an internal
//! sanity net even in buffered mode.

use blockio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Write alignment required by the on-disk format (journal sector size)
pub const DISK_ALIGNMENT: usize = 512;

/// Raw file handle with positional I/O
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    fsync_enabled: bool,
}

impl RawFile {
    /// Open a file or block device for engine I/O.
    ///
    /// `direct_io` requests O_DIRECT on Linux; `disable_fsync` downgrades
    /// [`RawFile::sync`] to a no-op (testing only).
    pub fn open(path: impl AsRef<Path>, direct_io: bool, disable_fsync: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);

        #[cfg(target_os = "linux")]
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct_io;

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open {path_str}: {e}")))?;

        let size = if Self::is_block_device(&path) {
            Self::block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| Error::storage(format!("failed to stat {path_str}: {e}")))?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            fsync_enabled: !disable_fsync,
        })
    }

    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Size of a block device via the BLKGETSIZE64 ioctl
    #[cfg(target_os = "linux")]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::storage(format!(
                "failed to get device size for {}: {}",
                path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::storage(format!("failed to get device size for {path}: {e}")))?;
        f.seek(SeekFrom::Start(0))
            .map_err(|e| Error::storage(format!("failed to rewind {path}: {e}")))?;
        Ok(size)
    }

    /// Device or file size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path the file was opened with
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::storage(format!("seek failed on {}: {}", self.path, e)))?;
        file.read_exact(buf)
            .map_err(|e| Error::storage(format!("read failed on {}: {}", self.path, e)))
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;

        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::storage(format!("seek failed on {}: {}", self.path, e)))?;
        file.write_all(buf)
            .map_err(|e| Error::storage(format!("write failed on {}: {}", self.path, e)))
    }

    /// Flush device caches. No-op when fsync is disabled by configuration.
    pub fn sync(&self) -> Result<()> {
        if !self.fsync_enabled {
            return Ok(());
        }
        self.file
            .sync_data()
            .map_err(|e| Error::storage(format!("fsync failed on {}: {}", self.path, e)))
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        if offset as usize % DISK_ALIGNMENT != 0 || len % DISK_ALIGNMENT != 0 {
            return Err(Error::storage(format!(
                "unaligned I/O on {}: offset={} len={}",
                self.path, offset, len
            )));
        }
        Ok(())
    }
}

/// Heap buffer aligned for direct I/O
///
/// With O_DIRECT the kernel requires buffer memory aligned to the logical
/// sector size. Allocation goes through `alloc_zeroed` with an explicit
/// layout; the buffer never reallocates.
pub struct AlignedBuffer {
    ptr: *mut u8,
    len: usize,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes rounded up to the alignment
    #[must_use]
    pub fn new(size: usize) -> Self {
        use std::alloc::{Layout, alloc_zeroed};

        let len = size.div_ceil(DISK_ALIGNMENT) * DISK_ALIGNMENT;
        let layout =
            Layout::from_size_align(len.max(DISK_ALIGNMENT), DISK_ALIGNMENT).expect("buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "aligned allocation failed");
        Self {
            ptr,
            len: len.max(DISK_ALIGNMENT),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Copy `src` into the buffer, zero-padding the tail
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.len);
        let buf = self.as_mut_slice();
        buf[..n].copy_from_slice(&src[..n]);
        buf[n..].fill(0);
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        use std::alloc::{Layout, dealloc};
        let layout = Layout::from_size_align(self.len, DISK_ALIGNMENT).expect("buffer layout");
        unsafe { dealloc(self.ptr, layout) };
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer_rounds_up() {
        let buf = AlignedBuffer::new(100);
        assert_eq!(buf.len(), DISK_ALIGNMENT);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_from_pads_with_zeros() {
        let mut buf = AlignedBuffer::new(512);
        buf.copy_from(b"payload");
        assert_eq!(&buf.as_slice()[..7], b"payload");
        assert!(buf.as_slice()[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(8192).unwrap();

        let file = RawFile::open(temp.path(), false, true).unwrap();
        let mut buf = AlignedBuffer::new(1024);
        buf.copy_from(b"sector data");
        file.write_at(512, buf.as_slice()).unwrap();

        let mut out = AlignedBuffer::new(1024);
        file.read_at(512, out.as_mut_slice()).unwrap();
        assert!(out.as_slice().starts_with(b"sector data"));
    }

    #[test]
    fn test_rejects_unaligned_io() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(4096).unwrap();

        let file = RawFile::open(temp.path(), false, true).unwrap();
        let mut buf = AlignedBuffer::new(512);
        assert!(file.read_at(100, buf.as_mut_slice()).is_err());
    }
}
