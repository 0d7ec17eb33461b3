//! Cold-start recovery
//!
//! Runs synchronously inside `Blockstore::open`, before any operation can be
//! enqueued. First the metadata region is scanned in aligned chunks to
//! rebuild the clean table and the allocator; then the journal is replayed
//! from the persisted `used_start`, following the CRC chain entry by entry
//! and applying each record as a dirty-entry insertion. The chain ends at
//! the first record whose magic, CRC, chain link or payload checksum does
//! not hold; everything beyond is discarded, which is what reverts objects
//! to their last durable version after a torn write.
//!
//! A region whose header sector is all zeroes is considered fresh and is
//! formatted in place; any other unparseable header is an error, so a
//! mis-pointed offset can never silently clobber a foreign region.

use crate::index::{BigStage, DelStage, DirtyEntry, JournalStage, VersionState};
use crate::journal::{JOURNAL_START, JournalEntry, MARKER_ENTRY_SIZE};
use crate::layout::{CLEAN_ENTRY_SIZE, CleanDiskEntry, JournalHeader, MetaHeader, SECTOR_SIZE};
use crate::raw_io::AlignedBuffer;
use crate::store::Blockstore;
use blockio_common::{Error, ObjVer, Result};
use tracing::{debug, info, warn};

/// Chunk size for the metadata scan
const SCAN_CHUNK: usize = 64 * 1024;

impl Blockstore {
    pub(crate) fn recover(&mut self) -> Result<()> {
        self.recover_meta()?;
        self.recover_journal()?;
        self.drop_stale_dirty();
        if self.journal.trim() {
            self.stats.journal_trims += 1;
        }
        Ok(())
    }

    fn recover_meta(&mut self) -> Result<()> {
        let mut header = AlignedBuffer::new(SECTOR_SIZE as usize);
        {
            let ring = self.ring.borrow();
            ring.file(self.meta_file)
                .read_at(self.geometry.meta_offset, header.as_mut_slice())?;
        }
        if header.as_slice().iter().all(|&b| b == 0) {
            return self.format_meta();
        }

        let parsed = MetaHeader::from_sector(header.as_slice())?;
        if parsed.block_order != self.geometry.block_order
            || parsed.block_count != self.geometry.block_count
        {
            return Err(Error::config(format!(
                "metadata region was formatted with block_order={} block_count={}, \
                 configuration says block_order={} block_count={}",
                parsed.block_order,
                parsed.block_count,
                self.geometry.block_order,
                self.geometry.block_count
            )));
        }

        let slots_len = (self.geometry.block_count * CLEAN_ENTRY_SIZE) as usize;
        let mut chunk = AlignedBuffer::new(SCAN_CHUNK);
        let mut done = 0usize;
        while done < slots_len {
            let want = (slots_len - done).min(SCAN_CHUNK);
            let aligned = want.div_ceil(SECTOR_SIZE as usize) * SECTOR_SIZE as usize;
            {
                let ring = self.ring.borrow();
                ring.file(self.meta_file).read_at(
                    self.geometry.meta_offset + SECTOR_SIZE + done as u64,
                    &mut chunk.as_mut_slice()[..aligned],
                )?;
            }
            self.meta_image[done..done + want].copy_from_slice(&chunk.as_slice()[..want]);

            for i in 0..want / CLEAN_ENTRY_SIZE as usize {
                let at = i * CLEAN_ENTRY_SIZE as usize;
                let slot = (done + at) as u64 / CLEAN_ENTRY_SIZE;
                let Some(entry) = CleanDiskEntry::from_bytes(&chunk.as_slice()[at..at + 32]) else {
                    continue;
                };
                self.apply_clean_slot(slot, entry);
            }
            done += want;
        }
        info!(
            objects = self.index.clean.len(),
            used_blocks = self.geometry.block_count - self.alloc.free_count(),
            "metadata scan complete"
        );
        Ok(())
    }

    /// Insert one scanned slot, resolving duplicate object ids in favor of
    /// the higher version.
    fn apply_clean_slot(&mut self, slot: u64, entry: CleanDiskEntry) {
        let location = slot << self.geometry.block_order;
        if let Some(existing) = self.index.clean.get(&entry.oid).copied() {
            let existing_slot = existing.location >> self.geometry.block_order;
            if existing.version >= entry.version {
                warn!(oid = %entry.oid, slot, "dropping stale duplicate metadata slot");
                self.zero_image_slot(slot);
                return;
            }
            warn!(oid = %entry.oid, slot = existing_slot, "dropping superseded metadata slot");
            self.alloc.set(existing_slot, false);
            self.zero_image_slot(existing_slot);
        }
        self.alloc.set(slot, true);
        self.index.clean.insert(
            entry.oid,
            crate::index::CleanEntry {
                version: entry.version,
                location,
            },
        );
    }

    fn zero_image_slot(&mut self, slot: u64) {
        let at = (slot * CLEAN_ENTRY_SIZE) as usize;
        self.meta_image[at..at + CLEAN_ENTRY_SIZE as usize].fill(0);
    }

    fn format_meta(&mut self) -> Result<()> {
        info!("formatting metadata region");
        let ring = self.ring.borrow();
        let file = ring.file(self.meta_file);
        let header = MetaHeader {
            block_order: self.geometry.block_order,
            block_count: self.geometry.block_count,
        };
        file.write_at(self.geometry.meta_offset, &header.to_sector())?;

        let slots_len = crate::layout::align_up(
            self.geometry.block_count * CLEAN_ENTRY_SIZE,
            SECTOR_SIZE,
        ) as usize;
        let zeros = AlignedBuffer::new(SCAN_CHUNK);
        let mut done = 0usize;
        while done < slots_len {
            let n = (slots_len - done).min(SCAN_CHUNK);
            file.write_at(
                self.geometry.meta_offset + SECTOR_SIZE + done as u64,
                &zeros.as_slice()[..n],
            )?;
            done += n;
        }
        file.sync()
    }

    fn format_journal(&mut self) -> Result<()> {
        info!("formatting journal region");
        let ring = self.ring.borrow();
        let file = ring.file(self.journal_file);
        let header = JournalHeader {
            used_start: JOURNAL_START,
            crc32_anchor: 0,
        };
        file.write_at(self.geometry.journal_offset, &header.to_sector())?;
        file.sync()
    }

    fn recover_journal(&mut self) -> Result<()> {
        let mut header = AlignedBuffer::new(SECTOR_SIZE as usize);
        {
            let ring = self.ring.borrow();
            ring.file(self.journal_file)
                .read_at(self.geometry.journal_offset, header.as_mut_slice())?;
        }
        if header.as_slice().iter().all(|&b| b == 0) {
            return self.format_journal();
        }
        let parsed = JournalHeader::from_sector(header.as_slice())?;
        if parsed.used_start < JOURNAL_START
            || parsed.used_start >= self.geometry.journal_len
            || parsed.used_start % SECTOR_SIZE != 0
        {
            return Err(Error::DataCorruption(format!(
                "journal used_start {} out of bounds",
                parsed.used_start
            )));
        }

        self.journal.used_start = parsed.used_start;
        self.journal.next_free = parsed.used_start;
        self.journal.crc32_anchor = parsed.crc32_anchor;
        self.journal.crc32_last = parsed.crc32_anchor;

        let journal_len = self.geometry.journal_len;
        let mut pos = parsed.used_start;
        let mut prev = parsed.crc32_anchor;
        let mut total = 0u64;
        let mut torn = false;
        let max_sectors = journal_len / SECTOR_SIZE + 2;

        let mut sector = AlignedBuffer::new(SECTOR_SIZE as usize);
        for iteration in 0..max_sectors {
            if pos + SECTOR_SIZE > journal_len {
                pos = JOURNAL_START;
            }
            if iteration > 0 && pos == parsed.used_start {
                break;
            }
            {
                let ring = self.ring.borrow();
                ring.file(self.journal_file)
                    .read_at(self.geometry.journal_offset + pos, sector.as_mut_slice())?;
            }

            let mut off = 0usize;
            let mut applied = 0u32;
            let mut last_payload_end: Option<u64> = None;
            while off + MARKER_ENTRY_SIZE <= SECTOR_SIZE as usize {
                let Some((entry, crc)) = JournalEntry::decode(&sector.as_slice()[off..], prev)
                else {
                    break;
                };
                if let JournalEntry::SmallWrite {
                    data_offset,
                    len,
                    crc32_data,
                    ..
                } = entry
                {
                    if !self.small_write_payload_ok(data_offset, len, crc32_data)? {
                        // Torn payload: the chain ends before this entry
                        torn = true;
                        break;
                    }
                    last_payload_end = Some(data_offset + u64::from(len));
                }
                if applied == 0 {
                    self.journal.open_replayed_segment(pos);
                }
                self.apply_replayed(&entry, crc);
                prev = crc;
                off += entry.size();
                applied += 1;
                total += 1;
            }

            if applied == 0 || torn {
                break;
            }
            pos = last_payload_end.unwrap_or(pos + SECTOR_SIZE);
        }

        self.journal.next_free = pos;
        self.journal.crc32_last = prev;
        if self.journal.segments.is_empty() {
            self.journal.empty = true;
            self.journal.next_free = parsed.used_start;
        }
        info!(
            entries = total,
            used_start = self.journal.used_start,
            next_free = self.journal.next_free,
            torn,
            "journal replay complete"
        );
        Ok(())
    }

    /// Validate a replayed small write's payload range and checksum
    fn small_write_payload_ok(&self, data_offset: u64, len: u32, crc32_data: u32) -> Result<bool> {
        if len == 0
            || u64::from(len) > u64::from(self.geometry.block_size)
            || data_offset < JOURNAL_START
            || data_offset % SECTOR_SIZE != 0
            || u64::from(len) % SECTOR_SIZE != 0
            || data_offset + u64::from(len) > self.geometry.journal_len
        {
            return Ok(false);
        }
        let mut payload = AlignedBuffer::new(len as usize);
        {
            let ring = self.ring.borrow();
            ring.file(self.journal_file).read_at(
                self.geometry.journal_offset + data_offset,
                &mut payload.as_mut_slice()[..len as usize],
            )?;
        }
        Ok(crc32c::crc32c(&payload.as_slice()[..len as usize]) == crc32_data)
    }

    fn apply_replayed(&mut self, entry: &JournalEntry, crc: u32) {
        let seg = self.journal.segments.back().map(|s| s.id);
        if let Some(segment) = self.journal.segments.back_mut() {
            segment.last_crc = crc;
            if entry.pins_segment() {
                segment.live += 1;
            }
        }
        match *entry {
            JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_offset,
                ..
            } => {
                self.index.dirty.insert(
                    ObjVer::new(oid, version),
                    DirtyEntry {
                        state: VersionState::Journal(JournalStage::Synced),
                        flags: 0,
                        location: data_offset,
                        offset,
                        len,
                        journal_seg: seg,
                    },
                );
            }
            JournalEntry::BigWrite {
                oid,
                version,
                location,
            } => {
                let block = location >> self.geometry.block_order;
                if block < self.geometry.block_count {
                    self.alloc.set(block, true);
                }
                self.index.dirty.insert(
                    ObjVer::new(oid, version),
                    DirtyEntry {
                        state: VersionState::Big(BigStage::MetaSynced),
                        flags: 0,
                        location,
                        offset: 0,
                        len: self.geometry.block_size,
                        journal_seg: seg,
                    },
                );
            }
            JournalEntry::Delete { oid, version } => {
                self.index.dirty.insert(
                    ObjVer::new(oid, version),
                    DirtyEntry {
                        state: VersionState::Del(DelStage::Synced),
                        flags: 0,
                        location: 0,
                        offset: 0,
                        len: self.geometry.block_size,
                        journal_seg: seg,
                    },
                );
            }
            JournalEntry::Stable { oid, version } => {
                self.mark_stable(ObjVer::new(oid, version));
            }
            JournalEntry::Rollback { oid, version } => {
                self.mark_rolled_back(ObjVer::new(oid, version));
            }
        }
    }

    /// Drop replayed dirty entries at or below the clean version: the object
    /// was already promoted past them before the crash.
    fn drop_stale_dirty(&mut self) {
        let stale: Vec<(ObjVer, DirtyEntry)> = self
            .index
            .dirty
            .iter()
            .filter(|(ov, _)| {
                self.index
                    .clean
                    .get(&ov.oid)
                    .is_some_and(|c| ov.version <= c.version)
            })
            .map(|(ov, e)| (*ov, *e))
            .collect();
        for (ov, entry) in stale {
            debug!(%ov, "dropping stale journal entry");
            self.index.dirty.remove(&ov);
            if let Some(seg) = entry.journal_seg {
                self.journal.dec_live(seg);
            }
            if entry.state.is_big() {
                let clean_location = self.index.clean.get(&ov.oid).map(|c| c.location);
                if clean_location != Some(entry.location) {
                    self.alloc
                        .set(entry.location >> self.geometry.block_order, false);
                }
            }
        }
    }
}
