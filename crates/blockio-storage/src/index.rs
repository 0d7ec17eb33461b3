//! In-memory object index
//!
//! The index is the union of a hash map of clean entries (one durable
//! version per object, addressed by data block) and an ordered map of dirty
//! entries keyed `(oid, version)`: every in-flight or not-yet-promoted
//! version. Reads reconstruct objects by walking an object's dirty chain
//! newest-first and falling back to the clean entry.
//!
//! Version states are not stored on disk; they are deduced from the journal
//! at recovery.

use blockio_common::{ObjVer, ObjectId};
use std::collections::HashMap;
use std::ops::RangeInclusive;

/// Lifecycle of a journaled (small) write
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JournalStage {
    /// Payload and journal entry handed to the device
    Written,
    /// Journal fsynced
    Synced,
    /// Declared permanent; eligible for the flusher
    Stable,
    /// Data copied to the data region
    Moved,
    /// Copy fsynced; journal space reclaimable
    MoveSynced,
}

/// Lifecycle of a redirect (big) write
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BigStage {
    /// Data landed in the data region
    Written,
    /// Data device fsynced
    Synced,
    /// Metadata entry landed in the journal
    MetaWritten,
    /// Journal fsynced
    MetaSynced,
    /// Declared permanent
    Stable,
    /// Metadata slot rewritten
    MetaMoved,
    /// Slot rewrite fsynced; promotes to clean
    MetaCommitted,
}

/// Lifecycle of a deletion tombstone
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DelStage {
    Written,
    Synced,
    Stable,
    /// Clean entry collapsed, block freed
    Moved,
}

/// Per-version lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionState {
    /// Submission accepted, no completion yet
    InFlight,
    Journal(JournalStage),
    Big(BigStage),
    Del(DelStage),
    /// The clean entry's state
    Current,
}

impl VersionState {
    /// Visible to non-dirty reads
    #[must_use]
    pub fn is_stable(&self) -> bool {
        match self {
            Self::Journal(s) => *s >= JournalStage::Stable,
            Self::Big(s) => *s >= BigStage::Stable,
            Self::Del(s) => matches!(s, DelStage::Synced | DelStage::Stable),
            Self::Current => true,
            Self::InFlight => false,
        }
    }

    /// Data resides in the journal data area
    #[must_use]
    pub fn is_journal(&self) -> bool {
        matches!(self, Self::Journal(_))
    }

    /// Durable enough to stabilize
    #[must_use]
    pub fn is_synced(&self) -> bool {
        match self {
            Self::Journal(s) => *s >= JournalStage::Synced,
            Self::Big(s) => *s >= BigStage::MetaSynced,
            Self::Del(s) => *s >= DelStage::Synced,
            Self::Current => true,
            Self::InFlight => false,
        }
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Del(_))
    }

    #[must_use]
    pub fn is_big(&self) -> bool {
        matches!(self, Self::Big(_))
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight)
    }
}

/// Current durable state of one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanEntry {
    pub version: u64,
    /// Byte offset into the data region
    pub location: u64,
}

/// One in-flight or not-yet-promoted version
#[derive(Clone, Copy, Debug)]
pub struct DirtyEntry {
    pub state: VersionState,
    pub flags: u32,
    /// Byte offset into the journal data area or the data region,
    /// depending on `state.is_journal()`
    pub location: u64,
    /// Byte range within the object covered by this version
    pub offset: u32,
    pub len: u32,
    /// Journal segment pinned by this entry's record, until flushed
    pub journal_seg: Option<u64>,
}

/// Clean table plus version-ordered dirty chain
#[derive(Default)]
pub struct ObjectIndex {
    pub clean: HashMap<ObjectId, CleanEntry>,
    pub dirty: std::collections::BTreeMap<ObjVer, DirtyEntry>,
}

impl ObjectIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Full key range of one object's dirty chain
    #[must_use]
    pub fn oid_range(oid: ObjectId) -> RangeInclusive<ObjVer> {
        ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX)
    }

    /// Newest-first walk over one object's dirty versions
    pub fn dirty_newest_first(
        &self,
        oid: ObjectId,
    ) -> impl Iterator<Item = (ObjVer, &DirtyEntry)> {
        self.dirty
            .range(Self::oid_range(oid))
            .rev()
            .map(|(k, v)| (*k, v))
    }

    /// Highest dirty version of an object
    #[must_use]
    pub fn max_dirty_version(&self, oid: ObjectId) -> Option<u64> {
        self.dirty
            .range(Self::oid_range(oid))
            .next_back()
            .map(|(k, _)| k.version)
    }

    /// Highest version known for an object, clean or dirty
    #[must_use]
    pub fn max_version(&self, oid: ObjectId) -> Option<u64> {
        let clean = self.clean.get(&oid).map(|c| c.version);
        match (clean, self.max_dirty_version(oid)) {
            (Some(c), Some(d)) => Some(c.max(d)),
            (c, d) => c.or(d),
        }
    }

    /// Invariant check: every dirty version is above its clean entry
    #[cfg(test)]
    pub fn check_version_order(&self) -> bool {
        self.dirty.keys().all(|ov| {
            self.clean
                .get(&ov.oid)
                .is_none_or(|c| c.version < ov.version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirty(state: VersionState) -> DirtyEntry {
        DirtyEntry {
            state,
            flags: 0,
            location: 0,
            offset: 0,
            len: 512,
            journal_seg: None,
        }
    }

    #[test]
    fn test_stability_predicate() {
        assert!(!VersionState::InFlight.is_stable());
        assert!(!VersionState::Journal(JournalStage::Synced).is_stable());
        assert!(VersionState::Journal(JournalStage::Stable).is_stable());
        assert!(VersionState::Journal(JournalStage::MoveSynced).is_stable());
        assert!(!VersionState::Big(BigStage::MetaSynced).is_stable());
        assert!(VersionState::Big(BigStage::MetaCommitted).is_stable());
        assert!(VersionState::Del(DelStage::Synced).is_stable());
        assert!(!VersionState::Del(DelStage::Moved).is_stable());
        assert!(VersionState::Current.is_stable());
    }

    #[test]
    fn test_journal_residency_predicate() {
        assert!(VersionState::Journal(JournalStage::MoveSynced).is_journal());
        assert!(!VersionState::Big(BigStage::Written).is_journal());
        assert!(!VersionState::InFlight.is_journal());
    }

    #[test]
    fn test_synced_predicate_gates_stabilize() {
        assert!(!VersionState::Journal(JournalStage::Written).is_synced());
        assert!(VersionState::Journal(JournalStage::Synced).is_synced());
        assert!(!VersionState::Big(BigStage::MetaWritten).is_synced());
        assert!(VersionState::Big(BigStage::MetaSynced).is_synced());
    }

    #[test]
    fn test_newest_first_walk_stays_within_oid() {
        let mut index = ObjectIndex::new();
        let a = ObjectId::new(1, 0);
        let b = ObjectId::new(1, 16);
        for v in 1..=3 {
            index
                .dirty
                .insert(ObjVer::new(a, v), dirty(VersionState::InFlight));
        }
        index
            .dirty
            .insert(ObjVer::new(b, 1), dirty(VersionState::InFlight));

        let versions: Vec<u64> = index.dirty_newest_first(a).map(|(ov, _)| ov.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(index.max_dirty_version(b), Some(1));
    }

    #[test]
    fn test_max_version_considers_clean() {
        let mut index = ObjectIndex::new();
        let oid = ObjectId::new(2, 0);
        index.clean.insert(
            oid,
            CleanEntry {
                version: 5,
                location: 0,
            },
        );
        assert_eq!(index.max_version(oid), Some(5));
        index
            .dirty
            .insert(ObjVer::new(oid, 7), dirty(VersionState::InFlight));
        assert_eq!(index.max_version(oid), Some(7));
        assert!(index.check_version_order());

        // A dirty version at or below the clean entry breaks the ordering
        index
            .dirty
            .insert(ObjVer::new(oid, 4), dirty(VersionState::InFlight));
        assert!(!index.check_version_order());
    }
}
