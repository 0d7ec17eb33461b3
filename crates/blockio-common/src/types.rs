//! Core identifier types for BlockIO
//!
//! Objects are fixed-size stripes of an inode's data. The identifier is a
//! 16-byte `(inode, stripe)` pair; the low 4 bits of `stripe` carry the
//! replica index so that replicas of one logical stripe sort together.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of low bits of `stripe` reserved for the replica index
pub const STRIPE_REPLICA_BITS: u32 = 4;

/// Identifier of one fixed-size object (a stripe replica)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub inode: u64,
    pub stripe: u64,
}

impl ObjectId {
    /// Serialized size on disk
    pub const SIZE: usize = 16;

    #[must_use]
    pub const fn new(inode: u64, stripe: u64) -> Self {
        Self { inode, stripe }
    }

    /// Logical stripe number (replica bits stripped)
    #[must_use]
    pub const fn stripe_num(&self) -> u64 {
        self.stripe >> STRIPE_REPLICA_BITS
    }

    /// Replica index within the stripe
    #[must_use]
    pub const fn replica(&self) -> u64 {
        self.stripe & ((1 << STRIPE_REPLICA_BITS) - 1)
    }

    /// A zero oid marks a free metadata slot
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.inode == 0 && self.stripe == 0
    }

    /// Serialize to the on-disk 16-byte representation
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.inode.to_le_bytes());
        buf[8..].copy_from_slice(&self.stripe.to_le_bytes());
        buf
    }

    /// Parse from the on-disk 16-byte representation
    ///
    /// # Panics
    /// Panics if `data` is shorter than [`Self::SIZE`].
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let inode = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let stripe = u64::from_le_bytes(data[8..16].try_into().unwrap());
        Self { inode, stripe }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}/{})", self.inode, self.stripe)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}",
            self.inode,
            self.stripe_num(),
            self.replica()
        )
    }
}

/// An object identifier paired with a version.
///
/// Derived ordering is lexicographic `(oid, version)`, which is exactly the
/// dirty-index key order: all versions of one object are adjacent, oldest
/// first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjVer {
    pub oid: ObjectId,
    pub version: u64,
}

impl ObjVer {
    #[must_use]
    pub const fn new(oid: ObjectId, version: u64) -> Self {
        Self { oid, version }
    }
}

impl fmt::Debug for ObjVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjVer({} v{})", self.oid, self.version)
    }
}

impl fmt::Display for ObjVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.oid, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_roundtrip() {
        let oid = ObjectId::new(7, (42 << STRIPE_REPLICA_BITS) | 3);
        let parsed = ObjectId::from_bytes(&oid.to_bytes());
        assert_eq!(oid, parsed);
        assert_eq!(parsed.stripe_num(), 42);
        assert_eq!(parsed.replica(), 3);
    }

    #[test]
    fn test_oid_ordering() {
        let a = ObjectId::new(1, 100);
        let b = ObjectId::new(1, 101);
        let c = ObjectId::new(2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_objver_ordering_groups_by_oid() {
        let oid = ObjectId::new(5, 0);
        let older = ObjVer::new(oid, 1);
        let newer = ObjVer::new(oid, 2);
        let other = ObjVer::new(ObjectId::new(5, 16), 1);
        assert!(older < newer);
        assert!(newer < other);
    }

    #[test]
    fn test_zero_oid() {
        assert!(ObjectId::new(0, 0).is_zero());
        assert!(!ObjectId::new(0, 1).is_zero());
    }
}
