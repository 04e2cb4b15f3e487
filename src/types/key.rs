//! Key ordering and the composite duplicate-key scheme.
//!
//! The tree itself only supports unique keys. Duplicate user keys are
//! handled at the call site by composing `(prefix, tag)` pairs: the
//! prefix identifies the user key, the tag disambiguates, and the full
//! ordering keeps every composed key unique. `find` matches under the
//! coarser prefix ordering, so it collects every tag stored for one
//! user key.

use std::cmp::Ordering;

use crate::types::FixedBytes;

/// Three-way key ordering capability.
///
/// `cmp` is the total order the tree is sorted by. `cmp_prefix` is the
/// coarser equivalence used by `find`; for plain keys it is the same
/// relation.
pub trait KeyComparator<K>: Default {
    /// Full ordering between two stored keys
    fn cmp(&self, a: &K, b: &K) -> Ordering;

    /// Prefix ordering used for lookups over composite keys
    fn cmp_prefix(&self, a: &K, b: &K) -> Ordering {
        self.cmp(a, b)
    }
}

/// Comparator for keys with a natural total order
#[derive(Debug, Default, Clone, Copy)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    fn cmp(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// A composite key: a 64-bit prefix plus a 32-bit disambiguating tag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeKey {
    /// User-key component, typically a string hash
    pub prefix: u64,
    /// Disambiguator making the composed key unique
    pub tag: i32,
}

impl CompositeKey {
    /// Compose a key from its components
    pub const fn new(prefix: u64, tag: i32) -> Self {
        Self { prefix, tag }
    }
}

impl FixedBytes for CompositeKey {
    const WIDTH: usize = 12;

    fn write_to(&self, buf: &mut [u8]) {
        self.prefix.write_to(&mut buf[..8]);
        self.tag.write_to(&mut buf[8..12]);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            prefix: u64::read_from(&buf[..8]),
            tag: i32::read_from(&buf[8..12]),
        }
    }
}

/// Comparator for [`CompositeKey`]: full order over `(prefix, tag)`,
/// prefix-only order for lookups.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositeKeyComparator;

impl KeyComparator<CompositeKey> for CompositeKeyComparator {
    fn cmp(&self, a: &CompositeKey, b: &CompositeKey) -> Ordering {
        a.prefix.cmp(&b.prefix).then(a.tag.cmp(&b.tag))
    }

    fn cmp_prefix(&self, a: &CompositeKey, b: &CompositeKey) -> Ordering {
        a.prefix.cmp(&b.prefix)
    }
}
