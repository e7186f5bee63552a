//! Surrogate key allocation.
//!
//! One independent key space per table. Keys start at 1 and grow by one;
//! the unknown member's -1 is never allocated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::{SurrogateKey, TableId};

/// Last issued key per table, persisted with every commit.
pub type KeyHighWater = BTreeMap<TableId, i64>;

/// Hands out surrogate keys.
pub trait KeyAllocator: Send + Sync {
    /// Returns a key never returned before for `table`, greater than every
    /// earlier one.
    fn allocate(&self, table: TableId) -> SurrogateKey;

    /// Raises the high-water mark of `table` to at least `key`.
    fn observe(&self, table: TableId, key: SurrogateKey);

    /// Last key issued for `table`, or 0.
    fn high_water(&self, table: TableId) -> i64;

    /// High-water marks of every table.
    fn snapshot(&self) -> KeyHighWater {
        TableId::all()
            .into_iter()
            .map(|table| (table, self.high_water(table)))
            .collect()
    }

    /// Resumes from persisted high-water marks.
    fn resume(&self, marks: &KeyHighWater) {
        for (table, key) in marks {
            self.observe(*table, SurrogateKey::new(*key));
        }
    }
}

/// Lock-free allocator backed by one atomic counter per table.
#[derive(Debug)]
pub struct AtomicKeyAllocator {
    last: [AtomicI64; TableId::COUNT],
}

impl Default for AtomicKeyAllocator {
    fn default() -> Self {
        Self {
            last: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }
}

impl AtomicKeyAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyAllocator for AtomicKeyAllocator {
    fn allocate(&self, table: TableId) -> SurrogateKey {
        let previous = self.last[table.index()].fetch_add(1, Ordering::AcqRel);
        SurrogateKey::new(previous + 1)
    }

    fn observe(&self, table: TableId, key: SurrogateKey) {
        self.last[table.index()].fetch_max(key.get(), Ordering::AcqRel);
    }

    fn high_water(&self, table: TableId) -> i64 {
        self.last[table.index()].load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DimensionKind, EntityKind};

    #[test]
    fn keys_start_at_one_per_table() {
        let alloc = AtomicKeyAllocator::new();
        let country = TableId::Conformed(EntityKind::Country);
        let dim = TableId::Dimension(DimensionKind::Product);
        assert_eq!(alloc.allocate(country), SurrogateKey::new(1));
        assert_eq!(alloc.allocate(country), SurrogateKey::new(2));
        assert_eq!(alloc.allocate(dim), SurrogateKey::new(1));
    }

    #[test]
    fn observe_never_lowers_the_mark() {
        let alloc = AtomicKeyAllocator::new();
        let table = TableId::Facts;
        alloc.observe(table, SurrogateKey::new(10));
        alloc.observe(table, SurrogateKey::new(3));
        alloc.observe(table, SurrogateKey::new(-1));
        assert_eq!(alloc.allocate(table), SurrogateKey::new(11));
    }

    #[test]
    fn snapshot_resume_roundtrip() {
        let alloc = AtomicKeyAllocator::new();
        let table = TableId::Conformed(EntityKind::Order);
        alloc.allocate(table);
        alloc.allocate(table);

        let resumed = AtomicKeyAllocator::new();
        resumed.resume(&alloc.snapshot());
        assert_eq!(resumed.allocate(table), SurrogateKey::new(3));
    }
}
