//! Inode table: ino → inode-info, separately chained.
//!
//! The bucket count is a mount-time tunable (the historical default is
//! 33377) and the table rehashes into twice as many buckets when the
//! entry count exceeds twice the bucket count. Misuse — inserting a
//! duplicate, removing a non-member — is a programming error and panics.

use crate::inode::InodeInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use toyfs_types::InodeNumber;
use tracing::debug;

/// Historical bucket count carried over from the reference implementation.
pub const DEFAULT_ITABLE_BUCKETS: usize = 33377;

struct ItableInner {
    buckets: Vec<Vec<Arc<InodeInfo>>>,
    count: usize,
}

impl ItableInner {
    #[allow(clippy::cast_possible_truncation)] // modulo bucket count fits usize
    fn slot_of(&self, ino: InodeNumber) -> usize {
        (ino.0 % self.buckets.len() as u64) as usize
    }

    fn rehash(&mut self, new_buckets: usize) {
        let old = std::mem::replace(&mut self.buckets, vec![Vec::new(); new_buckets]);
        for chain in old {
            for ii in chain {
                let slot = self.slot_of(ii.ino());
                self.buckets[slot].insert(0, ii);
            }
        }
    }
}

/// The per-mount inode table.
pub struct Itable {
    inner: Mutex<ItableInner>,
}

impl Itable {
    /// Build a table with the given bucket count (must be non-zero).
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        assert!(buckets > 0, "inode table needs at least one bucket");
        Self {
            inner: Mutex::new(ItableInner {
                buckets: vec![Vec::new(); buckets],
                count: 0,
            }),
        }
    }

    /// Look up a live inode by number.
    #[must_use]
    pub fn find(&self, ino: InodeNumber) -> Option<Arc<InodeInfo>> {
        let inner = self.inner.lock();
        let slot = inner.slot_of(ino);
        inner.buckets[slot]
            .iter()
            .find(|ii| ii.ino() == ino)
            .cloned()
    }

    /// Insert a bound inode-info. Inserting the same inode number twice is
    /// a programming error.
    pub fn insert(&self, ii: Arc<InodeInfo>) {
        let ino = ii.ino();
        let mut inner = self.inner.lock();
        let slot = inner.slot_of(ino);
        assert!(
            !inner.buckets[slot].iter().any(|e| e.ino() == ino),
            "duplicate itable insert for inode {ino}"
        );
        inner.buckets[slot].insert(0, ii);
        inner.count += 1;

        // Grow when chains get long on average; inode numbers are dense so
        // doubling keeps the distribution flat.
        if inner.count > 2 * inner.buckets.len() {
            let new_buckets = inner.buckets.len() * 2;
            debug!(count = inner.count, new_buckets, "itable rehash");
            inner.rehash(new_buckets);
        }
    }

    /// Remove by identity. Removing an inode-info that is not a member is
    /// a programming error.
    pub fn remove(&self, ii: &InodeInfo) {
        let ino = ii.ino();
        let mut inner = self.inner.lock();
        assert!(inner.count > 0, "itable remove on empty table");
        let slot = inner.slot_of(ino);
        let pos = inner.buckets[slot]
            .iter()
            .position(|e| std::ptr::eq(e.as_ref(), ii))
            .unwrap_or_else(|| panic!("itable remove of non-member inode {ino}"));
        inner.buckets[slot].remove(pos);
        inner.count -= 1;
    }

    /// Live inode count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count (grows under load).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Drop every entry (unmount path).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for chain in &mut inner.buckets {
            chain.clear();
        }
        inner.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::test_support::bound_info;

    #[test]
    fn find_absent_returns_none() {
        let table = Itable::new(7);
        assert!(table.find(InodeNumber(42)).is_none());
    }

    #[test]
    fn insert_find_remove() {
        let table = Itable::new(7);
        let a = bound_info(InodeNumber(1));
        let b = bound_info(InodeNumber(8)); // collides with 1 mod 7

        table.insert(a.clone());
        table.insert(b.clone());
        assert_eq!(table.len(), 2);

        assert!(Arc::ptr_eq(&table.find(InodeNumber(1)).unwrap(), &a));
        assert!(Arc::ptr_eq(&table.find(InodeNumber(8)).unwrap(), &b));

        table.remove(&a);
        assert!(table.find(InodeNumber(1)).is_none());
        assert!(table.find(InodeNumber(8)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate itable insert")]
    fn duplicate_insert_panics() {
        let table = Itable::new(7);
        let a = bound_info(InodeNumber(5));
        table.insert(a.clone());
        table.insert(a);
    }

    #[test]
    #[should_panic(expected = "non-member")]
    fn remove_non_member_panics() {
        let table = Itable::new(7);
        table.insert(bound_info(InodeNumber(1)));
        let stranger = bound_info(InodeNumber(1));
        table.remove(&stranger);
    }

    #[test]
    fn rehash_preserves_entries() {
        let table = Itable::new(3);
        let infos: Vec<_> = (1..=20)
            .map(|i| {
                let ii = bound_info(InodeNumber(i));
                table.insert(ii.clone());
                ii
            })
            .collect();

        assert!(table.bucket_count() > 3, "table grew under load");
        for (i, ii) in infos.iter().enumerate() {
            let found = table.find(InodeNumber(i as u64 + 1)).unwrap();
            assert!(Arc::ptr_eq(&found, ii));
        }
    }
}
