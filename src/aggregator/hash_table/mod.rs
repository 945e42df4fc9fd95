//! Record tables keyed by the raw key prefix of each record.

pub mod fallback;
pub mod fast;

use std::ptr::NonNull;

use super::allocator::AllocError;

pub use self::fallback::FallbackHashTable;
pub use self::fast::FastHashTable;

/// Pointer to a record inside a table's arena.
///
/// Valid for as long as the owning table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPtr(NonNull<u8>);

// SAFETY: a record pointer is only dereferenced through the table that owns
// its arena, and tables move between threads as a whole.
unsafe impl Send for RecordPtr {}
unsafe impl Sync for RecordPtr {}

impl RecordPtr {
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// # Safety
    ///
    /// The owning table must outlive `'a` and `len` must not exceed the
    /// record size.
    #[inline]
    pub(crate) unsafe fn as_slice<'a>(self, len: usize) -> &'a [u8] {
        std::slice::from_raw_parts(self.0.as_ptr(), len)
    }

    /// # Safety
    ///
    /// As [`as_slice`](Self::as_slice), and no other reference to the record
    /// may be live for `'a`.
    #[inline]
    pub(crate) unsafe fn as_mut_slice<'a>(self, len: usize) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.0.as_ptr(), len)
    }
}

/// Map from key bytes to a fixed-size record whose first bytes are the key.
pub trait RecordTable: Send {
    /// Creates an empty table for records of `record_size` bytes whose
    /// first `key_size` bytes are the key.
    fn new(key_size: usize, record_size: usize) -> Self
    where
        Self: Sized;

    /// Looks up the record for `key`.
    fn find(&self, key: &[u8]) -> Option<RecordPtr>;

    /// Looks up the record for `key`, creating it if missing.
    ///
    /// Returns the record and whether it already existed. A new record holds
    /// the key followed by zeroed value bytes.
    fn find_or_create(&mut self, key: &[u8]) -> Result<(RecordPtr, bool), AllocError>;

    /// All records in insertion order, or in the last order set through
    /// [`items_mut`](Self::items_mut).
    fn items(&self) -> &[RecordPtr];

    fn items_mut(&mut self) -> &mut [RecordPtr];

    fn len(&self) -> usize {
        self.items().len()
    }

    fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

/// 64-bit hash of a key.
#[inline]
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(key)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Shared contract checks run against every table implementation.
    pub(crate) fn check_contract<T: RecordTable>() {
        let mut table = T::new(4, 12);
        assert!(table.is_empty());

        let (rec, found) = table.find_or_create(&[1, 2, 3, 4]).expect("create");
        assert!(!found);
        let bytes = unsafe { rec.as_mut_slice(12) };
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert!(bytes[4..].iter().all(|&b| b == 0));
        bytes[4] = 42;

        let (again, found) = table.find_or_create(&[1, 2, 3, 4]).expect("find");
        assert!(found);
        assert_eq!(again, rec);
        assert_eq!(unsafe { again.as_slice(12) }[4], 42);

        assert_eq!(table.find(&[1, 2, 3, 4]), Some(rec));
        assert!(table.find(&[4, 3, 2, 1]).is_none());
        assert_eq!(table.len(), 1);
    }

    /// Inserts `n` distinct keys and verifies every lookup afterwards.
    pub(crate) fn check_many<T: RecordTable>(n: u32) -> T {
        let mut table = T::new(4, 8);
        let mut ptrs = Vec::with_capacity(n as usize);
        for i in 0..n {
            let (rec, found) = table.find_or_create(&i.to_le_bytes()).expect("create");
            assert!(!found);
            unsafe { rec.as_mut_slice(8)[4..].copy_from_slice(&i.to_be_bytes()) };
            ptrs.push(rec);
        }

        assert_eq!(table.len(), n as usize);
        for i in 0..n {
            let rec = table.find(&i.to_le_bytes()).expect("present");
            assert_eq!(rec, ptrs[i as usize]);
            assert_eq!(&unsafe { rec.as_slice(8) }[4..], &i.to_be_bytes());
        }
        assert!(table.find(&n.to_le_bytes()).is_none());
        table
    }
}
