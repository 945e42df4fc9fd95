//! Portable record table on top of `hashbrown`.

use hashbrown::hash_table::{Entry, HashTable};

use crate::aggregator::allocator::{AllocError, Arena};

use super::{hash_key, RecordPtr, RecordTable};

/// Record table without SIMD tag matching, same contract as
/// [`FastHashTable`](super::FastHashTable).
pub struct FallbackHashTable {
    table: HashTable<RecordPtr>,
    items: Vec<RecordPtr>,
    arena: Arena,
    key_size: usize,
    record_size: usize,
}

impl RecordTable for FallbackHashTable {
    fn new(key_size: usize, record_size: usize) -> Self {
        Self {
            table: HashTable::new(),
            items: Vec::new(),
            arena: Arena::new(),
            key_size,
            record_size,
        }
    }

    fn find(&self, key: &[u8]) -> Option<RecordPtr> {
        let key_size = self.key_size;
        // SAFETY: records live in our arena and hold `key_size` key bytes.
        self.table
            .find(hash_key(key), |rec| unsafe { rec.as_slice(key_size) } == key)
            .copied()
    }

    fn find_or_create(&mut self, key: &[u8]) -> Result<(RecordPtr, bool), AllocError> {
        let key_size = self.key_size;
        let entry = self.table.entry(
            hash_key(key),
            |rec| unsafe { rec.as_slice(key_size) } == key,
            |rec| hash_key(unsafe { rec.as_slice(key_size) }),
        );

        match entry {
            Entry::Occupied(e) => Ok((*e.get(), true)),
            Entry::Vacant(e) => {
                let rec = RecordPtr::new(self.arena.allocate(self.record_size)?);
                // SAFETY: freshly allocated and not referenced elsewhere.
                unsafe { rec.as_mut_slice(key_size) }.copy_from_slice(key);
                e.insert(rec);
                self.items.push(rec);
                Ok((rec, false))
            }
        }
    }

    fn items(&self) -> &[RecordPtr] {
        &self.items
    }

    fn items_mut(&mut self) -> &mut [RecordPtr] {
        &mut self.items
    }
}
