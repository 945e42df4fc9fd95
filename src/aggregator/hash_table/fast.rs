//! Open-addressing table probing 16 tags at a time.
//!
//! Slots are grouped in blocks of 16 one-byte tags plus 16 record pointers.
//! A tag is the low 7 bits of the key hash; [`EMPTY`] has the high bit set,
//! so the two never collide. Probing is linear over blocks. Records are
//! never removed, so a block with a free slot ends every probe sequence that
//! passes through it.

use crate::aggregator::allocator::{AllocError, Arena};

use super::{hash_key, RecordPtr, RecordTable};

const LANES: usize = 16;
const EMPTY: u8 = 0x80;

/// Default number of blocks of a new table.
pub const INITIAL_BLOCKS: usize = 4096;

#[derive(Clone, Copy)]
struct Block {
    tags: [u8; LANES],
    records: [Option<RecordPtr>; LANES],
}

impl Block {
    const EMPTY: Block = Block {
        tags: [EMPTY; LANES],
        records: [None; LANES],
    };
}

enum Probe {
    Found(RecordPtr),
    Vacant { block: usize, lane: usize },
}

/// Lanes whose tag equals `tag`, and lanes that are empty, as bit masks.
#[cfg(target_arch = "x86_64")]
#[inline]
fn match_block(tags: &[u8; LANES], tag: u8) -> (u32, u32) {
    use std::arch::x86_64::{_mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8};

    // SAFETY: SSE2 is part of the x86_64 baseline and the load is unaligned.
    unsafe {
        let group = _mm_loadu_si128(tags.as_ptr().cast());
        let hits = _mm_movemask_epi8(_mm_cmpeq_epi8(group, _mm_set1_epi8(tag as i8)));
        let empty = _mm_movemask_epi8(_mm_cmpeq_epi8(group, _mm_set1_epi8(EMPTY as i8)));
        (hits as u32, empty as u32)
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn match_block(tags: &[u8; LANES], tag: u8) -> (u32, u32) {
    let mut hits = 0u32;
    let mut empty = 0u32;
    for (i, &t) in tags.iter().enumerate() {
        hits |= u32::from(t == tag) << i;
        empty |= u32::from(t == EMPTY) << i;
    }
    (hits, empty)
}

#[inline]
fn tag_of(hash: u64) -> u8 {
    (hash & 0xFF) as u8 & !EMPTY
}

/// Record table with SIMD tag matching.
pub struct FastHashTable {
    blocks: Vec<Block>,
    items: Vec<RecordPtr>,
    arena: Arena,
    key_size: usize,
    record_size: usize,
    grow_count: usize,
}

impl FastHashTable {
    /// Creates a table starting with `blocks` blocks, rounded up to a power
    /// of two.
    pub fn with_blocks(key_size: usize, record_size: usize, blocks: usize) -> Self {
        Self {
            blocks: vec![Block::EMPTY; blocks.max(1).next_power_of_two()],
            items: Vec::new(),
            arena: Arena::new(),
            key_size,
            record_size,
            grow_count: 0,
        }
    }

    /// Current number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// How many times the table has doubled.
    pub fn grow_count(&self) -> usize {
        self.grow_count
    }

    #[inline]
    fn probe(&self, key: &[u8], hash: u64) -> Probe {
        let tag = tag_of(hash);
        let mask = self.blocks.len() - 1;
        let mut index = (hash >> 7) as usize & mask;

        loop {
            let block = &self.blocks[index];
            let (mut hits, empty) = match_block(&block.tags, tag);

            while hits != 0 {
                let lane = hits.trailing_zeros() as usize;
                if let Some(rec) = block.records[lane] {
                    // SAFETY: records live in our arena and are at least
                    // `key_size` bytes long.
                    if unsafe { rec.as_slice(self.key_size) } == key {
                        return Probe::Found(rec);
                    }
                }
                hits &= hits - 1;
            }

            if empty != 0 {
                return Probe::Vacant {
                    block: index,
                    lane: empty.trailing_zeros() as usize,
                };
            }

            index = (index + 1) & mask;
        }
    }

    #[inline]
    fn needs_grow(&self) -> bool {
        // Load factor of 0.95.
        (self.items.len() + 1) * 20 >= self.blocks.len() * LANES * 19
    }

    /// Doubles the block count and re-inserts every record pointer.
    fn grow(&mut self) -> Result<(), AllocError> {
        let new_len = self.blocks.len() * 2;
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(new_len)
            .map_err(|_| AllocError {
                size: new_len * std::mem::size_of::<Block>(),
            })?;
        blocks.resize(new_len, Block::EMPTY);
        self.blocks = blocks;

        let mask = new_len - 1;
        for &rec in &self.items {
            // SAFETY: see `probe`.
            let hash = hash_key(unsafe { rec.as_slice(self.key_size) });
            let mut index = (hash >> 7) as usize & mask;
            loop {
                let block = &mut self.blocks[index];
                let (_, empty) = match_block(&block.tags, EMPTY);
                if empty != 0 {
                    let lane = empty.trailing_zeros() as usize;
                    block.tags[lane] = tag_of(hash);
                    block.records[lane] = Some(rec);
                    break;
                }
                index = (index + 1) & mask;
            }
        }

        self.grow_count += 1;
        Ok(())
    }
}

impl RecordTable for FastHashTable {
    fn new(key_size: usize, record_size: usize) -> Self {
        Self::with_blocks(key_size, record_size, INITIAL_BLOCKS)
    }

    #[inline]
    fn find(&self, key: &[u8]) -> Option<RecordPtr> {
        match self.probe(key, hash_key(key)) {
            Probe::Found(rec) => Some(rec),
            Probe::Vacant { .. } => None,
        }
    }

    #[inline]
    fn find_or_create(&mut self, key: &[u8]) -> Result<(RecordPtr, bool), AllocError> {
        let hash = hash_key(key);
        let (block, lane) = loop {
            match self.probe(key, hash) {
                Probe::Found(rec) => return Ok((rec, true)),
                Probe::Vacant { .. } if self.needs_grow() => self.grow()?,
                Probe::Vacant { block, lane } => break (block, lane),
            }
        };

        let ptr = self.arena.allocate(self.record_size)?;
        let rec = RecordPtr::new(ptr);
        // SAFETY: freshly allocated, `record_size >= key_size` bytes, and not
        // referenced anywhere else yet.
        unsafe { rec.as_mut_slice(self.key_size) }.copy_from_slice(key);

        let block = &mut self.blocks[block];
        block.tags[lane] = tag_of(hash);
        block.records[lane] = Some(rec);
        self.items.push(rec);

        Ok((rec, false))
    }

    fn items(&self) -> &[RecordPtr] {
        &self.items
    }

    fn items_mut(&mut self) -> &mut [RecordPtr] {
        &mut self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::hash_table::tests::{check_contract, check_many};

    #[test]
    fn test_contract() {
        check_contract::<FastHashTable>();
    }

    #[test]
    fn test_many_keys() {
        check_many::<FastHashTable>(50_000);
    }

    #[test]
    fn test_tags_never_empty() {
        for hash in [0u64, 0x80, 0xFF, 0x7F, u64::MAX] {
            assert_ne!(tag_of(hash), EMPTY);
            assert!(tag_of(hash) < 0x80);
        }
    }

    #[test]
    fn test_match_block_masks() {
        let mut tags = [EMPTY; LANES];
        tags[0] = 5;
        tags[3] = 5;
        tags[7] = 9;
        let (hits, empty) = match_block(&tags, 5);
        assert_eq!(hits, 0b1001);
        assert_eq!(empty, 0xFFFF & !0b1000_1001);
    }

    #[test]
    fn test_growth_preserves_records() {
        let mut table = FastHashTable::with_blocks(8, 16, 1);
        let mut before = Vec::new();
        for i in 0..2_000u64 {
            let (rec, _) = table.find_or_create(&i.to_ne_bytes()).expect("create");
            unsafe { rec.as_mut_slice(16)[8..].copy_from_slice(&(i * 3).to_ne_bytes()) };
            before.push(rec);
        }

        assert!(table.grow_count() >= 3, "grew {} times", table.grow_count());
        assert_eq!(table.len(), 2_000);
        for (i, rec) in before.iter().enumerate() {
            let key = (i as u64).to_ne_bytes();
            assert_eq!(table.find(&key), Some(*rec));
            let value = unsafe { rec.as_slice(16) };
            assert_eq!(&value[8..], &(i as u64 * 3).to_ne_bytes());
        }
    }

    #[test]
    fn test_empty_key() {
        let mut table = FastHashTable::with_blocks(0, 8, 1);
        let (a, found) = table.find_or_create(&[]).expect("create");
        assert!(!found);
        let (b, found) = table.find_or_create(&[]).expect("find");
        assert!(found);
        assert_eq!(a, b);
    }
}
