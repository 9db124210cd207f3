/// KV-cache block pool: allocation, content-addressed reuse, and freeing.
///
/// Owns every `Block` in the pool plus the bookkeeping structures needed to
/// hand them out: an ordered free list (FIFO, so recently-freed-but-still
/// populated blocks are reclaimed last and stay eligible for prefix reuse
/// the longest), the set of in-use block indices, and an advisory
/// content-hash map used to detect when a sequence's prompt prefix is
/// already resident from an earlier sequence.
use std::collections::{HashMap, HashSet, VecDeque};

use common::Sequence;
use xxhash_rust::xxh64::Xxh64;

use crate::block::Block;
use crate::error::{CacheError, Result};

pub struct BlockManager {
    block_size: usize,
    blocks: Vec<Block>,
    hash_to_block_id: HashMap<i64, usize>,
    free_block_ids: VecDeque<usize>,
    used_block_ids: HashSet<usize>,
}

impl BlockManager {
    pub fn new(num_blocks: usize, block_size: usize) -> Result<Self> {
        if num_blocks == 0 {
            return Err(CacheError::EmptyPool(num_blocks));
        }
        if block_size == 0 {
            return Err(CacheError::ZeroBlockSize);
        }

        Ok(Self {
            block_size,
            blocks: (0..num_blocks).map(Block::new).collect(),
            hash_to_block_id: HashMap::new(),
            free_block_ids: (0..num_blocks).collect(),
            used_block_ids: HashSet::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_block_ids.len()
    }

    /// Chains `prefix_hash` (the previous block's hash, or `-1` for the
    /// first block of a sequence) with this block's tokens, so the digest
    /// identifies the whole prefix path from token 0, not just this block's
    /// local content.
    ///
    /// Each token is fed as a full 8-byte little-endian word, matching the
    /// reference implementation's `np.array(token_ids, dtype=int64).tobytes()`
    /// encoding, not the 4-byte width `Sequence::token_ids` happens to store
    /// tokens in.
    pub fn compute_hash(tokens: &[u32], prefix_hash: i64) -> i64 {
        let mut hasher = Xxh64::new(0);
        if prefix_hash != -1 {
            hasher.update(&prefix_hash.to_le_bytes());
        }
        for &token in tokens {
            hasher.update(&(token as u64).to_le_bytes());
        }
        hasher.digest() as i64
    }

    fn allocate_block(&mut self, block_id: usize) -> &mut Block {
        assert_eq!(self.blocks[block_id].ref_count, 0, "double allocation of block {block_id}");
        self.blocks[block_id].reset();
        let removed = self.free_block_ids.iter().position(|&id| id == block_id);
        let pos = removed.expect("allocated block must be on the free list");
        self.free_block_ids.remove(pos);
        self.used_block_ids.insert(block_id);
        &mut self.blocks[block_id]
    }

    fn deallocate_block(&mut self, block_id: usize) {
        assert_eq!(self.blocks[block_id].ref_count, 0, "freeing block {block_id} with live refs");
        self.used_block_ids.remove(&block_id);
        self.free_block_ids.push_back(block_id);
    }

    pub fn can_allocate(&self, seq: &Sequence) -> bool {
        self.free_block_ids.len() >= seq.num_blocks()
    }

    /// Allocates the full block table for a freshly-admitted sequence,
    /// reusing content-addressed blocks wherever the chained hash matches
    /// an existing block whose stored tokens agree (collisions are
    /// possible and always validated, never trusted on hash alone).
    ///
    /// Caller must check `can_allocate` first; violating that precondition
    /// is a scheduler bug and panics here rather than failing softly.
    pub fn allocate(&mut self, seq: &mut Sequence) {
        assert!(seq.block_table.is_empty(), "allocate called on a sequence that already has blocks");
        assert!(self.can_allocate(seq), "allocate called without available capacity");

        let mut prefix_hash: i64 = -1;
        let mut cache_miss = false;

        for i in 0..seq.num_blocks() {
            let chunk = seq.block(i).to_vec();
            let hash = if chunk.len() == self.block_size {
                Self::compute_hash(&chunk, prefix_hash)
            } else {
                -1
            };
            prefix_hash = hash;

            if !cache_miss {
                match self.hash_to_block_id.get(&hash).copied() {
                    Some(block_id) if self.blocks[block_id].token_ids == chunk => {
                        log::trace!("seq {} block {i}: cache hit on block {block_id}", seq.seq_id);
                    }
                    _ => cache_miss = true,
                }
            }

            let block_id = if cache_miss {
                let block_id = self.free_block_ids[0];
                self.allocate_block(block_id);
                log::debug!("seq {} block {i}: cache miss, allocated fresh block {block_id}", seq.seq_id);
                block_id
            } else {
                let block_id = *self.hash_to_block_id.get(&hash).unwrap();
                if self.used_block_ids.contains(&block_id) {
                    self.blocks[block_id].ref_count += 1;
                } else {
                    self.allocate_block(block_id);
                }
                seq.num_cached_tokens += self.block_size;
                block_id
            };

            if hash != -1 {
                self.blocks[block_id].update(hash, chunk);
                self.hash_to_block_id.insert(hash, block_id);
            }

            seq.block_table.push(block_id);
        }
    }

    /// Whether a new block would need to be allocated on the next
    /// `may_append` for `seq`. Only true right after a token opens a fresh
    /// block (`len % block_size == 1`); a partial or just-filled block
    /// never needs new capacity to record the hash transition.
    pub fn can_append(&self, seq: &Sequence) -> bool {
        if seq.len() % self.block_size == 1 {
            !self.free_block_ids.is_empty()
        } else {
            true
        }
    }

    /// Applies the structural effect of the token most recently appended to
    /// `seq.token_ids`. Unconditional per decode step: even when no new
    /// block is allocated, a block that just became full still needs its
    /// hash computed and recorded.
    pub fn may_append(&mut self, seq: &mut Sequence) {
        let len = seq.len();
        let last_block_id = *seq.block_table.last().expect("may_append on a sequence with no blocks");

        match len % self.block_size {
            1 => {
                assert_ne!(self.blocks[last_block_id].hash, -1, "new token opened a block but the prior block is unhashed");
                let block_id = self.free_block_ids[0];
                self.allocate_block(block_id);
                seq.block_table.push(block_id);
            }
            0 => {
                assert_eq!(self.blocks[last_block_id].hash, -1, "tail block already hashed but just became full again");
                let chunk = seq.block(seq.num_blocks() - 1).to_vec();
                let prefix = if seq.block_table.len() > 1 {
                    let prev = seq.block_table[seq.block_table.len() - 2];
                    self.blocks[prev].hash
                } else {
                    -1
                };
                let hash = Self::compute_hash(&chunk, prefix);
                self.blocks[last_block_id].update(hash, chunk);
                self.hash_to_block_id.insert(hash, last_block_id);
            }
            _ => {
                assert_eq!(self.blocks[last_block_id].hash, -1, "partial block unexpectedly hashed");
            }
        }
    }

    /// Releases every block this sequence references, decrementing
    /// ref-counts and returning fully-unreferenced blocks to the free list.
    /// Freed blocks keep their hash and tokens so a later sequence with the
    /// same prefix can revive them instead of recomputing.
    pub fn deallocate(&mut self, seq: &mut Sequence) {
        for &block_id in seq.block_table.iter().rev() {
            let block = &mut self.blocks[block_id];
            block.ref_count -= 1;
            if block.ref_count == 0 {
                self.deallocate_block(block_id);
            }
        }
        seq.num_cached_tokens = 0;
        seq.block_table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Sequence, SamplingParams};

    fn params() -> SamplingParams {
        SamplingParams { temperature: 1.0, max_tokens: 64, ignore_eos: false }
    }

    fn seq(tokens: Vec<u32>) -> Sequence {
        Sequence::with_block_size(tokens, params(), 4)
    }

    #[test]
    fn new_rejects_empty_pool() {
        assert!(BlockManager::new(0, 4).is_err());
    }

    #[test]
    fn new_rejects_zero_block_size() {
        assert!(BlockManager::new(8, 0).is_err());
    }

    // S1 — single sequence, no sharing.
    #[test]
    fn s1_single_sequence_no_sharing() {
        let mut bm = BlockManager::new(8, 4).unwrap();
        let mut s = seq(vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(bm.can_allocate(&s));
        bm.allocate(&mut s);

        assert_eq!(s.num_blocks(), 2);
        assert_eq!(s.block_table.len(), 2);
        assert_ne!(s.block_table[0], s.block_table[1]);
        assert_eq!(s.num_cached_tokens, 0);
        assert_eq!(bm.num_free_blocks(), 6);
    }

    // S2 — prefix reuse across sequences.
    #[test]
    fn s2_prefix_reuse() {
        let mut bm = BlockManager::new(8, 4).unwrap();
        let mut first = seq(vec![1, 2, 3, 4, 9]);
        bm.allocate(&mut first);
        bm.deallocate(&mut first);

        let mut second = seq(vec![1, 2, 3, 4, 7, 8, 9]);
        bm.allocate(&mut second);

        assert_eq!(second.block_table[0], first.block_table[0]);
        assert_eq!(second.num_cached_tokens, 4);
    }

    // S3 — decode crossing into a new block.
    #[test]
    fn s3_decode_triggers_new_block() {
        let mut bm = BlockManager::new(8, 4).unwrap();
        let mut s = seq(vec![1, 2, 3, 4]);
        bm.allocate(&mut s);
        assert_ne!(bm_last_block_hash(&bm, &s), -1);

        s.append_token(5);
        assert!(bm.can_append(&s));
        bm.may_append(&mut s);

        assert_eq!(s.len(), 5);
        assert_eq!(s.block_table.len(), 2);
        assert_eq!(bm_last_block_hash(&bm, &s), -1);
    }

    // S4 — block boundary hashing.
    #[test]
    fn s4_block_boundary_hashing() {
        let mut bm = BlockManager::new(8, 4).unwrap();
        let mut s = seq(vec![1, 2, 3]);
        bm.allocate(&mut s);
        assert_eq!(bm_last_block_hash(&bm, &s), -1);

        s.append_token(4);
        bm.may_append(&mut s);

        let expected = BlockManager::compute_hash(&[1, 2, 3, 4], -1);
        assert_eq!(bm_last_block_hash(&bm, &s), expected);
    }

    fn bm_last_block_hash(bm: &BlockManager, s: &Sequence) -> i64 {
        let block_id = *s.block_table.last().unwrap();
        bm.blocks[block_id].hash
    }

    #[test]
    fn deallocate_clears_block_table_and_refcounts() {
        let mut bm = BlockManager::new(8, 4).unwrap();
        let mut s = seq(vec![1, 2, 3, 4, 5]);
        bm.allocate(&mut s);
        let blocks = s.block_table.clone();
        bm.deallocate(&mut s);

        assert!(s.block_table.is_empty());
        assert_eq!(s.num_cached_tokens, 0);
        for block_id in blocks {
            assert_eq!(bm.blocks[block_id].ref_count, 0);
        }
        assert_eq!(bm.num_free_blocks(), 8);
    }

    #[test]
    fn reallocating_identical_prompt_is_fully_cached() {
        let mut bm = BlockManager::new(8, 4).unwrap();
        let mut first = seq(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        bm.allocate(&mut first);
        bm.deallocate(&mut first);

        let mut second = seq(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        bm.allocate(&mut second);

        assert_eq!(second.num_cached_tokens, second.num_prompt_tokens);
    }
}
