/// A single fixed-size slot of KV-cache memory, identified by its index in
/// the pool's block array.
///
/// `hash` is `-1` when the block isn't content-addressable (empty, or
/// holding a partial chunk smaller than the pool's block size). A block is
/// free iff `ref_count == 0`; `BlockManager` is the sole owner of that
/// transition, `Block` itself only carries the state.
#[derive(Debug, Clone)]
pub struct Block {
    pub block_id: usize,
    pub ref_count: usize,
    pub hash: i64,
    pub token_ids: Vec<u32>,
}

impl Block {
    pub fn new(block_id: usize) -> Self {
        Self { block_id, ref_count: 0, hash: -1, token_ids: Vec::new() }
    }

    /// Records content-addressed ownership of `token_ids` under `hash`.
    pub fn update(&mut self, hash: i64, token_ids: Vec<u32>) {
        self.hash = hash;
        self.token_ids = token_ids;
    }

    /// Prepares a free block for reuse by a fresh allocation: single owner,
    /// no stale hash or content until `update` is called again.
    pub fn reset(&mut self) {
        self.ref_count = 1;
        self.hash = -1;
        self.token_ids.clear();
    }
}
