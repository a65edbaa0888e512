//! The circular doubly-linked block ring, as a stable-index arena.
//!
//! Per DESIGN NOTES §9 ("classic arena pattern"): rather than porting `mmapBlock::prev`/`next`
//! raw pointers directly, blocks live in a `Vec` and ring links are `usize` indices. Each slot
//! holds an `Arc<Block>` rather than a bare `Block`, so a caller can clone a handle to the
//! current write/persist cursor, drop the ring lock, and operate on the block (append, drain)
//! without holding up unrelated ring growth.

use std::sync::Arc;

use crate::block::Block;

/// A stable index into a [`Ring`]'s block arena.
pub type BlockId = usize;

/// The circular doubly-linked list of blocks, plus the growth policy.
///
/// Holds only the ring topology and storage; cursors, persistence bookkeeping, and
/// coordination live on [`crate::buffer::Buffer`], which owns a `Ring`.
pub struct Ring {
    blocks: Vec<Arc<Block>>,
    next: Vec<BlockId>,
    prev: Vec<BlockId>,
    max_block_count: usize,
}

impl Ring {
    /// Builds a ring from an already-constructed, non-empty list of blocks, linking them in a
    /// cycle in the order given.
    pub fn new(blocks: Vec<Block>, max_block_count: usize) -> Ring {
        assert!(!blocks.is_empty(), "ring must start with at least one block");
        let len = blocks.len();
        let next = (0..len).map(|i| (i + 1) % len).collect();
        let prev = (0..len).map(|i| (i + len - 1) % len).collect();
        Ring {
            blocks: blocks.into_iter().map(Arc::new).collect(),
            next,
            prev,
            max_block_count,
        }
    }

    pub fn head(&self) -> BlockId {
        0
    }

    /// Clones a cheap, independently-owned handle to the block at `id`.
    ///
    /// Safe to hold onto after releasing whatever lock guarded this `Ring` borrow: blocks are
    /// never removed from the arena except when the whole `Buffer` tears down.
    pub fn get(&self, id: BlockId) -> Arc<Block> {
        Arc::clone(&self.blocks[id])
    }

    pub fn next(&self, id: BlockId) -> BlockId {
        self.next[id]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn max_block_count(&self) -> usize {
        self.max_block_count
    }

    pub fn is_at_cap(&self) -> bool {
        self.blocks.len() >= self.max_block_count
    }

    /// Splices a freshly constructed block in immediately after `after`, returning its new id.
    ///
    /// Caller (the `Buffer`, under its block-count mutex) must have already checked
    /// `!is_at_cap()`.
    pub fn insert_after(&mut self, after: BlockId, block: Block) -> BlockId {
        let new_id = self.blocks.len();
        let following = self.next[after];

        self.blocks.push(Arc::new(block));
        self.next.push(following);
        self.prev.push(after);

        self.next[after] = new_id;
        self.prev[following] = new_id;

        new_id
    }
}
