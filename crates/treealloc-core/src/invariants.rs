//! Structural self-check.
//!
//! Walks every arena and cross-checks the block chains against the free
//! index. Meant for tests, fuzzing and the harness; the engine never calls
//! it on its own.

use crate::block::{ALIGN, MIN_BLOCK_SIZE};
use crate::engine::Allocator;
use crate::error::InvariantViolation;
use crate::page_source::PageSource;

impl<P: PageSource> Allocator<P> {
    /// Verifies, for every arena:
    /// - block sizes are aligned, at least [`MIN_BLOCK_SIZE`], and tile the
    ///   data area exactly;
    /// - only the first block is flagged first and only the last is flagged
    ///   last;
    /// - each block's prev size matches its physical predecessor;
    /// - free blocks are indexed under their size and busy blocks are not;
    /// - large arenas hold a single busy block.
    ///
    /// Then checks the index holds nothing else and is a balanced search tree.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let index = self.free_index();
        let mut free_blocks = 0usize;

        for arena in self.arenas().iter() {
            let arena_addr = arena.addr();
            let expected = arena.data_len();
            let mut covered = 0usize;
            let mut count = 0usize;
            let mut prev_size = 0usize;

            for block in arena.blocks() {
                let size = block.size();
                let addr = block.addr();
                if size < MIN_BLOCK_SIZE || size % ALIGN != 0 {
                    return Err(InvariantViolation::BadBlockSize {
                        arena: arena_addr,
                        block: addr,
                        size,
                    });
                }
                covered += size;
                let is_tail = covered >= expected;
                if block.is_first() != (count == 0) || block.is_last() != is_tail {
                    return Err(InvariantViolation::BoundaryFlags {
                        arena: arena_addr,
                        block: addr,
                    });
                }
                if block.prev_size() != prev_size {
                    return Err(InvariantViolation::PrevSize {
                        arena: arena_addr,
                        block: addr,
                        found: block.prev_size(),
                        expected: prev_size,
                    });
                }
                let busy = block.is_busy();
                let indexed = index.contains(size, block);
                if busy == indexed {
                    return Err(InvariantViolation::IndexMembership {
                        block: addr,
                        busy,
                        indexed,
                    });
                }
                if !busy {
                    free_blocks += 1;
                }
                prev_size = size;
                count += 1;
            }

            if covered != expected {
                return Err(InvariantViolation::ChainLength {
                    arena: arena_addr,
                    covered,
                    expected,
                });
            }
            if arena.is_large() && (count != 1 || !arena.first_block().is_busy()) {
                return Err(InvariantViolation::LargeArenaShape { arena: arena_addr });
            }
        }

        if index.len() != free_blocks {
            return Err(InvariantViolation::IndexCount {
                indexed: index.len(),
                free: free_blocks,
            });
        }
        if !index.is_well_formed() {
            return Err(InvariantViolation::IndexShape);
        }
        Ok(())
    }
}
