//! Point-in-time views of allocator state.
//!
//! [`StateSnapshot`] copies out everything observable: config, arenas in
//! list order, the free index in key order, and every block in physical
//! order. Its `Display` renders the human-readable state dump; it also
//! serializes for machine consumers.

use std::fmt;

use serde::Serialize;

use crate::config::AllocatorConfig;
use crate::engine::{Allocator, AllocatorStats};
use crate::page_source::PageSource;

/// Block lines printed by the text dump before truncating.
pub const MAX_DUMP_BLOCKS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArenaSnapshot {
    pub addr: usize,
    pub size: usize,
    pub is_large: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockSnapshot {
    /// Index of the owning arena in [`StateSnapshot::arenas`].
    pub arena: usize,
    pub addr: usize,
    pub size: usize,
    pub prev_size: usize,
    pub busy: bool,
    pub first: bool,
    pub last: bool,
}

/// One free index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeEntry {
    pub size: usize,
    pub block: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub config: AllocatorConfig,
    pub stats: AllocatorStats,
    /// Newest first.
    pub arenas: Vec<ArenaSnapshot>,
    /// Ascending by size, then address.
    pub free_blocks: Vec<FreeEntry>,
    /// Physical order within each arena, arenas in list order.
    pub blocks: Vec<BlockSnapshot>,
}

impl StateSnapshot {
    /// Total bytes held by busy blocks, headers included.
    pub fn busy_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.busy).map(|b| b.size).sum()
    }

    /// Total bytes held by free blocks, headers included.
    pub fn free_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| !b.busy).map(|b| b.size).sum()
    }
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Memory Allocator State ===")?;
        writeln!(
            f,
            "Page size: {}, Default arena size: {}",
            self.config.page_size, self.config.default_arena_size
        )?;

        writeln!(f, "Arenas:")?;
        for (i, arena) in self.arenas.iter().enumerate() {
            writeln!(
                f,
                "  Arena {i}: {:#x}, size: {}, {}",
                arena.addr,
                arena.size,
                if arena.is_large { "large" } else { "normal" }
            )?;
        }

        writeln!(f, "Free blocks in tree:")?;
        if self.free_blocks.is_empty() {
            writeln!(f, "  (empty)")?;
        }
        for entry in &self.free_blocks {
            writeln!(f, "  Key: {}, Data: {:#x}", entry.size, entry.block)?;
        }

        writeln!(f, "All blocks:")?;
        for (i, block) in self.blocks.iter().take(MAX_DUMP_BLOCKS).enumerate() {
            writeln!(
                f,
                "  Block {i}: {:#x}, size: {}, busy: {}, first: {}, last: {}",
                block.addr,
                block.size,
                u8::from(block.busy),
                u8::from(block.first),
                u8::from(block.last)
            )?;
        }
        if self.blocks.len() > MAX_DUMP_BLOCKS {
            writeln!(f, "  ... {} more blocks", self.blocks.len() - MAX_DUMP_BLOCKS)?;
        }
        writeln!(f, "=== End of State ===")
    }
}

impl<P: PageSource> Allocator<P> {
    pub fn snapshot(&self) -> StateSnapshot {
        let mut arenas = Vec::with_capacity(self.arenas().len());
        let mut blocks = Vec::new();
        for (i, arena) in self.arenas().iter().enumerate() {
            arenas.push(ArenaSnapshot {
                addr: arena.addr(),
                size: arena.size(),
                is_large: arena.is_large(),
            });
            blocks.extend(arena.blocks().map(|b| BlockSnapshot {
                arena: i,
                addr: b.addr(),
                size: b.size(),
                prev_size: b.prev_size(),
                busy: b.is_busy(),
                first: b.is_first(),
                last: b.is_last(),
            }));
        }
        let free_blocks = self
            .free_index()
            .iter()
            .map(|(size, block)| FreeEntry {
                size,
                block: block.addr(),
            })
            .collect();
        StateSnapshot {
            config: *self.config(),
            stats: self.stats(),
            arenas,
            free_blocks,
            blocks,
        }
    }

    /// Human-readable dump of the whole allocator.
    pub fn dump_state(&self) -> String {
        self.snapshot().to_string()
    }
}
