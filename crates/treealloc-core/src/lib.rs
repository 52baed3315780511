//! # treealloc-core
//!
//! A general-purpose memory allocator that carves OS page regions ("arenas")
//! into variable-size blocks and serves requests best-fit from a size-keyed
//! AVL index of free blocks.
//!
//! Layout:
//! - [`block`]: in-place two-word block header with busy/first/last flags.
//! - [`free_index`]: AVL multiset of free blocks keyed by size.
//! - [`arena`]: page-backed regions, normal (shared) or large (one block).
//! - [`engine`]: allocate, free and reallocate over the pieces above.
//! - [`page_source`]: the `mmap`/`munmap` boundary, swappable for tests.
//! - [`global`]: optional process-wide allocator behind a mutex.
//!
//! Freed neighbors are never coalesced. Large arenas go back to the OS on
//! free; normal arenas live until the allocator is dropped.

pub mod arena;
pub mod block;
pub mod config;
pub mod engine;
pub mod error;
pub mod free_index;
pub mod global;
mod invariants;
pub mod log;
pub mod page_source;
pub mod snapshot;

pub use block::{ALIGN, HEADER_SIZE, MIN_BLOCK_SIZE};
pub use config::AllocatorConfig;
pub use engine::{Allocator, AllocatorStats, FreeOutcome, SPLIT_SLACK};
pub use error::{AllocError, InvariantViolation, PageSourceError};
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use page_source::{MmapPageSource, PageEvent, PageSource, RecordingPageSource};
pub use snapshot::StateSnapshot;
