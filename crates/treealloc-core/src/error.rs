//! Error types for the allocator engine and its page source.

use thiserror::Error;

/// Failure reported by a [`PageSource`](crate::page_source::PageSource).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageSourceError {
    /// The source could not provide a region of the requested size.
    #[error("page source exhausted: could not map {size} bytes")]
    Exhausted { size: usize },
    /// Returning a region failed.
    #[error("page source failed to release {size} bytes at {addr:#x} (errno {errno})")]
    ReleaseFailed { addr: usize, size: usize, errno: i32 },
    /// Zero-byte regions are never requested or returned.
    #[error("zero-sized region")]
    ZeroSize,
}

/// Engine-level allocation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error(transparent)]
    PageSource(#[from] PageSourceError),
    /// Header and alignment arithmetic overflowed `usize`.
    #[error("requested size {requested} overflows block arithmetic")]
    SizeOverflow { requested: usize },
    /// No arena claims the block behind this payload address.
    #[error("pointer {addr:#x} is not owned by any arena")]
    ForeignPointer { addr: usize },
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
}

/// A broken structural rule found by
/// [`Allocator::check_invariants`](crate::engine::Allocator::check_invariants).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("arena {arena:#x}: block chain covers {covered} of {expected} bytes")]
    ChainLength {
        arena: usize,
        covered: usize,
        expected: usize,
    },
    #[error("arena {arena:#x}: block {block:#x} has invalid size {size}")]
    BadBlockSize {
        arena: usize,
        block: usize,
        size: usize,
    },
    #[error("arena {arena:#x}: block {block:#x} has wrong first/last flags")]
    BoundaryFlags { arena: usize, block: usize },
    #[error("arena {arena:#x}: block {block:#x} records prev size {found}, expected {expected}")]
    PrevSize {
        arena: usize,
        block: usize,
        found: usize,
        expected: usize,
    },
    #[error("block {block:#x}: busy={busy} but indexed={indexed}")]
    IndexMembership {
        block: usize,
        busy: bool,
        indexed: bool,
    },
    #[error("large arena {arena:#x} must hold exactly one busy block")]
    LargeArenaShape { arena: usize },
    #[error("free index holds {indexed} entries but arenas hold {free} free blocks")]
    IndexCount { indexed: usize, free: usize },
    #[error("free index is not a balanced search tree")]
    IndexShape,
}
