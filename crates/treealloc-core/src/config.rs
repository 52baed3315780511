//! Allocator configuration.
//!
//! Two knobs: the page size and the size of a normal arena. Each is resolved
//! in order from an explicit argument, then an environment variable, then the
//! operating system default:
//! - `TREEALLOC_PAGE_SIZE`: page size in bytes (decimal or `0x` hex).
//!   Defaults to `sysconf(_SC_PAGESIZE)`.
//! - `TREEALLOC_ARENA_SIZE`: normal arena size in bytes. Defaults to four
//!   pages.

use serde::Serialize;

use crate::arena::ARENA_HEADER_SIZE;
use crate::block::{ALIGN, MIN_BLOCK_SIZE, align_up};
use crate::error::AllocError;
use crate::page_source::os_page_size;

pub const PAGE_SIZE_ENV: &str = "TREEALLOC_PAGE_SIZE";
pub const ARENA_SIZE_ENV: &str = "TREEALLOC_ARENA_SIZE";

/// Normal arenas default to this many pages.
pub const DEFAULT_ARENA_PAGES: usize = 4;

/// Resolved allocator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatorConfig {
    /// Page size in bytes, a power of two.
    pub page_size: usize,
    /// Size of every normal arena, a multiple of `ALIGN`.
    pub default_arena_size: usize,
}

/// Parses a size from decimal or `0x`-prefixed hex, ignoring `_` separators.
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let cleaned: String = raw.trim().chars().filter(|&c| c != '_').collect();
    let value = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16).ok()?,
        None => cleaned.parse().ok()?,
    };
    (value > 0).then_some(value)
}

fn env_size(key: &str) -> Option<usize> {
    std::env::var(key).ok().as_deref().and_then(parse_size)
}

impl AllocatorConfig {
    /// Validates explicit values.
    ///
    /// The arena size is rounded up to `ALIGN` and must leave room for the
    /// arena header plus one minimum-size block.
    pub fn new(page_size: usize, default_arena_size: usize) -> Result<Self, AllocError> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "page size {page_size} is not a nonzero power of two"
            )));
        }
        let min_arena = ARENA_HEADER_SIZE + MIN_BLOCK_SIZE;
        if default_arena_size < min_arena || default_arena_size > isize::MAX as usize {
            return Err(AllocError::InvalidConfig(format!(
                "arena size {default_arena_size} outside [{min_arena}, isize::MAX]"
            )));
        }
        Ok(Self {
            page_size,
            default_arena_size: align_up(default_arena_size, ALIGN),
        })
    }

    /// Resolves each knob from the argument, the environment, then the OS.
    pub fn resolve(
        page_size: Option<usize>,
        default_arena_size: Option<usize>,
    ) -> Result<Self, AllocError> {
        Self::resolve_with(page_size, default_arena_size, env_size)
    }

    fn resolve_with(
        page_size: Option<usize>,
        default_arena_size: Option<usize>,
        lookup: impl Fn(&str) -> Option<usize>,
    ) -> Result<Self, AllocError> {
        let page_size = page_size
            .filter(|&p| p > 0)
            .or_else(|| lookup(PAGE_SIZE_ENV))
            .unwrap_or_else(os_page_size);
        // An arena size from the environment beats the page-derived default
        // even when the page size was given explicitly.
        let default_arena_size = default_arena_size
            .filter(|&a| a > 0)
            .or_else(|| lookup(ARENA_SIZE_ENV))
            .unwrap_or(DEFAULT_ARENA_PAGES * page_size);
        Self::new(page_size, default_arena_size)
    }

    /// Largest `total` block size a normal arena can serve.
    #[must_use]
    pub const fn normal_capacity(&self) -> usize {
        self.default_arena_size - ARENA_HEADER_SIZE
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        let page_size = os_page_size();
        Self {
            page_size,
            default_arena_size: DEFAULT_ARENA_PAGES * page_size,
        }
    }
}
