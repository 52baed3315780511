//! Arena manager: OS-backed regions carved into block chains.
//!
//! Each region starts with an in-place [`ArenaHeader`] padded to
//! [`ARENA_HEADER_SIZE`], followed by a gapless run of blocks:
//!
//! ```text
//!   region start
//!   v
//!   +--------------+---------+---------+-----+---------+
//!   | ArenaHeader  | block F | block   | ... | block L |
//!   +--------------+---------+---------+-----+---------+
//!                  ^ data start                        ^ region end
//! ```
//!
//! Arenas form an intrusive singly linked list through the headers, newest
//! first. Ownership queries scan the list and test address containment.

use std::mem;
use std::ptr::{self, NonNull};

use crate::block::{ALIGN, Block, align_up, checked_align_up};
use crate::config::AllocatorConfig;
use crate::error::{AllocError, PageSourceError};
use crate::page_source::PageSource;

#[repr(C)]
pub(crate) struct ArenaHeader {
    size: usize,
    next: Option<NonNull<ArenaHeader>>,
    is_large: bool,
}

/// Arena header footprint rounded up so the first block stays aligned.
pub const ARENA_HEADER_SIZE: usize = align_up(mem::size_of::<ArenaHeader>(), ALIGN);

/// Handle to a live arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena(NonNull<ArenaHeader>);

impl Arena {
    #[inline]
    fn header(&self) -> &ArenaHeader {
        // SAFETY: handles only exist for arenas linked into an ArenaList,
        // whose regions stay mapped until destroyed.
        unsafe { self.0.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut ArenaHeader {
        // SAFETY: as in `header`; the list is mutated through `&mut ArenaList` only.
        unsafe { self.0.as_mut() }
    }

    /// Region start address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Total region size, header included.
    #[inline]
    pub fn size(self) -> usize {
        self.header().size
    }

    #[inline]
    pub fn is_large(self) -> bool {
        self.header().is_large
    }

    #[inline]
    fn next(self) -> Option<Arena> {
        self.header().next.map(Arena)
    }

    /// First byte after the arena header.
    #[inline]
    pub fn data_start(self) -> NonNull<u8> {
        // SAFETY: every region is larger than ARENA_HEADER_SIZE.
        unsafe { self.0.cast::<u8>().add(ARENA_HEADER_SIZE) }
    }

    /// Bytes available to blocks.
    #[inline]
    pub fn data_len(self) -> usize {
        self.size() - ARENA_HEADER_SIZE
    }

    /// Whether `addr` lies inside `[region start, region end)`.
    #[inline]
    pub fn contains(self, addr: usize) -> bool {
        let start = self.addr();
        addr >= start && addr - start < self.size()
    }

    #[inline]
    pub fn first_block(self) -> Block {
        // SAFETY: the data area always begins with a block header.
        unsafe { Block::from_raw(self.data_start()) }
    }

    /// Blocks in physical order.
    pub fn blocks(self) -> Blocks {
        Blocks {
            base: self.data_start(),
            data_len: self.data_len(),
            next: Some(self.first_block()),
        }
    }
}

/// Physical-order walk over one arena's blocks.
pub struct Blocks {
    base: NonNull<u8>,
    data_len: usize,
    next: Option<Block>,
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next?;
        self.next = block.next(self.base, self.data_len);
        Some(block)
    }
}

/// Owner of every arena, newest first.
#[derive(Debug, Default)]
pub struct ArenaList {
    head: Option<Arena>,
    len: usize,
}

impl ArenaList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> Arenas {
        Arenas { next: self.head }
    }

    /// Region size for an arena serving a `total`-byte block.
    pub fn region_size(
        config: &AllocatorConfig,
        total: usize,
        is_large: bool,
    ) -> Result<usize, AllocError> {
        if !is_large {
            return Ok(config.default_arena_size);
        }
        total
            .checked_add(ARENA_HEADER_SIZE)
            .and_then(|n| checked_align_up(n, ALIGN))
            .filter(|&n| n <= isize::MAX as usize)
            .ok_or(AllocError::SizeOverflow { requested: total })
    }

    /// Maps a new arena and links it at the head of the list.
    ///
    /// The arena holds a single block spanning the whole data area, flagged
    /// first, last and busy. Callers split or index it as needed.
    pub fn create<P: PageSource>(
        &mut self,
        source: &mut P,
        config: &AllocatorConfig,
        total: usize,
        is_large: bool,
    ) -> Result<Arena, AllocError> {
        let size = Self::region_size(config, total, is_large)?;
        let region = source.acquire(size)?;
        let header = region.cast::<ArenaHeader>();
        // SAFETY: the region is fresh, page aligned and at least
        // ARENA_HEADER_SIZE + MIN_BLOCK_SIZE bytes long.
        unsafe {
            ptr::write(
                header.as_ptr(),
                ArenaHeader {
                    size,
                    next: self.head.map(|a| a.0),
                    is_large,
                },
            );
        }
        let arena = Arena(header);
        arena
            .first_block()
            .init(arena.data_len(), true, true, true);
        self.head = Some(arena);
        self.len += 1;
        Ok(arena)
    }

    /// Arena whose region contains `addr`.
    pub fn find_owning(&self, addr: usize) -> Option<Arena> {
        self.iter().find(|arena| arena.contains(addr))
    }

    /// Unlinks `arena` and returns its region to `source`.
    ///
    /// Returns `Ok(false)` if the arena is not in this list.
    pub fn destroy<P: PageSource>(
        &mut self,
        source: &mut P,
        arena: Arena,
    ) -> Result<bool, PageSourceError> {
        let mut prev: Option<Arena> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == arena {
                break;
            }
            prev = Some(current);
            cursor = current.next();
        }
        if cursor.is_none() {
            return Ok(false);
        }

        let next = arena.header().next;
        match prev {
            Some(mut p) => p.header_mut().next = next,
            None => self.head = next.map(Arena),
        }
        self.len -= 1;

        let size = arena.size();
        // SAFETY: the region came from `source.acquire(size)` in `create` and
        // is no longer reachable from the list.
        unsafe { source.release(arena.0.cast(), size) }?;
        Ok(true)
    }

    /// Returns every region to `source`. Used on allocator teardown.
    pub fn release_all<P: PageSource>(&mut self, source: &mut P) -> Result<(), PageSourceError> {
        let mut first_err = None;
        while let Some(arena) = self.head {
            self.head = arena.next();
            self.len -= 1;
            let size = arena.size();
            // SAFETY: see `destroy`.
            if let Err(err) = unsafe { source.release(arena.0.cast(), size) } {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Walk over the arena list, newest first.
pub struct Arenas {
    next: Option<Arena>,
}

impl Iterator for Arenas {
    type Item = Arena;

    fn next(&mut self) -> Option<Arena> {
        let arena = self.next?;
        self.next = arena.next();
        Some(arena)
    }
}
