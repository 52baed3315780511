//! In-place block header codec.
//!
//! Every block starts with two machine words:
//!
//! ```text
//!   +-------------------------+-------------------------+----------------
//!   | size | L | F | B        | prev_size | L | F | B   |  payload ...
//!   +-------------------------+-------------------------+----------------
//!   ^ block                                              ^ payload
//! ```
//!
//! Sizes are multiples of [`ALIGN`], so the three low bits of each word are
//! free to carry the busy (`B`), first-in-arena (`F`) and last-in-arena (`L`)
//! flags. Reads mask the flags off; writes OR them back in.

use std::mem;
use std::ptr::NonNull;

/// Strictest scalar alignment served to callers.
pub const ALIGN: usize = 16;

pub(crate) const FLAG_BUSY: usize = 1 << 0;
pub(crate) const FLAG_FIRST: usize = 1 << 1;
pub(crate) const FLAG_LAST: usize = 1 << 2;
const FLAG_MASK: usize = FLAG_BUSY | FLAG_FIRST | FLAG_LAST;

/// Raw header layout as it sits in arena memory.
#[repr(C)]
pub(crate) struct BlockHeader {
    size_flags: usize,
    prev_size_flags: usize,
}

/// Size of the block header once padded to [`ALIGN`].
pub const HEADER_SIZE: usize = align_up(mem::size_of::<BlockHeader>(), ALIGN);

/// Smallest block the engine ever creates.
pub const MIN_BLOCK_SIZE: usize = 2 * HEADER_SIZE;

/// Rounds `x` up to the next multiple of `a` (`a` must be a power of two).
#[inline]
pub const fn align_up(x: usize, a: usize) -> usize {
    (x + (a - 1)) & !(a - 1)
}

/// Overflow-checked [`align_up`].
#[inline]
pub fn checked_align_up(x: usize, a: usize) -> Option<usize> {
    Some(x.checked_add(a - 1)? & !(a - 1))
}

#[inline]
const fn mask_flags(word: usize) -> usize {
    word & !FLAG_MASK
}

#[inline]
const fn take_flags(word: usize) -> usize {
    word & FLAG_MASK
}

/// Handle to a block header living inside an arena.
///
/// A `Block` is a plain address; it does not own the memory it points at. All
/// accessors assume the handle was built from a header inside a live arena,
/// which is the contract of [`Block::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(NonNull<BlockHeader>);

impl Block {
    /// Wraps a header address.
    ///
    /// # Safety
    ///
    /// `ptr` must be [`ALIGN`]-aligned, point at least [`HEADER_SIZE`]
    /// readable and writable bytes inside a live arena, and stay valid for as
    /// long as the handle is used.
    #[inline]
    pub(crate) unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self(ptr.cast())
    }

    /// Recovers the block owning a payload address.
    ///
    /// # Safety
    ///
    /// `payload` must have been produced by [`Block::payload`] on a block that
    /// is still part of a live arena.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // SAFETY: caller guarantees the header sits HEADER_SIZE bytes before payload.
        unsafe { Self::from_raw(payload.sub(HEADER_SIZE)) }
    }

    /// Header address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> NonNull<u8> {
        self.0.cast()
    }

    #[inline]
    fn header(&self) -> &BlockHeader {
        // SAFETY: construction contract keeps the header readable.
        unsafe { self.0.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut BlockHeader {
        // SAFETY: construction contract keeps the header writable; the engine
        // never holds two live references to one header at a time.
        unsafe { self.0.as_mut() }
    }

    /// Writes a fresh header: `size`, the given flags, and a zero prev size.
    pub(crate) fn init(mut self, size: usize, busy: bool, first: bool, last: bool) -> Self {
        debug_assert_eq!(take_flags(size), 0, "block size must be ALIGN-aligned");
        let header = self.header_mut();
        header.size_flags = size;
        header.prev_size_flags = 0;
        self.set_busy(busy);
        self.set_first(first);
        self.set_last(last);
        self
    }

    /// Block size including the header.
    #[inline]
    pub fn size(self) -> usize {
        mask_flags(self.header().size_flags)
    }

    #[inline]
    pub(crate) fn set_size(mut self, size: usize) {
        let header = self.header_mut();
        header.size_flags = size | take_flags(header.size_flags);
    }

    /// Size of the physically preceding block, zero for the first block.
    #[inline]
    pub fn prev_size(self) -> usize {
        mask_flags(self.header().prev_size_flags)
    }

    #[inline]
    pub(crate) fn set_prev_size(mut self, size: usize) {
        let header = self.header_mut();
        header.prev_size_flags = size | take_flags(header.prev_size_flags);
    }

    #[inline]
    pub fn is_busy(self) -> bool {
        self.header().size_flags & FLAG_BUSY != 0
    }

    #[inline]
    pub fn is_first(self) -> bool {
        self.header().size_flags & FLAG_FIRST != 0
    }

    #[inline]
    pub fn is_last(self) -> bool {
        self.header().size_flags & FLAG_LAST != 0
    }

    #[inline]
    pub(crate) fn set_busy(self, on: bool) {
        self.set_flag(FLAG_BUSY, on);
    }

    #[inline]
    pub(crate) fn set_first(self, on: bool) {
        self.set_flag(FLAG_FIRST, on);
    }

    #[inline]
    pub(crate) fn set_last(self, on: bool) {
        self.set_flag(FLAG_LAST, on);
    }

    fn set_flag(mut self, flag: usize, on: bool) {
        let header = self.header_mut();
        if on {
            header.size_flags |= flag;
        } else {
            header.size_flags &= !flag;
        }
    }

    /// Usable bytes behind the header.
    #[inline]
    pub fn usable_size(self) -> usize {
        self.size().saturating_sub(HEADER_SIZE)
    }

    /// Address handed to callers.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: every block is at least MIN_BLOCK_SIZE long, so the payload
        // start is still inside the block.
        unsafe { self.as_ptr().add(HEADER_SIZE) }
    }

    /// Next block in the arena whose data area starts at `base` and spans
    /// `data_len` bytes.
    ///
    /// Returns `None` for a zero-sized block or when the next header would not
    /// start strictly before the end of the data area.
    pub fn next(self, base: NonNull<u8>, data_len: usize) -> Option<Block> {
        let size = self.size();
        if size == 0 {
            return None;
        }
        let next = self.addr().checked_add(size)?;
        let end = (base.as_ptr() as usize).checked_add(data_len)?;
        if next >= end {
            return None;
        }
        // SAFETY: next lies inside the same arena data area, at a block boundary.
        Some(unsafe { Block::from_raw(self.as_ptr().add(size)) })
    }

    /// Previous block, derived from the stored prev size.
    pub fn prev(self) -> Option<Block> {
        let prev_size = self.prev_size();
        if prev_size == 0 {
            return None;
        }
        // SAFETY: a nonzero prev size is only written for blocks that have a
        // physical predecessor of exactly that size in the same arena.
        Some(unsafe { Block::from_raw(self.as_ptr().sub(prev_size)) })
    }
}
