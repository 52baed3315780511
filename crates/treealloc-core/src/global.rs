//! Process-wide allocator behind a mutex.
//!
//! The first call to any function here lazily builds an allocator from the
//! environment and OS defaults unless [`initialize`] ran first.
//! Re-initializing abandons the previous allocator without unmapping its
//! arenas, so pointers it handed out stay readable but are never reused.

use std::mem;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::engine::Allocator;
use crate::error::{AllocError, InvariantViolation};
use crate::log::AllocatorLogRecord;
use crate::snapshot::StateSnapshot;

static GLOBAL: Mutex<Option<Allocator>> = Mutex::new(None);

fn with_allocator<R>(f: impl FnOnce(&mut Allocator) -> R) -> Result<R, AllocError> {
    let mut guard = GLOBAL.lock();
    if guard.is_none() {
        *guard = Some(Allocator::from_system(None, None)?);
    }
    match guard.as_mut() {
        Some(allocator) => Ok(f(allocator)),
        None => Err(AllocError::InvalidConfig(
            "global allocator missing after initialization".into(),
        )),
    }
}

/// Resets the global allocator with the given sizes.
///
/// `None` (or zero) falls back to `TREEALLOC_PAGE_SIZE` /
/// `TREEALLOC_ARENA_SIZE` when set, then to the OS page size and four pages.
/// A set `TREEALLOC_ARENA_SIZE` therefore wins over four times an explicit
/// page size.
pub fn initialize(
    page_size: Option<usize>,
    default_arena_size: Option<usize>,
) -> Result<(), AllocError> {
    let fresh = Allocator::from_system(page_size, default_arena_size)?;
    let mut guard = GLOBAL.lock();
    if let Some(old) = guard.replace(fresh) {
        // Outstanding payloads may still point into the old arenas.
        mem::forget(old);
    }
    Ok(())
}

pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    with_allocator(|a| a.allocate(size)).ok().flatten()
}

/// # Safety
///
/// `ptr` must be null or a payload returned by this module and not yet freed.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: forwarded caller contract.
    let _ = with_allocator(|a| unsafe { a.free(ptr) });
}

/// # Safety
///
/// Same contract as [`free`].
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    // SAFETY: forwarded caller contract.
    with_allocator(|a| unsafe { a.reallocate(ptr, new_size) })
        .ok()
        .flatten()
}

pub fn dump_state() -> String {
    with_allocator(|a| a.dump_state()).unwrap_or_else(|err| err.to_string())
}

pub fn snapshot() -> Result<StateSnapshot, AllocError> {
    with_allocator(|a| a.snapshot())
}

pub fn check_invariants() -> Result<Result<(), InvariantViolation>, AllocError> {
    with_allocator(|a| a.check_invariants())
}

pub fn drain_lifecycle_logs() -> Vec<AllocatorLogRecord> {
    with_allocator(|a| a.drain_lifecycle_logs()).unwrap_or_default()
}
