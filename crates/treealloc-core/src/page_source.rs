//! Coarse region provider underneath the arena manager.
//!
//! The engine only needs two operations from the operating system: map a
//! zero-filled read/write region, and give it back. [`MmapPageSource`] does
//! that with anonymous private mappings; [`RecordingPageSource`] wraps any
//! source to count calls and inject refusals.

use std::ptr::{self, NonNull};

use crate::error::PageSourceError;

/// Region provider used by the arena manager.
pub trait PageSource {
    /// Maps `size` bytes of zero-initialized, readable and writable memory.
    ///
    /// The returned address is at least page aligned.
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, PageSourceError>;

    /// Returns a region obtained from [`PageSource::acquire`].
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe exactly one region previously returned
    /// by `acquire` on this source, and nothing may access it afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), PageSourceError>;
}

impl<P: PageSource + ?Sized> PageSource for &mut P {
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, PageSourceError> {
        (**self).acquire(size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), PageSourceError> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).release(ptr, size) }
    }
}

/// Page size reported by the operating system, or 4096 if the query fails.
#[must_use]
pub fn os_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 { 4096 } else { raw as usize }
}

/// Anonymous private `mmap`/`munmap` regions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapPageSource;

impl MmapPageSource {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl PageSource for MmapPageSource {
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, PageSourceError> {
        if size == 0 {
            return Err(PageSourceError::ZeroSize);
        }
        // SAFETY: anonymous mapping with no fixed address; the kernel picks the range.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(PageSourceError::Exhausted { size });
        }
        NonNull::new(raw.cast::<u8>()).ok_or(PageSourceError::Exhausted { size })
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), PageSourceError> {
        if size == 0 {
            return Err(PageSourceError::ZeroSize);
        }
        // SAFETY: caller guarantees (ptr, size) is a mapping we created.
        let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
        if rc != 0 {
            return Err(PageSourceError::ReleaseFailed {
                addr: ptr.as_ptr() as usize,
                size,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        Ok(())
    }
}

/// One call observed by a [`RecordingPageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PageEvent {
    Acquire { addr: usize, size: usize },
    Release { addr: usize, size: usize },
    Refused { size: usize },
}

/// Wrapper that records every acquire/release and can refuse requests.
#[derive(Debug, Default)]
pub struct RecordingPageSource<P = MmapPageSource> {
    inner: P,
    events: Vec<PageEvent>,
    /// Remaining successful acquires before refusals start. `None` = unlimited.
    budget: Option<usize>,
}

impl<P: PageSource> RecordingPageSource<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            events: Vec::new(),
            budget: None,
        }
    }

    /// Allows `n` more successful acquires, then refuses every request.
    pub fn set_acquire_budget(&mut self, n: Option<usize>) {
        self.budget = n;
    }

    /// All events in call order.
    pub fn events(&self) -> &[PageEvent] {
        &self.events
    }

    pub fn acquire_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, PageEvent::Acquire { .. }))
            .count()
    }

    pub fn release_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, PageEvent::Release { .. }))
            .count()
    }

    /// Bytes currently mapped through this source.
    pub fn mapped_bytes(&self) -> usize {
        self.events.iter().fold(0usize, |acc, e| match *e {
            PageEvent::Acquire { size, .. } => acc + size,
            PageEvent::Release { size, .. } => acc.saturating_sub(size),
            PageEvent::Refused { .. } => acc,
        })
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }
}

impl<P: PageSource> PageSource for RecordingPageSource<P> {
    fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, PageSourceError> {
        if let Some(remaining) = self.budget.as_mut() {
            if *remaining == 0 {
                self.events.push(PageEvent::Refused { size });
                return Err(PageSourceError::Exhausted { size });
            }
            *remaining -= 1;
        }
        match self.inner.acquire(size) {
            Ok(ptr) => {
                self.events.push(PageEvent::Acquire {
                    addr: ptr.as_ptr() as usize,
                    size,
                });
                Ok(ptr)
            }
            Err(err) => {
                self.events.push(PageEvent::Refused { size });
                Err(err)
            }
        }
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), PageSourceError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.release(ptr, size) }?;
        self.events.push(PageEvent::Release {
            addr: ptr.as_ptr() as usize,
            size,
        });
        Ok(())
    }
}
