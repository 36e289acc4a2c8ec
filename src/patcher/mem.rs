//! Patcher that lifts page protection for the duration of a write
//!
//! Function bodies live in pages mapped read+execute. [`PermissionWrapper`] opens the pages
//! covered by a patch to read+write+execute, lets the wrapped patcher write, and puts the previous
//! protection back before returning. Restoring goes through the same steps.
//!
//! The previous protection is recorded once by [`Pages::query`], before anything is patched.
//! Querying reads `/proc/self/maps` on Linux through libc `open` and `read`. Patching and
//! restoring only call `mprotect` and never allocate, so they keep working while `read` or
//! `open` are redirected.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use region::Protection;
use thiserror::Error;

use super::{PatchGuard, Patcher};

lazy_static! {
    /// Serialises protection changes. Two writers on the same page would otherwise
    /// each save the other's temporary protection and restore the wrong one.
    static ref PROTECT_LOCK: Mutex<()> = Mutex::new(());
}

/// Most page spans a range of at most one page can touch
const MAX_SPANS: usize = 2;

/// Errors from a write that needed its protection changed
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// The pages around the target couldn't be queried or reprotected
    #[error("cannot change memory protection: {0}")]
    ProtectionError(#[from] region::Error),
    /// The write falls outside the pages recorded for the wrapper
    #[error("write of {len} bytes at {address:#x} is outside the recorded pages")]
    OutsideRange {
        /// Start of the write
        address: usize,
        /// Bytes written
        len: usize,
    },
    /// The wrapped patcher failed
    #[error("{0}")]
    CustomError(E),
}

/// Page-aligned part of a mapping and the protection it had
#[derive(Debug, Clone, Copy)]
struct Span {
    /// First byte, page aligned
    start: usize,
    /// Length, a whole number of pages
    len: usize,
    /// Protection before any patch
    protection: Protection,
}

impl Span {
    /// Unused entry
    const EMPTY: Self = Self {
        start: 0,
        len: 0,
        protection: Protection::NONE,
    };
}

/// Protection of the pages under a range, recorded before it is patched
#[derive(Debug, Clone, Copy)]
pub struct Pages {
    /// First byte of the recorded range
    start: usize,
    /// One past the last byte of the recorded range
    end: usize,
    /// Pages under the range grouped by mapping, the first `count` are in use
    spans: [Span; MAX_SPANS],
    /// Spans in use
    count: usize,
}

impl Pages {
    /// Records the protection of every page under `len` bytes at `location`
    ///
    /// `len` may be at most one page.
    pub fn query(location: *const u8, len: usize) -> Result<Self, region::Error> {
        let page = region::page::size();
        if len == 0 || len > page {
            return Err(region::Error::InvalidParameter("size"));
        }
        let start = location as usize;
        let end = start
            .checked_add(len)
            .ok_or(region::Error::InvalidParameter("address"))?;
        let first = start & !(page - 1);
        let last = (end + page - 1) & !(page - 1);

        let mut pages = Self {
            start,
            end,
            spans: [Span::EMPTY; MAX_SPANS],
            count: 0,
        };
        for mapping in region::query_range(location, len)? {
            let mapping = mapping?;
            if pages.count == MAX_SPANS {
                return Err(region::Error::InvalidParameter("size"));
            }
            let range = mapping.as_range();
            let span_start = range.start.max(first);
            let span_end = range.end.min(last);
            pages.spans[pages.count] = Span {
                start: span_start,
                len: span_end - span_start,
                protection: mapping.protection(),
            };
            pages.count += 1;
        }
        Ok(pages)
    }

    /// Whether `len` bytes at `location` lie inside the recorded range
    pub fn covers(&self, location: *const u8, len: usize) -> bool {
        let start = location as usize;
        start >= self.start && start.checked_add(len).map_or(false, |end| end <= self.end)
    }

    /// Recorded spans
    fn spans(&self) -> &[Span] {
        &self.spans[..self.count]
    }

    /// Runs `write` with every recorded page writable, then puts the recorded protection back
    ///
    /// `write` isn't run if the pages can't be made writable.
    ///
    /// # Safety
    ///
    /// The recorded pages must still be mapped
    unsafe fn while_writable<R>(&self, write: impl FnOnce() -> R) -> Result<R, region::Error> {
        let _lock = PROTECT_LOCK.lock();
        for span in self.spans() {
            if let Err(e) = region::protect(span.start as *const u8, span.len, Protection::READ_WRITE_EXECUTE) {
                self.relock();
                return Err(e);
            }
        }
        let result = write();
        self.relock();
        Ok(result)
    }

    /// Puts the recorded protection back on every span
    ///
    /// # Safety
    ///
    /// The recorded pages must still be mapped
    unsafe fn relock(&self) {
        for span in self.spans() {
            if let Err(e) = region::protect(span.start as *const u8, span.len, span.protection) {
                tracing::warn!("{:#x}+{:#x} left writable: {e}", span.start, span.len);
            }
        }
    }
}

/// Wraps a patcher so it can write to code and other read-only memory
///
/// The wrapper only writes inside the range its [`Pages`] were recorded for.
///
/// # Safety
///
/// Wrapping a patcher that writes past the end of its patch is undefined behavior.
///
/// Targets must be memory Rust doesn't track through references, such as machine code. Writing
/// through a pointer derived from a `&T` is undefined behavior.
#[derive(Debug, Clone, Copy)]
pub struct PermissionWrapper<P: Patcher> {
    /// Patcher doing the actual write
    patcher: P,
    /// Pages the patch may touch and their protection before it
    pages: Pages,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Wraps `patcher` for writes inside `pages`
    pub fn new(patcher: P, pages: Pages) -> Self {
        Self { patcher, pages }
    }

    /// Pages this wrapper may write to
    pub fn pages(&self) -> &Pages {
        &self.pages
    }
}

/// Casts away constness of a code address so it can be handed to [`PermissionWrapper`]
///
/// # Safety
///
/// The protection of the memory is unchanged. The result may only be written through a
/// [`PermissionWrapper`], which reprotects the range around the write.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    type Error = PermissionError<P::Error>;
    type Guard = PermissionWrapperGuard<P::Guard>;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        if !self.pages.covers(location, patch.len()) {
            return Err(PermissionError::OutsideRange {
                address: location as usize,
                len: patch.len(),
            });
        }
        let inner = self
            .pages
            .while_writable(|| self.patcher.patch(location, patch))?
            .map_err(PermissionError::CustomError)?;
        Ok(PermissionWrapperGuard {
            guard: Some(inner),
            pages: self.pages,
        })
    }
}

/// Guard of a [`PermissionWrapper`] patch
#[derive(Debug)]
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Guard of the wrapped patcher, taken once it has been restored
    guard: Option<G>,
    /// Pages under the patch
    pages: Pages,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Reprotects the patched range and restores the inner guard
    ///
    /// If the pages can't be made writable the patch stays applied and restoring can be retried.
    pub fn try_restore(&mut self) -> Result<(), PermissionError<G::Error>> {
        if self.guard.is_none() {
            return Ok(());
        }
        let pages = self.pages;
        let guard = &mut self.guard;
        // Safety: the pages were mapped when the patch was applied and patched code is never unmapped
        match unsafe { pages.while_writable(|| guard.take().map(G::restore)) }? {
            Some(Err(e)) => Err(PermissionError::CustomError(e)),
            _ => Ok(()),
        }
    }

    /// Whether the wrapped patch is still applied
    pub fn is_applied(&self) -> bool {
        self.guard.is_some()
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    type Error = PermissionError<G::Error>;

    fn restore(mut self) -> Result<(), Self::Error> {
        self.try_restore()
    }

    fn original(&self) -> &[u8] {
        self.guard.as_ref().map(G::original).unwrap_or_default()
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        if self.try_restore().is_err() {
            tracing::error!(
                "failed to make {:#x}+{} writable, original bytes were not restored",
                self.pages.start,
                self.pages.end - self.pages.start
            );
            // Writing without permission would fault, so the guard is leaked instead
            std::mem::forget(self.guard.take());
        }
    }
}
