//! # Patcher
//!
//! Patchers overwrite a range of memory and hand back a guard that can put the previous contents
//! back. They know nothing about code; [`crate::hook`] builds on them to write trampolines.

pub mod byte;
pub mod mem;

/// Overwrites memory, remembering what was there
///
/// # Safety
///
/// Implementations write to arbitrary addresses. They must document which memory they can write
/// and must touch nothing outside the range being patched.
pub unsafe trait Patcher {
    /// Error from patching
    type Error;
    /// Puts the previous contents back when dropped
    type Guard: PatchGuard;

    /// Writes `patch` at `target`
    ///
    /// # Safety
    ///
    /// `target` must be valid for `patch.len()` bytes in the way this patcher requires
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error>;
}

/// Guard for an applied patch
///
/// # Safety
///
/// Dropping the guard must restore the location even if [`PatchGuard::restore`] is never called
pub unsafe trait PatchGuard: Sized {
    /// Error from restoring
    type Error;

    /// Restores the location, reporting failures that [`Drop::drop`] can only log
    fn restore(self) -> Result<(), Self::Error>;

    /// Bytes that were at the location before the patch was applied
    fn original(&self) -> &[u8];
}
