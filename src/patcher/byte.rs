//! Plain byte patcher

use std::ptr;

use thiserror::Error;

use super::{PatchGuard, Patcher};

/// Longest patch a [`BytePatcher`] can snapshot
pub const MAX_PATCH_LEN: usize = 16;

/// Errors from [`BytePatcher`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BytePatchError {
    /// The patch doesn't fit in the snapshot buffer
    #[error("patch of {0} bytes is longer than the {MAX_PATCH_LEN}-byte snapshot")]
    TooLong(usize),
}

/// Copies the patch over the target, keeping a snapshot of what was there.
/// The target must already be writable.
///
/// The snapshot lives inline in the guard, so neither patching nor restoring allocates.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a byte patcher
    pub fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = BytePatchError;
    type Guard = BytePatchGuard;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        if patch.len() > MAX_PATCH_LEN {
            return Err(BytePatchError::TooLong(patch.len()));
        }
        Ok(BytePatchGuard::apply(location, patch))
    }
}

/// Snapshot of the bytes a [`BytePatcher`] overwrote
#[derive(Debug)]
pub struct BytePatchGuard {
    /// Saved bytes, the first `len` are in use
    original: [u8; MAX_PATCH_LEN],
    /// Bytes saved, zero once written back
    len: usize,
    /// Start of the patched range
    location: *mut u8,
}
impl BytePatchGuard {
    /// Snapshots `patch.len()` bytes at `location`, then overwrites them
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes, at most
    /// [`MAX_PATCH_LEN`]
    unsafe fn apply(location: *mut u8, patch: &[u8]) -> Self {
        let mut original = [0; MAX_PATCH_LEN];
        ptr::copy_nonoverlapping(location, original.as_mut_ptr(), patch.len());
        ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());
        Self {
            original,
            len: patch.len(),
            location,
        }
    }

    /// Writes the snapshot back, leaving nothing to do on drop
    fn write_back(&mut self) {
        // Safety: `apply` was given a range valid for writes, and it outlives the guard
        unsafe {
            ptr::copy_nonoverlapping(self.original.as_ptr(), self.location, self.len);
        }
        self.len = 0;
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    type Error = BytePatchError;

    fn restore(mut self) -> Result<(), Self::Error> {
        self.write_back();
        Ok(())
    }

    fn original(&self) -> &[u8] {
        &self.original[..self.len]
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        if self.len != 0 {
            self.write_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use super::*;

    /// Reads `len` bytes at `ptr`
    fn bytes(ptr: *const u8, len: usize) -> Vec<u8> {
        unsafe { slice::from_raw_parts(ptr, len) }.to_vec()
    }

    #[test]
    fn restore_writes_snapshot_back() {
        let mut data = [0x55u8, 0x48, 0x89, 0xe5];
        let ptr = data.as_mut_ptr();

        let guard = unsafe { BytePatcher::new().patch(ptr, &[0xcc; 4]).unwrap() };
        assert_eq!(guard.original(), [0x55, 0x48, 0x89, 0xe5]);
        assert_eq!(bytes(ptr, 4), [0xcc; 4]);

        guard.restore().unwrap();
        assert_eq!(data, [0x55, 0x48, 0x89, 0xe5]);
    }

    #[test]
    fn drop_restores_only_the_patched_range() {
        let mut data = [1u8, 2, 3, 4, 5];
        let ptr = data.as_mut_ptr();

        let guard = unsafe { BytePatcher::new().patch(ptr.add(1), &[0, 0]).unwrap() };
        assert_eq!(bytes(ptr, 5), [1, 0, 0, 4, 5]);

        drop(guard);
        assert_eq!(data, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn stacked_patches_unwind_in_reverse() {
        let mut data = [1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        let patcher = BytePatcher::new();
        let outer = unsafe { patcher.patch(ptr, &[9, 9]).unwrap() };
        let inner = unsafe { patcher.patch(ptr, &[7, 7, 7]).unwrap() };
        assert_eq!(inner.original(), [9, 9, 3]);

        inner.restore().unwrap();
        assert_eq!(bytes(ptr, 4), [9, 9, 3, 4]);
        outer.restore().unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    fn rejects_patch_longer_than_snapshot() {
        let mut data = [0u8; MAX_PATCH_LEN + 1];
        let err = unsafe { BytePatcher::new().patch(data.as_mut_ptr(), &[1; MAX_PATCH_LEN + 1]) }
            .unwrap_err();
        assert_eq!(err, BytePatchError::TooLong(MAX_PATCH_LEN + 1));
        // nothing was written
        assert_eq!(data, [0; MAX_PATCH_LEN + 1]);
    }
}
