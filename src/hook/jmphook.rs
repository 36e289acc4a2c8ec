//! # Jump Hook
//!
//! This hook type uses a basic `jmp` instruction to redirect execution

use std::fmt;
use std::slice;

use crate::code::decode;
use crate::code::x64;
use crate::patcher::byte::{BytePatchError, BytePatchGuard, BytePatcher};
use crate::patcher::mem::{to_mut, Pages, PermissionError, PermissionWrapper, PermissionWrapperGuard};
use crate::patcher::{PatchGuard, Patcher};

use super::{Hook, HookError, PatchFlags};

#[cfg(target_arch = "x86_64")]
/// Decoder bitness for the host
const BITNESS: u32 = 64;
#[cfg(not(target_arch = "x86_64"))]
/// Decoder bitness for the host
const BITNESS: u32 = 32;

/// Encodes the trampoline that sends `source` to `replacement`
#[cfg(target_arch = "x86_64")]
fn encode(
    source: *const (),
    replacement: *const (),
    flags: PatchFlags,
) -> Result<Vec<u8>, HookError> {
    if flags.contains(PatchFlags::OFFSET_64BIT) {
        return Ok(x64::jmp_abs(replacement as u64).to_vec());
    }
    x64::jmp_rel32(source as u64, replacement as u64)
        .map(|code| code.to_vec())
        .ok_or(HookError::OutOfRange {
            address: source as usize,
            replacement: replacement as usize,
        })
}

/// Encodes the trampoline that sends `source` to `replacement`
#[cfg(target_arch = "x86")]
fn encode(
    source: *const (),
    replacement: *const (),
    flags: PatchFlags,
) -> Result<Vec<u8>, HookError> {
    if flags.contains(PatchFlags::OFFSET_64BIT) {
        return Err(HookError::UnsupportedFlags(flags));
    }
    Ok(x64::jmp_rel32_wrapping(source as u32, replacement as u32).to_vec())
}

/// Encodes the trampoline that sends `source` to `replacement`
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
fn encode(
    _source: *const (),
    _replacement: *const (),
    _flags: PatchFlags,
) -> Result<Vec<u8>, HookError> {
    Err(HookError::UnsupportedArch(std::env::consts::ARCH))
}

/// Whether `source` already starts with a trampoline of the same shape as `code`
///
/// Stacking a second hook on an already-hooked function overwrites exactly the previous
/// trampoline, which decodes as a short jump followed by data rather than as a function body.
///
/// # Safety
///
/// `source` must be readable for `code.len()` bytes
unsafe fn starts_with_trampoline(source: *const u8, code: &[u8]) -> bool {
    let current = slice::from_raw_parts(source, code.len());
    match code.len() {
        x64::JMP_ABS_LEN => current[..6] == code[..6],
        x64::JMP_REL32_LEN => current[0] == code[0],
        _ => false,
    }
}

/// Simple jmp hook
#[derive(Debug, Default, Clone, Copy)]
pub struct JmpHook {
    /// Underlying patcher to be used to write trampolines
    patcher: BytePatcher,
}
impl JmpHook {
    /// Creates a new jmp hook
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Hook for JmpHook {
    type Error = HookError;
    type Handle = PatchHandle;

    unsafe fn create(
        &self,
        source: *const (),
        replacement: *const (),
        flags: PatchFlags,
    ) -> Result<Self::Handle, Self::Error> {
        if source.is_null() {
            return Err(HookError::NullAddress("source"));
        }
        if replacement.is_null() {
            return Err(HookError::NullAddress("replacement"));
        }

        let code = encode(source, replacement, flags)?;
        if !starts_with_trampoline(source as *const u8, &code) {
            decode::covered_len(source as *const u8, code.len(), BITNESS).map_err(|error| {
                HookError::Unpatchable {
                    address: source as usize,
                    error,
                }
            })?;
        }

        // the only point that may read /proc, nothing is patched yet
        let pages = Pages::query(source as *const u8, code.len())
            .map_err(PermissionError::<BytePatchError>::from)?;

        tracing::debug!(
            "created {}-byte trampoline {:p} -> {:p}",
            code.len(),
            source,
            replacement
        );

        Ok(PatchHandle {
            patcher: PermissionWrapper::new(self.patcher, pages),
            source,
            replacement,
            flags,
            code,
            guard: None,
        })
    }
}

/// One redirect from a source function to a replacement
///
/// The handle can be installed and removed any number of times. Each install snapshots the
/// bytes it overwrites and each removal writes that snapshot back, so the source is
/// byte-identical after every removal. Dropping the handle removes it first.
///
/// Installing and removing only change page protection and copy bytes: they do no I/O and don't
/// allocate, so they are safe to use while libc functions such as `read` are redirected.
pub struct PatchHandle {
    /// Patcher used for every write, with the protection of the source pages
    patcher: PermissionWrapper<BytePatcher>,
    /// Entry point of the function being redirected
    source: *const (),
    /// Where the trampoline sends execution
    replacement: *const (),
    /// Encoding of the trampoline
    flags: PatchFlags,
    /// Trampoline bytes
    code: Vec<u8>,
    /// Present while the trampoline is written at `source`
    guard: Option<PermissionWrapperGuard<BytePatchGuard>>,
}

// SAFETY: the handle only holds code addresses, which are process-global, and every write goes through the protect lock
unsafe impl Send for PatchHandle {}

impl PatchHandle {
    /// Entry point of the function being redirected
    pub fn source(&self) -> *const () {
        self.source
    }

    /// Where the trampoline sends execution
    pub fn replacement(&self) -> *const () {
        self.replacement
    }

    /// Trampoline bytes written at the source while installed
    pub fn trampoline(&self) -> &[u8] {
        &self.code
    }

    /// Bytes the trampoline overwrote, while installed
    pub fn original(&self) -> Option<&[u8]> {
        self.guard.as_ref().map(|g| g.original())
    }

    /// Whether the trampoline is currently written at the source
    pub fn is_installed(&self) -> bool {
        self.guard.is_some()
    }

    /// Writes the trampoline. Does nothing if already installed.
    ///
    /// # Safety
    ///
    /// No thread may be executing the first bytes of the source while they are rewritten
    pub unsafe fn install(&mut self) -> Result<(), HookError> {
        if self.guard.is_some() {
            return Ok(());
        }
        let guard = self.patcher.patch(to_mut(self.source as *const u8), &self.code)?;
        self.guard = Some(guard);
        tracing::debug!("installed hook {:p} -> {:p}", self.source, self.replacement);
        Ok(())
    }

    /// Creates an uninstalled handle that sends the same source to `replacement`
    ///
    /// Reuses what was recorded about the source when this handle was created, so it can be
    /// called while this handle is installed.
    pub fn retarget(&self, replacement: *const ()) -> Result<PatchHandle, HookError> {
        if replacement.is_null() {
            return Err(HookError::NullAddress("replacement"));
        }
        let code = encode(self.source, replacement, self.flags)?;
        Ok(PatchHandle {
            patcher: self.patcher,
            source: self.source,
            replacement,
            flags: self.flags,
            code,
            guard: None,
        })
    }

    /// Restores the bytes the trampoline overwrote. Does nothing if not installed.
    ///
    /// On failure the trampoline stays in place and the handle stays installed.
    pub fn remove(&mut self) -> Result<(), HookError> {
        let Some(guard) = self.guard.as_mut() else {
            return Ok(());
        };
        guard.try_restore()?;
        self.guard = None;
        tracing::debug!("removed hook {:p} -> {:p}", self.source, self.replacement);
        Ok(())
    }

    /// Removes the trampoline and releases the handle
    pub fn free(mut self) -> Result<(), HookError> {
        self.remove()
    }
}

impl fmt::Debug for PatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchHandle")
            .field("source", &self.source)
            .field("replacement", &self.replacement)
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl Drop for PatchHandle {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::error!("failed to restore {:p}: {e}", self.source);
        }
    }
}
