//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another

use thiserror::Error;

use crate::code::decode::DecodeError;
use crate::patcher::byte::BytePatchError;
use crate::patcher::mem::PermissionError;

pub mod jmphook;

pub use jmphook::{JmpHook, PatchHandle};

bitflags::bitflags! {
    /// Options for how a trampoline is encoded
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PatchFlags: u32 {
        /// Use a 14-byte absolute jump instead of a 5-byte relative one, so the replacement may
        /// live anywhere in the address space. Only valid on x86-64.
        const OFFSET_64BIT = 1 << 0;
    }
}

impl PatchFlags {
    /// Flags suited to the architecture this crate was built for
    pub const fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::OFFSET_64BIT
        } else {
            Self::empty()
        }
    }
}

impl Default for PatchFlags {
    fn default() -> Self {
        Self::host()
    }
}

/// Errors from creating, toggling or tracking hooks
#[derive(Debug, Error)]
pub enum HookError {
    /// A null pointer was passed in as an address
    #[error("null {0} address")]
    NullAddress(&'static str),
    /// Trampolines can't be generated for this architecture
    #[error("hooking is not supported on {0}")]
    UnsupportedArch(&'static str),
    /// The flags can't be honoured on this architecture
    #[error("patch flags {0:?} are not supported on this architecture")]
    UnsupportedFlags(PatchFlags),
    /// A relative jump can't reach the replacement
    #[error("replacement {replacement:#x} is out of rel32 range of {address:#x}")]
    OutOfRange {
        /// Function being patched
        address: usize,
        /// Where the jump needs to land
        replacement: usize,
    },
    /// The code at the target can't hold a trampoline
    #[error("cannot patch {address:#x}: {error}")]
    Unpatchable {
        /// Function being patched
        address: usize,
        /// Why its entry was rejected
        #[source]
        error: DecodeError,
    },
    /// Memory protections couldn't be changed around the write
    #[error("{0}")]
    Permission(#[from] PermissionError<BytePatchError>),
    /// The slot already holds a patch owned by someone else
    #[error("hook slot `{0}` already holds a patch")]
    SlotOccupied(&'static str),
    /// The slot's patch belongs to a different installer, or it was already cleared
    #[error("hook slot `{0}` is not owned by this installer")]
    NotOwner(&'static str),
    /// Suppress or replace was requested while the patch isn't active
    #[error("hook slot `{0}` has no active patch")]
    NotActive(&'static str),
    /// Resume was requested while the patch isn't suppressed
    #[error("hook slot `{0}` is not suppressed")]
    NotSuppressed(&'static str),
}

/// Trait for hooks
///
/// # Safety
///
/// Hooks are inherently unsafe; it is up to the hook to leave the target intact once its handle is gone
pub unsafe trait Hook {
    /// Errors that could happen during a hook
    type Error;
    /// Handle which toggles the redirect on and off and restores the target when dropped
    type Handle;

    /// Creates a hook which redirects `source` to `replacement`. The hook is not active until the handle is installed.
    ///
    /// # Safety
    ///
    /// - Both `source` and `replacement` must be valid pointers
    /// - `replacement` must be valid executable code accepting the calling convention of `source`
    unsafe fn create(
        &self,
        source: *const (),
        replacement: *const (),
        flags: PatchFlags,
    ) -> Result<Self::Handle, Self::Error>;
}
