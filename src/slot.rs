//! # Slot
//!
//! A [`HookSlot`] is the single place a hookable function's active patch lives. Slots are
//! `static`s created by [`declare_hookable!`](crate::declare_hookable), so using a function that
//! was never declared fails to resolve at compile time.
//!
//! Every transition is checked: a slot moves `Empty -> Active` on set, `Active <-> Suppressed`
//! on suppress/resume and back to `Empty` on clear, and anything else is reported as an error
//! rather than silently corrupting the patch state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::hook::{HookError, PatchHandle};
use crate::registry;

/// Observable state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// No patch, the original function runs
    Empty,
    /// The redirect runs
    Active,
    /// A patch is held but temporarily removed, the original function runs
    Suppressed,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty",
            Self::Active => "active",
            Self::Suppressed => "suppressed",
        })
    }
}

/// A handle together with the installer that owns it
struct Installed {
    /// Id of the owning installer
    owner: u64,
    /// The patch itself
    handle: PatchHandle,
}

/// Storage for the active patch of one hookable function
pub struct HookSlot {
    /// Name of the function, for diagnostics
    name: &'static str,
    /// At most one patch at a time
    state: Mutex<Option<Installed>>,
    /// Whether the slot has been added to the registry
    enrolled: AtomicBool,
}

impl HookSlot {
    /// Creates an empty slot
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(None),
            enrolled: AtomicBool::new(false),
        }
    }

    /// Name of the function this slot belongs to
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state of the slot
    pub fn status(&self) -> SlotStatus {
        match &*self.state.lock() {
            None => SlotStatus::Empty,
            Some(installed) if installed.handle.is_installed() => SlotStatus::Active,
            Some(_) => SlotStatus::Suppressed,
        }
    }

    /// Whether no patch is held
    pub fn is_empty(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Source address of the held patch
    pub fn source(&self) -> Option<*const ()> {
        self.with_handle(|h| h.map(|h| h.source()))
    }

    /// Replacement address of the held patch
    pub fn replacement(&self) -> Option<*const ()> {
        self.with_handle(|h| h.map(|h| h.replacement()))
    }

    /// Runs `f` with the held patch, if any
    ///
    /// The slot stays locked while `f` runs, so `f` must not call back into this slot.
    pub fn with_handle<R>(&self, f: impl FnOnce(Option<&mut PatchHandle>) -> R) -> R {
        let mut state = self.state.lock();
        f(state.as_mut().map(|installed| &mut installed.handle))
    }

    /// Installs `handle` and stores it on behalf of `owner`
    ///
    /// # Safety
    ///
    /// See [`PatchHandle::install`]
    pub(crate) unsafe fn set(&'static self, owner: u64, mut handle: PatchHandle) -> Result<(), HookError> {
        if !self.enrolled.swap(true, Ordering::AcqRel) {
            registry::enroll(self);
        }

        let mut state = self.state.lock();
        if state.is_some() {
            return Err(HookError::SlotOccupied(self.name));
        }
        handle.install()?;
        *state = Some(Installed { owner, handle });
        Ok(())
    }

    /// Takes the patch out of the slot, leaving it empty
    pub(crate) fn clear(&self, owner: u64) -> Result<PatchHandle, HookError> {
        let mut state = self.state.lock();
        match state.take() {
            Some(installed) if installed.owner == owner => Ok(installed.handle),
            other => {
                *state = other;
                Err(HookError::NotOwner(self.name))
            }
        }
    }

    /// Runs `f` with the patch owned by `owner`
    pub(crate) fn with_owned<R>(
        &self,
        owner: u64,
        f: impl FnOnce(&mut PatchHandle) -> Result<R, HookError>,
    ) -> Result<R, HookError> {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(installed) if installed.owner == owner => f(&mut installed.handle),
            _ => Err(HookError::NotOwner(self.name)),
        }
    }

    /// Removes the active patch while keeping its handle
    pub(crate) fn suppress(&self) -> Result<(), HookError> {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(installed) if installed.handle.is_installed() => installed.handle.remove(),
            _ => Err(HookError::NotActive(self.name)),
        }
    }

    /// Reinstalls a suppressed patch
    pub(crate) fn resume(&self) -> Result<(), HookError> {
        let mut state = self.state.lock();
        match state.as_mut() {
            // Safety: the handle was installed at this source before it was suppressed
            Some(installed) if !installed.handle.is_installed() => unsafe {
                installed.handle.install()
            },
            _ => Err(HookError::NotSuppressed(self.name)),
        }
    }
}

impl fmt::Debug for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSlot")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
