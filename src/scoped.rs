//! # Scoped
//!
//! Guards that tie a patch to a lexical scope. [`ScopedHookInstall`] holds a redirect for as long
//! as it lives, and [`ScopedHookRemove`] temporarily lifts one so the real function can be
//! called from inside its own stub.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::hook::{Hook, HookError, JmpHook, PatchFlags, PatchHandle};
use crate::slot::HookSlot;

/// Source of installer ids
static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Reports an error that leaves no way to continue safely
///
/// Panics with the error text, or aborts if the thread is already unwinding since a second
/// panic would abort anyway without a message.
#[cold]
#[track_caller]
pub fn fatal(error: HookError) -> ! {
    tracing::error!("fatal hook error: {error}");
    if std::thread::panicking() {
        eprintln!("fatal hook error while unwinding: {error}");
        std::process::abort();
    }
    panic!("{error}");
}

/// Holds a redirect of one function for the lifetime of the guard
#[must_use = "the hook is removed as soon as the guard is dropped"]
pub struct ScopedHookInstall {
    /// Slot holding the patch
    slot: &'static HookSlot,
    /// Function being redirected
    source: *const (),
    /// Id stored in the slot alongside the patch
    owner: u64,
    /// Replacement currently installed
    replacement: Cell<*const ()>,
}

impl ScopedHookInstall {
    /// Redirects `source` to `replacement` using the encoding best suited to the host
    ///
    /// # Safety
    ///
    /// - `source` must be the entry point of a function in this process
    /// - `replacement` must be a function with the same signature and calling convention
    /// - No other thread may be executing the entry of `source` while it is patched or restored
    pub unsafe fn new(
        slot: &'static HookSlot,
        source: *const (),
        replacement: *const (),
    ) -> Result<Self, HookError> {
        Self::with_flags(slot, source, replacement, PatchFlags::host())
    }

    /// Same as [`ScopedHookInstall::new`] with an explicit trampoline encoding
    ///
    /// # Safety
    ///
    /// See [`ScopedHookInstall::new`]
    pub unsafe fn with_flags(
        slot: &'static HookSlot,
        source: *const (),
        replacement: *const (),
        flags: PatchFlags,
    ) -> Result<Self, HookError> {
        let handle = JmpHook::new().create(source, replacement, flags)?;
        let owner = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        slot.set(owner, handle)?;
        tracing::debug!("hooked `{}` {:p} -> {:p}", slot.name(), source, replacement);

        Ok(Self {
            slot,
            source,
            owner,
            replacement: Cell::new(replacement),
        })
    }

    /// Sends subsequent calls to `replacement` instead
    ///
    /// If the new patch can't be created or installed the previous one is put back and the
    /// error returned.
    ///
    /// # Safety
    ///
    /// See [`ScopedHookInstall::new`]
    pub unsafe fn replace(&self, replacement: *const ()) -> Result<(), HookError> {
        let name = self.slot.name();
        self.slot.with_owned(self.owner, |handle| {
            if !handle.is_installed() {
                return Err(HookError::NotActive(name));
            }
            let mut next = handle.retarget(replacement)?;
            handle.remove()?;
            if let Err(e) = next.install() {
                handle.install()?;
                return Err(e);
            }
            std::mem::swap(handle, &mut next);
            // the old handle is no longer installed so dropping it writes nothing
            drop(next);
            Ok(())
        })?;
        self.replacement.set(replacement);
        tracing::debug!("rehooked `{}` {:p} -> {:p}", name, self.source, replacement);
        Ok(())
    }

    /// Slot this guard installed into
    pub fn slot(&self) -> &'static HookSlot {
        self.slot
    }

    /// Function being redirected
    pub fn source(&self) -> *const () {
        self.source
    }

    /// Replacement currently installed
    pub fn replacement(&self) -> *const () {
        self.replacement.get()
    }

    /// Removes the redirect, restoring the original bytes
    ///
    /// The slot only empties once the bytes are back, so a failure leaves it holding the patch.
    fn uninstall(&self) -> Result<(), HookError> {
        self.slot.with_owned(self.owner, PatchHandle::remove)?;
        self.slot.clear(self.owner)?.free()?;
        tracing::debug!("unhooked `{}` {:p}", self.slot.name(), self.source);
        Ok(())
    }
}

impl fmt::Debug for ScopedHookInstall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedHookInstall")
            .field("slot", &self.slot.name())
            .field("source", &self.source)
            .field("replacement", &self.replacement.get())
            .finish()
    }
}

impl Drop for ScopedHookInstall {
    fn drop(&mut self) {
        if let Err(e) = self.uninstall() {
            fatal(e);
        }
    }
}

/// Suspends an active redirect for the lifetime of the guard
#[must_use = "the hook is reinstalled as soon as the guard is dropped"]
pub struct ScopedHookRemove {
    /// Slot whose patch is suspended
    slot: &'static HookSlot,
    /// Ties the guard to the thread that suspended the patch
    _not_send: PhantomData<*const ()>,
}

impl ScopedHookRemove {
    /// Removes the active patch in `slot` until the guard is dropped
    pub fn new(slot: &'static HookSlot) -> Result<Self, HookError> {
        slot.suppress()?;
        tracing::trace!("suppressed `{}`", slot.name());
        Ok(Self {
            slot,
            _not_send: PhantomData,
        })
    }

    /// Slot whose patch is suspended
    pub fn slot(&self) -> &'static HookSlot {
        self.slot
    }
}

impl fmt::Debug for ScopedHookRemove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedHookRemove")
            .field("slot", &self.slot.name())
            .finish()
    }
}

impl Drop for ScopedHookRemove {
    fn drop(&mut self) {
        match self.slot.resume() {
            Ok(()) => tracing::trace!("resumed `{}`", self.slot.name()),
            Err(e) => fatal(e),
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use std::hint::black_box;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::slot::SlotStatus;

    #[inline(never)]
    #[no_mangle]
    extern "C" fn scoped_test_target(x: i64) -> i64 {
        let mut acc = black_box(x);
        for i in 0..black_box(3i64) {
            acc = acc.wrapping_add(i).wrapping_mul(2);
        }
        acc
    }

    #[inline(never)]
    #[no_mangle]
    extern "C" fn scoped_test_first(_x: i64) -> i64 {
        black_box(-1)
    }

    #[inline(never)]
    #[no_mangle]
    extern "C" fn scoped_test_second(_x: i64) -> i64 {
        black_box(-2)
    }

    static CALLS: AtomicUsize = AtomicUsize::new(0);
    static SLOT: HookSlot = HookSlot::new("scoped_test_target");

    /// Calls the target through an opaque pointer so the patched entry is always used
    fn call(x: i64) -> i64 {
        black_box(scoped_test_target as extern "C" fn(i64) -> i64)(x)
    }

    #[inline(never)]
    #[no_mangle]
    extern "C" fn scoped_test_passthrough(x: i64) -> i64 {
        CALLS.fetch_add(1, Ordering::Relaxed);
        let _suppress = ScopedHookRemove::new(&SLOT).unwrap();
        call(x) + 1000
    }

    /// All scenarios share one target, so they share one test
    #[test]
    fn install_replace_suppress() {
        // (((0+0)*2+1)*2+2)*2 = 8
        assert_eq!(call(0), 8);

        {
            let install = unsafe {
                ScopedHookInstall::new(&SLOT, scoped_test_target as *const (), scoped_test_first as *const ())
            }
            .unwrap();
            assert_eq!(call(0), -1);
            assert_eq!(SLOT.status(), SlotStatus::Active);

            for _ in 0..3 {
                unsafe { install.replace(scoped_test_second as *const ()).unwrap() };
                assert_eq!(call(0), -2);
                unsafe { install.replace(scoped_test_first as *const ()).unwrap() };
                assert_eq!(call(0), -1);
            }
            assert_eq!(install.replacement(), scoped_test_first as *const ());

            // a failed replace keeps the previous redirect
            let err = unsafe { install.replace(std::ptr::null()) }.unwrap_err();
            assert!(matches!(err, HookError::NullAddress(_)));
            assert_eq!(call(0), -1);

            // the slot holds a single patch
            let err = unsafe {
                ScopedHookInstall::new(&SLOT, scoped_test_target as *const (), scoped_test_second as *const ())
            }
            .unwrap_err();
            assert!(matches!(err, HookError::SlotOccupied(_)));
            assert_eq!(call(0), -1);

            {
                let _suppress = ScopedHookRemove::new(&SLOT).unwrap();
                assert_eq!(SLOT.status(), SlotStatus::Suppressed);
                assert_eq!(call(0), 8);
                assert!(matches!(ScopedHookRemove::new(&SLOT), Err(HookError::NotActive(_))));
                // replacing isn't possible while suppressed
                assert!(matches!(
                    unsafe { install.replace(scoped_test_second as *const ()) },
                    Err(HookError::NotActive(_))
                ));
            }
            assert_eq!(call(0), -1);

            // a stub that calls the real function through a suppressor
            unsafe { install.replace(scoped_test_passthrough as *const ()).unwrap() };
            assert_eq!(call(0), 1008);
            assert_eq!(call(0), 1008);
            assert_eq!(CALLS.load(Ordering::Relaxed), 2);
            assert_eq!(SLOT.status(), SlotStatus::Active);
        }

        assert_eq!(SLOT.status(), SlotStatus::Empty);
        assert_eq!(call(0), 8);
    }

    #[test]
    fn suppress_without_hook_fails() {
        static UNUSED: HookSlot = HookSlot::new("unused");
        assert!(matches!(ScopedHookRemove::new(&UNUSED), Err(HookError::NotActive("unused"))));
    }

    #[test]
    #[should_panic(expected = "already holds a patch")]
    fn fatal_panics_with_error_text() {
        fatal(HookError::SlotOccupied("fopen"));
    }
}
