//! # Registry
//!
//! Process-wide view of every slot that has ever held a patch. Slots enrol themselves the first
//! time something is installed in them, so the registry never needs explicit registration.

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::slot::{HookSlot, SlotStatus};

lazy_static! {
    /// Every slot that has been used at least once
    static ref SLOTS: Mutex<Vec<&'static HookSlot>> = Mutex::new(Vec::new());
}

/// Adds a slot to the registry
pub(crate) fn enroll(slot: &'static HookSlot) {
    tracing::trace!("enrolling hook slot `{}`", slot.name());
    SLOTS.lock().push(slot);
}

/// Snapshot of a non-empty slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveHook {
    /// Function name
    pub name: &'static str,
    /// Address of the hooked function
    pub source: usize,
    /// Address execution is sent to
    pub replacement: usize,
    /// Active or suppressed
    pub status: SlotStatus,
}

/// Lists every slot that currently holds a patch, in enrolment order
pub fn active_hooks() -> Vec<ActiveHook> {
    let slots = SLOTS.lock().clone();
    slots
        .into_iter()
        .filter_map(|slot| {
            let status = slot.status();
            slot.with_handle(|handle| {
                handle.map(|handle| ActiveHook {
                    name: slot.name(),
                    source: handle.source() as usize,
                    replacement: handle.replacement() as usize,
                    status,
                })
            })
        })
        .collect()
}

/// Panics with the list of slots that still hold a patch
///
/// Meant for the end of a test body, after every installer should have gone out of scope.
#[track_caller]
pub fn assert_all_empty() {
    let active = active_hooks();
    if !active.is_empty() {
        let names: Vec<_> = active
            .iter()
            .map(|hook| format!("{} ({})", hook.name, hook.status))
            .collect();
        panic!("hooks still installed: {}", names.join(", "));
    }
}
