//! # Mock
//!
//! Binds a [`Mock`] to a C function. A function made mockable with
//! [`declare_mockable!`](crate::declare_mockable) gets a generated `extern "C"` adapter with the
//! original signature; installing a mock redirects the function to that adapter, which packs the
//! arguments into a tuple and hands them to whichever mock is bound at the time.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hook::HookError;
use crate::scoped::ScopedHookInstall;
use crate::slot::HookSlot;

pub mod action;
pub mod expectation;
pub mod recorder;

pub use action::{invoke, ret, Action, DefaultReturn, Matcher};
pub use expectation::{DefaultCall, Expectation, Sequence, Times};
pub use recorder::{Mock, MockFailure};

/// Slot and bound mock of one mockable function
pub struct MockSlot<A, R> {
    /// Holds the redirect to the adapter
    hook: HookSlot,
    /// Mock the adapter forwards to
    bound: Mutex<Option<Arc<Mock<A, R>>>>,
}

// SAFETY: the bound mock is only reached through the generated adapter, on whichever thread
// calls the mocked function. Concurrent calls into one mock are serialised by its own lock, and
// matchers and actions are only ever run by the thread making the call.
unsafe impl<A, R> Sync for MockSlot<A, R> {}

impl<A, R> MockSlot<A, R>
where
    A: fmt::Debug + 'static,
    R: DefaultReturn + 'static,
{
    /// Unbound slot for the function called `name`
    pub const fn new(name: &'static str) -> Self {
        Self {
            hook: HookSlot::new(name),
            bound: Mutex::new(None),
        }
    }

    /// Slot holding the redirect to the adapter
    pub fn hook(&'static self) -> &'static HookSlot {
        &self.hook
    }

    /// Whether a mock is receiving calls
    pub fn is_bound(&self) -> bool {
        self.bound.lock().is_some()
    }

    /// Binds `mock`, failing if another mock is already bound
    fn bind(&self, mock: Arc<Mock<A, R>>) -> Result<(), HookError> {
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err(HookError::SlotOccupied(self.hook.name()));
        }
        *bound = Some(mock);
        Ok(())
    }

    /// Takes the bound mock, if any
    fn unbind(&self) -> Option<Arc<Mock<A, R>>> {
        self.bound.lock().take()
    }

    /// Forwards a call to the bound mock
    ///
    /// Called by the generated adapter. With no mock bound the call returns the default value.
    pub fn dispatch(&self, args: A) -> R {
        let mock = self.bound.lock().clone();
        match mock {
            Some(mock) => mock.call(args),
            None => {
                tracing::warn!("`{}` called with no mock bound", self.hook.name());
                R::default_return()
            }
        }
    }
}

impl<A, R> fmt::Debug for MockSlot<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSlot")
            .field("hook", &self.hook)
            .field("bound", &self.bound.lock().is_some())
            .finish()
    }
}

/// A function that can be mocked
///
/// Implemented by [`declare_mockable!`](crate::declare_mockable).
///
/// # Safety
///
/// - [`Mockable::source`] must return the entry point of a function that can be patched
/// - [`Mockable::adapter`] must return a function with exactly the same signature and calling
///   convention, which hands its arguments to [`Mockable::slot`] as [`Mockable::Args`]
/// - No other thread may be executing the entry of the function while a mock is installed or
///   removed
pub unsafe trait Mockable: 'static {
    /// Argument tuple
    type Args: fmt::Debug + 'static;
    /// Return type, `()` for functions without one
    type Ret: DefaultReturn + 'static;

    /// Function name
    const NAME: &'static str;
    /// Number of parameters
    const ARITY: usize;

    /// Address of the real function
    fn source() -> *const ();
    /// Address of the generated adapter
    fn adapter() -> *const ();
    /// Slot the adapter dispatches through
    fn slot() -> &'static MockSlot<Self::Args, Self::Ret>;
}

/// Redirects `M` to a fresh mock until the returned guard is dropped
pub fn install_mock<M: Mockable>() -> Result<MockGuard<M>, HookError> {
    let slot = M::slot();
    let mock = Arc::new(Mock::new(M::NAME));
    slot.bind(Arc::clone(&mock))?;

    // Safety: upheld by the `Mockable` implementation
    let install = unsafe { ScopedHookInstall::new(slot.hook(), M::source(), M::adapter()) };
    match install {
        Ok(install) => {
            tracing::debug!("mocked `{}` with {} argument(s)", M::NAME, M::ARITY);
            Ok(MockGuard {
                mock,
                install: Some(install),
                _marker: PhantomData,
            })
        }
        Err(e) => {
            slot.unbind();
            Err(e)
        }
    }
}

/// Keeps a mock installed, verifying it when dropped
///
/// Dropping the guard restores the real function, unbinds the mock and panics with every
/// recorded failure, unless the thread is already panicking.
#[must_use = "the mock is removed as soon as the guard is dropped"]
pub struct MockGuard<M: Mockable> {
    /// Bound mock
    mock: Arc<Mock<M::Args, M::Ret>>,
    /// Redirect to the adapter, taken when dropped
    install: Option<ScopedHookInstall>,
    /// Function being mocked
    _marker: PhantomData<M>,
}

impl<M: Mockable> MockGuard<M> {
    /// Mock receiving the calls
    pub fn mock(&self) -> &Mock<M::Args, M::Ret> {
        &self.mock
    }

    /// Adds an expectation that owns this guard
    #[track_caller]
    pub fn into_expect_call(self, matcher: Matcher<M::Args>) -> OwnedExpectation<M> {
        let index = self.mock.push_expectation(matcher, Location::caller());
        OwnedExpectation(Expectation::new(self, index))
    }

    /// Adds a default that owns this guard
    pub fn into_on_call(self, matcher: Matcher<M::Args>) -> OwnedDefault<M> {
        let index = self.mock.push_default(matcher);
        OwnedDefault(DefaultCall::new(self, index))
    }
}

impl<M: Mockable> Deref for MockGuard<M> {
    type Target = Mock<M::Args, M::Ret>;

    fn deref(&self) -> &Self::Target {
        &self.mock
    }
}

impl<M: Mockable> fmt::Debug for MockGuard<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockGuard")
            .field("mock", &self.mock)
            .field("install", &self.install)
            .finish()
    }
}

impl<M: Mockable> Drop for MockGuard<M> {
    fn drop(&mut self) {
        drop(self.install.take());
        M::slot().unbind();

        let failures = self.mock.verify_and_clear();
        if failures.is_empty() {
            return;
        }
        for failure in &failures {
            tracing::error!("{failure}");
        }
        if !std::thread::panicking() {
            let report: Vec<_> = failures.iter().map(ToString::to_string).collect();
            panic!(
                "{} mock failure(s) for `{}`:\n  {}",
                failures.len(),
                M::NAME,
                report.join("\n  ")
            );
        }
    }
}

/// An [`Expectation`] that owns its mock, as built by
/// [`install_expect_call!`](crate::install_expect_call)
#[must_use = "the mock is removed and verified as soon as the expectation is dropped"]
pub struct OwnedExpectation<M: Mockable>(Expectation<MockGuard<M>>);

impl<M: Mockable> OwnedExpectation<M> {
    /// See [`Expectation::times`]
    pub fn times(self, times: Times) -> Self {
        Self(self.0.times(times))
    }

    /// See [`Expectation::will_once`]
    pub fn will_once(self, action: Action<M::Args, M::Ret>) -> Self {
        Self(self.0.will_once(action))
    }

    /// See [`Expectation::will_repeatedly`]
    pub fn will_repeatedly(self, action: Action<M::Args, M::Ret>) -> Self {
        Self(self.0.will_repeatedly(action))
    }

    /// See [`Expectation::in_sequence`]
    pub fn in_sequence(self, sequence: &Sequence) -> Self {
        Self(self.0.in_sequence(sequence))
    }

    /// See [`Expectation::retires_on_saturation`]
    pub fn retires_on_saturation(self) -> Self {
        Self(self.0.retires_on_saturation())
    }

    /// Calls matched by this expectation so far
    pub fn call_count(&self) -> usize {
        self.0.call_count()
    }

    /// Gives back the guard, keeping the expectation in place
    pub fn into_inner(self) -> MockGuard<M> {
        self.0.into_inner()
    }
}

impl<M: Mockable> fmt::Debug for OwnedExpectation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedExpectation").field(&self.0).finish()
    }
}

/// A [`DefaultCall`] that owns its mock, as built by [`install_on_call!`](crate::install_on_call)
#[must_use = "the mock is removed and verified as soon as the default is dropped"]
pub struct OwnedDefault<M: Mockable>(DefaultCall<MockGuard<M>>);

impl<M: Mockable> OwnedDefault<M> {
    /// See [`DefaultCall::will_by_default`]
    pub fn will_by_default(self, action: Action<M::Args, M::Ret>) -> Self {
        Self(self.0.will_by_default(action))
    }

    /// Gives back the guard, keeping the default in place
    pub fn into_inner(self) -> MockGuard<M> {
        self.0.into_inner()
    }
}

impl<M: Mockable> fmt::Debug for OwnedDefault<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedDefault").field(&self.0).finish()
    }
}
