#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod code;
pub mod hook;
pub mod mock;
pub mod patcher;
pub mod registry;
pub mod scoped;
pub mod slot;

pub use hook::{HookError, PatchFlags};
pub use mock::{install_mock, Action, Matcher, MockFailure, MockGuard, Mockable, Sequence, Times};
pub use registry::{active_hooks, assert_all_empty};
pub use scoped::{fatal, ScopedHookInstall, ScopedHookRemove};
pub use slot::{HookSlot, SlotStatus};

#[doc(hidden)]
pub use paste;

/// Declares functions that can be hooked with [`install_hook!`]
///
/// Creates one [`HookSlot`] per function, in the module the macro is invoked in.
///
/// ```ignore
/// use libc::{fopen, sprintf};
/// scopehook::declare_hookable!(fopen, pub(crate) sprintf);
/// ```
#[macro_export]
macro_rules! declare_hookable {
    ($($vis:vis $func:ident),+ $(,)?) => {
        $(
            $crate::paste::paste! {
                #[doc(hidden)]
                #[allow(non_upper_case_globals)]
                $vis static [<__scopehook_slot_ $func>]: $crate::HookSlot =
                    $crate::HookSlot::new(stringify!($func));
            }
        )+
    };
}

/// The [`HookSlot`] declared for `func` by [`declare_hookable!`]
#[macro_export]
macro_rules! hook_slot {
    ($func:ident) => {
        $crate::paste::paste! { &[<__scopehook_slot_ $func>] }
    };
}

/// Redirects `func` to `stub` until the returned [`ScopedHookInstall`] is dropped
///
/// Must be used inside an `unsafe` block; see [`ScopedHookInstall::new`] for the contract. Any
/// failure to patch is fatal.
///
/// ```ignore
/// let hook = unsafe { install_hook!(fopen, fake_fopen) };
/// unsafe { replace_hook!(hook, other_fopen) };
/// ```
#[macro_export]
macro_rules! install_hook {
    ($func:ident, $stub:expr $(,)?) => {
        $crate::install_hook!($func, $stub, $crate::PatchFlags::host())
    };
    ($func:ident, $stub:expr, $flags:expr $(,)?) => {
        $crate::ScopedHookInstall::with_flags(
            $crate::hook_slot!($func),
            $func as *const (),
            $stub as *const (),
            $flags,
        )
        .unwrap_or_else(|e| $crate::fatal(e))
    };
}

/// Sends the calls `guard` redirects to `stub` instead
///
/// `guard` is the [`ScopedHookInstall`] returned by [`install_hook!`]. Must be used inside an
/// `unsafe` block; see [`ScopedHookInstall::replace`] for the contract. Any failure is fatal, and
/// the previous stub stays installed until then.
#[macro_export]
macro_rules! replace_hook {
    ($guard:expr, $stub:expr $(,)?) => {
        $guard
            .replace($stub as *const ())
            .unwrap_or_else(|e| $crate::fatal(e))
    };
}

/// Removes the active hook on `func` until the end of the enclosing block
///
/// Used inside a stub to reach the real function. Fatal if `func` isn't actively hooked.
#[macro_export]
macro_rules! suppress_hook {
    ($func:ident) => {
        let _scopehook_suppress = $crate::ScopedHookRemove::new($crate::hook_slot!($func))
            .unwrap_or_else(|e| $crate::fatal(e));
    };
}

/// Return type of a mockable declaration
#[doc(hidden)]
#[macro_export]
macro_rules! __mock_ret {
    () => {
        ()
    };
    ($ret:ty) => {
        $ret
    };
}

/// Declares a function that can be mocked with [`install_mock!`]
///
/// The declaration repeats the function's signature. The parameter list is what the generated
/// `extern "C"` adapter takes, and the [`Mock`](mock::Mock) it forwards to sees them as one tuple.
///
/// ```ignore
/// use libc::{c_int, fclose, FILE};
/// scopehook::declare_mockable!(fn fclose(stream: *mut FILE) -> c_int);
/// ```
#[macro_export]
macro_rules! declare_mockable {
    ($vis:vis fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)?) => {
        $crate::paste::paste! {
            #[doc(hidden)]
            #[allow(non_camel_case_types)]
            $vis struct [<__scopehook_mock_ $name>];

            #[doc(hidden)]
            #[allow(non_upper_case_globals)]
            $vis static [<__scopehook_mock_slot_ $name>]: $crate::mock::MockSlot<
                ($($ty,)*),
                $crate::__mock_ret!($($ret)?),
            > = $crate::mock::MockSlot::new(stringify!($name));

            unsafe impl $crate::mock::Mockable for [<__scopehook_mock_ $name>] {
                type Args = ($($ty,)*);
                type Ret = $crate::__mock_ret!($($ret)?);

                const NAME: &'static str = stringify!($name);
                const ARITY: usize = <[&str]>::len(&[$(stringify!($arg)),*]);

                fn source() -> *const () {
                    let real: unsafe extern "C" fn($($ty),*) $(-> $ret)? = $name;
                    real as *const ()
                }

                fn adapter() -> *const () {
                    extern "C" fn adapter($($arg: $ty),*) $(-> $ret)? {
                        <[<__scopehook_mock_ $name>] as $crate::mock::Mockable>::slot()
                            .dispatch(($($arg,)*))
                    }
                    let adapter: extern "C" fn($($ty),*) $(-> $ret)? = adapter;
                    adapter as *const ()
                }

                fn slot() -> &'static $crate::mock::MockSlot<Self::Args, Self::Ret> {
                    &[<__scopehook_mock_slot_ $name>]
                }
            }
        }
    };
}

/// The [`Mockable`] type generated for `name` by [`declare_mockable!`]
///
/// ```ignore
/// let guard = scopehook::install_mock::<mockable!(fclose)>()?;
/// ```
#[macro_export]
macro_rules! mockable {
    ($name:ident) => {
        $crate::paste::paste! { [<__scopehook_mock_ $name>] }
    };
}

/// Installs a fresh [`Mock`](mock::Mock) for a function declared with [`declare_mockable!`]
///
/// Returns the [`MockGuard`]. Fatal if the function can't be patched or already has a mock.
#[macro_export]
macro_rules! install_mock {
    ($name:ident) => {
        $crate::paste::paste! {
            $crate::mock::install_mock::<[<__scopehook_mock_ $name>]>()
                .unwrap_or_else(|e| $crate::fatal(e))
        }
    };
}

/// Installs a mock and adds one expectation to it, returning an
/// [`OwnedExpectation`](mock::OwnedExpectation) that owns the mock
///
/// ```ignore
/// let _close = install_expect_call!(fclose).will_once(ret(0));
/// ```
#[macro_export]
macro_rules! install_expect_call {
    ($name:ident $(,)?) => {
        $crate::install_expect_call!($name, $crate::Matcher::any())
    };
    ($name:ident, $matcher:expr $(,)?) => {
        $crate::install_mock!($name).into_expect_call($matcher)
    };
}

/// Installs a mock and gives it one default, returning an [`OwnedDefault`](mock::OwnedDefault)
/// that owns the mock
#[macro_export]
macro_rules! install_on_call {
    ($name:ident $(,)?) => {
        $crate::install_on_call!($name, $crate::Matcher::any())
    };
    ($name:ident, $matcher:expr $(,)?) => {
        $crate::install_mock!($name).into_on_call($matcher)
    };
}
