//! Argument matchers, actions and default return values

use std::fmt;
use std::sync::Arc;

/// Predicate over the argument tuple of a mocked call
pub struct Matcher<A>(Arc<dyn Fn(&A) -> bool>);

impl<A: 'static> Matcher<A> {
    /// Matches every call
    pub fn any() -> Self {
        Self(Arc::new(|_| true))
    }

    /// Matches calls for which `f` returns true
    pub fn with(f: impl Fn(&A) -> bool + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Matches calls whose arguments equal `expected`
    pub fn equals(expected: A) -> Self
    where
        A: PartialEq,
    {
        Self(Arc::new(move |args| *args == expected))
    }
}

impl<A> Matcher<A> {
    /// Whether a call with `args` is accepted
    pub fn matches(&self, args: &A) -> bool {
        (self.0)(args)
    }
}

impl<A> Clone for Matcher<A> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<A> fmt::Debug for Matcher<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Matcher")
    }
}

/// What a mocked call does once it has been matched
pub struct Action<A, R>(Arc<dyn Fn(&A) -> R>);

impl<A: 'static, R: 'static> Action<A, R> {
    /// Returns a clone of `value`
    pub fn ret(value: R) -> Self
    where
        R: Clone,
    {
        Self(Arc::new(move |_| value.clone()))
    }

    /// Calls `f` with the arguments of the call
    pub fn invoke(f: impl Fn(&A) -> R + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl<A, R> Action<A, R> {
    /// Runs the action for a call with `args`
    pub fn perform(&self, args: &A) -> R {
        (self.0)(args)
    }
}

impl<A, R> Clone for Action<A, R> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<A, R> fmt::Debug for Action<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Action")
    }
}

/// Shorthand for [`Action::ret`]
pub fn ret<A: 'static, R: Clone + 'static>(value: R) -> Action<A, R> {
    Action::ret(value)
}

/// Shorthand for [`Action::invoke`]
pub fn invoke<A: 'static, R: 'static>(f: impl Fn(&A) -> R + 'static) -> Action<A, R> {
    Action::invoke(f)
}

/// Value a mocked call returns when nothing was configured for it
pub trait DefaultReturn {
    /// The value itself
    fn default_return() -> Self;
}

/// Implements [`DefaultReturn`] through [`Default`]
macro_rules! default_return {
    ($($ty:ty),* $(,)?) => {
        $(
            impl DefaultReturn for $ty {
                fn default_return() -> Self {
                    <$ty as Default>::default()
                }
            }
        )*
    };
}

default_return!(
    (), bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
);

impl<T> DefaultReturn for *const T {
    fn default_return() -> Self {
        std::ptr::null()
    }
}

impl<T> DefaultReturn for *mut T {
    fn default_return() -> Self {
        std::ptr::null_mut()
    }
}

impl<T> DefaultReturn for Option<T> {
    fn default_return() -> Self {
        None
    }
}
