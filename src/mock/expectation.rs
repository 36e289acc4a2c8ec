//! Builders for expectations and default behaviours
//!
//! Both builders work on any handle that dereferences to a [`Mock`], so the same clauses are
//! written against a borrowed mock and against a guard returned by one of the quick macros.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use super::action::Action;
use super::recorder::Mock;

/// How many calls an expectation accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Times {
    /// Fewest calls that satisfy the expectation
    min: usize,
    /// Most calls the expectation accepts, unbounded if `None`
    max: Option<usize>,
}

impl Times {
    /// Exactly `n` calls
    pub const fn exactly(n: usize) -> Self {
        Self {
            min: n,
            max: Some(n),
        }
    }

    /// `n` calls or more
    pub const fn at_least(n: usize) -> Self {
        Self { min: n, max: None }
    }

    /// No more than `n` calls
    pub const fn at_most(n: usize) -> Self {
        Self {
            min: 0,
            max: Some(n),
        }
    }

    /// Between `min` and `max` calls, inclusive
    pub const fn between(min: usize, max: usize) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    /// Any number of calls, including none
    pub const fn any() -> Self {
        Self::at_least(0)
    }

    /// No calls at all
    pub const fn never() -> Self {
        Self::exactly(0)
    }

    /// Whether `calls` falls within the bounds
    pub fn is_satisfied_by(&self, calls: usize) -> bool {
        calls >= self.min && self.max.map_or(true, |max| calls <= max)
    }

    /// Whether another call would exceed the upper bound
    pub fn is_saturated_by(&self, calls: usize) -> bool {
        self.max.map_or(false, |max| calls >= max)
    }
}

/// Plural suffix for a call count
fn calls(n: usize) -> &'static str {
    if n == 1 {
        "call"
    } else {
        "calls"
    }
}

impl fmt::Display for Times {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (0, None) => f.write_str("any number of calls"),
            (min, None) => write!(f, "at least {min} {}", calls(min)),
            (0, Some(max)) => write!(f, "at most {max} {}", calls(max)),
            (min, Some(max)) if min == max => write!(f, "exactly {min} {}", calls(min)),
            (min, Some(max)) => write!(f, "between {min} and {max} calls"),
        }
    }
}

/// Source of sequence ids
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Orders expectations added to it
///
/// An expectation in a sequence only matches once every expectation added to the sequence before
/// it is satisfied. Matching it retires those predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sequence {
    /// Unique id
    id: u64,
}

impl Sequence {
    /// Starts an empty sequence
    pub fn new() -> Self {
        Self {
            id: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Identity shared by every expectation in the sequence
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Clauses of an expected call, applied to the mock as they are chained
pub struct Expectation<H> {
    /// Mock the expectation lives in
    handle: H,
    /// Position in the mock's expectation list
    index: usize,
}

impl<H, A, R> Expectation<H>
where
    H: Deref<Target = Mock<A, R>>,
    A: 'static,
    R: 'static,
{
    /// Builder for the expectation at `index` of the mock behind `handle`
    pub(crate) fn new(handle: H, index: usize) -> Self {
        Self { handle, index }
    }

    /// How many calls are expected, overriding what the actions imply
    pub fn times(self, times: Times) -> Self {
        self.handle.update_expectation(self.index, |e| e.times = Some(times));
        self
    }

    /// Action for the next call. Chained calls run in order, one per call.
    pub fn will_once(self, action: Action<A, R>) -> Self {
        self.handle.update_expectation(self.index, |e| e.once.push(action));
        self
    }

    /// Action for every call after the `will_once` actions are used up
    pub fn will_repeatedly(self, action: Action<A, R>) -> Self {
        self.handle
            .update_expectation(self.index, |e| e.repeatedly = Some(action));
        self
    }

    /// Adds the expectation to `sequence`. It only matches once every earlier member is done.
    pub fn in_sequence(self, sequence: &Sequence) -> Self {
        let id = sequence.id();
        self.handle
            .update_expectation(self.index, |e| e.sequences.push(id));
        self
    }

    /// Retires the expectation once its upper bound is reached, releasing a sequence block
    pub fn retires_on_saturation(self) -> Self {
        self.handle
            .update_expectation(self.index, |e| e.retire_on_saturation = true);
        self
    }

    /// Calls matched by this expectation so far
    pub fn call_count(&self) -> usize {
        self.handle.expectation_calls(self.index)
    }

    /// Gives back the handle, keeping the expectation in place
    pub fn into_inner(self) -> H {
        self.handle
    }
}

impl<H> fmt::Debug for Expectation<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Default behaviour for matching calls that no expectation takes
pub struct DefaultCall<H> {
    /// Mock the default lives in
    handle: H,
    /// Position in the mock's default list
    index: usize,
}

impl<H, A, R> DefaultCall<H>
where
    H: Deref<Target = Mock<A, R>>,
    A: 'static,
    R: 'static,
{
    /// Builder for the default at `index` of the mock behind `handle`
    pub(crate) fn new(handle: H, index: usize) -> Self {
        Self { handle, index }
    }

    /// Action run for matching calls no expectation takes
    pub fn will_by_default(self, action: Action<A, R>) -> Self {
        self.handle
            .update_default(self.index, |d| d.action = Some(action));
        self
    }

    /// Gives back the handle, keeping the default in place
    pub fn into_inner(self) -> H {
        self.handle
    }
}

impl<H> fmt::Debug for DefaultCall<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultCall")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
