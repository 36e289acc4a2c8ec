//! # Recorder
//!
//! The call-recording engine behind every mocked function. A [`Mock`] holds the expectations and
//! defaults configured for one function, picks the action for each incoming call, and collects
//! the failures that are reported when the mock is verified.

use std::fmt;
use std::panic::Location;

use parking_lot::Mutex;
use thiserror::Error;

use super::action::{Action, DefaultReturn, Matcher};
use super::expectation::{DefaultCall, Expectation, Times};

/// A failure recorded by a mock, reported when it is verified
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// No expectation or default matched the call
    #[error("unexpected call to `{mock}` with {args}")]
    UnexpectedCall {
        /// Mocked function
        mock: &'static str,
        /// Debug rendering of the arguments
        args: String,
    },
    /// The only matching expectations were waiting on earlier ones in their sequence
    #[error("call to `{mock}` with {args} matched the expectation at {location} out of sequence")]
    SequenceViolation {
        /// Mocked function
        mock: &'static str,
        /// Debug rendering of the arguments
        args: String,
        /// Where the blocked expectation was declared
        location: &'static Location<'static>,
    },
    /// The expectation wasn't called the right number of times
    #[error("`{mock}` expected {expected} at {location} but got {actual}")]
    Unsatisfied {
        /// Mocked function
        mock: &'static str,
        /// Where the expectation was declared
        location: &'static Location<'static>,
        /// What was expected
        expected: Times,
        /// Calls that matched
        actual: usize,
    },
}

/// An expected call and its progress
pub(crate) struct ExpectationState<A, R> {
    /// Which calls the expectation accepts
    matcher: Matcher<A>,
    /// Where the expectation was declared
    location: &'static Location<'static>,
    /// Explicit cardinality
    pub(crate) times: Option<Times>,
    /// One action per call, in order
    pub(crate) once: Vec<Action<A, R>>,
    /// Action after `once` is used up
    pub(crate) repeatedly: Option<Action<A, R>>,
    /// Sequences the expectation belongs to
    pub(crate) sequences: Vec<u64>,
    /// Whether saturation retires the expectation
    pub(crate) retire_on_saturation: bool,
    /// Calls matched so far
    calls: usize,
    /// Retired expectations never match again
    retired: bool,
}

impl<A, R> ExpectationState<A, R> {
    /// Cardinality, explicit or implied by the actions
    fn cardinality(&self) -> Times {
        if let Some(times) = self.times {
            return times;
        }
        match (self.once.len(), self.repeatedly.is_some()) {
            (0, false) => Times::exactly(1),
            (n, false) => Times::exactly(n),
            (n, true) => Times::at_least(n),
        }
    }

    /// Whether enough calls were seen
    fn is_satisfied(&self) -> bool {
        self.cardinality().is_satisfied_by(self.calls)
    }

    /// Whether another call would be too many
    fn is_saturated(&self) -> bool {
        self.cardinality().is_saturated_by(self.calls)
    }

    /// Whether the expectation could take a call with these arguments, ignoring sequences
    fn accepts(&self, args: &A) -> bool {
        !self.retired && !self.is_saturated() && self.matcher.matches(args)
    }

    /// Counts a call and picks its action
    fn take_call(&mut self) -> Option<Action<A, R>> {
        let action = self
            .once
            .get(self.calls)
            .or(self.repeatedly.as_ref())
            .cloned();
        self.calls += 1;
        if self.retire_on_saturation && self.is_saturated() {
            self.retired = true;
        }
        action
    }
}

/// A default behaviour for matching calls
pub(crate) struct DefaultState<A, R> {
    /// Which calls the default applies to
    matcher: Matcher<A>,
    /// Action to run, the default return value if `None`
    pub(crate) action: Option<Action<A, R>>,
}

/// Everything a mock records
struct MockState<A, R> {
    /// In declaration order
    expectations: Vec<ExpectationState<A, R>>,
    /// In declaration order, the last match wins
    defaults: Vec<DefaultState<A, R>>,
    /// Failures since the last clear
    failures: Vec<MockFailure>,
    /// Every call received since the last clear
    calls: usize,
}

/// How a call was resolved
enum Resolution<A, R> {
    /// An expectation or default took the call
    Handled(Option<Action<A, R>>),
    /// Nothing could take the call
    Failed(MockFailure, Option<Action<A, R>>),
}

impl<A: fmt::Debug, R> MockState<A, R> {
    /// Whether every sequence predecessor of expectation `index` is done
    fn predecessors_done(&self, index: usize) -> bool {
        let sequences = &self.expectations[index].sequences;
        self.expectations[..index]
            .iter()
            .filter(|e| e.sequences.iter().any(|s| sequences.contains(s)))
            .all(|e| e.retired || e.is_satisfied())
    }

    /// Retires every sequence predecessor of expectation `index`
    fn retire_predecessors(&mut self, index: usize) {
        let (before, rest) = self.expectations.split_at_mut(index);
        let sequences = &rest[0].sequences;
        for e in before {
            if e.sequences.iter().any(|s| sequences.contains(s)) {
                e.retired = true;
            }
        }
    }

    /// Action of the last default matching `args`
    fn default_for(&self, args: &A) -> Option<Option<Action<A, R>>> {
        self.defaults
            .iter()
            .rev()
            .find(|d| d.matcher.matches(args))
            .map(|d| d.action.clone())
    }

    /// Picks what answers a call and records it
    fn resolve(&mut self, name: &'static str, args: &A) -> Resolution<A, R> {
        let mut blocked = None;
        for index in 0..self.expectations.len() {
            if !self.expectations[index].accepts(args) {
                continue;
            }
            if !self.predecessors_done(index) {
                blocked.get_or_insert(index);
                continue;
            }
            self.retire_predecessors(index);
            let expectation = &mut self.expectations[index];
            let action = match expectation.take_call() {
                Some(action) => Some(action),
                None => self.default_for(args).flatten(),
            };
            return Resolution::Handled(action);
        }

        let default = self.default_for(args);
        match (blocked, default) {
            (Some(index), default) => Resolution::Failed(
                MockFailure::SequenceViolation {
                    mock: name,
                    args: format!("{args:?}"),
                    location: self.expectations[index].location,
                },
                default.flatten(),
            ),
            (None, Some(action)) => Resolution::Handled(action),
            (None, None) => Resolution::Failed(
                MockFailure::UnexpectedCall {
                    mock: name,
                    args: format!("{args:?}"),
                },
                None,
            ),
        }
    }

    /// Recorded failures plus every unsatisfied expectation
    fn failures(&self, name: &'static str) -> Vec<MockFailure> {
        let unsatisfied = self
            .expectations
            .iter()
            .filter(|e| !e.is_satisfied())
            .map(|e| MockFailure::Unsatisfied {
                mock: name,
                location: e.location,
                expected: e.cardinality(),
                actual: e.calls,
            });
        self.failures.iter().cloned().chain(unsatisfied).collect()
    }
}

/// Records calls to one mocked function
pub struct Mock<A, R> {
    /// Function name
    name: &'static str,
    /// Expectations, defaults and failures
    state: Mutex<MockState<A, R>>,
}

impl<A, R> Mock<A, R>
where
    A: fmt::Debug + 'static,
    R: DefaultReturn + 'static,
{
    /// Mock with no expectations or defaults
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(MockState {
                expectations: Vec::new(),
                defaults: Vec::new(),
                failures: Vec::new(),
                calls: 0,
            }),
        }
    }

    /// Name of the mocked function
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Expects a call matching `matcher`
    #[track_caller]
    pub fn expect_call(&self, matcher: Matcher<A>) -> Expectation<&Self> {
        let index = self.push_expectation(matcher, Location::caller());
        Expectation::new(self, index)
    }

    /// Configures what matching calls do when no expectation takes them
    pub fn on_call(&self, matcher: Matcher<A>) -> DefaultCall<&Self> {
        let index = self.push_default(matcher);
        DefaultCall::new(self, index)
    }

    /// Handles a call to the mocked function
    ///
    /// Matchers run while the mock is locked, actions run after it is released so they may call
    /// back into the mocked function.
    pub fn call(&self, args: A) -> R {
        let resolution = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.resolve(self.name, &args)
        };

        let action = match resolution {
            Resolution::Handled(action) => {
                tracing::trace!("`{}` called with {args:?}", self.name);
                action
            }
            Resolution::Failed(failure, action) => {
                tracing::debug!("{failure}");
                self.state.lock().failures.push(failure);
                action
            }
        };

        match action {
            Some(action) => action.perform(&args),
            None => R::default_return(),
        }
    }

    /// Calls received since the last clear
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    /// Failures so far, including expectations that aren't satisfied yet
    pub fn verify(&self) -> Vec<MockFailure> {
        self.state.lock().failures(self.name)
    }

    /// Same as [`Mock::verify`], then forgets every expectation, default and failure
    pub fn verify_and_clear(&self) -> Vec<MockFailure> {
        let mut state = self.state.lock();
        let failures = state.failures(self.name);
        state.expectations.clear();
        state.defaults.clear();
        state.failures.clear();
        state.calls = 0;
        failures
    }

    /// Adds an expectation, returning its index
    pub(crate) fn push_expectation(
        &self,
        matcher: Matcher<A>,
        location: &'static Location<'static>,
    ) -> usize {
        let mut state = self.state.lock();
        state.expectations.push(ExpectationState {
            matcher,
            location,
            times: None,
            once: Vec::new(),
            repeatedly: None,
            sequences: Vec::new(),
            retire_on_saturation: false,
            calls: 0,
            retired: false,
        });
        state.expectations.len() - 1
    }

    /// Adds a default, returning its index
    pub(crate) fn push_default(&self, matcher: Matcher<A>) -> usize {
        let mut state = self.state.lock();
        state.defaults.push(DefaultState {
            matcher,
            action: None,
        });
        state.defaults.len() - 1
    }
}

impl<A, R> Mock<A, R> {
    /// Edits expectation `index`, if it wasn't cleared
    pub(crate) fn update_expectation(&self, index: usize, f: impl FnOnce(&mut ExpectationState<A, R>)) {
        if let Some(expectation) = self.state.lock().expectations.get_mut(index) {
            f(expectation);
        }
    }

    /// Edits default `index`, if it wasn't cleared
    pub(crate) fn update_default(&self, index: usize, f: impl FnOnce(&mut DefaultState<A, R>)) {
        if let Some(default) = self.state.lock().defaults.get_mut(index) {
            f(default);
        }
    }

    /// Calls matched by expectation `index`
    pub(crate) fn expectation_calls(&self, index: usize) -> usize {
        self.state
            .lock()
            .expectations
            .get(index)
            .map_or(0, |e| e.calls)
    }
}

impl<A, R> fmt::Debug for Mock<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mock")
            .field("name", &self.name)
            .field("expectations", &state.expectations.len())
            .field("defaults", &state.defaults.len())
            .field("calls", &state.calls)
            .finish()
    }
}
