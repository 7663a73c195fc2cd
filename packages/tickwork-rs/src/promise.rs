//! Single-threaded promises with continuation combinators.
//!
//! A [`Promise`] is the read half of a value that becomes available later;
//! its [`Deferred`] is the write half. Both are `!Send`: they live on the
//! reactor thread and continuations run on it.
//!
//! # Semantics
//!
//! - A promise has **one consumer**. Every combinator takes `self` and
//!   returns a new promise, so a continuation chain is a straight line.
//! - Continuations run **synchronously** when the deferred settles, or
//!   immediately when attached to a promise that already settled.
//! - Dropping an unsettled [`Deferred`] rejects its promise with
//!   [`TickworkError::Abandoned`], so a chain never hangs on a lost writer.
//!
//! # Example
//!
//! ```ignore
//! let (deferred, promise) = Deferred::<u32>::new();
//!
//! let doubled = promise.map(|n| n * 2);
//! deferred.resolve(21);
//!
//! assert_eq!(doubled.try_take().ok().map(|r| r.ok()), Some(Some(42)));
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use anyhow::Result;

use crate::error::TickworkError;

type Continuation<T> = Box<dyn FnOnce(Result<T>)>;

enum State<T> {
    Pending(Option<Continuation<T>>),
    Settled(Result<T>),
    Consumed,
}

struct Shared<T> {
    state: RefCell<State<T>>,
}

impl<T: 'static> Shared<T> {
    /// Store the outcome, or hand it to the waiting continuation.
    ///
    /// The borrow is released before the continuation runs, so continuations
    /// may freely create and settle other promises.
    fn settle(&self, outcome: Result<T>) {
        let mut state = self.state.borrow_mut();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Pending(Some(continuation)) => {
                drop(state);
                continuation(outcome);
            }
            State::Pending(None) => *state = State::Settled(outcome),
            already => *state = already,
        }
    }
}

// =============================================================================
// Deferred
// =============================================================================

/// The resolving half of a [`Promise`].
pub struct Deferred<T: 'static> {
    shared: Option<Rc<Shared<T>>>,
}

impl<T: 'static> Deferred<T> {
    /// Create a linked deferred/promise pair.
    pub fn new() -> (Deferred<T>, Promise<T>) {
        let shared = Rc::new(Shared {
            state: RefCell::new(State::Pending(None)),
        });
        (
            Deferred {
                shared: Some(shared.clone()),
            },
            Promise { shared },
        )
    }

    /// Fulfil the promise with a value.
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    /// Reject the promise with a reason.
    pub fn reject(self, reason: impl Into<anyhow::Error>) {
        self.settle(Err(reason.into()));
    }

    /// Returns false once nothing can observe the outcome: the matching
    /// [`Promise`] was dropped without a continuation attached.
    pub fn has_receiver(&self) -> bool {
        self.shared.as_ref().is_some_and(|shared| {
            Rc::strong_count(shared) > 1
                || matches!(&*shared.state.borrow(), State::Pending(Some(_)))
        })
    }

    /// Settle the promise with an outcome.
    pub fn settle(mut self, outcome: Result<T>) {
        if let Some(shared) = self.shared.take() {
            shared.settle(outcome);
        }
    }
}

impl<T: 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Err(TickworkError::Abandoned.into()));
        }
    }
}

impl<T: 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.shared.is_none())
            .finish()
    }
}

// =============================================================================
// Promise
// =============================================================================

/// A value or failure that becomes available on a later tick.
#[must_use = "a promise does nothing unless its outcome is consumed"]
pub struct Promise<T: 'static> {
    shared: Rc<Shared<T>>,
}

impl<T: 'static> Promise<T> {
    /// A promise that is already fulfilled.
    pub fn resolved(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// A promise that is already rejected.
    pub fn rejected(reason: impl Into<anyhow::Error>) -> Self {
        Self::from_result(Err(reason.into()))
    }

    /// A promise already settled with `outcome`.
    pub fn from_result(outcome: Result<T>) -> Self {
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(State::Settled(outcome)),
            }),
        }
    }

    /// Returns true while the promise has not settled.
    pub fn is_pending(&self) -> bool {
        matches!(&*self.shared.state.borrow(), State::Pending(_))
    }

    /// Take the outcome if the promise has settled, or get the promise back.
    pub fn try_take(self) -> std::result::Result<Result<T>, Promise<T>> {
        let mut state = self.shared.state.borrow_mut();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Settled(outcome) => Ok(outcome),
            other => {
                *state = other;
                drop(state);
                Err(self)
            }
        }
    }

    /// Run `f` with the outcome once the promise settles.
    ///
    /// This is the terminal combinator; all others are built on it.
    pub fn on_settle(self, f: impl FnOnce(Result<T>) + 'static) {
        let mut state = self.shared.state.borrow_mut();
        match std::mem::replace(&mut *state, State::Consumed) {
            State::Settled(outcome) => {
                drop(state);
                f(outcome);
            }
            State::Pending(None) => *state = State::Pending(Some(Box::new(f))),
            other => *state = other,
        }
    }

    /// Chain a continuation that sees both success and failure.
    pub fn then<U: 'static>(self, f: impl FnOnce(Result<T>) -> Promise<U> + 'static) -> Promise<U> {
        let (deferred, promise) = Deferred::new();
        self.on_settle(move |outcome| f(outcome).forward(deferred));
        promise
    }

    /// Transform the fulfilled value.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Promise<U> {
        self.then(move |outcome| Promise::from_result(outcome.map(f)))
    }

    /// Chain another asynchronous step after a fulfilled value.
    pub fn and_then<U: 'static>(self, f: impl FnOnce(T) -> Promise<U> + 'static) -> Promise<U> {
        self.then(move |outcome| match outcome {
            Ok(value) => f(value),
            Err(reason) => Promise::rejected(reason),
        })
    }

    /// Recover from a rejection with another asynchronous step.
    pub fn or_else(self, f: impl FnOnce(anyhow::Error) -> Promise<T> + 'static) -> Promise<T> {
        self.then(move |outcome| match outcome {
            Ok(value) => Promise::resolved(value),
            Err(reason) => f(reason),
        })
    }

    /// Transform the rejection reason.
    pub fn map_err(self, f: impl FnOnce(anyhow::Error) -> anyhow::Error + 'static) -> Promise<T> {
        self.then(move |outcome| Promise::from_result(outcome.map_err(f)))
    }

    /// Settle `deferred` with this promise's outcome.
    pub fn forward(self, deferred: Deferred<T>) {
        self.on_settle(move |outcome| deferred.settle(outcome));
    }
}

impl<T: 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.borrow() {
            State::Pending(_) => "pending",
            State::Settled(Ok(_)) => "fulfilled",
            State::Settled(Err(_)) => "rejected",
            State::Consumed => "consumed",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

// =============================================================================
// Aggregation
// =============================================================================

/// Wait for every promise to settle, keeping each outcome in input order.
///
/// The returned promise never rejects.
pub fn all_settled<T: 'static>(promises: Vec<Promise<T>>) -> Promise<Vec<Result<T>>> {
    if promises.is_empty() {
        return Promise::resolved(Vec::new());
    }

    let (deferred, promise) = Deferred::new();
    let total = promises.len();
    let slots: Rc<RefCell<Vec<Option<Result<T>>>>> =
        Rc::new(RefCell::new((0..total).map(|_| None).collect()));
    let remaining = Rc::new(Cell::new(total));
    let deferred = Rc::new(RefCell::new(Some(deferred)));

    for (index, pending) in promises.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let deferred = deferred.clone();
        pending.on_settle(move |outcome| {
            if let Some(slot) = slots.borrow_mut().get_mut(index) {
                *slot = Some(outcome);
            }
            remaining.set(remaining.get().saturating_sub(1));
            if remaining.get() == 0 {
                let collected = slots.borrow_mut().drain(..).flatten().collect();
                if let Some(deferred) = deferred.borrow_mut().take() {
                    deferred.resolve(collected);
                }
            }
        });
    }

    promise
}
