//! Testing utilities for code built on tickwork.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tickwork = { path = "../tickwork-rs", features = ["testing"] }
//! ```
//!
//! # Capturing Promise Outcomes
//!
//! ```ignore
//! use tickwork::testing::Capture;
//!
//! let outcome = Capture::of(source.fetch(HardwareKind::Cpu, 0)?);
//! reactor.run().await;
//!
//! let listings = outcome.expect_ok();
//! assert_eq!(listings.len(), 4);
//! ```
//!
//! # Recording Listener Calls
//!
//! ```ignore
//! use tickwork::testing::Recorder;
//!
//! let recorder = Recorder::new();
//! dispatcher.add_listener("prices.refreshed", recorder.listener("audit"), 0);
//!
//! dispatcher.dispatch("prices.refreshed", report);
//! reactor.run().await;
//!
//! assert_eq!(recorder.calls(), vec!["audit:prices.refreshed"]);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use anyhow::Result;

use crate::dispatch::Dispatcher;
use crate::event::{Event, ListenerResult};
use crate::promise::Promise;

/// Holds the outcome of a promise once it settles.
pub struct Capture<T: 'static> {
    slot: Rc<RefCell<Option<Result<T>>>>,
}

impl<T: 'static> Capture<T> {
    /// Start capturing `promise`.
    pub fn of(promise: Promise<T>) -> Self {
        let slot = Rc::new(RefCell::new(None));
        let writer = slot.clone();
        promise.on_settle(move |outcome| *writer.borrow_mut() = Some(outcome));
        Self { slot }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Take the outcome, if the promise settled.
    pub fn take(&self) -> Option<Result<T>> {
        self.slot.borrow_mut().take()
    }

    /// Take the fulfilled value.
    ///
    /// # Panics
    ///
    /// Panics if the promise is pending or was rejected.
    pub fn expect_ok(&self) -> T {
        match self.take() {
            Some(Ok(value)) => value,
            Some(Err(err)) => panic!("expected fulfilled promise, got rejection: {err:#}"),
            None => panic!("expected fulfilled promise, still pending"),
        }
    }

    /// Take the rejection reason.
    ///
    /// # Panics
    ///
    /// Panics if the promise is pending or was fulfilled.
    pub fn expect_err(&self) -> anyhow::Error {
        match self.take() {
            Some(Err(err)) => err,
            Some(Ok(_)) => panic!("expected rejected promise, got a value"),
            None => panic!("expected rejected promise, still pending"),
        }
    }
}

impl<T: 'static> fmt::Debug for Capture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Records `label:event_name` for every listener invocation it produced.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    calls: Rc<RefCell<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener that records its invocation and returns no handle.
    pub fn listener<P: 'static>(
        &self,
        label: &str,
    ) -> impl Fn(&Rc<Event<P>>, &str, &Dispatcher<P>) -> ListenerResult + 'static {
        let calls = self.calls.clone();
        let label = label.to_string();
        move |_, name, _| {
            calls.borrow_mut().push(format!("{label}:{name}"));
            Ok(None)
        }
    }

    /// A listener that records its invocation and then stops propagation.
    pub fn stopping_listener<P: 'static>(
        &self,
        label: &str,
    ) -> impl Fn(&Rc<Event<P>>, &str, &Dispatcher<P>) -> ListenerResult + 'static {
        let calls = self.calls.clone();
        let label = label.to_string();
        move |event, name, _| {
            calls.borrow_mut().push(format!("{label}:{name}"));
            event.stop_propagation();
            Ok(None)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.borrow().len()
    }
}
