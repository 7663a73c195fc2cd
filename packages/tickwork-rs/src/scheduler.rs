//! Tick schedulers: how a dispatch turns into reactor ticks.
//!
//! Two strategies share the same contract. Listeners run on future ticks in
//! priority order, and the dispatch completion resolves once every produced
//! handle has settled.
//!
//! ```text
//! Eager (all slots committed up front)
//!
//!   dispatch ──► [L1][L2][L3][resolve]      L3 becomes a no-op if L2 stops
//!
//! Demand (one slot in flight)
//!
//!   dispatch ──► [L1] ──► [L2] ──stop──► resolve
//!                                 └─► [L3] only if L2 did not stop
//! ```
//!
//! The demand variant walks an explicit cursor rather than recursing, so a
//! long listener chain never grows the stack.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::Deserialize;
use tracing::trace;

use crate::dispatch::{resolve_dispatch_promise, Dispatcher, TickCallbackBuilder};
use crate::error::TickworkError;
use crate::event::{Event, Listener};
use crate::promise::Promise;
use crate::reactor::Reactor;

/// Which tick scheduler a [`Dispatcher`] uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Commit one tick per listener at dispatch time.
    Eager,
    /// Schedule the next listener only after the previous one ran.
    #[default]
    Demand,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Eager => f.write_str("eager"),
            SchedulerKind::Demand => f.write_str("demand"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = TickworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(SchedulerKind::Eager),
            "demand" => Ok(SchedulerKind::Demand),
            other => Err(TickworkError::UnknownScheduler(other.to_string())),
        }
    }
}

// =============================================================================
// Eager
// =============================================================================

/// Schedules every listener invocation up front.
pub struct TickScheduler;

impl TickScheduler {
    pub fn schedule<P: 'static>(
        reactor: &Reactor,
        dispatcher: &Dispatcher<P>,
        event: Rc<Event<P>>,
        listeners: Vec<Rc<dyn Listener<P>>>,
    ) {
        let handles: Rc<RefCell<Vec<Promise<()>>>> = Rc::new(RefCell::new(Vec::new()));

        for listener in listeners {
            let callback = TickCallbackBuilder::build(
                listener,
                event.name(),
                event.clone(),
                dispatcher.clone(),
            );
            let event = event.clone();
            let handles = handles.clone();
            reactor.future_tick(move || {
                if event.is_propagation_stopped() {
                    trace!(event = event.name(), "propagation stopped, skipping listener");
                    return;
                }
                if let Some(handle) = callback() {
                    handles.borrow_mut().push(handle);
                }
            });
        }

        reactor.future_tick(move || {
            let collected = std::mem::take(&mut *handles.borrow_mut());
            resolve_dispatch_promise(&event, collected);
        });
    }
}

// =============================================================================
// Demand
// =============================================================================

/// Schedules listener invocations one at a time.
pub struct DeferredTickScheduler;

impl DeferredTickScheduler {
    pub fn schedule<P: 'static>(
        reactor: &Reactor,
        dispatcher: &Dispatcher<P>,
        event: Rc<Event<P>>,
        listeners: Vec<Rc<dyn Listener<P>>>,
    ) {
        let chain = Rc::new(DemandChain {
            reactor: reactor.clone(),
            dispatcher: dispatcher.clone(),
            event,
            listeners,
            cursor: Cell::new(0),
            handles: RefCell::new(Vec::new()),
        });
        chain.schedule_next();
    }
}

/// Per-dispatch state of the demand scheduler.
///
/// `handles` grows by at most one entry per invoked listener.
struct DemandChain<P: 'static> {
    reactor: Reactor,
    dispatcher: Dispatcher<P>,
    event: Rc<Event<P>>,
    listeners: Vec<Rc<dyn Listener<P>>>,
    cursor: Cell<usize>,
    handles: RefCell<Vec<Promise<()>>>,
}

impl<P: 'static> DemandChain<P> {
    fn schedule_next(self: Rc<Self>) {
        let reactor = self.reactor.clone();
        reactor.future_tick(move || self.step());
    }

    fn step(self: Rc<Self>) {
        let index = self.cursor.get();
        let Some(listener) = self.listeners.get(index).cloned() else {
            self.finish();
            return;
        };
        if self.event.is_propagation_stopped() {
            self.finish();
            return;
        }

        self.cursor.set(index + 1);
        let callback = TickCallbackBuilder::build(
            listener,
            self.event.name(),
            self.event.clone(),
            self.dispatcher.clone(),
        );
        if let Some(handle) = callback() {
            self.handles.borrow_mut().push(handle);
        }

        if self.event.is_propagation_stopped() {
            trace!(
                event = self.event.name(),
                invoked = index + 1,
                total = self.listeners.len(),
                "propagation stopped"
            );
            self.finish();
        } else if index + 1 < self.listeners.len() {
            self.schedule_next();
        } else {
            self.finish();
        }
    }

    fn finish(&self) {
        let collected = std::mem::take(&mut *self.handles.borrow_mut());
        resolve_dispatch_promise(&self.event, collected);
    }
}
