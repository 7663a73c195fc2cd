//! Self-rescheduling background work.
//!
//! A [`PeriodicRoutine`] runs a [`UnitOfWork`] in cycles:
//!
//! ```text
//! start() ──► future tick ──► run() ──► settle ──► log ──► timer(interval) ──┐
//!                  ▲                                                          │
//!                  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The interval counts from the end of a cycle, so cycles never overlap. A
//! rejected cycle is logged layer by layer and the routine re-arms anyway.
//! A unit of work that cannot even start is governed by
//! [`StartFailurePolicy`].
//!
//! Timers hold only a weak reference: dropping the last routine handle ends
//! the schedule.

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::panic_message;
use crate::promise::Promise;
use crate::reactor::{Reactor, TimerId};

/// Work performed by a [`PeriodicRoutine`] on every cycle.
pub trait UnitOfWork: 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Begin one cycle. `Err` means the work could not be started at all.
    fn run(&self) -> anyhow::Result<Promise<()>>;
}

/// What a routine does when [`UnitOfWork::run`] fails synchronously.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFailurePolicy {
    /// Log critical and re-arm as after any other failure.
    #[default]
    Reschedule,
    /// Log critical and stop scheduling further cycles.
    Halt,
}

struct RoutineInner {
    reactor: Reactor,
    work: Box<dyn UnitOfWork>,
    interval: Duration,
    policy: Cell<StartFailurePolicy>,
    timer: Cell<Option<TimerId>>,
    cycles: Cell<u64>,
    failures: Cell<u64>,
    in_flight: Cell<bool>,
    /// The first cycle is queued as a tick and has not run yet.
    queued: Cell<bool>,
    stopped: Cell<bool>,
}

impl Drop for RoutineInner {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            self.reactor.cancel_timer(id);
        }
    }
}

/// A unit of work that requeues itself after every cycle.
#[derive(Clone)]
pub struct PeriodicRoutine {
    inner: Rc<RoutineInner>,
}

impl PeriodicRoutine {
    pub fn new(reactor: &Reactor, work: impl UnitOfWork, interval: Duration) -> Self {
        Self {
            inner: Rc::new(RoutineInner {
                reactor: reactor.clone(),
                work: Box::new(work),
                interval,
                policy: Cell::new(StartFailurePolicy::default()),
                timer: Cell::new(None),
                cycles: Cell::new(0),
                failures: Cell::new(0),
                in_flight: Cell::new(false),
                queued: Cell::new(false),
                stopped: Cell::new(false),
            }),
        }
    }

    /// Choose how synchronous start failures are handled.
    pub fn with_start_failure_policy(self, policy: StartFailurePolicy) -> Self {
        self.inner.policy.set(policy);
        self
    }

    /// Schedule the first cycle on a future tick.
    ///
    /// A routine keeps one schedule: starting it again while a cycle is
    /// queued, in flight or armed only clears a pending [`stop`](Self::stop).
    pub fn start(&self) {
        self.inner.stopped.set(false);
        if self.inner.queued.get() || self.inner.in_flight.get() || self.is_armed() {
            debug!(routine = self.inner.work.name(), "routine already scheduled");
            return;
        }
        self.inner.queued.set(true);
        let weak = Rc::downgrade(&self.inner);
        self.inner.reactor.future_tick(move || {
            if let Some(inner) = weak.upgrade() {
                inner.queued.set(false);
                cycle(&inner);
            }
        });
    }

    /// Cancel the armed timer and stop re-arming. A cycle already in flight
    /// finishes but does not requeue.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
        if let Some(id) = self.inner.timer.take() {
            self.inner.reactor.cancel_timer(id);
        }
    }

    /// Cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.inner.cycles.get()
    }

    /// Cycles that failed, including failures to start.
    pub fn failures(&self) -> u64 {
        self.inner.failures.get()
    }

    /// Returns true while a cycle's promise is unsettled.
    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.get()
    }

    /// Returns true while the next cycle is armed.
    pub fn is_armed(&self) -> bool {
        self.inner.timer.get().is_some()
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }
}

impl fmt::Debug for PeriodicRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicRoutine")
            .field("work", &self.inner.work.name())
            .field("interval", &self.inner.interval)
            .field("cycles", &self.cycles())
            .field("failures", &self.failures())
            .field("armed", &self.is_armed())
            .finish()
    }
}

// =============================================================================
// Cycle
// =============================================================================

fn cycle(inner: &Rc<RoutineInner>) {
    if inner.stopped.get() || inner.in_flight.get() {
        return;
    }

    let name = inner.work.name();
    let number = inner.cycles.get() + 1;
    inner.cycles.set(number);
    info!(routine = name, cycle = number, "routine cycle starting");

    let started = match catch_unwind(AssertUnwindSafe(|| inner.work.run())) {
        Ok(started) => started,
        Err(payload) => Err(anyhow!("unit of work panicked: {}", panic_message(&payload))),
    };

    match started {
        Ok(operation) => {
            inner.in_flight.set(true);
            let weak = Rc::downgrade(inner);
            operation.on_settle(move |outcome| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.in_flight.set(false);
                match outcome {
                    Ok(()) => {
                        info!(routine = inner.work.name(), cycle = number, "routine cycle completed");
                    }
                    Err(err) => {
                        inner.failures.set(inner.failures.get() + 1);
                        log_failure(inner.work.name(), number, &err);
                    }
                }
                rearm(&inner);
            });
        }
        Err(err) => {
            inner.failures.set(inner.failures.get() + 1);
            let rendered = format!("{err:#}");
            error!(
                routine = name,
                cycle = number,
                critical = true,
                error = %rendered,
                "task could not be started"
            );
            match inner.policy.get() {
                StartFailurePolicy::Reschedule => rearm(inner),
                StartFailurePolicy::Halt => {
                    warn!(routine = name, "routine halted after start failure");
                }
            }
        }
    }
}

fn log_failure(name: &str, number: u64, err: &anyhow::Error) {
    for (depth, layer) in err.chain().enumerate() {
        error!(routine = name, cycle = number, depth, error = %layer, "routine cycle failed");
    }
    error!(routine = name, cycle = number, critical = true, "task has failed");
}

fn rearm(inner: &Rc<RoutineInner>) {
    if inner.stopped.get() {
        return;
    }
    let weak: Weak<RoutineInner> = Rc::downgrade(inner);
    let id = inner.reactor.add_timer(inner.interval, move || {
        if let Some(inner) = weak.upgrade() {
            inner.timer.set(None);
            cycle(&inner);
        }
    });
    inner.timer.set(Some(id));
}
