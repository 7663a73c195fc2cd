//! Single-threaded reactor: a FIFO future-tick queue plus a monotonic timer
//! schedule.
//!
//! The reactor is the only thing in tickwork that waits. Everything else
//! registers work with it:
//!
//! ```text
//! future_tick(f) ──► tick queue (FIFO) ─────────┐
//!                                                ├──► run() loop
//! add_timer / add_periodic_timer ──► schedule ──┘      │
//!                                   (due, seq)         ├─ drain ticks
//!                                                      ├─ fire due timers
//!                                                      └─ sleep_until(next due)
//! ```
//!
//! # Guarantees
//!
//! - **FIFO ticks**: ticks run in the order they were queued. Ticks queued
//!   while draining run in the same drain.
//! - **Due-order timers**: timers fire in due order; equal due times fire in
//!   registration order. Ticks are drained after every timer.
//! - **Re-registration**: a periodic timer gets a fresh due time (same id)
//!   every time it fires. Periodic intervals are floored to 1ms.
//! - **One pass per instant**: a pass fires only timers scheduled before it
//!   began. A timer re-registered at the current instant fires on the next
//!   loop iteration, after the loop has yielded.
//! - **Cooperative**: sleeping uses `tokio::time::sleep_until`, so other
//!   tasks on a current-thread runtime make progress, and tests on the paused
//!   clock advance instantly.
//!
//! A reactor handle is `Rc`-based and never leaves its thread.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::promise::{Deferred, Promise};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle identifying a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type Tick = Box<dyn FnOnce()>;

enum Callback {
    Once(Box<dyn FnOnce()>),
    Every(Box<dyn FnMut()>),
}

struct TimerSlot {
    /// Taken out while the callback runs.
    callback: Option<Callback>,
    interval: Option<Duration>,
}

struct Inner {
    ticks: RefCell<VecDeque<Tick>>,
    /// Due schedule keyed by (due, registration sequence). Entries whose
    /// timer was cancelled are skipped lazily.
    schedule: RefCell<BTreeMap<(Instant, u64), TimerId>>,
    timers: RefCell<HashMap<TimerId, TimerSlot>>,
    next_id: Cell<u64>,
    next_seq: Cell<u64>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    wake: Notify,
}

/// Cooperative single-threaded event loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Create an idle reactor.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                ticks: RefCell::new(VecDeque::new()),
                schedule: RefCell::new(BTreeMap::new()),
                timers: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                next_seq: Cell::new(0),
                running: Cell::new(false),
                stopped: Cell::new(false),
                wake: Notify::new(),
            }),
        }
    }

    /// Current reactor time.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Queue `f` to run on a future tick.
    pub fn future_tick(&self, f: impl FnOnce() + 'static) {
        self.inner.ticks.borrow_mut().push_back(Box::new(f));
        self.inner.wake.notify_one();
    }

    /// Run `f` once after `delay`.
    pub fn add_timer(&self, delay: Duration, f: impl FnOnce() + 'static) -> TimerId {
        self.register(delay, None, Callback::Once(Box::new(f)))
    }

    /// Run `f` every `interval` until the timer is cancelled. Intervals below
    /// 1ms are raised to 1ms.
    pub fn add_periodic_timer(&self, interval: Duration, f: impl FnMut() + 'static) -> TimerId {
        let interval = interval.max(MIN_PERIOD);
        self.register(interval, Some(interval), Callback::Every(Box::new(f)))
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.timers.borrow_mut().remove(&id).is_some()
    }

    /// Returns true while the timer is registered.
    pub fn is_timer_active(&self, id: TimerId) -> bool {
        self.inner.timers.borrow().contains_key(&id)
    }

    /// Number of registered timers.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Number of queued ticks.
    pub fn pending_ticks(&self) -> usize {
        self.inner.ticks.borrow().len()
    }

    /// A promise fulfilled after `delay`.
    pub fn delay(&self, delay: Duration) -> Promise<()> {
        let (deferred, promise) = Deferred::new();
        self.add_timer(delay, move || deferred.resolve(()));
        promise
    }

    /// Ask the loop to return after the unit of work in progress.
    ///
    /// A stop requested while the reactor is idle is kept, and the next
    /// [`run`](Self::run) returns without doing any work.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
        self.inner.wake.notify_one();
    }

    /// Drive ticks and timers until [`stop`](Self::stop) is called or no work
    /// remains.
    pub async fn run(&self) {
        if self.inner.running.replace(true) {
            warn!("reactor is already running; nested run ignored");
            return;
        }
        debug!(
            ticks = self.pending_ticks(),
            timers = self.pending_timers(),
            "reactor starting"
        );

        loop {
            self.drain_ticks();
            if self.inner.stopped.get() {
                break;
            }

            self.fire_due_timers(Instant::now());
            if self.inner.stopped.get() {
                break;
            }

            if self.pending_ticks() > 0 {
                tokio::task::yield_now().await;
                continue;
            }

            let Some(deadline) = self.next_deadline() else {
                break;
            };
            if deadline <= Instant::now() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.inner.wake.notified() => {}
            }
        }

        self.inner.running.set(false);
        debug!(
            stopped = self.inner.stopped.get(),
            ticks = self.pending_ticks(),
            timers = self.pending_timers(),
            "reactor returned"
        );
        self.inner.stopped.set(false);
    }

    /// Run for at most `duration` of reactor time.
    pub async fn run_for(&self, duration: Duration) {
        let reactor = self.clone();
        let deadline = self.add_timer(duration, move || reactor.stop());
        self.run().await;
        self.cancel_timer(deadline);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn register(&self, delay: Duration, interval: Option<Duration>, callback: Callback) -> TimerId {
        let id = TimerId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        self.inner.timers.borrow_mut().insert(
            id,
            TimerSlot {
                callback: Some(callback),
                interval,
            },
        );
        self.enqueue(id, Instant::now() + delay);
        self.inner.wake.notify_one();
        id
    }

    fn enqueue(&self, id: TimerId, due: Instant) {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        self.inner.schedule.borrow_mut().insert((due, seq), id);
    }

    fn drain_ticks(&self) {
        while !self.inner.stopped.get() {
            let next = self.inner.ticks.borrow_mut().pop_front();
            match next {
                Some(tick) => tick(),
                None => break,
            }
        }
    }

    /// Earliest due time of a live timer, discarding cancelled entries.
    fn next_deadline(&self) -> Option<Instant> {
        let mut schedule = self.inner.schedule.borrow_mut();
        let timers = self.inner.timers.borrow();
        loop {
            let (key, id) = match schedule.iter().next() {
                Some((&key, &id)) => (key, id),
                None => return None,
            };
            if timers.contains_key(&id) {
                return Some(key.0);
            }
            schedule.remove(&key);
        }
    }

    /// Earliest entry due at `now` that was scheduled before `before_seq`.
    fn pop_due(&self, now: Instant, before_seq: u64) -> Option<TimerId> {
        let mut schedule = self.inner.schedule.borrow_mut();
        let key = schedule
            .keys()
            .take_while(|(due, _)| *due <= now)
            .find(|(_, seq)| *seq < before_seq)
            .copied()?;
        schedule.remove(&key)
    }

    fn fire_due_timers(&self, now: Instant) {
        let before_seq = self.inner.next_seq.get();
        while !self.inner.stopped.get() {
            let Some(id) = self.pop_due(now, before_seq) else {
                break;
            };
            self.fire(id, now);
            self.drain_ticks();
        }
    }

    fn fire(&self, id: TimerId, now: Instant) {
        let taken = {
            let mut timers = self.inner.timers.borrow_mut();
            let Some(slot) = timers.get_mut(&id) else {
                return;
            };
            let interval = slot.interval;
            match interval {
                // One-shot timers are gone before their callback runs.
                None => timers.remove(&id).and_then(|slot| slot.callback),
                Some(_) => slot.callback.take(),
            }
        };

        match taken {
            Some(Callback::Once(callback)) => callback(),
            Some(Callback::Every(mut callback)) => {
                callback();
                // Cancelled from inside its own callback: leave it dropped.
                let rearm = match self.inner.timers.borrow_mut().get_mut(&id) {
                    Some(slot) => {
                        slot.callback = Some(Callback::Every(callback));
                        slot.interval
                    }
                    None => None,
                };
                if let Some(interval) = rearm {
                    self.enqueue(id, now + interval);
                }
            }
            None => {}
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("pending_ticks", &self.pending_ticks())
            .field("pending_timers", &self.pending_timers())
            .field("running", &self.inner.running.get())
            .finish()
    }
}
