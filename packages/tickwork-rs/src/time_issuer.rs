//! Rate-limited turn issuing for outbound actions.
//!
//! A [`TimeIssuer`] hands out turns one at a time on a jittered cadence:
//!
//! ```text
//! get_time() ──► pending waiters ──┐
//!                                   │  every 1/aps + jitter seconds
//!                 ┌─────────────────┘  (fresh one-shot timer per firing)
//!                 ▼
//!   active < concurrent_actions ? pop (FIFO | LIFO), active += 1, grant
//!                 │
//!                 └──► caller acts, then release()  (active -= 1)
//! ```
//!
//! # Release Contract
//!
//! Grants never expire. A caller that takes a turn and never calls
//! [`TimeIssuer::release`] keeps its slot forever and permanently lowers
//! throughput. Prefer [`TimeIssuer::with_turn`], which releases when the
//! throttled operation settles.
//!
//! # Lifetime
//!
//! The firing timer holds only a weak reference, and dropping the last
//! `TimeIssuer` handle cancels it immediately. A queued waiter whose
//! continuation captured a handle keeps the issuer alive, so the handle
//! count alone does not end a busy issuer. Call [`TimeIssuer::shutdown`] to
//! stop firing and reject queued waiters with
//! [`TickworkError::IssuerShutDown`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, trace, warn};

use crate::error::{panic_message, TickworkError};
use crate::promise::{Deferred, Promise};
use crate::reactor::{Reactor, TimerId};

const MIN_ACTIONS_PER_SECOND: f64 = 0.1;
const MIN_CONCURRENT_ACTIONS: usize = 1;
const MIN_ACTION_DELAY: f64 = 0.001;

/// Throughput settings for a [`TimeIssuer`].
///
/// Out-of-range values are clamped when the issuer is built, see
/// [`TimeIssuerOptions::normalized`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeIssuerOptions {
    /// Turns granted per second. Floor 0.1.
    pub actions_per_second: f64,
    /// Granted-but-unreleased turns allowed at once. Floor 1.
    pub concurrent_actions: usize,
    /// Lower bound of the random delay added per firing, in seconds. Floor 0.001.
    pub actions_delay_min: f64,
    /// Upper bound of the random delay added per firing, in seconds. Floor 0.001.
    pub actions_delay_max: f64,
    /// Grant the most recent waiter first instead of the oldest.
    pub is_stack: bool,
    /// Seed for the jitter generator; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for TimeIssuerOptions {
    fn default() -> Self {
        Self {
            actions_per_second: 1.0,
            concurrent_actions: 1,
            actions_delay_min: MIN_ACTION_DELAY,
            actions_delay_max: MIN_ACTION_DELAY,
            is_stack: false,
            seed: None,
        }
    }
}

impl TimeIssuerOptions {
    /// Apply the floors. A maximum delay below the minimum is raised to it.
    pub fn normalized(mut self) -> Self {
        self.actions_per_second = floor(self.actions_per_second, MIN_ACTIONS_PER_SECOND);
        self.concurrent_actions = self.concurrent_actions.max(MIN_CONCURRENT_ACTIONS);
        self.actions_delay_min = floor(self.actions_delay_min, MIN_ACTION_DELAY);
        self.actions_delay_max = floor(self.actions_delay_max, MIN_ACTION_DELAY);
        if self.actions_delay_max < self.actions_delay_min {
            self.actions_delay_max = self.actions_delay_min;
        }
        self
    }
}

/// NaN falls to the floor as well.
fn floor(value: f64, min: f64) -> f64 {
    if value >= min {
        value
    } else {
        min
    }
}

struct IssuerInner {
    reactor: Reactor,
    options: TimeIssuerOptions,
    pending: RefCell<VecDeque<Deferred<TimeIssuer>>>,
    active: Cell<usize>,
    timer: Cell<Option<TimerId>>,
    rng: RefCell<fastrand::Rng>,
    shut_down: Cell<bool>,
}

impl Drop for IssuerInner {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            self.reactor.cancel_timer(id);
        }
    }
}

/// Sequential throughput gate. Cloning yields another handle to the same gate.
#[derive(Clone)]
pub struct TimeIssuer {
    inner: Rc<IssuerInner>,
}

impl TimeIssuer {
    /// Build an issuer and arm its first firing.
    pub fn new(reactor: &Reactor, options: TimeIssuerOptions) -> Self {
        let options = options.normalized();
        let rng = match options.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let issuer = Self {
            inner: Rc::new(IssuerInner {
                reactor: reactor.clone(),
                options,
                pending: RefCell::new(VecDeque::new()),
                active: Cell::new(0),
                timer: Cell::new(None),
                rng: RefCell::new(rng),
                shut_down: Cell::new(false),
            }),
        };
        issuer.arm();
        issuer
    }

    /// Queue for a turn. Fulfilled with this issuer once the turn is granted.
    pub fn get_time(&self) -> Promise<TimeIssuer> {
        if self.inner.shut_down.get() {
            return Promise::rejected(TickworkError::IssuerShutDown);
        }
        let (deferred, promise) = Deferred::new();
        self.inner.pending.borrow_mut().push_back(deferred);
        trace!(pending = self.pending(), "time issuer waiter queued");
        promise
    }

    /// Give a granted turn back.
    pub fn release(&self) {
        let active = self.inner.active.get();
        if active == 0 {
            warn!("time issuer release called with no turn granted");
            return;
        }
        self.inner.active.set(active - 1);
    }

    /// Take a turn, run `f`, and release once its promise settles.
    ///
    /// If `f` fails to start, the turn is released immediately and the error
    /// becomes the rejection.
    pub fn with_turn<T: 'static>(
        &self,
        f: impl FnOnce() -> anyhow::Result<Promise<T>> + 'static,
    ) -> Promise<T> {
        self.get_time().and_then(move |issuer| match f() {
            Ok(operation) => operation.then(move |outcome| {
                issuer.release();
                Promise::from_result(outcome)
            }),
            Err(err) => {
                issuer.release();
                Promise::rejected(err)
            }
        })
    }

    /// Stop firing and reject every queued waiter.
    pub fn shutdown(&self) {
        if self.inner.shut_down.replace(true) {
            return;
        }
        if let Some(id) = self.inner.timer.take() {
            self.inner.reactor.cancel_timer(id);
        }
        let waiters: Vec<_> = self.inner.pending.borrow_mut().drain(..).collect();
        debug!(rejected = waiters.len(), "time issuer shut down");
        for waiter in waiters {
            waiter.reject(TickworkError::IssuerShutDown);
        }
    }

    /// Turns granted and not yet released.
    pub fn active(&self) -> usize {
        self.inner.active.get()
    }

    /// Waiters still queued.
    pub fn pending(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// The normalized options in effect.
    pub fn options(&self) -> &TimeIssuerOptions {
        &self.inner.options
    }

    // -------------------------------------------------------------------------
    // Firing
    // -------------------------------------------------------------------------

    /// `1/aps + uniform(min, max)` rounded to whole milliseconds.
    fn next_interval(&self) -> Duration {
        let options = &self.inner.options;
        let spread = options.actions_delay_max - options.actions_delay_min;
        let jitter = options.actions_delay_min + self.inner.rng.borrow_mut().f64() * spread;
        let seconds = 1.0 / options.actions_per_second + jitter;
        Duration::from_millis((seconds * 1000.0).round() as u64)
    }

    fn arm(&self) {
        if self.inner.shut_down.get() {
            return;
        }
        let interval = self.next_interval();
        let weak: Weak<IssuerInner> = Rc::downgrade(&self.inner);
        let id = self.inner.reactor.add_timer(interval, move || {
            if let Some(inner) = weak.upgrade() {
                inner.timer.set(None);
                let issuer = TimeIssuer { inner };
                issuer.grant();
                issuer.arm();
            }
        });
        self.inner.timer.set(Some(id));
    }

    fn grant(&self) {
        let active = self.inner.active.get();
        if active >= self.inner.options.concurrent_actions {
            trace!(active, pending = self.pending(), "time issuer at concurrency ceiling");
            return;
        }

        let Some(waiter) = self.pop_waiter() else {
            return;
        };

        // Counted before fulfilling, so a faulty waiter cannot desync it.
        self.inner.active.set(active + 1);
        let issuer = self.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || waiter.resolve(issuer))) {
            error!(
                panic = %panic_message(&payload),
                "time issuer waiter panicked while taking its turn"
            );
        }
    }

    /// Next live waiter in FIFO or LIFO order. Waiters nobody observes are
    /// discarded without taking a slot.
    fn pop_waiter(&self) -> Option<Deferred<TimeIssuer>> {
        let mut discarded = Vec::new();
        let live = {
            let mut pending = self.inner.pending.borrow_mut();
            loop {
                let next = if self.inner.options.is_stack {
                    pending.pop_back()
                } else {
                    pending.pop_front()
                };
                match next {
                    Some(waiter) if waiter.has_receiver() => break Some(waiter),
                    Some(waiter) => discarded.push(waiter),
                    None => break None,
                }
            }
        };
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "time issuer discarded abandoned waiters");
        }
        // Dropped outside the queue borrow.
        drop(discarded);
        live
    }
}

impl fmt::Debug for TimeIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeIssuer")
            .field("active", &self.active())
            .field("pending", &self.pending())
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn two_per_second_options() -> TimeIssuerOptions {
        TimeIssuerOptions {
            actions_per_second: 2.0,
            concurrent_actions: 1,
            actions_delay_min: 0.001,
            actions_delay_max: 0.001,
            is_stack: false,
            seed: None,
        }
    }

    /// Grant log entry: (waiter index, seconds since start, active at grant).
    type Grants = Rc<RefCell<Vec<(usize, f64, usize)>>>;

    fn enqueue(reactor: &Reactor, issuer: &TimeIssuer, count: usize, release: bool) -> Grants {
        let grants: Grants = Rc::new(RefCell::new(Vec::new()));
        let start = reactor.now();
        for index in 0..count {
            let grants = grants.clone();
            let reactor2 = reactor.clone();
            issuer.get_time().on_settle(move |outcome| {
                let Ok(issuer) = outcome else { return };
                let elapsed = (reactor2.now() - start).as_secs_f64();
                grants.borrow_mut().push((index, elapsed, issuer.active()));
                if release {
                    reactor2.future_tick(move || issuer.release());
                }
            });
        }
        grants
    }

    #[test]
    fn test_options_are_clamped() {
        let options = TimeIssuerOptions {
            actions_per_second: 0.0,
            concurrent_actions: 0,
            actions_delay_min: 0.0,
            actions_delay_max: -3.0,
            is_stack: false,
            seed: None,
        }
        .normalized();

        assert_eq!(options.actions_per_second, 0.1);
        assert_eq!(options.concurrent_actions, 1);
        assert_eq!(options.actions_delay_min, 0.001);
        assert_eq!(options.actions_delay_max, 0.001);
    }

    #[test]
    fn test_delay_max_raised_to_min() {
        let options = TimeIssuerOptions {
            actions_delay_min: 0.5,
            actions_delay_max: 0.2,
            ..TimeIssuerOptions::default()
        }
        .normalized();
        assert_eq!(options.actions_delay_max, 0.5);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: TimeIssuerOptions =
            serde_json::from_str(r#"{"actions_per_second": 4.0, "is_stack": true}"#).unwrap();
        assert_eq!(options.actions_per_second, 4.0);
        assert!(options.is_stack);
        assert_eq!(options.concurrent_actions, 1);
        assert_eq!(options.seed, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_fifo_at_configured_rate() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());
        let grants = enqueue(&reactor, &issuer, 3, true);

        reactor.run_for(Duration::from_secs(2)).await;

        let grants = grants.borrow();
        let order: Vec<usize> = grants.iter().map(|g| g.0).collect();
        assert_eq!(order, vec![0, 1, 2]);

        for (k, (_, at, active)) in grants.iter().enumerate() {
            let expected = (k as f64 + 1.0) * 0.501;
            assert!(
                (*at - expected).abs() < 0.01,
                "grant {k} at {at}s, expected ~{expected}s"
            );
            assert_eq!(*active, 1, "never more than one outstanding grant");
        }
        assert!(grants.windows(2).all(|w| w[1].1 > w[0].1));
        assert_eq!(issuer.active(), 0);
        assert_eq!(issuer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_grant_waits_for_release() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());
        let grants = enqueue(&reactor, &issuer, 3, false);

        reactor.run_for(Duration::from_secs(2)).await;
        assert_eq!(grants.borrow().len(), 1);
        assert_eq!(issuer.active(), 1);
        assert_eq!(issuer.pending(), 2);

        issuer.release();
        reactor.run_for(Duration::from_millis(600)).await;
        assert_eq!(grants.borrow().len(), 2);
        assert_eq!(grants.borrow()[1].0, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stack_mode_grants_newest_first() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(
            &reactor,
            TimeIssuerOptions {
                is_stack: true,
                ..two_per_second_options()
            },
        );
        let grants = enqueue(&reactor, &issuer, 3, true);

        reactor.run_for(Duration::from_secs(2)).await;

        let order: Vec<usize> = grants.borrow().iter().map(|g| g.0).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling_allows_parallel_grants() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(
            &reactor,
            TimeIssuerOptions {
                concurrent_actions: 2,
                ..two_per_second_options()
            },
        );
        let grants = enqueue(&reactor, &issuer, 3, false);

        reactor.run_for(Duration::from_secs(2)).await;
        assert_eq!(grants.borrow().len(), 2);
        assert_eq!(issuer.active(), 2);

        issuer.release();
        reactor.run_for(Duration::from_millis(600)).await;
        assert_eq!(grants.borrow().len(), 3);
        assert_eq!(issuer.active(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_waiter_still_counts_as_granted() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());

        issuer
            .get_time()
            .on_settle(|_| panic!("listener-side bug"));
        let grants = enqueue(&reactor, &issuer, 1, true);

        reactor.run_for(Duration::from_secs(2)).await;

        assert_eq!(issuer.active(), 1);
        assert_eq!(issuer.pending(), 1);
        assert!(grants.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_waiter_can_queue_again() {
        fn take_turns(issuer: &TimeIssuer, left: u32, turns: Rc<Cell<u32>>) {
            issuer.get_time().on_settle(move |outcome| {
                let Ok(issuer) = outcome else { return };
                turns.set(turns.get() + 1);
                issuer.release();
                if left > 1 {
                    take_turns(&issuer, left - 1, turns);
                }
            });
        }

        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());
        let turns = Rc::new(Cell::new(0));

        drop(issuer.get_time());
        take_turns(&issuer, 3, turns.clone());

        reactor.run_for(Duration::from_secs(2)).await;
        assert_eq!(turns.get(), 3);
        assert_eq!(issuer.active(), 0);
        assert_eq!(issuer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_does_not_take_a_slot() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());

        drop(issuer.get_time());
        let grants = enqueue(&reactor, &issuer, 1, false);

        reactor.run_for(Duration::from_millis(600)).await;
        assert_eq!(grants.borrow().len(), 1);
        assert_eq!(issuer.active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_turn_releases_after_settle() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());
        let results = Rc::new(RefCell::new(Vec::new()));

        for n in 0..3_u32 {
            let reactor2 = reactor.clone();
            let results = results.clone();
            issuer
                .with_turn(move || Ok(reactor2.delay(Duration::from_millis(100)).map(move |_| n)))
                .on_settle(move |outcome| results.borrow_mut().push(outcome.unwrap()));
        }

        reactor.run_for(Duration::from_secs(2)).await;
        assert_eq!(*results.borrow(), vec![0, 1, 2]);
        assert_eq!(issuer.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_turn_releases_when_start_fails() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());
        let failed = Rc::new(Cell::new(false));

        {
            let failed = failed.clone();
            issuer
                .with_turn(|| -> anyhow::Result<Promise<()>> { Err(anyhow::anyhow!("no socket")) })
                .on_settle(move |outcome| failed.set(outcome.is_err()));
        }

        reactor.run_for(Duration::from_secs(1)).await;
        assert!(failed.get());
        assert_eq!(issuer.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_pending_waiters() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());
        let rejected = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let rejected = rejected.clone();
            issuer.get_time().on_settle(move |outcome| {
                if let Err(err) = outcome {
                    assert!(matches!(
                        err.downcast_ref::<TickworkError>(),
                        Some(TickworkError::IssuerShutDown)
                    ));
                    rejected.set(rejected.get() + 1);
                }
            });
        }

        issuer.shutdown();
        assert_eq!(rejected.get(), 2);
        assert_eq!(reactor.pending_timers(), 0);
        assert!(issuer.get_time().try_take().unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_cancels_timer() {
        let reactor = Reactor::new();
        let issuer = TimeIssuer::new(&reactor, two_per_second_options());
        assert_eq!(reactor.pending_timers(), 1);

        drop(issuer);
        assert_eq!(reactor.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_jitter_is_reproducible() {
        async fn grant_times(seed: u64) -> Vec<u64> {
            let reactor = Reactor::new();
            let issuer = TimeIssuer::new(
                &reactor,
                TimeIssuerOptions {
                    actions_per_second: 5.0,
                    actions_delay_min: 0.001,
                    actions_delay_max: 0.150,
                    seed: Some(seed),
                    ..TimeIssuerOptions::default()
                },
            );
            let grants = enqueue(&reactor, &issuer, 4, true);
            reactor.run_for(Duration::from_secs(3)).await;
            let times = grants
                .borrow()
                .iter()
                .map(|g| (g.1 * 1000.0).round() as u64)
                .collect();
            times
        }

        let first = grant_times(7).await;
        let second = grant_times(7).await;
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }
}
