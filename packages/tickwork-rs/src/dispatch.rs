//! Event dispatcher with tick-scheduled listener invocation.
//!
//! The `Dispatcher` is responsible for:
//! 1. Keeping listeners per event name, ordered by priority
//! 2. Handing each dispatch to the configured tick scheduler
//! 3. Returning a completion promise that resolves once every listener's
//!    asynchronous work has settled
//!
//! Listener invocations never run inside `dispatch` itself; they run on
//! future ticks of the [`Reactor`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{debug, error};

use crate::error::{panic_message, TickworkError};
use crate::event::{Event, Listener, ListenerResult};
use crate::promise::{all_settled, Promise};
use crate::reactor::Reactor;
use crate::scheduler::{DeferredTickScheduler, SchedulerKind, TickScheduler};

// =============================================================================
// Tick Callback Builder
// =============================================================================

/// Builds the unit of work a scheduler puts on the tick queue for one
/// listener invocation.
pub struct TickCallbackBuilder;

impl TickCallbackBuilder {
    /// Wrap `listener` so that invoking the result calls it with
    /// `(event, event_name, dispatcher)` and yields its completion handle.
    ///
    /// An `Err` return or a panic from the listener is logged and yields
    /// `None`; it never escapes into the reactor.
    pub fn build<P: 'static>(
        listener: Rc<dyn Listener<P>>,
        event_name: &str,
        event: Rc<Event<P>>,
        dispatcher: Dispatcher<P>,
    ) -> impl FnOnce() -> Option<Promise<()>> + 'static {
        let event_name = event_name.to_string();
        move || invoke(listener.as_ref(), &event_name, &event, &dispatcher)
    }
}

fn invoke<P: 'static>(
    listener: &dyn Listener<P>,
    event_name: &str,
    event: &Rc<Event<P>>,
    dispatcher: &Dispatcher<P>,
) -> Option<Promise<()>> {
    let result: std::thread::Result<ListenerResult> =
        catch_unwind(AssertUnwindSafe(|| listener.handle(event, event_name, dispatcher)));

    match result {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => {
            let rendered = format!("{err:#}");
            error!(
                listener = listener.name(),
                event = event_name,
                error = %rendered,
                "listener failed"
            );
            None
        }
        Err(payload) => {
            let err = TickworkError::ListenerPanicked {
                event: event_name.to_string(),
                message: panic_message(&payload),
            };
            error!(listener = listener.name(), event = event_name, error = %err, "listener panicked");
            None
        }
    }
}

// =============================================================================
// Dispatch Promise Resolver
// =============================================================================

/// Resolve `event`'s completion once every handle in `handles` has settled.
///
/// Listener outcomes are ignored; the completion never rejects. If a
/// listener already took the completion this does nothing.
pub fn resolve_dispatch_promise<P: 'static>(event: &Event<P>, handles: Vec<Promise<()>>) {
    let Some(completion) = event.take_completion() else {
        debug!(event = event.name(), "dispatch completion managed by a listener");
        return;
    };
    all_settled(handles).on_settle(move |_| completion.resolve(()));
}

// =============================================================================
// Dispatcher
// =============================================================================

struct Registration<P: 'static> {
    priority: i32,
    listener: Rc<dyn Listener<P>>,
}

struct DispatcherInner<P: 'static> {
    reactor: Reactor,
    scheduler: SchedulerKind,
    listeners: RefCell<HashMap<String, Vec<Registration<P>>>>,
    dispatched: Cell<u64>,
}

/// Routes events to listeners through a tick scheduler.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::new(&reactor, SchedulerKind::Demand);
///
/// dispatcher.add_listener_fn("prices.refreshed", 10, |event, _name, _dispatcher| {
///     event.detail_mut().push("stored".into());
///     Ok(None)
/// });
///
/// let (event, done) = dispatcher.dispatch("prices.refreshed", Vec::<String>::new());
/// done.on_settle(move |_| println!("{:?}", event.detail()));
/// ```
pub struct Dispatcher<P: 'static> {
    inner: Rc<DispatcherInner<P>>,
}

impl<P: 'static> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: 'static> Dispatcher<P> {
    /// Create a dispatcher that schedules listeners with `scheduler`.
    pub fn new(reactor: &Reactor, scheduler: SchedulerKind) -> Self {
        Self {
            inner: Rc::new(DispatcherInner {
                reactor: reactor.clone(),
                scheduler,
                listeners: RefCell::new(HashMap::new()),
                dispatched: Cell::new(0),
            }),
        }
    }

    /// The scheduling strategy in use.
    pub fn scheduler(&self) -> SchedulerKind {
        self.inner.scheduler
    }

    /// Register a listener. Higher priorities run first; equal priorities run
    /// in registration order.
    pub fn add_listener<L: Listener<P>>(&self, event_name: &str, listener: L, priority: i32) {
        let mut listeners = self.inner.listeners.borrow_mut();
        let registered = listeners.entry(event_name.to_string()).or_default();
        let position = registered
            .iter()
            .position(|existing| existing.priority < priority)
            .unwrap_or(registered.len());
        registered.insert(
            position,
            Registration {
                priority,
                listener: Rc::new(listener),
            },
        );
    }

    /// Register a closure listener.
    pub fn add_listener_fn<F>(&self, event_name: &str, priority: i32, f: F)
    where
        F: Fn(&Rc<Event<P>>, &str, &Dispatcher<P>) -> ListenerResult + 'static,
    {
        self.add_listener(event_name, f, priority);
    }

    /// Remove every listener for `event_name`, returning how many there were.
    pub fn remove_listeners(&self, event_name: &str) -> usize {
        self.inner
            .listeners
            .borrow_mut()
            .remove(event_name)
            .map_or(0, |removed| removed.len())
    }

    /// Listeners for `event_name` in invocation order.
    pub fn listeners(&self, event_name: &str) -> Vec<Rc<dyn Listener<P>>> {
        self.inner
            .listeners
            .borrow()
            .get(event_name)
            .map(|registered| registered.iter().map(|r| r.listener.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_listeners(&self, event_name: &str) -> bool {
        self.inner
            .listeners
            .borrow()
            .get(event_name)
            .is_some_and(|registered| !registered.is_empty())
    }

    /// Number of events dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.get()
    }

    /// Create and dispatch an event.
    ///
    /// Returns the event, so the caller can read its detail once the
    /// completion resolves.
    pub fn dispatch(&self, event_name: &str, detail: P) -> (Rc<Event<P>>, Promise<()>) {
        let event = Event::new(event_name, detail);
        let completion = self.dispatch_event(&event);
        (event, completion)
    }

    /// Dispatch an existing event.
    ///
    /// An event can be dispatched once; a second dispatch is rejected with
    /// [`TickworkError::AlreadyDispatched`].
    pub fn dispatch_event(&self, event: &Rc<Event<P>>) -> Promise<()> {
        let Some(completion) = event.take_promise() else {
            return Promise::rejected(TickworkError::AlreadyDispatched {
                event: event.name().to_string(),
            });
        };

        let listeners = self.listeners(event.name());
        self.inner.dispatched.set(self.inner.dispatched.get() + 1);
        debug!(
            event = event.name(),
            listeners = listeners.len(),
            scheduler = %self.inner.scheduler,
            "dispatching event"
        );

        match self.inner.scheduler {
            SchedulerKind::Eager => {
                TickScheduler::schedule(&self.inner.reactor, self, event.clone(), listeners)
            }
            SchedulerKind::Demand => {
                DeferredTickScheduler::schedule(&self.inner.reactor, self, event.clone(), listeners)
            }
        }
        completion
    }
}

impl<P: 'static> fmt::Debug for Dispatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.inner.listeners.borrow();
        f.debug_struct("Dispatcher")
            .field("scheduler", &self.inner.scheduler)
            .field("event_names", &listeners.len())
            .field("dispatched", &self.inner.dispatched.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::Deferred;
    use anyhow::anyhow;
    use std::time::Duration;

    type Detail = Vec<String>;

    fn record(label: &'static str) -> impl Fn(&Rc<Event<Detail>>, &str, &Dispatcher<Detail>) -> ListenerResult {
        move |event, _, _| {
            event.detail_mut().push(label.to_string());
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_ordered_by_priority_then_registration() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<Detail>::new(&reactor, SchedulerKind::Demand);

        dispatcher.add_listener("e", record("low"), -5);
        dispatcher.add_listener("e", record("high-1"), 10);
        dispatcher.add_listener("e", record("mid"), 0);
        dispatcher.add_listener("e", record("high-2"), 10);

        let (event, _done) = dispatcher.dispatch("e", Vec::new());
        reactor.run().await;

        assert_eq!(*event.detail(), vec!["high-1", "high-2", "mid", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_does_not_invoke_listeners_synchronously() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<Detail>::new(&reactor, SchedulerKind::Eager);
        dispatcher.add_listener("e", record("ran"), 0);

        let (event, done) = dispatcher.dispatch("e", Vec::new());
        assert!(event.detail().is_empty());
        assert!(done.is_pending());

        reactor.run().await;
        assert_eq!(*event.detail(), vec!["ran"]);
        assert!(done.try_take().unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_waits_for_async_listeners() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<Detail>::new(&reactor, SchedulerKind::Demand);

        {
            let reactor2 = reactor.clone();
            dispatcher.add_listener_fn("e", 0, move |_, _, _| {
                Ok(Some(reactor2.delay(Duration::from_secs(5))))
            });
        }
        {
            let reactor2 = reactor.clone();
            dispatcher.add_listener_fn("e", 0, move |_, _, _| {
                let (deferred, promise) = Deferred::new();
                reactor2.add_timer(Duration::from_secs(1), move || {
                    deferred.reject(anyhow!("listener gave up"))
                });
                Ok(Some(promise))
            });
        }

        let start = reactor.now();
        let resolved_after = Rc::new(Cell::new(None));
        {
            let reactor2 = reactor.clone();
            let resolved_after = resolved_after.clone();
            let (_event, done) = dispatcher.dispatch("e", Vec::new());
            done.on_settle(move |outcome| {
                assert!(outcome.is_ok(), "dispatch completion never rejects");
                resolved_after.set(Some(reactor2.now() - start));
            });
        }

        reactor.run().await;
        assert!(resolved_after.get().unwrap() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_managed_completion_is_left_alone() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<Detail>::new(&reactor, SchedulerKind::Eager);
        let handed_off: Rc<RefCell<Option<Deferred<()>>>> = Rc::new(RefCell::new(None));

        {
            let handed_off = handed_off.clone();
            dispatcher.add_listener_fn("e", 0, move |event, _, _| {
                *handed_off.borrow_mut() = event.take_completion();
                Ok(None)
            });
        }

        let (_event, done) = dispatcher.dispatch("e", Vec::new());
        reactor.run().await;
        assert!(done.is_pending());

        handed_off.borrow_mut().take().unwrap().resolve(());
        assert!(done.try_take().unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_listeners_resolves_on_next_tick() {
        for kind in [SchedulerKind::Eager, SchedulerKind::Demand] {
            let reactor = Reactor::new();
            let dispatcher = Dispatcher::<Detail>::new(&reactor, kind);

            let (_event, done) = dispatcher.dispatch("nobody.listens", Vec::new());
            assert!(done.is_pending());

            reactor.run().await;
            assert!(done.try_take().unwrap().is_ok(), "{kind} scheduler");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_dispatch_of_same_event_is_rejected() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<Detail>::new(&reactor, SchedulerKind::Demand);
        dispatcher.add_listener("e", record("once"), 0);

        let event = Event::new("e", Vec::new());
        let first = dispatcher.dispatch_event(&event);
        let second = dispatcher.dispatch_event(&event);

        let err = second.try_take().unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TickworkError>(),
            Some(TickworkError::AlreadyDispatched { .. })
        ));

        reactor.run().await;
        assert!(first.try_take().unwrap().is_ok());
        assert_eq!(*event.detail(), vec!["once"]);
        assert_eq!(dispatcher.dispatched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_can_dispatch_through_dispatcher_ref() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<Detail>::new(&reactor, SchedulerKind::Demand);
        let follow_up: Rc<RefCell<Option<Rc<Event<Detail>>>>> = Rc::new(RefCell::new(None));

        {
            let follow_up = follow_up.clone();
            dispatcher.add_listener_fn("first", 0, move |_, _, dispatcher| {
                let (event, done) = dispatcher.dispatch("second", Vec::new());
                *follow_up.borrow_mut() = Some(event);
                Ok(Some(done))
            });
        }
        dispatcher.add_listener("second", record("chained"), 0);

        let (_event, done) = dispatcher.dispatch("first", Vec::new());
        reactor.run().await;

        assert!(done.try_take().unwrap().is_ok());
        let second = follow_up.borrow_mut().take().unwrap();
        assert_eq!(*second.detail(), vec!["chained"]);
    }

    #[test]
    fn test_remove_listeners() {
        let reactor = Reactor::new();
        let dispatcher = Dispatcher::<Detail>::new(&reactor, SchedulerKind::Eager);
        dispatcher.add_listener("e", record("a"), 0);
        dispatcher.add_listener("e", record("b"), 0);

        assert!(dispatcher.has_listeners("e"));
        assert_eq!(dispatcher.remove_listeners("e"), 2);
        assert!(!dispatcher.has_listeners("e"));
        assert_eq!(dispatcher.remove_listeners("e"), 0);
    }
}
