//! Dispatchable events and the listener contract.
//!
//! An [`Event`] carries a name, a mutable detail payload, a propagation-stop
//! flag and its own completion handle. The dispatcher resolves that handle
//! once every listener's completion has settled, unless a listener takes it
//! with [`Event::take_completion`] to resolve it on its own terms.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::dispatch::Dispatcher;
use crate::promise::{Deferred, Promise};

/// Something whose propagation to further listeners can be stopped.
pub trait StoppableEvent {
    /// Returns true once no further listeners should run.
    fn is_propagation_stopped(&self) -> bool;
}

/// An event moving through a [`Dispatcher`].
pub struct Event<P: 'static> {
    name: String,
    detail: RefCell<P>,
    stopped: Cell<bool>,
    completion: RefCell<Option<Deferred<()>>>,
    promise: RefCell<Option<Promise<()>>>,
}

impl<P: 'static> Event<P> {
    /// Create an event that has not been dispatched yet.
    pub fn new(name: impl Into<String>, detail: P) -> Rc<Self> {
        let (completion, promise) = Deferred::new();
        Rc::new(Self {
            name: name.into(),
            detail: RefCell::new(detail),
            stopped: Cell::new(false),
            completion: RefCell::new(Some(completion)),
            promise: RefCell::new(Some(promise)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrow the payload.
    ///
    /// # Panics
    ///
    /// Panics if a listener currently holds [`detail_mut`](Self::detail_mut).
    pub fn detail(&self) -> Ref<'_, P> {
        self.detail.borrow()
    }

    /// Mutably borrow the payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload is already borrowed.
    pub fn detail_mut(&self) -> RefMut<'_, P> {
        self.detail.borrow_mut()
    }

    /// Prevent listeners that have not run yet from being invoked.
    pub fn stop_propagation(&self) {
        self.stopped.set(true);
    }

    /// Take over resolution of this event's completion.
    ///
    /// Returns `None` if the handle was already taken. Once taken, the
    /// dispatcher no longer resolves the completion; the taker must.
    pub fn take_completion(&self) -> Option<Deferred<()>> {
        self.completion.borrow_mut().take()
    }

    /// The completion promise, available once per event.
    pub(crate) fn take_promise(&self) -> Option<Promise<()>> {
        self.promise.borrow_mut().take()
    }
}

impl<P: 'static> StoppableEvent for Event<P> {
    fn is_propagation_stopped(&self) -> bool {
        self.stopped.get()
    }
}

impl<P: 'static> Event<P> {
    /// Returns true once [`stop_propagation`](Self::stop_propagation) was called.
    pub fn is_propagation_stopped(&self) -> bool {
        StoppableEvent::is_propagation_stopped(self)
    }
}

impl<P: fmt::Debug + 'static> fmt::Debug for Event<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("detail", &self.detail)
            .field("stopped", &self.stopped.get())
            .finish_non_exhaustive()
    }
}

/// What a listener returns: optionally a handle that settles when its
/// asynchronous work is done.
pub type ListenerResult = anyhow::Result<Option<Promise<()>>>;

/// Reacts to dispatched events.
///
/// Errors and panics are logged by the dispatcher and never reach the
/// dispatch completion. A listener that needs its failure seen must report
/// it itself.
///
/// # Example
///
/// ```ignore
/// struct AuditListener;
///
/// impl Listener<Report> for AuditListener {
///     fn handle(&self, event: &Rc<Event<Report>>, name: &str, _: &Dispatcher<Report>) -> ListenerResult {
///         info!(event = name, rows = event.detail().rows, "audited");
///         Ok(None)
///     }
/// }
/// ```
pub trait Listener<P: 'static>: 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn handle(&self, event: &Rc<Event<P>>, name: &str, dispatcher: &Dispatcher<P>) -> ListenerResult;
}

impl<P, F> Listener<P> for F
where
    P: 'static,
    F: Fn(&Rc<Event<P>>, &str, &Dispatcher<P>) -> ListenerResult + 'static,
{
    fn handle(&self, event: &Rc<Event<P>>, name: &str, dispatcher: &Dispatcher<P>) -> ListenerResult {
        self(event, name, dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_propagation_sets_flag() {
        let event = Event::new("price.updated", ());
        assert!(!event.is_propagation_stopped());
        event.stop_propagation();
        assert!(event.is_propagation_stopped());
    }

    #[test]
    fn test_completion_can_only_be_taken_once() {
        let event = Event::new("price.updated", ());
        assert!(event.take_completion().is_some());
        assert!(event.take_completion().is_none());
    }

    #[test]
    fn test_detail_is_mutable_through_shared_handle() {
        let event = Event::new("price.updated", Vec::<u32>::new());
        let shared = event.clone();
        shared.detail_mut().push(3);
        assert_eq!(*event.detail(), vec![3]);
    }
}
