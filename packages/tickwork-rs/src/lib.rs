//! # Tickwork
//!
//! A single-threaded cooperative runtime for scraping-style background work:
//! throttled outbound actions, bounded retries, tick-scheduled event dispatch
//! and self-rescheduling routines, all driven by one [`Reactor`].
//!
//! ## Architecture
//!
//! ```text
//! PeriodicRoutine ──► UnitOfWork.run()
//!     ▲                   │
//!     │                   ├─► TimeIssuer.get_time()      one turn per interval
//!     │                   ├─► RetryAssistant.retry()     bounded re-invocation
//!     │                   │
//!     │                   └─► Dispatcher.dispatch(event)
//!     │                            │
//!     │                 TickScheduler | DeferredTickScheduler
//!     │                            │
//!     │                   Reactor future ticks ──► Listener.handle()
//!     │                            │
//!     │                   resolve_dispatch_promise()
//!     │                            │
//!     └──── timer(interval) ◄──────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One thread** - every handle is `Rc`-based; nothing here is `Send`
//! 2. **Ticks are FIFO** - a tick queued earlier always runs earlier
//! 3. **Listeners never run inside `dispatch`** - only on future ticks
//! 4. **Listener faults are isolated** - errors and panics are logged and the
//!    dispatch completion still resolves
//! 5. **Routines outlive failures** - a failed cycle re-arms its timer
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tickwork::{Dispatcher, PeriodicRoutine, Reactor, SchedulerKind, TimeIssuer, TimeIssuerOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let reactor = Reactor::new();
//!     let issuer = TimeIssuer::new(&reactor, TimeIssuerOptions::default());
//!     let dispatcher = Dispatcher::new(&reactor, SchedulerKind::Demand);
//!
//!     let routine = PeriodicRoutine::new(&reactor, RefreshPrices::new(issuer, dispatcher), Duration::from_secs(300));
//!     routine.start();
//!
//!     reactor.run().await;
//! }
//! ```

mod dispatch;
mod error;
mod event;
mod promise;
mod reactor;
mod retry;
mod routine;
mod scheduler;
mod time_issuer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod stress_tests;

pub use dispatch::{resolve_dispatch_promise, Dispatcher, TickCallbackBuilder};
pub use error::{BoxError, RetryError, TickworkError};
pub use event::{Event, Listener, ListenerResult, StoppableEvent};
pub use promise::{all_settled, Deferred, Promise};
pub use reactor::{Reactor, TimerId};
pub use retry::{retry, RetryAssistant, DEFAULT_MAX_RETRIES};
pub use routine::{PeriodicRoutine, StartFailurePolicy, UnitOfWork};
pub use scheduler::{DeferredTickScheduler, SchedulerKind, TickScheduler};
pub use time_issuer::{TimeIssuer, TimeIssuerOptions};
