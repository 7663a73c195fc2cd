//! Bounded retries for promise-producing operations.
//!
//! A promisor is called with the current attempt index (starting at 0). A
//! rejection is retried until the attempt index reaches `max_retries`; the
//! final failure carries one [`RetryError`] layer per attempt, outermost
//! first, with the latest rejection innermost:
//!
//! ```text
//! Attempt { attempt: 0 }
//!   └─ Attempt { attempt: 1 }
//!        └─ Exhausted { attempt: 2 }
//!             └─ <rejection of attempt 2>
//! ```
//!
//! A promisor that fails synchronously (returns `Err`) is not retried.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use tracing::debug;

use crate::error::{retry_source, RetryError};
use crate::promise::Promise;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Re-invokes failed operations up to a fixed bound.
#[derive(Debug, Clone, Copy)]
pub struct RetryAssistant {
    max_retries: u32,
}

impl RetryAssistant {
    /// Build an assistant; `max_retries` is clamped to at least 1.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
        }
    }

    /// The clamped retry bound.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `promisor`, retrying rejections.
    pub fn retry<T, F>(&self, promisor: F) -> Promise<T>
    where
        T: 'static,
        F: FnMut(u32) -> Result<Promise<T>> + 'static,
    {
        attempt(Rc::new(RefCell::new(promisor)), 0, self.max_retries)
    }
}

impl Default for RetryAssistant {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// Run `promisor` with at most `max_retries` retries.
pub fn retry<T, F>(promisor: F, max_retries: u32) -> Promise<T>
where
    T: 'static,
    F: FnMut(u32) -> Result<Promise<T>> + 'static,
{
    RetryAssistant::new(max_retries).retry(promisor)
}

fn attempt<T, F>(promisor: Rc<RefCell<F>>, current: u32, max_retries: u32) -> Promise<T>
where
    T: 'static,
    F: FnMut(u32) -> Result<Promise<T>> + 'static,
{
    let started = {
        let mut call = promisor.borrow_mut();
        (*call)(current)
    };

    let operation = match started {
        Ok(operation) => operation,
        Err(err) => {
            return Promise::rejected(RetryError::Start {
                attempt: current,
                source: err.into(),
            })
        }
    };

    operation.or_else(move |reason| {
        if current >= max_retries {
            return Promise::rejected(RetryError::Exhausted {
                attempt: current,
                max_retries,
                source: reason.into(),
            });
        }

        debug!(attempt = current, max_retries, error = %reason, "attempt failed, retrying");
        let rendered = format!("{reason:#}");
        attempt(promisor, current + 1, max_retries).map_err(move |failure| {
            RetryError::Attempt {
                attempt: current,
                max_retries,
                reason: rendered,
                source: retry_source(failure),
            }
            .into()
        })
    })
}
