//! Structured error types for tickwork.
//!
//! Promise rejections carry `anyhow::Error` so any domain error can flow
//! through a continuation chain. The types here are the faults tickwork
//! itself raises:
//!
//! - [`TickworkError`] - reactor, promise and issuer level faults
//! - [`RetryError`] - one layer of a retry causal chain
//!
//! # Unwrapping a Retry Chain
//!
//! ```ignore
//! use tickwork::RetryError;
//!
//! promise.on_settle(|result| {
//!     if let Err(err) = result {
//!         for (depth, layer) in err.chain().enumerate() {
//!             if let Some(retry) = layer.downcast_ref::<RetryError>() {
//!                 println!("{depth}: attempt {} failed", retry.attempt());
//!             }
//!         }
//!     }
//! });
//! ```

use thiserror::Error;

/// Boxed error used as the `source` of a [`RetryError`] layer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the tickwork primitives themselves.
#[derive(Debug, Error)]
pub enum TickworkError {
    /// The resolving half of a promise was dropped before it settled.
    #[error("promise abandoned before it was settled")]
    Abandoned,

    /// The time issuer was shut down while the waiter was still queued.
    #[error("time issuer shut down before a turn was granted")]
    IssuerShutDown,

    /// A listener panicked while handling an event.
    #[error("listener panicked while handling '{event}': {message}")]
    ListenerPanicked {
        /// Name of the event being dispatched.
        event: String,
        /// Extracted panic payload.
        message: String,
    },

    /// An event was handed to the dispatcher a second time.
    #[error("event '{event}' was already dispatched")]
    AlreadyDispatched { event: String },

    /// A scheduler name that is neither `eager` nor `demand`.
    #[error("unknown dispatch scheduler '{0}', expected 'eager' or 'demand'")]
    UnknownScheduler(String),
}

/// One layer of the causal chain produced by [`RetryAssistant`](crate::RetryAssistant).
///
/// The outermost layer belongs to attempt 0. Each `Attempt` layer wraps the
/// failure of the attempts that followed it, and the chain ends in an
/// `Exhausted` layer whose source is the promisor's latest rejection.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The promisor failed before it could produce a promise.
    ///
    /// Synchronous failures are not retried.
    #[error("attempt {attempt} could not be started")]
    Start {
        attempt: u32,
        #[source]
        source: BoxError,
    },

    /// The attempt was rejected and the retries that followed also failed.
    #[error("attempt {attempt} of {max_retries} failed ({reason}), retries failed as well")]
    Attempt {
        attempt: u32,
        max_retries: u32,
        /// Rendered rejection of this attempt.
        reason: String,
        #[source]
        source: BoxError,
    },

    /// The final attempt was rejected; no retries remain.
    #[error("attempt {attempt} of {max_retries} failed, giving up")]
    Exhausted {
        attempt: u32,
        max_retries: u32,
        #[source]
        source: BoxError,
    },
}

impl RetryError {
    /// The attempt index this layer describes.
    pub fn attempt(&self) -> u32 {
        match self {
            RetryError::Start { attempt, .. }
            | RetryError::Attempt { attempt, .. }
            | RetryError::Exhausted { attempt, .. } => *attempt,
        }
    }
}

/// Box a rejection as the source of a retry layer.
///
/// A nested [`RetryError`] is boxed as itself so the layer stays reachable
/// through `downcast_ref` while walking the chain.
pub(crate) fn retry_source(err: anyhow::Error) -> BoxError {
    match err.downcast::<RetryError>() {
        Ok(layer) => Box::new(layer),
        Err(other) => other.into(),
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_error_attempt_accessor() {
        let err = RetryError::Exhausted {
            attempt: 2,
            max_retries: 2,
            source: anyhow::anyhow!("boom").into(),
        };
        assert_eq!(err.attempt(), 2);
        assert_eq!(err.to_string(), "attempt 2 of 2 failed, giving up");
    }

    #[test]
    fn test_nested_retry_layer_stays_downcastable() {
        let inner = anyhow::Error::new(RetryError::Exhausted {
            attempt: 1,
            max_retries: 1,
            source: anyhow::anyhow!("timeout").into(),
        });
        let outer = RetryError::Attempt {
            attempt: 0,
            max_retries: 1,
            reason: "timeout".into(),
            source: retry_source(inner),
        };

        let nested = std::error::Error::source(&outer).unwrap();
        assert!(matches!(
            nested.downcast_ref::<RetryError>(),
            Some(RetryError::Exhausted { attempt: 1, .. })
        ));
    }

    #[test]
    fn test_panic_message_variants() {
        let str_payload: Box<dyn std::any::Any + Send> = Box::new("static");
        let string_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let other_payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(&str_payload), "static");
        assert_eq!(panic_message(&string_payload), "owned");
        assert_eq!(panic_message(&other_payload), "unknown panic");
    }
}
