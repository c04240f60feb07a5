//! Bounded retry with cancellation

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared cancellation flag
///
/// Clones observe the same flag, so a signal handler can cancel a session
/// that runs on another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How often to retry an operation that reports a not-yet-available resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts (0 = spin)
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

fn default_max_attempts() -> u32 {
    100_000
}

impl RetryPolicy {
    /// Run `attempt` until it succeeds or fails with a non-retriable error
    ///
    /// Retriable errors are retried up to `max_attempts` times; the token is
    /// checked before every attempt.
    pub fn run<T>(&self, what: &str, cancel: &CancelToken, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let backoff = Duration::from_millis(self.backoff_ms);
        let mut tries = 0u32;

        loop {
            if cancel.is_cancelled() {
                warn!("{}: cancelled after {} attempts", what, tries);
                return Err(Error::Cancelled);
            }

            tries += 1;
            match attempt() {
                Ok(value) => {
                    if tries > 1 {
                        debug!("{}: succeeded after {} attempts", what, tries);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retriable() => {
                    if tries >= self.max_attempts {
                        warn!("{}: giving up after {} attempts", what, tries);
                        return Err(Error::ResourceUnavailable(format!(
                            "{} still unavailable after {} attempts",
                            what, tries
                        )));
                    }
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> Error {
        Error::ResourceUnavailable("queue".into())
    }

    #[test]
    fn test_retries_until_success() {
        let policy = RetryPolicy { max_attempts: 10, backoff_ms: 0 };
        let mut calls = 0;
        let value = policy
            .run("open", &CancelToken::new(), || {
                calls += 1;
                if calls < 4 { Err(unavailable()) } else { Ok(calls) }
            })
            .unwrap();
        assert_eq!(value, 4);
    }

    #[test]
    fn test_other_errors_abort_immediately() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let err = policy
            .run("open", &CancelToken::new(), || -> Result<()> {
                calls += 1;
                Err(Error::InvalidArgument("bad name".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_bounded_attempts() {
        let policy = RetryPolicy { max_attempts: 3, backoff_ms: 0 };
        let mut calls = 0;
        let err = policy
            .run("open", &CancelToken::new(), || -> Result<()> {
                calls += 1;
                Err(unavailable())
            })
            .unwrap_err();
        assert!(matches!(err, Error::ResourceUnavailable(_)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_cancel_stops_retrying() {
        let policy = RetryPolicy::default();
        let cancel = CancelToken::new();
        let observer = cancel.clone();
        let mut calls = 0;
        let err = policy
            .run("open", &cancel, || -> Result<()> {
                calls += 1;
                if calls == 5 {
                    observer.cancel();
                }
                Err(unavailable())
            })
            .unwrap_err();
        assert_eq!(err, Error::Cancelled);
        assert_eq!(calls, 5);
    }
}
