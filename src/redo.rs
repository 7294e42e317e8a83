//! Bounded redo of timed-out calls.
//!
//! Every client to broker RPC and every broker to client push goes through
//! [`RedoPolicy::run`]. The rules:
//!
//! - An attempt that times out (either the wrapped call returns
//!   [`Error::Timeout`] or the per-attempt deadline elapses) is redone
//!   immediately with the redo counter incremented.
//! - Any other outcome, success or error, is returned as is.
//! - With `max_redo = K` an always-timing-out call is attempted exactly
//!   `K + 1` times and then fails with [`Error::MaxRedoExceeded`].
//!
//! The wrapped closure receives the current redo counter, starting at 0.
//!
//! ```rust
//! use std::time::Duration;
//! use bundlemq::redo::RedoPolicy;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let policy = RedoPolicy::new(2, Duration::from_millis(50));
//! let out = policy
//!     .run("echo", |redo| async move { Ok::<_, bundlemq::Error>(redo) })
//!     .await;
//! assert_eq!(out, Ok(0));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cluster::config::RedoConfig;
use crate::cluster::metrics::{REDO_ATTEMPTS, REDO_EXHAUSTED};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoPolicy {
    max_redo: u32,
    attempt_timeout: Duration,
}

impl RedoPolicy {
    pub fn new(max_redo: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_redo,
            attempt_timeout,
        }
    }

    pub fn from_config(config: &RedoConfig) -> Self {
        Self::new(config.max_redo, config.operation_timeout())
    }

    /// Same budget, different per-attempt deadline.
    pub fn with_attempt_timeout(self, attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            ..self
        }
    }

    pub fn max_redo(&self) -> u32 {
        self.max_redo
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut redo = 0u32;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, op(redo)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };

            match outcome {
                Err(Error::Timeout) if redo >= self.max_redo => {
                    REDO_EXHAUSTED.with_label_values(&[op_name]).inc();
                    warn!(op = op_name, attempts = redo + 1, "Redo budget exhausted");
                    return Err(Error::MaxRedoExceeded(format!(
                        "{op_name} timed out {} times",
                        redo + 1
                    )));
                }
                Err(Error::Timeout) => {
                    redo += 1;
                    REDO_ATTEMPTS.with_label_values(&[op_name]).inc();
                    debug!(op = op_name, redo, "Call timed out, redoing");
                }
                other => return other,
            }
        }
    }
}

impl Default for RedoPolicy {
    fn default() -> Self {
        Self::from_config(&RedoConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_always_timeout_makes_k_plus_one_attempts() {
        for k in [0u32, 1, 3, 5] {
            let calls = Arc::new(AtomicU32::new(0));
            let policy = RedoPolicy::new(k, Duration::from_secs(1));
            let c = calls.clone();
            let result: Result<()> = policy
                .run("test", move |_| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Timeout)
                    }
                })
                .await;
            assert!(matches!(result, Err(Error::MaxRedoExceeded(_))));
            assert_eq!(calls.load(Ordering::SeqCst), k + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline_counts_as_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RedoPolicy::new(2, Duration::from_millis(100));
        let c = calls.clone();
        let result: Result<()> = policy
            .run("slow", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(Error::MaxRedoExceeded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_propagate_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RedoPolicy::new(5, Duration::from_secs(1));
        let c = calls.clone();
        let result: Result<()> = policy
            .run("test", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ModeConflict("s".into()))
                }
            })
            .await;
        assert_eq!(result, Err(Error::ModeConflict("s".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_counter_is_passed_and_success_stops() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let policy = RedoPolicy::new(5, Duration::from_secs(1));
        let s = seen.clone();
        let result = policy
            .run("test", move |redo| {
                s.lock().unwrap().push(redo);
                async move {
                    if redo < 2 {
                        Err(Error::Timeout)
                    } else {
                        Ok(redo)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
