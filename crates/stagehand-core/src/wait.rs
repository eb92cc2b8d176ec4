//! Bounded fixed-interval polling.
//!
//! Every wait in the engine (stack status, remote builds, database readiness)
//! goes through [`poll_until`]: re-check at a fixed interval, give up with
//! [`Error::Timeout`] once the deadline passes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Deadline and interval for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(3),
        }
    }
}

impl PollConfig {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub const fn secs(timeout: u64, interval: u64) -> Self {
        Self::new(Duration::from_secs(timeout), Duration::from_secs(interval))
    }

    /// Scale both values down, used to run the same flows quickly in tests
    /// and sandboxes.
    pub fn scaled(self, divisor: u32) -> Self {
        let divisor = divisor.max(1);
        Self {
            timeout: self.timeout / divisor,
            interval: self.interval / divisor,
        }
    }
}

/// Result of one check inside a polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    /// Not there yet; carries a description of what was observed.
    Pending(String),
}

/// Poll `check` until it reports [`Probe::Ready`].
///
/// Errors returned by `check` abort the loop immediately.
pub async fn poll_until<T, F, Fut>(config: PollConfig, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match check().await? {
            Probe::Ready(value) => {
                debug!(what = %what, attempts, "Wait finished");
                return Ok(value);
            }
            Probe::Pending(last) => {
                let waited = start.elapsed();
                if waited >= config.timeout {
                    return Err(Error::Timeout {
                        what: what.to_string(),
                        waited,
                        last,
                    });
                }
                debug!(what = %what, attempt = attempts, observed = %last, "Still waiting");
                tokio::time::sleep(config.interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> PollConfig {
        PollConfig::new(Duration::from_millis(200), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_returns_when_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = poll_until(fast(), "thing", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n >= 2 {
                    Ok(Probe::Ready(n))
                } else {
                    Ok(Probe::Pending(format!("attempt {}", n)))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out_with_last_observation() {
        let err = poll_until::<(), _, _>(fast(), "stack web", || async {
            Ok(Probe::Pending("PROGRESS".to_string()))
        })
        .await
        .unwrap_err();

        match err {
            Error::Timeout { what, last, waited } => {
                assert_eq!(what, "stack web");
                assert_eq!(last, "PROGRESS");
                assert!(waited >= Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_check_error_aborts() {
        let err = poll_until::<(), _, _>(fast(), "x", || async {
            Err(Error::Remote("boom".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[test]
    fn test_scaled() {
        let config = PollConfig::secs(600, 10).scaled(1000);
        assert_eq!(config.timeout, Duration::from_millis(600));
        assert_eq!(config.interval, Duration::from_millis(10));
    }
}
