use crate::{Error, Result};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long to keep retrying calls that fail with [`Error::Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The total time allowed for retries after the first failure.
    pub max_retry: Duration,
    /// The pause between attempts.
    pub retry_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: Duration::from_secs(1),
            retry_wait: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Runs `f` until it succeeds, fails with an error other than a network failure,
    /// or keeps failing for longer than `max_retry`, in which case the last network
    /// error is returned.
    pub fn run<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut failure_started: Option<Instant> = None;
        loop {
            match f() {
                Err(Error::Network(message)) => {
                    let started = *failure_started.get_or_insert_with(Instant::now);
                    if started.elapsed() >= self.max_retry {
                        warn!(what, %message, "giving up after network failures");
                        return Err(Error::Network(message));
                    }
                    debug!(what, %message, "retrying after network failure");
                    std::thread::sleep(self.retry_wait);
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retries_network_failures() {
        let policy = RetryPolicy {
            max_retry: Duration::from_secs(5),
            retry_wait: Duration::from_millis(1),
        };
        let mut attempts = 0;
        let result = policy.run("test", || {
            attempts += 1;
            if attempts < 3 {
                Err(Error::Network("connection reset".into()))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn other_errors_are_returned_at_once() {
        let mut attempts = 0;
        let result: Result<()> = RetryPolicy::default().run("test", || {
            attempts += 1;
            Err(Error::Conflict("busy".into()))
        });
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn gives_up_after_max_retry() {
        let policy = RetryPolicy {
            max_retry: Duration::from_millis(20),
            retry_wait: Duration::from_millis(2),
        };
        let result: Result<()> = policy.run("test", || Err(Error::Network("down".into())));
        assert_eq!(result, Err(Error::Network("down".into())));
    }
}
