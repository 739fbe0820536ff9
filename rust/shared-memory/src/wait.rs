//! Bounded polling used while waiting for the peer to create IPC objects

use crate::{Result, SharedMemoryError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Retry policy for `attach`-style waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOptions {
    /// Give up after this long
    pub timeout: Duration,
    /// First sleep between attempts
    pub poll_interval: Duration,
    /// Backoff ceiling
    pub max_poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(500),
        }
    }
}

impl WaitOptions {
    /// Options with the given timeout and default backoff
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Fixed poll interval, no backoff
    pub fn fixed(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            max_poll_interval: poll_interval,
        }
    }
}

/// Run `attempt` until it yields a value or the timeout expires.
///
/// `attempt` returns `Ok(None)` for "not there yet" and `Err` for failures that
/// retrying cannot fix; those are returned immediately. Sleeps never overshoot
/// the deadline, so the call returns within `timeout` plus one attempt.
pub fn poll_until<T>(
    resource: &str,
    options: &WaitOptions,
    mut attempt: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let started = Instant::now();
    let mut interval = options.poll_interval.max(Duration::from_micros(100));
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        if let Some(value) = attempt()? {
            if attempts > 1 {
                debug!("{} became available after {} attempts", resource, attempts);
            }
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            return Err(SharedMemoryError::ResourceUnavailable {
                resource: resource.to_string(),
                waited_ms: elapsed.as_millis() as u64,
            });
        }

        let sleep_for = interval.min(options.timeout - elapsed);
        trace!("{} not ready, sleeping {:?}", resource, sleep_for);
        std::thread::sleep(sleep_for);
        interval = (interval * 2).min(options.max_poll_interval.max(options.poll_interval));
    }
}
