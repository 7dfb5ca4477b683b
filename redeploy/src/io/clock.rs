//! Injectable sleeping for retry and health-poll loops.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::core::retry::RetryPolicy;

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread for real.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Call `op` until it succeeds or the policy is exhausted, sleeping between attempts.
///
/// Returns the last error when every attempt fails.
pub fn retry_with_backoff<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut retry = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if retry < policy.max_retries => {
                let delay = policy.delay_for_retry(retry);
                debug!(label, retry, delay_ms = delay.as_millis() as u64, err = %err, "retrying");
                sleeper.sleep(delay);
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
