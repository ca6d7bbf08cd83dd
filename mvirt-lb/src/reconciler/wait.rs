//! Poll-until-settled primitive.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::clock::Clock;
use crate::config::duration_secs;

/// Backoff between status reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Wait before the first read.
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    /// Wait after the first pending read; doubles after every further one.
    #[serde(with = "duration_secs")]
    pub min_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of one status read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    /// Not settled yet; carries the observed status for error reporting.
    Pending(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitError<E> {
    Timeout { waited: Duration, last_status: String },
    /// The probe failed; never retried.
    Failed(E),
}

/// Call `probe` until it reports `Ready`, it fails, or `timeout` elapses.
///
/// Sleeps never run past the deadline, and once the deadline has been
/// reached after a pending read no further read is issued. At least one
/// read always happens.
pub async fn poll_until_settled<T, E, F, Fut>(
    clock: &dyn Clock,
    policy: &PollPolicy,
    timeout: Duration,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, E>>,
{
    let start = clock.now();
    let deadline = start.checked_add(timeout);
    let mut delay = policy.initial_delay;
    let mut interval = policy.min_interval;
    let mut last_status = String::from("unknown");
    let mut reads = 0u32;

    loop {
        let remaining = time_left(deadline, clock.now());
        if reads > 0 && remaining.is_zero() {
            return Err(WaitError::Timeout {
                waited: clock.now() - start,
                last_status,
            });
        }
        clock.sleep(delay.min(remaining)).await;

        reads += 1;
        match probe().await.map_err(WaitError::Failed)? {
            Poll::Ready(value) => {
                debug!(reads, "settled");
                return Ok(value);
            }
            Poll::Pending(status) => {
                debug!(reads, status = %status, "not settled yet");
                last_status = status;
            }
        }

        delay = interval;
        interval = interval.saturating_mul(2).min(policy.max_interval);
    }
}

/// Time until `deadline`; a deadline past the representable range never arrives.
pub(crate) fn time_left(deadline: Option<Instant>, now: Instant) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(now),
        None => Duration::MAX,
    }
}
