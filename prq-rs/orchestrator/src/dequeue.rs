use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::store::{Conn, ScoreRange};

/// Delayed-set score for a due time: seconds since the epoch, microsecond
/// precision.
pub(crate) fn time_as_score(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

/// Take the next job key for one queue.
///
/// A due member of the delayed set is preferred. It is read and then removed
/// in two calls, so concurrent pollers can read the same candidate; only the
/// one whose remove deletes it owns the job, and a poller that loses falls
/// through to the priority lists. Those are popped with a single blocking
/// pop across `priority_keys`, which must be ordered highest priority first.
///
/// `Ok(None)` means nothing was eligible before `timeout` ran out.
pub(crate) async fn pop_job_key(
    conn: &mut dyn Conn,
    delayed_key: &str,
    priority_keys: &[String],
    now: DateTime<Utc>,
    timeout: Duration,
) -> Result<Option<String>> {
    let due = conn
        .zrange_by_score(delayed_key, ScoreRange::up_to(time_as_score(now), 1))
        .await
        .context("failed to read delayed jobs")?;
    if let Some(candidate) = due.into_iter().next() {
        let removed = conn
            .zrem(delayed_key, &candidate)
            .await
            .context("failed to claim delayed job")?;
        if removed >= 1 {
            return Ok(Some(candidate));
        }
        tracing::debug!(job_key = %candidate, "delayed job claimed by another poller");
    }

    let popped = conn
        .blpop(timeout, priority_keys)
        .await
        .context("failed to pop from priority queues")?;
    Ok(popped.map(|(_, job_key)| job_key))
}
