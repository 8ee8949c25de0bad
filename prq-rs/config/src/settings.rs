use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_DEQUEUE_TIMEOUT_SECONDS, DEFAULT_ERROR_BACKOFF_SECONDS, DEFAULT_KEY_PREFIX,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_NUM_WORKERS, DEFAULT_REDIS_DSN, DEFAULT_RETRY_INTERVAL_SECONDS,
    DEFAULT_SHUTDOWN_GRACE_PERIOD_SECONDS,
};

/// Dispatch policy for one named queue, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueSettings {
    pub num_workers: usize,
    pub max_attempts: u32,
    pub retry_interval_seconds: f64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval_seconds: DEFAULT_RETRY_INTERVAL_SECONDS,
        }
    }
}

impl QueueSettings {
    pub fn retry_interval(&self) -> Duration {
        seconds_to_duration(self.retry_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct PrqSettings {
    pub redis_dsn: String,
    pub key_prefix: String,
    pub dequeue_timeout_seconds: f64,
    pub error_backoff_seconds: f64,
    pub shutdown_grace_period_seconds: f64,
    pub queues: HashMap<String, QueueSettings>,
}

impl Default for PrqSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            dequeue_timeout_seconds: DEFAULT_DEQUEUE_TIMEOUT_SECONDS,
            error_backoff_seconds: DEFAULT_ERROR_BACKOFF_SECONDS,
            shutdown_grace_period_seconds: DEFAULT_SHUTDOWN_GRACE_PERIOD_SECONDS,
            queues: HashMap::new(),
        }
    }
}

impl PrqSettings {
    pub fn dequeue_timeout(&self) -> Duration {
        seconds_to_duration(self.dequeue_timeout_seconds)
    }

    pub fn error_backoff(&self) -> Duration {
        seconds_to_duration(self.error_backoff_seconds)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        seconds_to_duration(self.shutdown_grace_period_seconds)
    }

    /// Settings for `name`, falling back to the defaults for queues that are
    /// not listed in the config file.
    pub fn queue(&self, name: &str) -> QueueSettings {
        self.queues.get(name).cloned().unwrap_or_default()
    }
}

/// Non-positive and NaN values read as zero; values past `Duration::MAX`
/// saturate.
fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}
