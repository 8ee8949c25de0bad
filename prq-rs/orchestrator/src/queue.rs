use std::time::Duration;

use prq_config::QueueSettings;

use crate::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_NUM_WORKERS};

/// A named queue and its dispatch policy. Plain value; the store keys it
/// maps to come from [`crate::keys::KeySpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub num_workers: usize,
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_workers: DEFAULT_NUM_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: Duration::ZERO,
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &QueueSettings) -> Self {
        Self {
            name: name.into(),
            num_workers: settings.num_workers,
            max_attempts: settings.max_attempts,
            retry_interval: settings.retry_interval(),
        }
        .normalized()
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Raise a zero worker count or attempt ceiling to one.
    pub fn normalized(mut self) -> Self {
        self.num_workers = self.num_workers.max(1);
        self.max_attempts = self.max_attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_raises_zero_limits() {
        let queue = Queue::new("q").with_workers(0).with_max_attempts(0).normalized();
        assert_eq!(queue.num_workers, 1);
        assert_eq!(queue.max_attempts, 1);
    }

    #[test]
    fn from_settings_copies_policy() {
        let settings = QueueSettings {
            num_workers: 3,
            max_attempts: 5,
            retry_interval_seconds: 2.0,
        };
        let queue = Queue::from_settings("mail", &settings);
        assert_eq!(queue.name, "mail");
        assert_eq!(queue.num_workers, 3);
        assert_eq!(queue.max_attempts, 5);
        assert_eq!(queue.retry_interval, Duration::from_secs(2));
    }

    #[test]
    fn from_settings_saturates_huge_retry_interval() {
        let settings = QueueSettings {
            retry_interval_seconds: 1e20,
            ..QueueSettings::default()
        };
        let queue = Queue::from_settings("mail", &settings);
        assert_eq!(queue.retry_interval, Duration::MAX);
    }
}
