use anyhow::Result;

use crate::constants::{
    DEFAULT_KEY_PREFIX, DELAYED_QUEUE_KEY_SEGMENT, JOB_ID_COUNTER_SEGMENT, JOB_KEY_SEGMENT,
    KEY_SEPARATOR, MAX_PRIORITY, MIN_PRIORITY, QUEUE_KEY_SEGMENT,
};

/// Maps queue names, priorities and job IDs onto store keys under one
/// prefix. The mapping is pure, so a restarted process finds the same keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.is_empty() {
            DEFAULT_KEY_PREFIX.to_string()
        } else {
            prefix
        };
        Self { prefix }
    }

    fn build_key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push_str(KEY_SEPARATOR);
            key.push_str(part);
        }
        key
    }

    pub fn job_id_counter_key(&self) -> String {
        self.build_key(&[JOB_ID_COUNTER_SEGMENT])
    }

    pub fn job_key(&self, id: u64) -> String {
        self.build_key(&[JOB_KEY_SEGMENT, &id.to_string()])
    }

    pub fn priority_queue_key(&self, queue_name: &str, priority: i64) -> String {
        self.build_key(&[QUEUE_KEY_SEGMENT, queue_name, &priority.to_string()])
    }

    pub fn delayed_queue_key(&self, queue_name: &str) -> String {
        self.build_key(&[DELAYED_QUEUE_KEY_SEGMENT, queue_name])
    }

    /// Every priority list of a queue, highest priority first. A multi-key
    /// blocking pop over this list serves priorities in order.
    pub fn priority_queue_keys(&self, queue_name: &str) -> Vec<String> {
        (MIN_PRIORITY..=MAX_PRIORITY)
            .rev()
            .map(|priority| self.priority_queue_key(queue_name, priority))
            .collect()
    }

    pub fn check_priority(priority: i64) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            anyhow::bail!("priority {priority} out of range [{MIN_PRIORITY}, {MAX_PRIORITY}]");
        }
        Ok(())
    }
}
