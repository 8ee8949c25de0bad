pub use prq_config::defaults::{
    DEFAULT_DEQUEUE_TIMEOUT_SECONDS, DEFAULT_ERROR_BACKOFF_SECONDS, DEFAULT_KEY_PREFIX,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_NUM_WORKERS, DEFAULT_PRIORITY, DEFAULT_REDIS_DSN, MAX_PRIORITY,
    MIN_PRIORITY,
};

pub const JOB_ID_COUNTER_SEGMENT: &str = "cur_job_id";
pub const JOB_KEY_SEGMENT: &str = "jobs";
pub const QUEUE_KEY_SEGMENT: &str = "queue";
pub const DELAYED_QUEUE_KEY_SEGMENT: &str = "delayed_queue";
pub const KEY_SEPARATOR: &str = ":";

pub const FIELD_ID: &str = "id";
pub const FIELD_PRIORITY: &str = "priority";
pub const FIELD_STATE: &str = "state";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_CREATION_TIME: &str = "creation_time";
pub const FIELD_DELAYED_UNTIL: &str = "delayed_until";
pub const FIELD_COMPLETION_TIME: &str = "completion_time";
pub const FIELD_NUM_ATTEMPTS: &str = "num_attempts";
