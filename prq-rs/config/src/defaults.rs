pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";
pub const DEFAULT_KEY_PREFIX: &str = "prq";

pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 100;
pub const DEFAULT_PRIORITY: i64 = MIN_PRIORITY;

pub const DEFAULT_NUM_WORKERS: usize = 1;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
pub const DEFAULT_RETRY_INTERVAL_SECONDS: f64 = 0.0;

pub const DEFAULT_DEQUEUE_TIMEOUT_SECONDS: f64 = 1.0;
pub const DEFAULT_ERROR_BACKOFF_SECONDS: f64 = 1.0;
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_SECONDS: f64 = 0.0;
