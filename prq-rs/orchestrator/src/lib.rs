pub mod client;
pub mod constants;
pub mod dispatcher;
pub mod handler;
pub mod job;
pub mod keys;
pub mod queue;
pub mod store;
pub mod telemetry;

mod dequeue;

#[cfg(test)]
mod test_support;

pub use client::{Client, ClientOptions, SubmitOptions};
pub use dispatcher::{Canceller, Dispatcher};
pub use handler::Handler;
pub use job::{Job, JobState};
pub use keys::KeySpace;
pub use prq_config::{PrqSettings, QueueSettings, load_toml_settings, resolve_config_source};
pub use queue::Queue;
pub use store::{Conn, ConnPool, Connector, MemoryStore, RedisConnector};
