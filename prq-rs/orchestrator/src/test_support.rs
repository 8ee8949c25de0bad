use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use crate::client::{Client, ClientOptions};
use crate::store::MemoryStore;

pub(crate) const TEST_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(20);
pub(crate) const TEST_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A client over a fresh in-memory store, with short blocking timeouts so
/// loops notice cancellation quickly.
pub(crate) struct MemoryTestContext {
    pub client: Client,
    pub store: MemoryStore,
}

impl MemoryTestContext {
    pub async fn new() -> Result<Self> {
        Self::with_dequeue_timeout(TEST_DEQUEUE_TIMEOUT).await
    }

    pub async fn with_dequeue_timeout(dequeue_timeout: Duration) -> Result<Self> {
        let store = MemoryStore::new();
        let options = ClientOptions {
            dequeue_timeout,
            error_backoff: TEST_ERROR_BACKOFF,
            ..ClientOptions::default()
        }
        .with_connector(Arc::new(store.clone()));
        let client = Client::connect(options).await?;
        Ok(Self { client, store })
    }
}

/// A client against the Redis named by `PRQ_TEST_REDIS_DSN`, under a prefix
/// no other test uses. `None` when the variable is unset.
pub(crate) async fn redis_test_client() -> Result<Option<Client>> {
    let Ok(dsn) = std::env::var("PRQ_TEST_REDIS_DSN") else {
        return Ok(None);
    };
    let options = ClientOptions {
        url: dsn,
        prefix: format!("prq-test-{}", Uuid::new_v4()),
        dequeue_timeout: Duration::from_millis(100),
        error_backoff: TEST_ERROR_BACKOFF,
        connector: None,
    };
    Ok(Some(Client::connect(options).await?))
}
