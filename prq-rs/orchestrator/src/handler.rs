use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;

use crate::job::Job;

/// Work run for each job claimed from a queue. An `Err` counts as a failed
/// attempt: the job is retried or killed according to the queue's policy.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<()>;
}

pub(crate) struct FnHandler<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, job: Job) -> Result<()> {
        (self.0)(job).await
    }
}
