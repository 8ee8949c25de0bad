use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prq_config::PrqSettings;
use serde_json::Value;
use tracing::Instrument;

use crate::constants::{
    DEFAULT_DEQUEUE_TIMEOUT_SECONDS, DEFAULT_ERROR_BACKOFF_SECONDS, DEFAULT_KEY_PREFIX,
    DEFAULT_PRIORITY, DEFAULT_REDIS_DSN, FIELD_COMPLETION_TIME, FIELD_DELAYED_UNTIL,
    FIELD_NUM_ATTEMPTS, FIELD_STATE,
};
use crate::dequeue::{pop_job_key, time_as_score};
use crate::dispatcher::{Canceller, Dispatcher};
use crate::handler::{FnHandler, Handler};
use crate::job::{Job, JobState};
use crate::keys::KeySpace;
use crate::queue::Queue;
use crate::store::{Conn, ConnPool, Connector, RedisConnector};

#[derive(Clone)]
pub struct ClientOptions {
    pub url: String,
    pub prefix: String,
    /// Replaces the Redis connector built from `url`.
    pub connector: Option<Arc<dyn Connector>>,
    /// Upper bound on one blocking dequeue.
    pub dequeue_timeout: Duration,
    /// Pause after a store error inside a dispatch loop.
    pub error_backoff: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_DSN.to_string(),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            connector: None,
            dequeue_timeout: Duration::from_secs_f64(DEFAULT_DEQUEUE_TIMEOUT_SECONDS),
            error_backoff: Duration::from_secs_f64(DEFAULT_ERROR_BACKOFF_SECONDS),
        }
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &PrqSettings) -> Self {
        Self {
            url: settings.redis_dsn.clone(),
            prefix: settings.key_prefix.clone(),
            connector: None,
            dequeue_timeout: settings.dequeue_timeout(),
            error_backoff: settings.error_backoff(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    pub priority: i64,
    /// Hold the job in the delayed set until this much time has passed.
    pub delay: Option<Duration>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay: None,
        }
    }
}

struct Registration {
    queue: Queue,
    handler: Arc<dyn Handler>,
}

struct ClientInner {
    pool: Arc<ConnPool>,
    keys: KeySpace,
    dequeue_timeout: Duration,
    error_backoff: Duration,
    registrations: Mutex<Vec<Registration>>,
}

/// Submits jobs, reads them back, and owns the handlers registered for
/// dispatch. Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client and check that the store is reachable.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let connector: Arc<dyn Connector> = match options.connector {
            Some(connector) => connector,
            None => Arc::new(RedisConnector::new(options.url.clone())?),
        };
        let pool = ConnPool::new(connector);
        drop(pool.get().await?);

        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                keys: KeySpace::new(options.prefix),
                dequeue_timeout: options.dequeue_timeout,
                error_backoff: options.error_backoff,
                registrations: Mutex::new(Vec::new()),
            }),
        })
    }

    pub async fn from_settings(settings: &PrqSettings) -> Result<Self> {
        Self::connect(ClientOptions::from_settings(settings)).await
    }

    pub fn keys(&self) -> &KeySpace {
        &self.inner.keys
    }

    pub(crate) fn error_backoff(&self) -> Duration {
        self.inner.error_backoff
    }

    pub async fn submit(&self, queue: &Queue, priority: i64, payload: Value) -> Result<Job> {
        let options = SubmitOptions {
            priority,
            delay: None,
        };
        self.enqueue(queue, payload, options).await
    }

    /// Submit a job that becomes eligible once `delay` has passed. A zero
    /// delay is eligible immediately.
    pub async fn submit_delayed(
        &self,
        queue: &Queue,
        delay: Duration,
        payload: Value,
    ) -> Result<Job> {
        let options = SubmitOptions {
            priority: DEFAULT_PRIORITY,
            delay: Some(delay),
        };
        self.enqueue(queue, payload, options).await
    }

    pub async fn enqueue(
        &self,
        queue: &Queue,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<Job> {
        KeySpace::check_priority(options.priority)?;
        let span = tracing::info_span!(
            "prq.submit",
            queue = %queue.name,
            priority = options.priority,
            job_id = tracing::field::Empty
        );

        async {
            let keys = &self.inner.keys;
            let mut conn = self.inner.pool.get().await?;
            let raw_id = conn
                .incr(&keys.job_id_counter_key())
                .await
                .context("failed to allocate job id")?;
            let id = u64::try_from(raw_id)
                .with_context(|| format!("job id counter returned {raw_id}"))?;
            tracing::Span::current().record("job_id", id);

            let now = Utc::now();
            let mut job = Job::new(options.priority, payload);
            job.id = id;
            job.creation_time = now;
            if let Some(delay) = options.delay {
                job.delayed_until = Some(offset_time(now, delay)?);
            }
            job.transition(JobState::Queued, now)?;
            persist_job(&mut *conn, keys, &job, &[]).await?;

            let job_key = keys.job_key(id);
            match job.delayed_until {
                Some(due) => {
                    conn.zadd_nx(
                        &keys.delayed_queue_key(&queue.name),
                        time_as_score(due),
                        &job_key,
                    )
                    .await
                    .context("failed to schedule delayed job")?;
                }
                None => {
                    conn.rpush(
                        &keys.priority_queue_key(&queue.name, job.priority),
                        &[job_key],
                    )
                    .await
                    .context("failed to push job")?;
                }
            }
            tracing::debug!(delayed_until = ?job.delayed_until, "job submitted");
            Ok(job)
        }
        .instrument(span)
        .await
    }

    /// Load a job record. `None` when no job has that ID.
    pub async fn job(&self, id: u64) -> Result<Option<Job>> {
        let mut conn = self.inner.pool.get().await?;
        let job_key = self.inner.keys.job_key(id);
        let raw = conn
            .hgetall(&job_key)
            .await
            .with_context(|| format!("failed to read {job_key}"))?;
        if raw.is_empty() {
            return Ok(None);
        }
        let job = Job::from_fields(&raw).with_context(|| format!("invalid job record {job_key}"))?;
        Ok(Some(job))
    }

    /// Claim the next eligible job of `queue` and move it to `Working`.
    ///
    /// Blocks for at most the dequeue timeout; `None` means nothing was
    /// eligible, so callers can check for cancellation and poll again.
    pub async fn wait(&self, queue: &Queue) -> Result<Option<Job>> {
        let span = tracing::debug_span!(
            "prq.dequeue",
            queue = %queue.name,
            job_id = tracing::field::Empty
        );

        async {
            let keys = &self.inner.keys;
            let mut conn = self.inner.pool.get().await?;
            let popped = pop_job_key(
                &mut *conn,
                &keys.delayed_queue_key(&queue.name),
                &keys.priority_queue_keys(&queue.name),
                Utc::now(),
                self.inner.dequeue_timeout,
            )
            .await?;
            let Some(job_key) = popped else {
                return Ok(None);
            };

            let raw = conn
                .hgetall(&job_key)
                .await
                .with_context(|| format!("failed to read {job_key}"))?;
            if raw.is_empty() {
                anyhow::bail!("dequeued {job_key} but its record is missing");
            }
            let mut job =
                Job::from_fields(&raw).with_context(|| format!("invalid job record {job_key}"))?;
            tracing::Span::current().record("job_id", job.id);

            job.transition(JobState::Working, Utc::now())?;
            persist_job(&mut *conn, keys, &job, &[FIELD_STATE, FIELD_NUM_ATTEMPTS]).await?;
            Ok(Some(job))
        }
        .instrument(span)
        .await
    }

    pub async fn finish(&self, job: &mut Job) -> Result<()> {
        job.transition(JobState::Finished, Utc::now())?;
        let mut conn = self.inner.pool.get().await?;
        persist_job(
            &mut *conn,
            &self.inner.keys,
            job,
            &[FIELD_STATE, FIELD_COMPLETION_TIME],
        )
        .await
    }

    /// Put a working job back in the delayed set, due after the queue's
    /// retry interval.
    pub async fn retry(&self, queue: &Queue, job: &mut Job) -> Result<()> {
        let now = Utc::now();
        job.transition(JobState::Queued, now)?;
        let due = offset_time(now, queue.retry_interval)?;
        job.delayed_until = Some(due);

        let keys = &self.inner.keys;
        let mut conn = self.inner.pool.get().await?;
        persist_job(&mut *conn, keys, job, &[FIELD_STATE, FIELD_DELAYED_UNTIL]).await?;
        conn.zadd_nx(
            &keys.delayed_queue_key(&queue.name),
            time_as_score(due),
            &keys.job_key(job.id),
        )
        .await
        .context("failed to schedule retry")?;
        Ok(())
    }

    pub async fn kill(&self, job: &mut Job) -> Result<()> {
        job.transition(JobState::Dead, Utc::now())?;
        let mut conn = self.inner.pool.get().await?;
        persist_job(&mut *conn, &self.inner.keys, job, &[FIELD_STATE]).await
    }

    /// Record a failed attempt: retry while attempts remain, otherwise kill.
    pub async fn fail(&self, queue: &Queue, job: &mut Job) -> Result<()> {
        if job.num_attempts < queue.max_attempts {
            self.retry(queue, job).await
        } else {
            self.kill(job).await
        }
    }

    pub fn register<F, Fut>(&self, queue: Queue, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(queue, Arc::new(FnHandler(handler)));
    }

    /// Attach `handler` to `queue`. Dispatchers start on the next [`work`].
    ///
    /// [`work`]: Client::work
    pub fn register_handler(&self, queue: Queue, handler: Arc<dyn Handler>) {
        let queue = queue.normalized();
        tracing::debug!(queue = %queue.name, num_workers = queue.num_workers, "handler registered");
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { queue, handler });
    }

    /// Start one dispatcher per registered queue.
    pub fn work(&self) -> Canceller {
        let registrations = self
            .inner
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let dispatchers = registrations
            .iter()
            .map(|registration| {
                let dispatcher = Arc::new(Dispatcher::new(
                    self.clone(),
                    registration.queue.clone(),
                    Arc::clone(&registration.handler),
                ));
                dispatcher.run();
                dispatcher
            })
            .collect();
        Canceller::new(dispatchers)
    }

    /// Dispatch until interrupted, then cancel without waiting for handlers.
    pub async fn work_forever(&self) -> Result<()> {
        let canceller = self.work();
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for interrupt")?;
        tracing::info!("interrupt received, cancelling dispatchers");
        canceller.cancel().await;
        Ok(())
    }
}

fn offset_time(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(delay).context("delay out of range")?;
    now.checked_add_signed(delta)
        .ok_or_else(|| anyhow::anyhow!("delay out of range"))
}

/// Write the named fields of `job`, or the whole record when `fields` is
/// empty.
async fn persist_job(
    conn: &mut dyn Conn,
    keys: &KeySpace,
    job: &Job,
    fields: &[&str],
) -> Result<()> {
    let mut encoded = job.to_fields()?;
    if !fields.is_empty() {
        encoded.retain(|(name, _)| fields.contains(name));
    }
    let job_key = keys.job_key(job.id);
    conn.hset_all(&job_key, &encoded)
        .await
        .with_context(|| format!("failed to persist {job_key}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{MemoryTestContext, redis_test_client};

    #[tokio::test]
    async fn submit_then_job_round_trips() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("mail");
        let submitted = ctx
            .client
            .submit(&queue, 100, json!({"foo": "bar"}))
            .await
            .unwrap();
        assert!(submitted.id > 0);
        let list_key = ctx.client.keys().priority_queue_key("mail", 100);
        assert_eq!(ctx.store.list_len(&list_key), 1);

        let loaded = ctx.client.job(submitted.id).await.unwrap().unwrap();
        assert_eq!(loaded.priority, 100);
        assert_eq!(loaded.payload, json!({"foo": "bar"}));
        assert_eq!(loaded.state, JobState::Queued);
        assert!(loaded.creation_time > DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(loaded.completion_time, None);
        assert_eq!(loaded.num_attempts, 0);
    }

    #[tokio::test]
    async fn job_ids_are_never_reused() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        let first = ctx.client.submit(&queue, 1, Value::Null).await.unwrap();
        let second = ctx.client.submit(&queue, 1, Value::Null).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let ctx = MemoryTestContext::new().await.unwrap();
        assert!(ctx.client.job(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn out_of_range_priority_is_rejected() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        let err = ctx.client.submit(&queue, 101, Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "priority 101 out of range [0, 100]");
        assert!(ctx.client.submit(&queue, -1, Value::Null).await.is_err());
        assert!(ctx.client.job(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn higher_priority_is_served_first_in_either_order() {
        for priorities in [[50, 100], [100, 50]] {
            let ctx = MemoryTestContext::new().await.unwrap();
            let queue = Queue::new("q");
            for priority in priorities {
                ctx.client.submit(&queue, priority, Value::Null).await.unwrap();
            }
            let first = ctx.client.wait(&queue).await.unwrap().unwrap();
            let second = ctx.client.wait(&queue).await.unwrap().unwrap();
            assert_eq!(first.priority, 100);
            assert_eq!(second.priority, 50);
        }
    }

    #[tokio::test]
    async fn same_priority_is_first_in_first_out() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        let a = ctx.client.submit(&queue, 10, json!("a")).await.unwrap();
        let b = ctx.client.submit(&queue, 10, json!("b")).await.unwrap();
        assert_eq!(ctx.client.wait(&queue).await.unwrap().unwrap().id, a.id);
        assert_eq!(ctx.client.wait(&queue).await.unwrap().unwrap().id, b.id);
        assert!(ctx.client.wait(&queue).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let mail = Queue::new("mail");
        let reports = Queue::new("reports");
        ctx.client.submit(&mail, 5, Value::Null).await.unwrap();
        assert!(ctx.client.wait(&reports).await.unwrap().is_none());
        assert!(ctx.client.wait(&mail).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wait_moves_job_to_working() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        let job = ctx.client.submit(&queue, 0, Value::Null).await.unwrap();

        let claimed = ctx.client.wait(&queue).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Working);
        assert_eq!(claimed.num_attempts, 1);

        let stored = ctx.client.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Working);
        assert_eq!(stored.num_attempts, 1);
    }

    #[tokio::test]
    async fn delayed_job_is_hidden_until_due() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        let delay = Duration::from_millis(300);
        let job = ctx
            .client
            .submit_delayed(&queue, delay, Value::Null)
            .await
            .unwrap();
        let due = job.delayed_until.unwrap();
        assert_eq!(due, offset_time(job.creation_time, delay).unwrap());

        assert!(ctx.client.wait(&queue).await.unwrap().is_none());
        assert!(Utc::now() < due);

        tokio::time::sleep(delay).await;
        let claimed = ctx.client.wait(&queue).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert!(Utc::now() >= due);
    }

    #[tokio::test]
    async fn zero_delay_is_immediately_eligible() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        let job = ctx
            .client
            .submit_delayed(&queue, Duration::ZERO, Value::Null)
            .await
            .unwrap();
        let claimed = ctx.client.wait(&queue).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
    }

    #[tokio::test]
    async fn missing_record_is_an_error() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        let mut conn = ctx.store.conn();
        conn.rpush(
            &ctx.client.keys().priority_queue_key("q", 3),
            &[ctx.client.keys().job_key(99)],
        )
        .await
        .unwrap();

        let err = ctx.client.wait(&queue).await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn fail_retries_until_attempts_run_out() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q").with_max_attempts(2);
        let job = ctx.client.submit(&queue, 0, Value::Null).await.unwrap();

        let mut claimed = ctx.client.wait(&queue).await.unwrap().unwrap();
        ctx.client.fail(&queue, &mut claimed).await.unwrap();
        let stored = ctx.client.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert!(stored.delayed_until.is_some());
        let delayed = ctx
            .store
            .sorted_set_members(&ctx.client.keys().delayed_queue_key("q"));
        assert_eq!(delayed.len(), 1);

        let mut again = ctx.client.wait(&queue).await.unwrap().unwrap();
        assert_eq!(again.num_attempts, 2);
        ctx.client.fail(&queue, &mut again).await.unwrap();
        let stored = ctx.client.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Dead);
        assert!(ctx.client.wait(&queue).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finish_stamps_completion_time() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        ctx.client.submit(&queue, 0, Value::Null).await.unwrap();
        let mut claimed = ctx.client.wait(&queue).await.unwrap().unwrap();
        ctx.client.finish(&mut claimed).await.unwrap();

        let stored = ctx.client.job(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Finished);
        assert!(stored.completion_time.is_some());
        assert!(ctx.client.kill(&mut claimed).await.is_err());
    }

    #[tokio::test]
    async fn store_errors_reach_the_caller() {
        let ctx = MemoryTestContext::new().await.unwrap();
        let queue = Queue::new("q");
        ctx.store.fail_next_operations(1);
        assert!(ctx.client.submit(&queue, 0, Value::Null).await.is_err());
        ctx.store.fail_next_operations(1);
        assert!(ctx.client.wait(&queue).await.is_err());
    }

    #[tokio::test]
    async fn redis_round_trip() {
        let Some(client) = redis_test_client().await.unwrap() else {
            eprintln!("Skipping Redis test: PRQ_TEST_REDIS_DSN not set");
            return;
        };
        let queue = Queue::new("redis");
        let low = client.submit(&queue, 1, json!({"n": 1})).await.unwrap();
        let high = client.submit(&queue, 90, json!({"n": 2})).await.unwrap();

        let first = client.wait(&queue).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        let mut second = client.wait(&queue).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
        client.finish(&mut second).await.unwrap();
        let stored = client.job(low.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Finished);
    }
}
