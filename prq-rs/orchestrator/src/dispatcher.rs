//! Bounded-concurrency dispatch for one queue.
//!
//! A [`Dispatcher`] owns a semaphore with one permit per worker slot, the
//! map of jobs its handlers are running, and a stop signal. The loop takes a
//! slot before each dequeue and hands it to the task that runs the handler,
//! so at most `num_workers` handlers run at once. Whoever claims a job's
//! in-flight entry first, the handler task or [`Dispatcher::cancel`],
//! records its outcome; the other side leaves the store alone. A handler
//! task marks its entry as resolving and drops it only once the outcome is
//! saved, so `cancel` can wait for writes already under way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;
use tracing::field::Empty;

use crate::client::Client;
use crate::handler::Handler;
use crate::job::Job;
use crate::queue::Queue;

const ERROR_BACKOFF_JITTER: f64 = 0.5;
/// Shortest pause after a failed dequeue, however small the configured
/// backoff.
const MIN_ERROR_BACKOFF: Duration = Duration::from_millis(10);

struct InFlight {
    job: Job,
    // Set by the handler task once it owns the outcome and is saving it.
    resolving: bool,
}

struct DispatchState {
    client: Client,
    queue: Queue,
    handler: Arc<dyn Handler>,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    resolved: Notify,
}

impl DispatchState {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<u64, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, job: Job) {
        self.in_flight().insert(
            job.id,
            InFlight {
                job,
                resolving: false,
            },
        );
    }

    /// Take ownership of a job's outcome for the handler task. `None` when
    /// cancel already resolved it.
    fn begin_resolving(&self, job_id: u64) -> Option<Job> {
        let mut in_flight = self.in_flight();
        match in_flight.get_mut(&job_id) {
            Some(entry) if !entry.resolving => {
                entry.resolving = true;
                Some(entry.job.clone())
            }
            _ => None,
        }
    }

    fn finish_resolving(&self, job_id: u64) {
        self.in_flight().remove(&job_id);
        self.resolved.notify_waiters();
    }

    /// Remove every job no handler task has claimed yet.
    fn take_unresolved(&self) -> Vec<Job> {
        let mut in_flight = self.in_flight();
        let ids: Vec<u64> = in_flight
            .iter()
            .filter(|(_, entry)| !entry.resolving)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| in_flight.remove(&id))
            .map(|entry| entry.job)
            .collect()
    }

    /// Wait until the handler tasks saving outcomes have all finished.
    async fn wait_until_resolved(&self) {
        loop {
            let mut notified = std::pin::pin!(self.resolved.notified());
            notified.as_mut().enable();
            if self.in_flight().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn failure_outcome(&self, job: &Job) -> &'static str {
        if job.num_attempts < self.queue.max_attempts {
            "retry"
        } else {
            "dead"
        }
    }

    /// Apply the failure policy to a job taken out of the in-flight map.
    async fn resolve_failure(&self, mut job: Job) -> &'static str {
        let outcome = self.failure_outcome(&job);
        if let Err(err) = self.client.fail(&self.queue, &mut job).await {
            tracing::error!(job_id = job.id, error = %err, "failed to record job failure");
        }
        outcome
    }
}

pub struct Dispatcher {
    state: Arc<DispatchState>,
    slots: Arc<Semaphore>,
    stop: watch::Sender<bool>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(client: Client, queue: Queue, handler: Arc<dyn Handler>) -> Self {
        let queue = queue.normalized();
        let (stop, _) = watch::channel(false);
        Self {
            slots: Arc::new(Semaphore::new(queue.num_workers)),
            state: Arc::new(DispatchState {
                client,
                queue,
                handler,
                in_flight: Mutex::new(HashMap::new()),
                resolved: Notify::new(),
            }),
            stop,
            dispatch_loop: Mutex::new(None),
        }
    }

    /// Start the dispatch loop in the background. Each dispatcher runs once;
    /// build a new one to dispatch again after [`cancel`](Self::cancel).
    pub fn run(&self) {
        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.state),
            Arc::clone(&self.slots),
            self.stop.subscribe(),
        ));
        let previous = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if previous.is_some() {
            tracing::warn!(queue = %self.state.queue.name, "dispatcher started twice");
        }
    }

    /// Snapshot of the jobs whose handlers are running, ordered by ID.
    pub fn in_flight(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .state
            .in_flight()
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Stop dispatching and resolve everything still in flight.
    ///
    /// With a non-zero `timeout`, first waits up to that long for running
    /// handlers to free every slot. Jobs still in flight after that are
    /// recorded as failed attempts, even though their handlers may still be
    /// running; a handler that finishes later does not overwrite that.
    /// Outcomes a handler task is already saving are awaited, not failed.
    pub async fn cancel(&self, timeout: Duration) {
        let queue = &self.state.queue;
        self.stop.send_replace(true);

        if !timeout.is_zero() {
            let slots = u32::try_from(queue.num_workers).unwrap_or(u32::MAX);
            match tokio::time::timeout(timeout, self.slots.acquire_many(slots)).await {
                Ok(Ok(_drained)) => {
                    tracing::debug!(queue = %queue.name, "in-flight jobs drained");
                }
                Ok(Err(_closed)) => {}
                Err(_elapsed) => {
                    tracing::info!(
                        queue = %queue.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "drain timed out; failing remaining jobs"
                    );
                }
            }
        }

        let handle = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::error!(queue = %queue.name, error = %err, "dispatch loop panicked");
        }

        for job in self.state.take_unresolved() {
            let job_id = job.id;
            let outcome = self.state.resolve_failure(job).await;
            tracing::warn!(queue = %queue.name, job_id, outcome, "in-flight job cancelled");
        }
        self.state.wait_until_resolved().await;
    }
}

/// Stops a group of running dispatchers.
pub struct Canceller {
    dispatchers: Vec<Arc<Dispatcher>>,
}

impl Canceller {
    pub(crate) fn new(dispatchers: Vec<Arc<Dispatcher>>) -> Self {
        Self { dispatchers }
    }

    pub fn dispatchers(&self) -> &[Arc<Dispatcher>] {
        &self.dispatchers
    }

    /// Cancel immediately, failing whatever is in flight.
    pub async fn cancel(&self) {
        self.cancel_with_timeout(Duration::ZERO).await;
    }

    /// Cancel every dispatcher concurrently and return once all have
    /// finished.
    pub async fn cancel_with_timeout(&self, timeout: Duration) {
        let mut cancels = JoinSet::new();
        for dispatcher in &self.dispatchers {
            let dispatcher = Arc::clone(dispatcher);
            cancels.spawn(async move { dispatcher.cancel(timeout).await });
        }
        while let Some(result) = cancels.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "dispatcher cancel panicked");
            }
        }
    }
}

async fn dispatch_loop(
    state: Arc<DispatchState>,
    slots: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
) {
    let queue = &state.queue;
    tracing::info!(
        queue = %queue.name,
        num_workers = queue.num_workers,
        max_attempts = queue.max_attempts,
        "dispatcher started"
    );

    loop {
        if *stop.borrow() {
            break;
        }
        let permit = tokio::select! {
            biased;
            _ = stop.changed() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match state.client.wait(queue).await {
            Ok(None) => drop(permit),
            Ok(Some(job)) => {
                // Runs even when cancel began during the wait; its slot
                // counts toward the drain.
                state.track(job.clone());
                tokio::spawn(execute_job(Arc::clone(&state), job, permit));
            }
            Err(err) => {
                drop(permit);
                let delay = error_backoff_delay(state.client.error_backoff());
                tracing::error!(
                    queue = %queue.name,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "dequeue failed"
                );
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    tracing::info!(queue = %queue.name, "dispatcher stopped");
}

async fn execute_job(state: Arc<DispatchState>, job: Job, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    let span = tracing::info_span!(
        "prq.job",
        job_id = job.id,
        queue = %state.queue.name,
        attempt = job.num_attempts,
        outcome = Empty,
        duration_ms = Empty
    );

    async move {
        let started_at = Instant::now();
        let job_id = job.id;
        let handler = Arc::clone(&state.handler);
        // A panicking handler is a failed attempt, not a lost slot.
        let result = match tokio::spawn(
            async move { handler.handle(job).await }.in_current_span(),
        )
        .await
        {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("handler panicked: {err}")),
        };
        let span = tracing::Span::current();
        span.record("duration_ms", started_at.elapsed().as_millis() as u64);

        let Some(mut job) = state.begin_resolving(job_id) else {
            span.record("outcome", "cancelled");
            tracing::debug!("outcome already recorded by cancel");
            return;
        };

        match result {
            Ok(()) => {
                span.record("outcome", "finished");
                match state.client.finish(&mut job).await {
                    Ok(()) => tracing::info!("job completed"),
                    Err(err) => tracing::error!(error = %err, "failed to record job completion"),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "handler failed");
                let outcome = state.resolve_failure(job).await;
                span.record("outcome", outcome);
            }
        }
        state.finish_resolving(job_id);
    }
    .instrument(span)
    .await
}

fn jittered_delay(base: Duration, jitter_factor: f64) -> Duration {
    let base = base.as_secs_f64();
    if base <= 0.0 {
        return Duration::ZERO;
    }
    let jitter = jitter_factor.clamp(0.0, 0.99);
    let min_delay = base * (1.0 - jitter);
    let max_delay = base * (1.0 + jitter);
    let delay = rand::rng().random_range(min_delay..=max_delay);
    Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
}

fn error_backoff_delay(base: Duration) -> Duration {
    jittered_delay(base, ERROR_BACKOFF_JITTER).max(MIN_ERROR_BACKOFF)
}
