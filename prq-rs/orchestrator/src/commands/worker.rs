use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use prq::{Client, Handler, Job, PrqSettings, Queue, load_toml_settings, resolve_config_source};

/// Stand-in handler for `prq worker run`: logs each job and marks it done.
struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        tracing::info!(
            job_id = job.id,
            priority = job.priority,
            attempt = job.num_attempts,
            payload = %job.payload,
            "job received"
        );
        Ok(())
    }
}

pub(crate) async fn run_worker(config: Option<String>, queues: Vec<String>) -> Result<()> {
    let (resolved, source) = resolve_config_source(config.as_deref());
    if let Some(path) = resolved.as_deref() {
        println!("Loading prq settings from {source} ({path}).");
    } else {
        println!("No prq config found; using defaults and PRQ_* environment variables.");
    }
    let settings = load_toml_settings(config.as_deref())?;
    let queues = select_queues(&settings, queues)?;

    let client = Client::from_settings(&settings).await?;
    let handler: Arc<dyn Handler> = Arc::new(LogHandler);
    for queue in queues {
        client.register_handler(queue, Arc::clone(&handler));
    }

    let canceller = client.work();
    wait_for_shutdown_signal().await;
    let grace_period = settings.shutdown_grace_period();
    tracing::info!(
        grace_period_ms = grace_period.as_millis() as u64,
        "shutdown requested"
    );
    canceller.cancel_with_timeout(grace_period).await;
    Ok(())
}

/// Queues named on the command line, or every queue in the config when none
/// are given.
fn select_queues(settings: &PrqSettings, requested: Vec<String>) -> Result<Vec<Queue>> {
    let mut names = if requested.is_empty() {
        settings.queues.keys().cloned().collect::<Vec<_>>()
    } else {
        requested
    };
    names.sort();
    names.dedup();
    if names.is_empty() {
        anyhow::bail!("no queues to work on (pass --queue or configure [prq.queues])");
    }
    Ok(names
        .into_iter()
        .map(|name| {
            let queue_settings = settings.queue(&name);
            Queue::from_settings(name, &queue_settings)
        })
        .collect())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigint = signal(SignalKind::interrupt());
        let sigterm = signal(SignalKind::terminate());
        match (sigint, sigterm) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prq::QueueSettings;

    fn settings_with(queues: &[(&str, usize)]) -> PrqSettings {
        let mut settings = PrqSettings::default();
        for (name, workers) in queues {
            settings.queues.insert(
                (*name).to_string(),
                QueueSettings {
                    num_workers: *workers,
                    ..QueueSettings::default()
                },
            );
        }
        settings
    }

    #[test]
    fn select_queues_defaults_to_configured_queues() {
        let settings = settings_with(&[("reports", 2), ("mail", 4)]);
        let queues = select_queues(&settings, Vec::new()).unwrap();
        let names: Vec<&str> = queues.iter().map(|queue| queue.name.as_str()).collect();
        assert_eq!(names, vec!["mail", "reports"]);
        assert_eq!(queues[0].num_workers, 4);
    }

    #[test]
    fn select_queues_uses_defaults_for_unconfigured_names() {
        let settings = settings_with(&[("mail", 4)]);
        let queues =
            select_queues(&settings, vec!["adhoc".to_string(), "adhoc".to_string()]).unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, "adhoc");
        assert_eq!(queues[0].num_workers, 1);
    }

    #[test]
    fn select_queues_requires_at_least_one() {
        let err = select_queues(&PrqSettings::default(), Vec::new()).unwrap_err();
        assert!(err.to_string().contains("--queue"));
    }
}
