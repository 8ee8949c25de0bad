use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use prq::{Client, Queue, SubmitOptions, load_toml_settings};

pub(crate) struct SubmitArgs {
    pub config: Option<String>,
    pub queue: String,
    pub priority: i64,
    pub delay_seconds: Option<f64>,
    pub payload: Option<String>,
}

pub(crate) async fn submit_job(args: SubmitArgs) -> Result<()> {
    let settings = load_toml_settings(args.config.as_deref())?;
    let payload = parse_payload(args.payload.as_deref())?;
    let delay = args.delay_seconds.map(parse_delay).transpose()?;

    let client = Client::from_settings(&settings).await?;
    let queue = Queue::from_settings(&args.queue, &settings.queue(&args.queue));
    let options = SubmitOptions {
        priority: args.priority,
        delay,
    };
    let job = client.enqueue(&queue, payload, options).await?;
    println!("{}", job.id);
    Ok(())
}

fn parse_payload(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--payload must be valid JSON"),
        None => Ok(Value::Null),
    }
}

fn parse_delay(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        anyhow::anyhow!("--delay-seconds must be a non-negative number of seconds, got {seconds}")
    })
}
