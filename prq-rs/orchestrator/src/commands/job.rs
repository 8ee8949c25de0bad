use anyhow::{Context, Result};

use prq::{Client, load_toml_settings};

pub(crate) async fn job_show(job_id: String, config: Option<String>) -> Result<()> {
    let id: u64 = job_id
        .trim()
        .parse()
        .with_context(|| format!("invalid job id '{job_id}'"))?;
    let settings = load_toml_settings(config.as_deref())?;
    let client = Client::from_settings(&settings).await?;
    match client.job(id).await? {
        Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
        None => anyhow::bail!("job {id} not found"),
    }
    Ok(())
}
