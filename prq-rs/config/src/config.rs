use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::settings::PrqSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "prq.toml";
pub const ENV_CONFIG_KEY: &str = "PRQ_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "--config parameter".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY)
        && !env_path.is_empty()
    {
        return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "not found".to_string())
}

/// Load settings from the resolved TOML file, layering `PRQ_*` environment
/// overrides on top. Without a config file the defaults are used as the base.
pub fn load_toml_settings(config_path: Option<&str>) -> Result<PrqSettings> {
    dotenvy::dotenv().ok();

    let (path, _) = resolve_config_source(config_path);
    let base = match path {
        Some(path) => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {path}"))?;
            let toml_value: toml::Value = toml::from_str(&payload)
                .with_context(|| format!("failed to parse TOML at {path}"))?;
            let json_value =
                serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;
            normalize_toml_payload(json_value)?
        }
        None => Value::Object(Map::new()),
    };

    let merged = deep_merge(base, env_overrides()?);
    let settings: PrqSettings = serde_json::from_value(merged)
        .map_err(|err| anyhow::anyhow!("invalid prq config: {err}"))?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn normalize_toml_payload(payload: Value) -> Result<Value> {
    match payload {
        Value::Object(mut map) => match map.remove("prq") {
            Some(inner @ Value::Object(_)) => Ok(inner),
            Some(_) => Err(anyhow::anyhow!("[prq] must be a TOML table")),
            None => Ok(Value::Object(map)),
        },
        _ => Err(anyhow::anyhow!("prq config must be a TOML table")),
    }
}

fn env_overrides() -> Result<Value> {
    let mut payload = Map::new();

    set_env_string(&mut payload, "redis_dsn", "PRQ_REDIS_DSN");
    set_env_string(&mut payload, "key_prefix", "PRQ_KEY_PREFIX");
    set_env_float(
        &mut payload,
        "dequeue_timeout_seconds",
        "PRQ_DEQUEUE_TIMEOUT_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "error_backoff_seconds",
        "PRQ_ERROR_BACKOFF_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "shutdown_grace_period_seconds",
        "PRQ_SHUTDOWN_GRACE_PERIOD_SECONDS",
    )?;

    Ok(Value::Object(payload))
}

fn set_env_string(map: &mut Map<String, Value>, key: &str, env: &str) {
    if let Ok(value) = std::env::var(env)
        && !value.is_empty()
    {
        map.insert(key.to_string(), Value::String(value));
    }
}

fn set_env_float(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: f64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(
            key.to_string(),
            Value::Number(
                serde_json::Number::from_f64(parsed)
                    .ok_or_else(|| anyhow::anyhow!("Invalid {env} value: {value}"))?,
            ),
        );
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let entry = base_map.remove(&key);
                let merged = match entry {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}

/// Seconds must be finite, non-negative and small enough for a `Duration`.
fn check_seconds(field: &str, seconds: f64) -> Result<()> {
    if Duration::try_from_secs_f64(seconds).is_err() {
        return Err(anyhow::anyhow!(
            "invalid {field}: {seconds} - must be a non-negative number of seconds"
        ));
    }
    Ok(())
}

fn validate_settings(settings: &PrqSettings) -> Result<()> {
    if settings.key_prefix.is_empty() {
        return Err(anyhow::anyhow!("key_prefix must not be empty"));
    }
    check_seconds("dequeue_timeout_seconds", settings.dequeue_timeout_seconds)?;
    check_seconds(
        "shutdown_grace_period_seconds",
        settings.shutdown_grace_period_seconds,
    )?;
    check_seconds("error_backoff_seconds", settings.error_backoff_seconds)?;
    if settings.error_backoff_seconds <= 0.0 {
        return Err(anyhow::anyhow!(
            "invalid error_backoff_seconds: {} - must be positive",
            settings.error_backoff_seconds
        ));
    }
    for (name, queue) in &settings.queues {
        if name.is_empty() {
            return Err(anyhow::anyhow!("queue names must not be empty"));
        }
        if queue.num_workers == 0 {
            return Err(anyhow::anyhow!(
                "queue '{name}' has invalid num_workers: 0 - must be a positive integer"
            ));
        }
        if queue.max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "queue '{name}' has invalid max_attempts: 0 - must be a positive integer"
            ));
        }
        check_seconds("retry_interval_seconds", queue.retry_interval_seconds)
            .with_context(|| format!("queue '{name}'"))?;
    }
    Ok(())
}
