use std::env;
use std::fs;
use std::path::Path;

use procura_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields: [(&str, String, &[&str]); 13] = [
        ("database.url", config.database.url.clone(), &["PROCURA_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["PROCURA_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["PROCURA_DATABASE_TIMEOUT_SECS"],
        ),
        ("worker.bind_address", config.worker.bind_address.clone(), &["PROCURA_WORKER_BIND_ADDRESS"]),
        (
            "worker.health_check_port",
            config.worker.health_check_port.to_string(),
            &["PROCURA_WORKER_HEALTH_CHECK_PORT"],
        ),
        (
            "worker.graceful_shutdown_secs",
            config.worker.graceful_shutdown_secs.to_string(),
            &["PROCURA_WORKER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        (
            "workflow.approval_timeout_hours",
            config.workflow.approval_timeout_hours.to_string(),
            &["PROCURA_WORKFLOW_APPROVAL_TIMEOUT_HOURS"],
        ),
        (
            "workflow.max_delegation_days",
            config.workflow.max_delegation_days.to_string(),
            &["PROCURA_WORKFLOW_MAX_DELEGATION_DAYS"],
        ),
        (
            "workflow.journal_max_retries",
            config.workflow.journal_max_retries.to_string(),
            &["PROCURA_WORKFLOW_JOURNAL_MAX_RETRIES"],
        ),
        (
            "workflow.journal_retry_base_delay_ms",
            config.workflow.journal_retry_base_delay_ms.to_string(),
            &["PROCURA_WORKFLOW_JOURNAL_RETRY_BASE_DELAY_MS"],
        ),
        (
            "workflow.journal_retry_max_delay_ms",
            config.workflow.journal_retry_max_delay_ms.to_string(),
            &["PROCURA_WORKFLOW_JOURNAL_RETRY_MAX_DELAY_MS"],
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            &["PROCURA_LOGGING_LEVEL", "PROCURA_LOG_LEVEL"],
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format),
            &["PROCURA_LOGGING_FORMAT", "PROCURA_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value, env_keys) in fields {
        let source =
            field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &redact_url(key_path, &value), source));
    }

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Hides query parameters of the database url, which may carry credentials for encrypted files.
fn redact_url(key_path: &str, value: &str) -> String {
    if key_path != "database.url" {
        return value.to_string();
    }
    match value.split_once('?') {
        Some((base, query)) if query.contains("key") || query.contains("password") => {
            format!("{base}?<redacted>")
        }
        _ => value.to_string(),
    }
}
