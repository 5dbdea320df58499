use std::env;
use std::sync::{Mutex, OnceLock};

use chrono::{TimeZone, Utc};
use procura_cli::commands::{config, instances, migrate};
use procura_core::workflow::{InstanceId, InstanceJournal, InstanceRecord, InstanceStatus};
use procura_db::{connect, SqlInstanceJournal};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("PROCURA_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_invalid_workflow_settings() {
    with_env(
        &[
            ("PROCURA_DATABASE_URL", "sqlite::memory:"),
            ("PROCURA_WORKFLOW_APPROVAL_TIMEOUT_HOURS", "0"),
        ],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn config_reports_env_sources() {
    with_env(&[("PROCURA_WORKFLOW_MAX_DELEGATION_DAYS", "14"), ("PROCURA_LOG_LEVEL", "debug")], || {
        let output = config::run();

        assert!(output.starts_with("effective config"));
        assert!(output.contains(
            "- workflow.max_delegation_days = 14 (source: env (PROCURA_WORKFLOW_MAX_DELEGATION_DAYS))"
        ));
        assert!(output.contains("- logging.level = debug (source: env (PROCURA_LOG_LEVEL))"));
        assert!(output.contains("- workflow.approval_timeout_hours = 168 (source: default)"));
    });
}

#[test]
fn instances_lists_running_records_unless_all_requested() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("procura.db").display());

    with_env(&[("PROCURA_DATABASE_URL", url.as_str())], || {
        assert_eq!(migrate::run().exit_code, 0);
        seed_journal(&url);

        let running = parse_payload(&instances::run(None, false).output);
        assert_eq!(running["status"], "ok");
        let rows = running["data"]["instances"].as_array().expect("instances array");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["instance_id"], "PR-1");
        assert_eq!(rows[0]["status"], "running");
        assert!(rows[0].get("state_json").is_none());

        let all = parse_payload(&instances::run(Some("purchase_approval"), true).output);
        assert_eq!(all["data"]["instances"].as_array().map(Vec::len), Some(2));

        let other_kind = parse_payload(&instances::run(Some("delegation_lifecycle"), true).output);
        assert_eq!(other_kind["message"], "0 journaled instances");
    });
}

#[test]
fn instances_fails_before_migrations_are_applied() {
    with_env(&[("PROCURA_DATABASE_URL", "sqlite::memory:")], || {
        let result = instances::run(None, false);
        assert_eq!(result.exit_code, 5);
        assert_eq!(parse_payload(&result.output)["error_class"], "journal_read");
    });
}

fn seed_journal(url: &str) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let pool = connect(url).await.expect("connect");
        let journal = SqlInstanceJournal::new(pool.clone());
        let updated_at = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).single().expect("timestamp");
        for (id, status) in [("PR-1", InstanceStatus::Running), ("PR-2", InstanceStatus::Completed)] {
            journal
                .save(&InstanceRecord {
                    kind: "purchase_approval".to_string(),
                    instance_id: InstanceId(id.to_string()),
                    status,
                    state_json: "{}".to_string(),
                    wake_at: None,
                    revision: 1,
                    updated_at,
                })
                .await
                .expect("save");
        }
        pool.close().await;
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid json")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "PROCURA_DATABASE_URL",
        "PROCURA_DATABASE_MAX_CONNECTIONS",
        "PROCURA_DATABASE_TIMEOUT_SECS",
        "PROCURA_WORKER_BIND_ADDRESS",
        "PROCURA_WORKER_HEALTH_CHECK_PORT",
        "PROCURA_WORKER_GRACEFUL_SHUTDOWN_SECS",
        "PROCURA_WORKFLOW_APPROVAL_TIMEOUT_HOURS",
        "PROCURA_WORKFLOW_MAX_DELEGATION_DAYS",
        "PROCURA_WORKFLOW_JOURNAL_MAX_RETRIES",
        "PROCURA_WORKFLOW_JOURNAL_RETRY_BASE_DELAY_MS",
        "PROCURA_WORKFLOW_JOURNAL_RETRY_MAX_DELAY_MS",
        "PROCURA_LOGGING_LEVEL",
        "PROCURA_LOGGING_FORMAT",
        "PROCURA_LOG_LEVEL",
        "PROCURA_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
