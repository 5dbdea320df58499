use std::sync::Arc;

use procura_core::config::{AppConfig, ConfigError, LoadOptions};
use procura_core::workflow::SystemClock;
use procura_core::{ApplicationError, ProcurementEngine, ResumeSummary, TracingAuditSink};
use procura_db::{connect_with_config, migrations, DbPool, SqlInstanceJournal};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: ProcurementEngine,
    pub resumed: ResumeSummary,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("workflow resume failed: {0}")]
    Resume(#[source] ApplicationError),
}

#[cfg_attr(not(test), allow(dead_code))]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting worker bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let engine = ProcurementEngine::new(
        config.workflow.clone(),
        Arc::new(SqlInstanceJournal::new(db_pool.clone())),
        Arc::new(TracingAuditSink),
        Arc::new(SystemClock),
    );
    let resumed = engine.resume().await.map_err(BootstrapError::Resume)?;
    info!(
        event_name = "system.bootstrap.workflows_resumed",
        correlation_id = "bootstrap",
        delegations = resumed.delegations,
        approvals = resumed.approvals,
        "journaled workflow instances resumed"
    );

    Ok(Application { config, db_pool, engine, resumed })
}

#[cfg(test)]
mod tests {
    use procura_core::config::{ConfigOverrides, LoadOptions};
    use procura_core::{
        LineItem, NewPurchaseRequest, PurchaseRequestId, PurchaseStatus, ResumeSummary, UserId,
    };
    use rust_decimal::Decimal;

    use crate::bootstrap::bootstrap;

    fn options(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_workflow_settings() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                approval_timeout_hours: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().map(|error| error.to_string()).unwrap_or_default();
        assert!(message.contains("workflow.approval_timeout_hours"), "unexpected: {message}");
    }

    #[tokio::test]
    async fn bootstrap_migrates_an_empty_database() {
        let app = bootstrap(options("sqlite::memory:?cache=shared")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'workflow_instance'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("journal table exists");
        assert_eq!(table_count, 1);
        assert_eq!(app.resumed, ResumeSummary::default());

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn restarted_worker_resumes_journaled_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("procura.db").display());

        let first = bootstrap(options(&url)).await.expect("first bootstrap");
        first
            .engine
            .submit_purchase_request(NewPurchaseRequest {
                id: PurchaseRequestId("PR-77".to_string()),
                requester_id: UserId("engineer".to_string()),
                delivery_office: "Oslo".to_string(),
                line_items: vec![LineItem {
                    description: "oscilloscope".to_string(),
                    url: None,
                    amount: Decimal::new(1_899_00, 2),
                }],
                justification: "lab bench".to_string(),
                assigned_approver_id: UserId("lab-lead".to_string()),
            })
            .await
            .expect("submit");
        first.engine.shutdown().await;
        first.db_pool.close().await;

        let second = bootstrap(options(&url)).await.expect("second bootstrap");
        assert_eq!(second.resumed, ResumeSummary { delegations: 0, approvals: 1 });
        let request = second
            .engine
            .purchase_request(&PurchaseRequestId("PR-77".to_string()))
            .await
            .expect("resumed request");
        assert_eq!(request.status, PurchaseStatus::PendingApproval);

        second.engine.shutdown().await;
        second.db_pool.close().await;
    }
}
