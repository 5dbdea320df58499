use procura_core::workflow::{InstanceJournal, InstanceRecord};
use procura_db::{connect_with_config, SqlInstanceJournal};
use serde::Serialize;
use serde_json::json;

use crate::commands::{prepare, CommandResult, Failure};

/// Journal row without the opaque state payload.
#[derive(Debug, Serialize)]
struct InstanceRow {
    kind: String,
    instance_id: String,
    status: &'static str,
    wake_at: Option<String>,
    revision: u64,
    updated_at: String,
}

impl From<InstanceRecord> for InstanceRow {
    fn from(record: InstanceRecord) -> Self {
        Self {
            kind: record.kind,
            instance_id: record.instance_id.0,
            status: record.status.as_str(),
            wake_at: record.wake_at.map(|at| at.to_rfc3339()),
            revision: record.revision,
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

pub fn run(kind: Option<&str>, include_completed: bool) -> CommandResult {
    let (config, runtime) = match prepare("instances") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let records = SqlInstanceJournal::new(pool.clone())
            .list(kind, include_completed)
            .await
            .map_err(|error| ("journal_read", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<_, Failure>(records)
    });

    match result {
        Ok(records) => {
            let rows: Vec<InstanceRow> = records.into_iter().map(InstanceRow::from).collect();
            let message = format!("{} journaled instances", rows.len());
            CommandResult::success_with("instances", message, Some(json!({ "instances": rows })))
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("instances", error_class, message, exit_code)
        }
    }
}
