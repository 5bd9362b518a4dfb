//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepline-core` using sqlx with
//! split read/write pools. Definitions and instance state are stored as
//! JSON blobs next to the columns the queries filter on; the execution log
//! is a plain append-only table keyed by `(instance_id, seq)`.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepline_core::repository::workflow::WorkflowRepository;
use stepline_types::error::RepositoryError;
use stepline_types::workflow::{
    DefinitionStatus, ExecutionLogEntry, ExecutionState, InstanceStatus, LogLevel,
    WorkflowDefinition, WorkflowInstance,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

struct InstanceRow {
    id: String,
    definition_id: String,
    definition_version: i64,
    status: String,
    state: String,
    initiated_by: String,
    created_at: String,
    started_at: String,
    completed_at: Option<String>,
    failure: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_version: row.try_get("definition_version")?,
            status: row.try_get("status")?,
            state: row.try_get("state")?,
            initiated_by: row.try_get("initiated_by")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failure: row.try_get("failure")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: InstanceStatus =
            serde_json::from_value(serde_json::Value::String(self.status.clone()))
                .map_err(|_| RepositoryError::Query(format!("invalid instance status: {}", self.status)))?;

        let state: ExecutionState = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid execution state JSON: {e}")))?;

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            definition_version: self.definition_version as u32,
            status,
            state,
            initiated_by: self.initiated_by,
            created_at: parse_datetime(&self.created_at)?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            failure: self.failure,
        })
    }
}

struct LogRow {
    instance_id: String,
    seq: i64,
    level: String,
    message: String,
    step_id: Option<String>,
    logged_at: String,
}

impl LogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            seq: row.try_get("seq")?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            step_id: row.try_get("step_id")?,
            logged_at: row.try_get("logged_at")?,
        })
    }

    fn into_entry(self) -> Result<ExecutionLogEntry, RepositoryError> {
        let level: LogLevel = serde_json::from_value(serde_json::Value::String(self.level.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid log level: {}", self.level)))?;

        Ok(ExecutionLogEntry {
            instance_id: parse_uuid(&self.instance_id)?,
            seq: self.seq as u64,
            level,
            message: self.message,
            step_id: self.step_id,
            logged_at: parse_datetime(&self.logged_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn status_str<T: serde::Serialize>(status: &T) -> Result<String, RepositoryError> {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| RepositoryError::Query("unserializable status".to_string()))
}

fn map_insert_err(e: sqlx::Error, what: &str) -> RepositoryError {
    if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
        RepositoryError::Conflict(format!("{what} already exists"))
    } else {
        RepositoryError::Query(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, version, name, status, definition, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(def.version as i64)
        .bind(&def.name)
        .bind(status_str(&def.status)?)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| map_insert_err(e, "definition version"))?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE id = ? AND version = ?",
        )
        .bind(id.to_string())
        .bind(version as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn get_latest_definition(
        &self,
        id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definition_versions(
        &self,
        id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE id = ? ORDER BY version ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DefinitionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT d.definition FROM workflow_definitions d
               JOIN (SELECT id, MAX(version) AS version FROM workflow_definitions GROUP BY id) latest
                 ON d.id = latest.id AND d.version = latest.version
               ORDER BY d.name ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DefinitionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn set_definition_status(
        &self,
        id: &Uuid,
        version: u32,
        status: DefinitionStatus,
    ) -> Result<(), RepositoryError> {
        // The JSON blob carries the status too; keep both in sync.
        let mut def = self
            .get_definition(id, version)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        def.status = status;
        let definition_json = serde_json::to_string(&def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        let result = sqlx::query(
            "UPDATE workflow_definitions SET status = ?, definition = ? WHERE id = ? AND version = ?",
        )
        .bind(status_str(&status)?)
        .bind(&definition_json)
        .bind(id.to_string())
        .bind(version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(&instance.state)
            .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, definition_id, definition_version, status, state, initiated_by,
                created_at, started_at, completed_at, failure)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(instance.definition_version as i64)
        .bind(status_str(&instance.status)?)
        .bind(&state_json)
        .bind(&instance.initiated_by)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.started_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(&instance.failure)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| map_insert_err(e, "instance"))?;

        Ok(())
    }

    async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(&instance.state)
            .map_err(|e| RepositoryError::Query(format!("serialize state: {e}")))?;

        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?, state = ?, completed_at = ?, failure = ?
               WHERE id = ?"#,
        )
        .bind(status_str(&instance.status)?)
        .bind(&state_json)
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(&instance.failure)
        .bind(instance.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(
        &self,
        definition_id: &Uuid,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"SELECT * FROM workflow_instances
                       WHERE definition_id = ? AND status = ?
                       ORDER BY created_at DESC LIMIT ?"#,
                )
                .bind(definition_id.to_string())
                .bind(status_str(&status)?)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    r#"SELECT * FROM workflow_instances
                       WHERE definition_id = ?
                       ORDER BY created_at DESC LIMIT ?"#,
                )
                .bind(definition_id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn append_log(&self, entries: &[ExecutionLogEntry]) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for entry in entries {
            sqlx::query(
                r#"INSERT INTO execution_log (instance_id, seq, level, message, step_id, logged_at)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(entry.instance_id.to_string())
            .bind(entry.seq as i64)
            .bind(status_str(&entry.level)?)
            .bind(&entry.message)
            .bind(&entry.step_id)
            .bind(format_datetime(&entry.logged_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_err(e, "log entry"))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn list_log(
        &self,
        instance_id: &Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_log WHERE instance_id = ? ORDER BY seq ASC",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = LogRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }

    async fn next_log_seq(&self, instance_id: &Uuid) -> Result<u64, RepositoryError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM execution_log WHERE instance_id = ?",
        )
        .bind(instance_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(row.0 as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
