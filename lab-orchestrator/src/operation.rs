//! Audit trail of create/delete attempts.
//!
//! Rows are written when an attempt starts and closed when it ends. They are
//! for operators; nothing resumes a workflow from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Operation {
    pub id: String,
    pub machine_id: String,
    pub owner: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct OperationFilters {
    pub machine_id: Option<String>,
    pub owner: Option<String>,
    pub operation_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
}

#[derive(Clone)]
pub struct OperationLog {
    pool: SqlitePool,
}

impl OperationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn start(
        &self,
        machine_id: &str,
        owner: &str,
        operation_type: OperationType,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO operations (id, machine_id, owner, operation_type, status, started_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(machine_id)
        .bind(owner)
        .bind(operation_type)
        .bind(OperationStatus::Running)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Close an operation. `error` is `None` on success.
    pub async fn finish(&self, id: &str, error: Option<&str>) -> Result<()> {
        let status = match error {
            None => OperationStatus::Success,
            Some(_) => OperationStatus::Failed,
        };

        sqlx::query("UPDATE operations SET status = ?, completed_at = ?, error = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().timestamp())
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Operation>> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list(&self, filters: OperationFilters) -> Result<Vec<Operation>> {
        let mut query = "SELECT * FROM operations WHERE 1=1".to_string();

        if filters.machine_id.is_some() {
            query.push_str(" AND machine_id = ?");
        }
        if filters.owner.is_some() {
            query.push_str(" AND owner = ?");
        }
        if filters.operation_type.is_some() {
            query.push_str(" AND operation_type = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY started_at DESC, rowid DESC");

        let mut q = sqlx::query_as::<_, OperationRow>(&query);

        if let Some(machine_id) = &filters.machine_id {
            q = q.bind(machine_id);
        }
        if let Some(owner) = &filters.owner {
            q = q.bind(owner);
        }
        if let Some(operation_type) = filters.operation_type {
            q = q.bind(operation_type);
        }
        if let Some(status) = filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    machine_id: String,
    owner: String,
    operation_type: OperationType,
    status: OperationStatus,
    started_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            machine_id: row.machine_id,
            owner: row.owner,
            operation_type: row.operation_type,
            status: row.status,
            started_at: DateTime::from_timestamp(row.started_at, 0).unwrap_or_default(),
            completed_at: row.completed_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            error: row.error,
        }
    }
}
