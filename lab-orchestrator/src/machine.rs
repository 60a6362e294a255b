//! Ledger rows for machines: ownership, lifecycle state and the
//! sub-resources attached during provisioning.

use chrono::{DateTime, Utc};
use lab_provider::{OwnedMachine, Resources};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use crate::error::{is_unique_violation, OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Reserved; the creation workflow is still running.
    Pending,
    Active,
    /// Teardown started and has not finished.
    Deleting,
}

/// Who is asking. Owners see their own machines, admins see all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Stable subject identifier, never the mutable username.
    pub subject: String,
    pub display_name: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(subject: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            display_name: display_name.into(),
            is_admin: false,
        }
    }

    pub fn admin(subject: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::user(subject, display_name)
        }
    }

    /// Identity used by background tasks such as the expiry janitor.
    pub fn system() -> Self {
        Self::admin("system", "System")
    }

    pub fn can_access(&self, machine: &Machine) -> bool {
        self.is_admin || machine.owner == self.subject
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Machine {
    pub id: String,
    pub owner: String,
    pub owner_display_name: String,
    pub name: String,
    pub description: String,
    pub os: String,
    /// Hypervisor backend that owns the VM.
    pub backend: String,
    /// Hypervisor-assigned id, set once the VM exists.
    pub vmid: Option<String>,
    pub resources: Resources,
    pub subdomain: Option<String>,
    pub ip_address: Option<String>,
    pub state: MachineState,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    pub fn owned(&self) -> OwnedMachine {
        OwnedMachine {
            machine_id: self.id.clone(),
            vmid: self.vmid.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            os: self.os.clone(),
            subdomain: self.subdomain.clone(),
            ip_address: self.ip_address.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Fields of a machine known before any external call.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMachine {
    pub id: String,
    pub owner: String,
    pub owner_display_name: String,
    pub name: String,
    pub description: String,
    pub os: String,
    pub backend: String,
    pub resources: Resources,
    pub subdomain: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MachineLedger {
    pool: SqlitePool,
}

impl MachineLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a `pending` row unless the owner already holds `max_per_owner`
    /// machines. The count and the insert are one statement, so two
    /// concurrent requests cannot both slip under the quota.
    #[instrument(skip(self, machine), fields(owner = %machine.owner, name = %machine.name))]
    pub async fn reserve(&self, machine: &NewMachine, max_per_owner: u32) -> Result<Machine> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            "INSERT INTO machines (id, owner, owner_display_name, name, description, os, backend,
                                   memory_mb, cpu_cores, disk_gb, subdomain, state,
                                   expires_at, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?
             WHERE (SELECT COUNT(*) FROM machines WHERE owner = ?) < ?",
        )
        .bind(&machine.id)
        .bind(&machine.owner)
        .bind(&machine.owner_display_name)
        .bind(&machine.name)
        .bind(&machine.description)
        .bind(&machine.os)
        .bind(&machine.backend)
        .bind(machine.resources.memory_mb as i64)
        .bind(machine.resources.cpu_cores as i64)
        .bind(machine.resources.disk_gb as i64)
        .bind(&machine.subdomain)
        .bind(machine.expires_at.timestamp())
        .bind(now)
        .bind(now)
        .bind(&machine.owner)
        .bind(max_per_owner as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OrchestratorError::Conflict(format!(
                    "a machine named '{}' already exists",
                    machine.name
                ))
            } else {
                e.into()
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "you already have {} machines",
                max_per_owner
            )));
        }

        debug!(machine_id = %machine.id, "Ledger row reserved");
        self.get(&machine.id).await
    }

    pub async fn get(&self, id: &str) -> Result<Machine> {
        sqlx::query_as::<_, MachineRow>("SELECT * FROM machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or_else(|| OrchestratorError::NotFound(format!("machine {}", id)))
    }

    pub async fn list_for_owner(&self, owner: &str) -> Result<Vec<Machine>> {
        let rows = sqlx::query_as::<_, MachineRow>(
            "SELECT * FROM machines WHERE owner = ? ORDER BY created_at, name",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_all(&self) -> Result<Vec<Machine>> {
        let rows = sqlx::query_as::<_, MachineRow>("SELECT * FROM machines ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count_for_owner(&self, owner: &str) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM machines WHERE owner = ?")
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u32)
    }

    pub async fn name_taken(&self, owner: &str, name: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM machines WHERE owner = ? AND name = ?)")
                .bind(owner)
                .bind(name)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    /// Machines whose expiry has passed.
    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Machine>> {
        let rows = sqlx::query_as::<_, MachineRow>(
            "SELECT * FROM machines WHERE expires_at < ? AND state != 'pending' ORDER BY expires_at",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// `pending` rows last touched before `cutoff`.
    pub async fn abandoned(&self, cutoff: DateTime<Utc>) -> Result<Vec<Machine>> {
        let rows = sqlx::query_as::<_, MachineRow>(
            "SELECT * FROM machines WHERE state = 'pending' AND updated_at < ? ORDER BY updated_at",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn set_vmid(&self, id: &str, vmid: &str) -> Result<()> {
        self.update(id, "vmid", Some(vmid)).await
    }

    pub async fn set_address(&self, id: &str, address: &str) -> Result<()> {
        self.update(id, "ip_address", Some(address)).await
    }

    pub async fn set_state(&self, id: &str, state: MachineState) -> Result<()> {
        let result = sqlx::query("UPDATE machines SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("machine {}", id)));
        }
        Ok(())
    }

    async fn update(&self, id: &str, column: &'static str, value: Option<&str>) -> Result<()> {
        let query = format!("UPDATE machines SET {} = ?, updated_at = ? WHERE id = ?", column);
        let result = sqlx::query(&query)
            .bind(value)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("machine {}", id)));
        }
        Ok(())
    }

    /// Remove a row (and, by cascade, its name records). Returns whether a
    /// row existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(sqlx::FromRow)]
struct MachineRow {
    id: String,
    owner: String,
    owner_display_name: String,
    name: String,
    description: String,
    os: String,
    backend: String,
    vmid: Option<String>,
    memory_mb: i64,
    cpu_cores: i64,
    disk_gb: i64,
    subdomain: Option<String>,
    ip_address: Option<String>,
    state: MachineState,
    expires_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl From<MachineRow> for Machine {
    fn from(row: MachineRow) -> Self {
        Self {
            id: row.id,
            owner: row.owner,
            owner_display_name: row.owner_display_name,
            name: row.name,
            description: row.description,
            os: row.os,
            backend: row.backend,
            vmid: row.vmid,
            resources: Resources::new(row.memory_mb as u64, row.cpu_cores as u32, row.disk_gb as u64),
            subdomain: row.subdomain,
            ip_address: row.ip_address,
            state: row.state,
            expires_at: DateTime::from_timestamp(row.expires_at, 0).unwrap_or_default(),
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;
    use chrono::Duration;

    fn new_machine(id: &str, owner: &str, name: &str) -> NewMachine {
        NewMachine {
            id: id.to_string(),
            owner: owner.to_string(),
            owner_display_name: "User One".to_string(),
            name: name.to_string(),
            description: "coursework".to_string(),
            os: "Ubuntu".to_string(),
            backend: "mock".to_string(),
            resources: Resources::new(1024, 2, 20),
            subdomain: None,
            expires_at: Utc::now() + Duration::days(30),
        }
    }

    #[tokio::test]
    async fn test_reserve_and_bind() {
        let ledger = MachineLedger::new(create_test_db().await);

        let machine = ledger.reserve(&new_machine("m1", "u1", "web1"), 2).await.unwrap();
        assert_eq!(machine.state, MachineState::Pending);
        assert!(machine.vmid.is_none());

        ledger.set_vmid("m1", "100").await.unwrap();
        ledger.set_address("m1", "10.0.0.10").await.unwrap();
        ledger.set_state("m1", MachineState::Active).await.unwrap();

        let machine = ledger.get("m1").await.unwrap();
        assert_eq!(machine.vmid.as_deref(), Some("100"));
        assert_eq!(machine.ip_address.as_deref(), Some("10.0.0.10"));
        assert_eq!(machine.state, MachineState::Active);
        assert_eq!(machine.resources, Resources::new(1024, 2, 20));
    }

    #[tokio::test]
    async fn test_reserve_enforces_quota() {
        let ledger = MachineLedger::new(create_test_db().await);
        ledger.reserve(&new_machine("m1", "u1", "a"), 2).await.unwrap();
        ledger.reserve(&new_machine("m2", "u1", "b"), 2).await.unwrap();

        let err = ledger.reserve(&new_machine("m3", "u1", "c"), 2).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));

        ledger.reserve(&new_machine("m4", "u2", "a"), 2).await.unwrap();
        assert_eq!(ledger.count_for_owner("u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reserve_duplicate_name_is_conflict() {
        let ledger = MachineLedger::new(create_test_db().await);
        ledger.reserve(&new_machine("m1", "u1", "web1"), 2).await.unwrap();

        let err = ledger.reserve(&new_machine("m2", "u1", "web1"), 2).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
        assert!(ledger.name_taken("u1", "web1").await.unwrap());
        assert!(!ledger.name_taken("u2", "web1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let ledger = MachineLedger::new(create_test_db().await);
        ledger.reserve(&new_machine("m1", "u1", "web1"), 2).await.unwrap();

        assert!(ledger.delete("m1").await.unwrap());
        assert!(!ledger.delete("m1").await.unwrap());
        assert!(matches!(ledger.get("m1").await, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_skips_pending() {
        let ledger = MachineLedger::new(create_test_db().await);
        let mut old = new_machine("m1", "u1", "old");
        old.expires_at = Utc::now() - Duration::days(1);
        let mut pending = new_machine("m2", "u1", "pending");
        pending.expires_at = Utc::now() - Duration::days(1);

        ledger.reserve(&old, 2).await.unwrap();
        ledger.reserve(&pending, 2).await.unwrap();
        ledger.set_state("m1", MachineState::Active).await.unwrap();

        let expired = ledger.expired(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "m1");
    }

    #[tokio::test]
    async fn test_abandoned_lists_stale_pending_rows() {
        let pool = create_test_db().await;
        let ledger = MachineLedger::new(pool.clone());
        ledger.reserve(&new_machine("m1", "u1", "stale"), 2).await.unwrap();
        ledger.reserve(&new_machine("m2", "u1", "fresh"), 2).await.unwrap();
        sqlx::query("UPDATE machines SET updated_at = ? WHERE id = 'm1'")
            .bind((Utc::now() - Duration::hours(1)).timestamp())
            .execute(&pool)
            .await
            .unwrap();

        let abandoned = ledger.abandoned(Utc::now() - Duration::minutes(15)).await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, "m1");

        ledger.set_state("m1", MachineState::Active).await.unwrap();
        let ids: Vec<String> = ledger
            .abandoned(Utc::now() + Duration::minutes(1))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m2"]);
    }

    #[test]
    fn test_caller_access() {
        let machine = Machine {
            id: "m1".into(),
            owner: "u1".into(),
            owner_display_name: "User One".into(),
            name: "web1".into(),
            description: String::new(),
            os: "Ubuntu".into(),
            backend: "mock".into(),
            vmid: None,
            resources: Resources::new(1024, 2, 20),
            subdomain: None,
            ip_address: None,
            state: MachineState::Active,
            expires_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(Caller::user("u1", "User One").can_access(&machine));
        assert!(!Caller::user("u2", "User Two").can_access(&machine));
        assert!(Caller::admin("ops", "Operator").can_access(&machine));
        assert!(Caller::system().can_access(&machine));
    }
}
