//! The finite pool of assignable IP addresses.
//!
//! An address moves `free -> claimed -> assigned -> free`. Claiming is one
//! conditional `UPDATE`, so SQLite's write lock decides which of several
//! concurrent callers gets a given address.

use chrono::{DateTime, Utc};
use lab_core::validation::parse_ip;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::PoolError;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AddressState {
    Free,
    Claimed,
    Assigned,
}

impl AddressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressState::Free => "free",
            AddressState::Claimed => "claimed",
            AddressState::Assigned => "assigned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IpAllocation {
    pub address: String,
    pub state: AddressState,
    pub machine_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A reserved address. Only the holder of the claim can assign it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub address: String,
    token: String,
}

/// Outcome of [`AddressPool::seed`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SeedReport {
    pub added: Vec<String>,
    /// Addresses that were already in the pool and left untouched.
    pub duplicates: Vec<String>,
}

#[derive(Clone)]
pub struct AddressPool {
    pool: SqlitePool,
}

impl AddressPool {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reserve one free address.
    #[instrument(skip(self))]
    pub async fn claim(&self) -> Result<Claim> {
        let token = Uuid::new_v4().to_string();

        let address: Option<(String,)> = sqlx::query_as(
            "UPDATE ip_addresses
             SET state = 'claimed', claim_token = ?, updated_at = ?
             WHERE address = (
                 SELECT address FROM ip_addresses WHERE state = 'free' ORDER BY address LIMIT 1
             ) AND state = 'free'
             RETURNING address",
        )
        .bind(&token)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        match address {
            Some((address,)) => {
                debug!(%address, "IP address claimed");
                Ok(Claim { address, token })
            }
            None => Err(PoolError::Exhausted),
        }
    }

    /// Bind a claimed address to a machine.
    #[instrument(skip(self, claim), fields(address = %claim.address))]
    pub async fn assign(&self, claim: &Claim, machine_id: &str) -> Result<IpAllocation> {
        let result = sqlx::query(
            "UPDATE ip_addresses
             SET state = 'assigned', machine_id = ?, claim_token = NULL, updated_at = ?
             WHERE address = ? AND state = 'claimed' AND claim_token = ?",
        )
        .bind(machine_id)
        .bind(Utc::now().timestamp())
        .bind(&claim.address)
        .bind(&claim.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let state = self
                .get(&claim.address)
                .await?
                .map(|allocation| allocation.state.as_str().to_string())
                .unwrap_or_else(|| "not in the pool".to_string());
            return Err(PoolError::InvalidState {
                address: claim.address.clone(),
                state,
            });
        }

        info!(machine_id, "IP address assigned");
        self.get(&claim.address)
            .await?
            .ok_or_else(|| PoolError::NotFound(machine_id.to_string()))
    }

    /// Return an address to the pool from any state. Releasing a free or
    /// unknown address is a no-op.
    #[instrument(skip(self))]
    pub async fn release(&self, address: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE ip_addresses
             SET state = 'free', claim_token = NULL, machine_id = NULL, updated_at = ?
             WHERE address = ? AND state != 'free'",
        )
        .bind(Utc::now().timestamp())
        .bind(address)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!("IP address released");
        } else {
            debug!("IP address already free");
        }
        Ok(())
    }

    /// The address assigned to a machine.
    pub async fn lookup(&self, machine_id: &str) -> Result<IpAllocation> {
        sqlx::query_as::<_, AllocationRow>("SELECT * FROM ip_addresses WHERE machine_id = ?")
            .bind(machine_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or_else(|| PoolError::NotFound(machine_id.to_string()))
    }

    pub async fn get(&self, address: &str) -> Result<Option<IpAllocation>> {
        let row = sqlx::query_as::<_, AllocationRow>("SELECT * FROM ip_addresses WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list(&self) -> Result<Vec<IpAllocation>> {
        let rows = sqlx::query_as::<_, AllocationRow>("SELECT * FROM ip_addresses ORDER BY address")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Add addresses as free. The whole batch is rejected if any literal is
    /// not an IP address; addresses already present are reported, not reset.
    #[instrument(skip(self, addresses), fields(count = addresses.len()))]
    pub async fn seed(&self, addresses: &[String]) -> Result<SeedReport> {
        let parsed = addresses
            .iter()
            .map(|raw| parse_ip(raw).map(|ip| ip.to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PoolError::InvalidAddress(e.to_string()))?;

        let now = Utc::now().timestamp();
        let mut report = SeedReport::default();
        let mut tx = self.pool.begin().await?;

        for address in parsed {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO ip_addresses (address, state, updated_at) VALUES (?, 'free', ?)",
            )
            .bind(&address)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                report.duplicates.push(address);
            } else {
                report.added.push(address);
            }
        }

        tx.commit().await?;
        info!(
            added = report.added.len(),
            duplicates = report.duplicates.len(),
            "IP pool seeded"
        );
        Ok(report)
    }
}

#[derive(sqlx::FromRow)]
struct AllocationRow {
    address: String,
    state: AddressState,
    machine_id: Option<String>,
    updated_at: i64,
}

impl From<AllocationRow> for IpAllocation {
    fn from(row: AllocationRow) -> Self {
        Self {
            address: row.address,
            state: row.state,
            machine_id: row.machine_id,
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}
