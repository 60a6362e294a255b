//! Name Service: DNS records owned by machines.
//!
//! Records are kept in the ledger and published to the DNS controller. The
//! ledger is written first and rolled back if publishing fails, so a record
//! never exists in the ledger without existing on the controller.
//!
//! Ownership is by *top-level managed subdomain*: the last two labels of the
//! stored subdomain (`api.web1.students` -> `web1.students`). A top-level
//! name belongs to the first machine that publishes under it, and a machine
//! may hold at most [`MAX_TOP_LEVEL_GROUPS`] of them.

use chrono::{DateTime, Utc};
use lab_core::validation::{normalize_subdomain, validate_subdomain};
use lab_network::dns::PublishedRecord;
use lab_network::{DnsController, DnsRecord, RecordType, RecordValue, Zone};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{is_unique_violation, OrchestratorError, Result};
use crate::saga::bounded;

pub const DEFAULT_TTL: u32 = 3600;
pub const MAX_TOP_LEVEL_GROUPS: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct NameRecord {
    pub id: String,
    pub machine_id: String,
    pub zone: String,
    /// Subdomain including the managed suffix, without the zone.
    pub subdomain: String,
    pub top_level: String,
    pub record_type: RecordType,
    /// Canonical text form of the value.
    pub value: String,
    pub ttl: u32,
    pub created_at: DateTime<Utc>,
}

impl NameRecord {
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.subdomain, self.zone)
    }

    fn to_dns(&self) -> Result<DnsRecord> {
        Ok(DnsRecord {
            zone: self.zone.clone(),
            domain: self.fqdn(),
            ttl: self.ttl,
            value: RecordValue::parse(self.record_type, &self.value)?,
        })
    }
}

/// A record as requested by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RecordRequest {
    pub zone: String,
    /// Subdomain without the managed suffix (`api.web1`).
    pub subdomain: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: Option<u32>,
}

/// Last two labels when there are more than two, otherwise the whole name.
pub fn top_level_subdomain(subdomain: &str) -> &str {
    let labels: Vec<&str> = subdomain.split('.').collect();
    if labels.len() > 2 {
        let keep = labels[labels.len() - 2].len() + labels[labels.len() - 1].len() + 1;
        &subdomain[subdomain.len() - keep..]
    } else {
        subdomain
    }
}

#[derive(Clone)]
pub struct NameService {
    pool: SqlitePool,
    dns: Arc<dyn DnsController>,
    suffix: Option<String>,
    timeout: Duration,
}

impl NameService {
    pub fn new(pool: SqlitePool, dns: Arc<dyn DnsController>, suffix: Option<String>, timeout: Duration) -> Self {
        Self {
            pool,
            dns,
            suffix: suffix.map(|s| normalize_subdomain(&s)).filter(|s| !s.is_empty()),
            timeout,
        }
    }

    /// Normalize a user subdomain and append the managed suffix.
    pub fn qualify(&self, subdomain: &str) -> Result<String> {
        let subdomain = normalize_subdomain(subdomain);
        validate_subdomain(&subdomain)?;

        Ok(match &self.suffix {
            Some(suffix) => format!("{}.{}", subdomain, suffix),
            None => subdomain,
        })
    }

    /// Publish a record for `machine_id`.
    ///
    /// The record shape is checked before anything else. Ownership of the
    /// top-level name, duplicates and the top-level quota are enforced by
    /// the ledger insert itself.
    #[instrument(skip(self, request), fields(zone = %request.zone, subdomain = %request.subdomain))]
    pub async fn create_record(&self, machine_id: &str, request: &RecordRequest) -> Result<NameRecord> {
        let record_type = RecordType::from_str(&request.record_type)?;
        let value = RecordValue::parse(record_type, &request.value)?;

        let zone = normalize_subdomain(&request.zone);
        let subdomain = self.qualify(&request.subdomain)?;
        let top_level = top_level_subdomain(&subdomain).to_string();

        let record = NameRecord {
            id: Uuid::new_v4().to_string(),
            machine_id: machine_id.to_string(),
            zone,
            subdomain,
            top_level,
            record_type,
            value: value.to_string(),
            ttl: request.ttl.unwrap_or(DEFAULT_TTL),
            created_at: Utc::now(),
        };

        self.insert(&record).await?;
        if let Err(e) = self.publish(&record).await {
            if let Err(rollback) = self.remove_row(&record.id).await {
                error!(
                    record_id = %record.id,
                    "Failed to roll back ledger row after DNS publish failure: {}",
                    rollback
                );
            }
            return Err(e);
        }

        info!(record_id = %record.id, machine_id, fqdn = %record.fqdn(), "DNS record created");
        Ok(record)
    }

    /// Insert the ledger row unless another machine owns its top-level name
    /// or the machine would exceed [`MAX_TOP_LEVEL_GROUPS`]. The checks and
    /// the write are one statement, so concurrent creates are serialized by
    /// the ledger.
    async fn insert(&self, record: &NameRecord) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO name_records (id, machine_id, zone, subdomain, top_level, record_type, value, ttl, created_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (
                       SELECT 1 FROM name_records
                       WHERE zone = ? AND top_level = ? AND machine_id != ?
                   )
               AND (SELECT COUNT(DISTINCT top_level) FROM name_records
                    WHERE machine_id = ? AND top_level != ?) < ?",
        )
        .bind(&record.id)
        .bind(&record.machine_id)
        .bind(&record.zone)
        .bind(&record.subdomain)
        .bind(&record.top_level)
        .bind(record.record_type.as_str())
        .bind(&record.value)
        .bind(record.ttl as i64)
        .bind(record.created_at.timestamp())
        .bind(&record.zone)
        .bind(&record.top_level)
        .bind(&record.machine_id)
        .bind(&record.machine_id)
        .bind(&record.top_level)
        .bind(MAX_TOP_LEVEL_GROUPS)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OrchestratorError::DuplicateRecord(describe(record))
            } else {
                e.into()
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(self.refusal(record).await?);
        }
        Ok(())
    }

    /// Why the guarded insert wrote nothing.
    async fn refusal(&self, record: &NameRecord) -> Result<OrchestratorError> {
        let (taken,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                 SELECT 1 FROM name_records WHERE zone = ? AND top_level = ? AND machine_id != ?
             )",
        )
        .bind(&record.zone)
        .bind(&record.top_level)
        .bind(&record.machine_id)
        .fetch_one(&self.pool)
        .await?;

        if taken {
            return Ok(OrchestratorError::DomainInUse(record.top_level.clone()));
        }
        Ok(OrchestratorError::QuotaExceeded(format!(
            "a machine may hold at most {} top-level subdomains",
            MAX_TOP_LEVEL_GROUPS
        )))
    }

    async fn publish(&self, record: &NameRecord) -> Result<()> {
        let dns_record = record.to_dns()?;
        bounded("dns add record", self.timeout, self.dns.add_record(&dns_record)).await
    }

    async fn remove_row(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM name_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete by the record key: ledger row first, then the controller
    /// entry. Deleting a record that is already gone succeeds.
    #[instrument(skip(self, value))]
    pub async fn delete_record(
        &self,
        zone: &str,
        subdomain: &str,
        record_type: RecordType,
        value: &str,
    ) -> Result<()> {
        let value = RecordValue::parse(record_type, value)?;

        sqlx::query(
            "DELETE FROM name_records
             WHERE zone = ? AND subdomain = ? AND record_type = ? AND value = ?",
        )
        .bind(zone)
        .bind(subdomain)
        .bind(record_type.as_str())
        .bind(value.to_string())
        .execute(&self.pool)
        .await?;

        let dns_record = DnsRecord {
            zone: zone.to_string(),
            domain: format!("{}.{}", subdomain, zone),
            ttl: DEFAULT_TTL,
            value,
        };
        bounded("dns delete record", self.timeout, self.dns.delete_record(&dns_record)).await?;

        info!("DNS record deleted");
        Ok(())
    }

    pub async fn delete_record_by_id(&self, id: &str) -> Result<()> {
        let record = self.get_record(id).await?;
        self.delete_record(&record.zone, &record.subdomain, record.record_type, &record.value)
            .await
    }

    pub async fn get_record(&self, id: &str) -> Result<NameRecord> {
        let row = sqlx::query_as::<_, NameRecordRow>("SELECT * FROM name_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("record {}", id)))?;

        row.try_into()
    }

    pub async fn list_records(&self, machine_id: &str) -> Result<Vec<NameRecord>> {
        let rows = sqlx::query_as::<_, NameRecordRow>(
            "SELECT * FROM name_records WHERE machine_id = ? ORDER BY created_at, subdomain",
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Replace a record. The new record goes through the full create checks;
    /// if it is refused the old one is put back.
    #[instrument(skip(self, request))]
    pub async fn update_record(&self, id: &str, request: &RecordRequest) -> Result<NameRecord> {
        let old = self.get_record(id).await?;

        let record_type = RecordType::from_str(&request.record_type)?;
        RecordValue::parse(record_type, &request.value)?;

        self.delete_record_by_id(id).await?;

        match self.create_record(&old.machine_id, request).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(record_id = %old.id, "Record update refused, restoring the previous record: {}", e);
                if let Err(restore) = self.restore(&old).await {
                    error!(record_id = %old.id, "Failed to restore DNS record: {}", restore);
                }
                Err(e)
            }
        }
    }

    async fn restore(&self, record: &NameRecord) -> Result<()> {
        self.insert(record).await?;
        if let Err(e) = self.publish(record).await {
            self.remove_row(&record.id).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Delete every record of a machine. Failures are returned, not raised,
    /// so teardown can carry on.
    pub async fn delete_all_for_machine(&self, machine_id: &str) -> Result<Vec<(NameRecord, OrchestratorError)>> {
        let mut failures = Vec::new();

        for record in self.list_records(machine_id).await? {
            if let Err(e) = self
                .delete_record(&record.zone, &record.subdomain, record.record_type, &record.value)
                .await
            {
                warn!(machine_id, record_id = %record.id, "Failed to delete DNS record: {}", e);
                failures.push((record, e));
            }
        }

        Ok(failures)
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        bounded("dns list zones", self.timeout, self.dns.list_zones()).await
    }

    /// What the controller currently serves for a stored record.
    pub async fn live_records(&self, record: &NameRecord) -> Result<Vec<PublishedRecord>> {
        bounded(
            "dns get records",
            self.timeout,
            self.dns.get_records(&record.zone, &record.fqdn()),
        )
        .await
    }
}

fn describe(record: &NameRecord) -> String {
    format!("{} {} {}", record.fqdn(), record.record_type, record.value)
}

#[derive(sqlx::FromRow)]
struct NameRecordRow {
    id: String,
    machine_id: String,
    zone: String,
    subdomain: String,
    top_level: String,
    record_type: String,
    value: String,
    ttl: i64,
    created_at: i64,
}

impl TryFrom<NameRecordRow> for NameRecord {
    type Error = OrchestratorError;

    fn try_from(row: NameRecordRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            machine_id: row.machine_id,
            zone: row.zone,
            subdomain: row.subdomain,
            top_level: row.top_level,
            record_type: RecordType::from_str(&row.record_type)?,
            value: row.value,
            ttl: row.ttl as u32,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
        })
    }
}
