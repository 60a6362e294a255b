use crate::error::Result;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument};

/// Open (creating if needed) the ledger database.
///
/// Writers queue on the SQLite lock for up to `busy_timeout` instead of
/// failing, so concurrent claims serialize inside the database.
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Copy the database aside before migrating. Returns the backup path, or
/// `None` when there was nothing to back up yet.
pub fn backup_database(db_path: &Path) -> Result<Option<PathBuf>> {
    if !db_path.exists() {
        return Ok(None);
    }

    let backup_path = db_path.with_extension(format!("db.backup.{}", Utc::now().timestamp()));
    std::fs::copy(db_path, &backup_path)?;
    info!(backup = %backup_path.display(), "Ledger backed up before migration");

    Ok(Some(backup_path))
}
