//! Bookkeeping tables.
//!
//! Four tables in the target database track engine state: `_yoyo_migration`
//! (the applied-set), `_yoyo_log` (append-only operation log),
//! `_yoyo_version` (bookkeeping schema version) and `yoyo_lock` (the
//! sentinel row for backends without advisory locks). Only the engine
//! writes to them, and only while holding the lock.
//!
//! Timestamps are stored as RFC 3339 text and read back leniently, so the
//! same column works across every dialect.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{Result, YoyoError};
use crate::migration::{migration_hash, Migration};

/// Applied-set table.
pub const MIGRATION_TABLE: &str = "_yoyo_migration";
/// Append-only operation log.
pub const LOG_TABLE: &str = "_yoyo_log";
/// Single-row bookkeeping schema version.
pub const VERSION_TABLE: &str = "_yoyo_version";
/// Sentinel-lock table.
pub const LOCK_TABLE: &str = "yoyo_lock";

/// Applied-set table used by engines predating versioned bookkeeping.
const LEGACY_TABLE: &str = "migration";

/// Newest bookkeeping schema this engine writes.
const SCHEMA_VERSION: i64 = 2;

/// One row of the applied-set, in applied order.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// Migration id.
    pub id: String,
    /// SHA-256 of the id, the row's key.
    pub hash: String,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
    /// user@host that applied it.
    pub applied_by: String,
}

/// An operation recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Steps were executed forward and the migration recorded.
    Apply,
    /// Steps were executed backward and the record removed.
    Rollback,
    /// The record was added without executing steps.
    Mark,
    /// The record was removed without executing steps.
    Unmark,
}

impl Operation {
    /// The string stored in the `operation` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Rollback => "rollback",
            Self::Mark => "mark",
            Self::Unmark => "unmark",
        }
    }
}

/// The current UTC time in the stored text form.
#[must_use]
pub fn utc_now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp, tolerating the bare `YYYY-MM-DD HH:MM:SS`
/// form some databases hand back.
fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}

/// `user@host` attribution for applied rows.
#[must_use]
pub fn applied_by() -> String {
    format!("{}@{}", username(), hostname())
}

fn username() -> String {
    whoami::username()
}

fn hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string())
}

async fn table_exists(backend: &mut Backend, table: &str) -> Result<bool> {
    let sql = backend.dialect().table_exists_sql();
    let row = sqlx::query(&sql)
        .bind(table)
        .fetch_one(backend.connection())
        .await?;
    let count: i64 = row.try_get(0)?;
    Ok(count > 0)
}

/// Creates the lock table if it does not exist.
///
/// The lock table is created outside the lock by necessity; `CREATE TABLE
/// IF NOT EXISTS` keeps racing engines from tripping over each other.
pub async fn ensure_lock_table(backend: &mut Backend) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         locked INT NOT NULL, \
         ctime {} NOT NULL, \
         pid BIGINT NOT NULL, \
         PRIMARY KEY (locked))",
        backend.dialect().quote_identifier(LOCK_TABLE),
        backend.dialect().timestamp_type(),
    );
    backend.execute(&sql).await?;
    Ok(())
}

/// Brings the bookkeeping tables to the current schema version.
///
/// Detects databases last touched by engines predating versioned
/// bookkeeping (a `migration` table and no `_yoyo_version`) and migrates
/// their rows forward. Refuses to touch bookkeeping written by a newer
/// engine.
pub async fn ensure_bookkeeping(backend: &mut Backend) -> Result<()> {
    let version = current_version(backend).await?;
    if version == SCHEMA_VERSION {
        return Ok(());
    }
    if version > SCHEMA_VERSION {
        return Err(YoyoError::SchemaVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    info!(from = version, to = SCHEMA_VERSION, "upgrading bookkeeping tables");
    backend.begin().await?;
    let result = upgrade(backend, version).await;
    match result {
        Ok(()) => backend.commit().await,
        Err(e) => {
            backend.rollback().await?;
            Err(e)
        }
    }
}

async fn current_version(backend: &mut Backend) -> Result<i64> {
    if table_exists(backend, VERSION_TABLE).await? {
        let sql = format!(
            "SELECT MAX(version) FROM {}",
            backend.dialect().quote_identifier(VERSION_TABLE)
        );
        let row = sqlx::query(&sql).fetch_one(backend.connection()).await?;
        let version: Option<i64> = row.try_get(0)?;
        return Ok(version.unwrap_or(0));
    }
    if table_exists(backend, LEGACY_TABLE).await? {
        return Ok(1);
    }
    Ok(0)
}

async fn upgrade(backend: &mut Backend, from: i64) -> Result<()> {
    let timestamp = backend.dialect().timestamp_type();
    let text = backend.dialect().text_type();

    let create_migration = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         migration_hash VARCHAR(64) NOT NULL, \
         migration_id {text} NOT NULL, \
         applied_at_utc {timestamp} NOT NULL, \
         applied_by_user {text} NOT NULL, \
         PRIMARY KEY (migration_hash))",
        backend.dialect().quote_identifier(MIGRATION_TABLE),
    );
    let create_log = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id VARCHAR(36) NOT NULL, \
         migration_hash VARCHAR(64), \
         migration_id {text}, \
         operation VARCHAR(10) NOT NULL, \
         username {text} NOT NULL, \
         hostname {text} NOT NULL, \
         comment {text}, \
         created_at_utc {timestamp} NOT NULL, \
         PRIMARY KEY (id))",
        backend.dialect().quote_identifier(LOG_TABLE),
    );
    let create_version = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         version BIGINT NOT NULL, \
         installed_at_utc {timestamp} NOT NULL, \
         PRIMARY KEY (version))",
        backend.dialect().quote_identifier(VERSION_TABLE),
    );
    backend.execute(&create_migration).await?;
    backend.execute(&create_log).await?;
    backend.execute(&create_version).await?;

    if from == 1 {
        copy_legacy_rows(backend).await?;
        let drop_legacy = format!(
            "DROP TABLE {}",
            backend.dialect().quote_identifier(LEGACY_TABLE)
        );
        backend.execute(&drop_legacy).await?;
    }

    let delete = format!(
        "DELETE FROM {}",
        backend.dialect().quote_identifier(VERSION_TABLE)
    );
    backend.execute(&delete).await?;
    let insert = format!(
        "INSERT INTO {} (version, installed_at_utc) VALUES ({}, {})",
        backend.dialect().quote_identifier(VERSION_TABLE),
        backend.dialect().placeholder(1),
        backend.dialect().placeholder(2),
    );
    sqlx::query(&insert)
        .bind(SCHEMA_VERSION)
        .bind(utc_now_text())
        .execute(backend.connection())
        .await?;
    Ok(())
}

/// Moves rows from the pre-versioning `migration` table into
/// `_yoyo_migration`, deriving each row's hash from its id.
async fn copy_legacy_rows(backend: &mut Backend) -> Result<()> {
    let select = format!(
        "SELECT id FROM {}",
        backend.dialect().quote_identifier(LEGACY_TABLE)
    );
    let rows = sqlx::query(&select).fetch_all(backend.connection()).await?;

    let insert = format!(
        "INSERT INTO {} (migration_hash, migration_id, applied_at_utc, applied_by_user) \
         VALUES ({}, {}, {}, {})",
        backend.dialect().quote_identifier(MIGRATION_TABLE),
        backend.dialect().placeholder(1),
        backend.dialect().placeholder(2),
        backend.dialect().placeholder(3),
        backend.dialect().placeholder(4),
    );
    for row in rows {
        let id: String = row.try_get(0)?;
        debug!(id = %id, "migrating legacy applied row");
        sqlx::query(&insert)
            .bind(migration_hash(&id))
            .bind(&id)
            .bind(utc_now_text())
            .bind("unknown")
            .execute(backend.connection())
            .await?;
    }
    Ok(())
}

/// Reads the applied-set, in applied order.
pub async fn applied_migrations(backend: &mut Backend) -> Result<Vec<AppliedMigration>> {
    let sql = format!(
        "SELECT migration_hash, migration_id, applied_at_utc, applied_by_user \
         FROM {} ORDER BY applied_at_utc",
        backend.dialect().quote_identifier(MIGRATION_TABLE)
    );
    let rows = sqlx::query(&sql).fetch_all(backend.connection()).await?;
    rows.into_iter()
        .map(|row| {
            let applied_at_text: String = row.try_get(2)?;
            Ok(AppliedMigration {
                hash: row.try_get(0)?,
                id: row.try_get(1)?,
                applied_at: parse_timestamp(&applied_at_text),
                applied_by: row.try_get(3)?,
            })
        })
        .collect()
}

/// The applied ids, in applied order.
pub async fn applied_ids(backend: &mut Backend) -> Result<Vec<String>> {
    Ok(applied_migrations(backend)
        .await?
        .into_iter()
        .map(|m| m.id)
        .collect())
}

/// Returns whether the migration's hash is recorded as applied.
pub async fn is_applied(backend: &mut Backend, hash: &str) -> Result<bool> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE migration_hash = {}",
        backend.dialect().quote_identifier(MIGRATION_TABLE),
        backend.dialect().placeholder(1),
    );
    let row = sqlx::query(&sql)
        .bind(hash)
        .fetch_one(backend.connection())
        .await?;
    let count: i64 = row.try_get(0)?;
    Ok(count > 0)
}

/// Inserts an applied row. A no-op returning false when the row already
/// exists, which makes `mark` safe to repeat and partial-failure recovery
/// possible after manual intervention.
pub async fn mark_applied(backend: &mut Backend, migration: &Migration) -> Result<bool> {
    if is_applied(backend, &migration.hash).await? {
        return Ok(false);
    }
    let sql = format!(
        "INSERT INTO {} (migration_hash, migration_id, applied_at_utc, applied_by_user) \
         VALUES ({}, {}, {}, {})",
        backend.dialect().quote_identifier(MIGRATION_TABLE),
        backend.dialect().placeholder(1),
        backend.dialect().placeholder(2),
        backend.dialect().placeholder(3),
        backend.dialect().placeholder(4),
    );
    sqlx::query(&sql)
        .bind(&migration.hash)
        .bind(&migration.id)
        .bind(utc_now_text())
        .bind(applied_by())
        .execute(backend.connection())
        .await?;
    Ok(true)
}

/// Deletes an applied row by hash. A no-op returning false when no such
/// row exists.
pub async fn unmark_applied(backend: &mut Backend, hash: &str) -> Result<bool> {
    let sql = format!(
        "DELETE FROM {} WHERE migration_hash = {}",
        backend.dialect().quote_identifier(MIGRATION_TABLE),
        backend.dialect().placeholder(1),
    );
    let result = sqlx::query(&sql)
        .bind(hash)
        .execute(backend.connection())
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Appends a log row.
pub async fn log_operation(
    backend: &mut Backend,
    migration_id: &str,
    hash: &str,
    operation: Operation,
    comment: Option<&str>,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (id, migration_hash, migration_id, operation, \
         username, hostname, comment, created_at_utc) \
         VALUES ({}, {}, {}, {}, {}, {}, {}, {})",
        backend.dialect().quote_identifier(LOG_TABLE),
        backend.dialect().placeholder(1),
        backend.dialect().placeholder(2),
        backend.dialect().placeholder(3),
        backend.dialect().placeholder(4),
        backend.dialect().placeholder(5),
        backend.dialect().placeholder(6),
        backend.dialect().placeholder(7),
        backend.dialect().placeholder(8),
    );
    sqlx::query(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(hash)
        .bind(migration_id)
        .bind(operation.as_str())
        .bind(username())
        .bind(hostname())
        .bind(comment.map(str::to_string))
        .bind(utc_now_text())
        .execute(backend.connection())
        .await?;
    Ok(())
}

/// The ids most recently applied according to the log, newest first,
/// restricted to ids still in the applied-set. Drives `develop -n`.
pub async fn recently_applied_ids(backend: &mut Backend, n: usize) -> Result<Vec<String>> {
    let currently_applied = applied_ids(backend).await?;
    let sql = format!(
        "SELECT migration_id FROM {} WHERE operation = {} ORDER BY created_at_utc DESC",
        backend.dialect().quote_identifier(LOG_TABLE),
        backend.dialect().placeholder(1),
    );
    let rows = sqlx::query(&sql)
        .bind(Operation::Apply.as_str())
        .fetch_all(backend.connection())
        .await?;

    let mut out: Vec<String> = Vec::new();
    for row in rows {
        let id: String = row.try_get(0)?;
        if out.len() == n {
            break;
        }
        if currently_applied.contains(&id) && !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}
