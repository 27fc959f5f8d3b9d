//! Cross-process lock.
//!
//! At most one engine process may execute mutating bookkeeping against a
//! database at a time; readers proceed without the lock. Dialects with a
//! native advisory lock use it; the rest fall back to an insert-sentinel
//! protocol on the `yoyo_lock` table. Either way the lock is polled with
//! bounded exponential backoff until the timeout expires, and held across
//! the entire plan.

use std::time::Duration;

use sqlx::any::AnyRow;
use sqlx::Row;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::backend::{Backend, LockStrategy};
use crate::error::{Result, YoyoError};
use crate::history::{utc_now_text, LOCK_TABLE};

/// Default time to wait for the lock before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Blocks until this process owns the lock or the timeout expires.
pub async fn acquire(backend: &mut Backend, timeout: Duration) -> Result<()> {
    match backend.dialect().lock_strategy(backend.url()) {
        LockStrategy::Advisory { acquire, .. } => acquire_advisory(backend, &acquire, timeout).await,
        LockStrategy::Sentinel => acquire_sentinel(backend, timeout).await,
    }
}

/// Releases the lock taken by [`acquire`].
pub async fn release(backend: &mut Backend) -> Result<()> {
    match backend.dialect().lock_strategy(backend.url()) {
        LockStrategy::Advisory { release, .. } => {
            backend.execute(&release).await?;
            Ok(())
        }
        LockStrategy::Sentinel => release_sentinel(backend).await,
    }
}

/// Removes any lock row left behind by a dead process.
///
/// Advisory locks die with their session, so there is nothing to break for
/// those backends.
pub async fn break_lock(backend: &mut Backend) -> Result<()> {
    match backend.dialect().lock_strategy(backend.url()) {
        LockStrategy::Advisory { .. } => {
            info!("backend uses advisory locks; nothing to break");
            Ok(())
        }
        LockStrategy::Sentinel => {
            let delete = format!(
                "DELETE FROM {}",
                backend.dialect().quote_identifier(LOCK_TABLE)
            );
            backend.begin().await?;
            backend.execute(&delete).await?;
            backend.commit().await?;
            Ok(())
        }
    }
}

async fn acquire_advisory(backend: &mut Backend, acquire_sql: &str, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let row = sqlx::query(acquire_sql)
            .fetch_one(backend.connection())
            .await?;
        if lock_granted(&row)? {
            debug!("advisory lock acquired");
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(YoyoError::LockTimeout {
                holder_pid: None,
                holder_ctime: None,
            });
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// The advisory acquire statement returns a boolean on PostgreSQL and an
/// integer on MySQL.
fn lock_granted(row: &AnyRow) -> Result<bool> {
    if let Ok(granted) = row.try_get::<bool, _>(0) {
        return Ok(granted);
    }
    let granted: i64 = row.try_get(0)?;
    Ok(granted != 0)
}

async fn acquire_sentinel(backend: &mut Backend, timeout: Duration) -> Result<()> {
    let insert = format!(
        "INSERT INTO {} (locked, ctime, pid) VALUES (1, {}, {})",
        backend.dialect().quote_identifier(LOCK_TABLE),
        backend.dialect().placeholder(1),
        backend.dialect().placeholder(2),
    );
    let pid = i64::from(std::process::id());

    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        // The insert runs in its own transaction so a successful lock is
        // visible to other processes immediately.
        backend.begin().await?;
        let inserted = sqlx::query(&insert)
            .bind(utc_now_text())
            .bind(pid)
            .execute(backend.connection())
            .await;
        match inserted {
            Ok(_) => {
                backend.commit().await?;
                debug!(pid, "sentinel lock acquired");
                return Ok(());
            }
            Err(_) => {
                backend.rollback().await?;
                if started.elapsed() >= timeout {
                    let (holder_pid, holder_ctime) = read_holder(backend).await?;
                    return Err(YoyoError::LockTimeout {
                        holder_pid,
                        holder_ctime,
                    });
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn read_holder(backend: &mut Backend) -> Result<(Option<i64>, Option<String>)> {
    let select = format!(
        "SELECT pid, ctime FROM {}",
        backend.dialect().quote_identifier(LOCK_TABLE)
    );
    let row = sqlx::query(&select)
        .fetch_optional(backend.connection())
        .await?;
    match row {
        Some(row) => Ok((row.try_get(0).ok(), row.try_get(1).ok())),
        None => Ok((None, None)),
    }
}

async fn release_sentinel(backend: &mut Backend) -> Result<()> {
    let delete = format!(
        "DELETE FROM {} WHERE pid = {}",
        backend.dialect().quote_identifier(LOCK_TABLE),
        backend.dialect().placeholder(1),
    );
    backend.begin().await?;
    sqlx::query(&delete)
        .bind(i64::from(std::process::id()))
        .execute(backend.connection())
        .await?;
    backend.commit().await?;
    Ok(())
}
