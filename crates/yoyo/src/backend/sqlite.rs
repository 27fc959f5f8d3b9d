//! SQLite dialect.
//!
//! SQLite has no advisory locks, so the insert-sentinel protocol on
//! `yoyo_lock` serializes engine processes.

use super::{DatabaseUrl, Dialect};

/// SQLite dialect.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    fn table_exists_sql(&self) -> String {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?".to_string()
    }

    fn timestamp_type(&self) -> &'static str {
        "TEXT"
    }

    fn sqlx_url(&self, url: &DatabaseUrl) -> String {
        url.rewritten("sqlite", &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LockStrategy;

    #[test]
    fn test_sentinel_lock() {
        let dialect = SqliteDialect;
        let url = DatabaseUrl::parse("sqlite:app.db").unwrap();
        assert_eq!(dialect.lock_strategy(&url), LockStrategy::Sentinel);
    }

    #[test]
    fn test_memory_url_passes_through() {
        let dialect = SqliteDialect;
        let url = DatabaseUrl::parse("sqlite::memory:").unwrap();
        assert_eq!(dialect.sqlx_url(&url), "sqlite::memory:");
    }
}
