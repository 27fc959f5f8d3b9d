//! Redshift dialect.
//!
//! Redshift speaks the PostgreSQL wire protocol but supports neither
//! `SAVEPOINT` nor advisory locks, so step-level error handling degrades
//! to whole-migration rollback and locking falls back to the sentinel
//! protocol.

use super::{DatabaseUrl, Dialect};

/// Redshift dialect.
#[derive(Debug, Clone, Default)]
pub struct RedshiftDialect;

impl Dialect for RedshiftDialect {
    fn name(&self) -> &'static str {
        "redshift"
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn supports_savepoints(&self) -> bool {
        false
    }

    fn init_connection_sql(&self, url: &DatabaseUrl) -> Vec<String> {
        match url.query_param("schema") {
            Some(schema) => vec![format!("SET search_path TO {}", self.quote_identifier(&schema))],
            None => Vec::new(),
        }
    }

    fn sqlx_url(&self, url: &DatabaseUrl) -> String {
        url.rewritten("postgres", &["schema"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LockStrategy;

    #[test]
    fn test_no_savepoints() {
        assert!(!RedshiftDialect.supports_savepoints());
    }

    #[test]
    fn test_sentinel_lock_and_postgres_wire() {
        let dialect = RedshiftDialect;
        let url = DatabaseUrl::parse("redshift://u@cluster:5439/app").unwrap();
        assert_eq!(dialect.lock_strategy(&url), LockStrategy::Sentinel);
        assert!(dialect.sqlx_url(&url).starts_with("postgres://"));
    }
}
