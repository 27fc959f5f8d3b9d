//! PostgreSQL dialect.
//!
//! Covers both the `postgresql` and `postgres` schemes; the `+driver`
//! suffix (`postgresql+psycopg` and friends in other tooling) is accepted
//! and ignored since sqlx brings its own driver. A `schema` query
//! parameter selects the search path for the connection.

use super::{DatabaseUrl, Dialect, LockStrategy};

/// Advisory lock key: the bytes of `"yoyolock"` as a big-endian integer.
/// Advisory locks are database-local in PostgreSQL, so a constant key is
/// enough to serialize engines against one database.
const ADVISORY_LOCK_KEY: i64 = 0x796f_796f_6c6f_636b;

/// PostgreSQL dialect.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn lock_strategy(&self, _url: &DatabaseUrl) -> LockStrategy {
        LockStrategy::Advisory {
            acquire: format!("SELECT pg_try_advisory_lock({ADVISORY_LOCK_KEY})"),
            release: format!("SELECT pg_advisory_unlock({ADVISORY_LOCK_KEY})"),
        }
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
