//! MySQL dialect.
//!
//! `GET_LOCK` names are server-global, so the advisory lock name includes
//! the database name to keep engines on different databases independent.

use super::{DatabaseUrl, Dialect, LockStrategy};

/// MySQL dialect.
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    fn table_exists_sql(&self) -> String {
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_name = ?"
            .to_string()
    }

    fn lock_strategy(&self, url: &DatabaseUrl) -> LockStrategy {
        let name = format!("yoyo:{}", url.database()).replace('\'', "");
        LockStrategy::Advisory {
            acquire: format!("SELECT GET_LOCK('{name}', 0)"),
            release: format!("SELECT RELEASE_LOCK('{name}')"),
        }
    }

    fn sqlx_url(&self, url: &DatabaseUrl) -> String {
        url.rewritten("mysql", &["unix_socket"])
    }
}
