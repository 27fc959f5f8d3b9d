//! Database schema migrations with dependency ordering.
//!
//! `yoyo` discovers a directory of migration scripts, orders them by
//! declared dependencies and filename, and applies or rolls back the delta
//! needed to move a database from its current applied-set to the desired
//! one. Applied migrations are tracked in bookkeeping tables inside the
//! target database itself, under a cross-process lock so two invocations
//! cannot race.
//!
//! # Architecture
//!
//! - **Loader** - scans directories, globs and embedded packages for
//!   `<stem>.sql` / `<stem>.rollback.sql` pairs and parses their
//!   `-- depends:` / `-- transactional:` directives
//! - **Graph** - validates the dependency graph and produces the canonical
//!   (dependency-then-filename) order
//! - **Planner** - computes apply/rollback plans against the applied-set
//! - **Executor** - drives a plan with per-migration transactions,
//!   per-step savepoints and the step-level error policy
//! - **Backend** - one connection type over PostgreSQL, MySQL, SQLite and
//!   Redshift, with per-DBMS variance behind the `Dialect` trait
//!
//! # Example
//!
//! ```rust,no_run
//! use yoyo::prelude::*;
//!
//! # async fn example() -> yoyo::error::Result<()> {
//! let registry = BackendRegistry::default();
//! let loader = SourceLoader::new();
//! let settings = Settings::new("sqlite://app.db", vec!["migrations".to_string()]);
//!
//! let mut session = Session::open(&registry, &loader, &settings).await?;
//! let plan = session.apply_plan(None)?;
//! session.execute(&plan).await?;
//! # Ok(())
//! # }
//! ```
//!
//! In-language migrations are built with the same types the loader
//! produces:
//!
//! ```rust
//! use yoyo::migration::{Migration, Step};
//!
//! let m = Migration::new("0002-add-index")
//!     .depends_on("0001-create-table")
//!     .step(Step::sql(
//!         "CREATE INDEX ix_t_c ON t (c)",
//!         Some("DROP INDEX ix_t_c".to_string()),
//!     ));
//! ```

pub mod backend;
pub mod commands;
pub mod error;
pub mod executor;
pub mod graph;
pub mod history;
pub mod loader;
pub mod lock;
pub mod migration;
pub mod planner;
pub mod sqlsplit;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{Backend, BackendRegistry, DatabaseUrl, Dialect};
    pub use crate::commands::{MigrationStatus, Session, Settings};
    pub use crate::error::{Result, YoyoError};
    pub use crate::executor::{CancellationToken, Executor};
    pub use crate::graph::{DependencyGraph, MigrationSet};
    pub use crate::loader::SourceLoader;
    pub use crate::migration::{Direction, IgnoreErrors, Migration, Step, StepPayload};
    pub use crate::planner::Plan;
}
