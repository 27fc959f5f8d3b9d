//! Error types for the migration engine.

use std::path::PathBuf;

/// Errors that can occur while loading, planning or executing migrations.
#[derive(Debug, thiserror::Error)]
pub enum YoyoError {
    /// A migration depends on an id that is neither loaded nor applied.
    #[error("migration '{migration}' depends on '{dependency}' which is unknown")]
    UnknownDependency {
        /// The migration carrying the bad reference.
        migration: String,
        /// The id that could not be resolved.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("circular dependencies among these migrations: {}", .0.join(", "))]
    CircularDependencies(Vec<String>),

    /// The same migration id was loaded from more than one source.
    #[error("duplicate migration id '{0}'")]
    DuplicateMigration(String),

    /// A `--` directive line could not be parsed.
    #[error("bad directive in '{path}': {message}")]
    BadDirective {
        /// Path of the offending file.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    /// A source specifier did not resolve to anything readable.
    #[error("bad migration source '{0}'")]
    BadSource(String),

    /// A `package:` source named a package that was never registered.
    #[error("unknown migration package '{0}'")]
    UnknownPackage(String),

    /// No backend is registered for the URL scheme.
    #[error("no backend registered for scheme '{0}'")]
    UnknownScheme(String),

    /// The connection URL could not be parsed.
    #[error("invalid database URL '{0}'")]
    InvalidUrl(String),

    /// Connecting to the database failed. The URL is shown with the
    /// password redacted.
    #[error("could not connect to '{url}': {source}")]
    Connection {
        /// Redacted connection URL.
        url: String,
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// The cross-process lock could not be acquired in time.
    #[error(
        "could not acquire lock (held by pid {holder_pid:?} since {holder_ctime:?}): \
         run 'yoyo break-lock' to remove a stale lock"
    )]
    LockTimeout {
        /// Pid of the current holder, when the sentinel row reports one.
        holder_pid: Option<i64>,
        /// When the holder took the lock.
        holder_ctime: Option<String>,
    },

    /// A step failed and its error was not covered by `ignore_errors`.
    #[error("migration '{migration}' failed on: {statement}: {source}")]
    StepFailed {
        /// Id of the failing migration.
        migration: String,
        /// The failing statement, truncated for display.
        statement: String,
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// Like [`YoyoError::StepFailed`], but the migration ran outside a
    /// transaction, so earlier statements have been committed and the
    /// database is left partially migrated.
    #[error(
        "non-transactional migration '{migration}' failed on: {statement}: {source} \
         (the database is left partially migrated)"
    )]
    NonTransactionalFailure {
        /// Id of the failing migration.
        migration: String,
        /// The failing statement, truncated for display.
        statement: String,
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// Rollback was requested for a migration with applied descendants that
    /// are unknown to the loaded sources.
    #[error(
        "cannot roll back '{migration}': applied migrations {} are not in the loaded sources \
         (re-run with --force to drop their records)",
        .ghosts.join(", ")
    )]
    DanglingRollback {
        /// The requested rollback target.
        migration: String,
        /// Applied ids with no loaded counterpart.
        ghosts: Vec<String>,
    },

    /// A migration id was named on the command line but not found.
    #[error("migration not found: {0}")]
    MigrationNotFound(String),

    /// The bookkeeping tables are at a version this engine cannot upgrade.
    #[error("bookkeeping schema version {found} is not supported (expected <= {supported})")]
    SchemaVersion {
        /// Version recorded in `_yoyo_version`.
        found: i64,
        /// Newest version this engine understands.
        supported: i64,
    },

    /// The command was interrupted by a signal.
    #[error("interrupted")]
    Interrupted,

    /// Database error outside of step execution.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error while reading migration sources.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, YoyoError>;

impl YoyoError {
    /// Process exit code for this error class.
    ///
    /// Load and plan errors, lock timeouts and execution failures each get
    /// a distinct code so callers can tell them apart without parsing
    /// messages.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownDependency { .. }
            | Self::CircularDependencies(_)
            | Self::DuplicateMigration(_)
            | Self::BadDirective { .. }
            | Self::BadSource(_)
            | Self::UnknownPackage(_)
            | Self::DanglingRollback { .. }
            | Self::MigrationNotFound(_)
            | Self::Io(_) => 2,
            Self::UnknownScheme(_) | Self::InvalidUrl(_) | Self::Connection { .. } => 3,
            Self::LockTimeout { .. } => 4,
            Self::StepFailed { .. }
            | Self::NonTransactionalFailure { .. }
            | Self::Database(_)
            | Self::SchemaVersion { .. } => 5,
            Self::Interrupted => 130,
        }
    }
}
