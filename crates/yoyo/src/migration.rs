//! Migration and step types.
//!
//! A [`Migration`] is a named unit of schema change: an ordered list of
//! [`Step`]s, a dependency set, and a transactional flag. SQL migrations
//! come from the [loader](crate::loader); in-language migrations are built
//! through the same type's builder methods, with their apply and rollback
//! payloads given as opaque async callables over the live connection.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use sqlx::AnyConnection;

/// Reserved filename stem for post-apply hooks.
pub const POST_APPLY_STEM: &str = "post-apply";

/// Direction a plan is executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Run apply payloads, record migrations as applied.
    Apply,
    /// Run rollback payloads, remove applied records.
    Rollback,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => f.write_str("apply"),
            Self::Rollback => f.write_str("rollback"),
        }
    }
}

/// Which directions a step's database errors are swallowed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnoreErrors {
    /// Errors always abort the migration.
    #[default]
    None,
    /// Errors are ignored while applying.
    Apply,
    /// Errors are ignored while rolling back.
    Rollback,
    /// Errors are ignored in both directions.
    All,
}

impl IgnoreErrors {
    /// Returns whether an error in the given direction is swallowed.
    #[must_use]
    pub fn covers(self, direction: Direction) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Apply => direction == Direction::Apply,
            Self::Rollback => direction == Direction::Rollback,
        }
    }
}

/// An opaque async callable executed with the live connection.
pub type StepFn = Arc<
    dyn for<'c> Fn(&'c mut AnyConnection) -> BoxFuture<'c, Result<(), sqlx::Error>>
        + Send
        + Sync,
>;

/// The apply or rollback payload of a single step.
#[derive(Clone)]
pub enum StepPayload {
    /// One SQL statement.
    Sql(String),
    /// An ordered run of SQL statements sharing the step's savepoint.
    ///
    /// Produced by the loader when an entire rollback file attaches to the
    /// last apply step (statement counts did not match).
    Batch(Vec<String>),
    /// An in-language callable invoked with the connection.
    Code(StepFn),
}

impl fmt::Debug for StepPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Self::Batch(stmts) => f.debug_tuple("Batch").field(stmts).finish(),
            Self::Code(_) => f.write_str("Code(..)"),
        }
    }
}

impl StepPayload {
    /// A short, single-line description of the payload for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        const MAX: usize = 80;
        let text = match self {
            Self::Sql(sql) => sql.as_str(),
            Self::Batch(stmts) => stmts.first().map_or("", String::as_str),
            Self::Code(_) => "<code step>",
        };
        let mut line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.len() > MAX {
            let mut cut = MAX;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push_str("...");
        }
        line
    }
}

/// One sub-unit of a migration.
///
/// A step is either a single apply/rollback payload pair, or a group of
/// nested steps sharing one savepoint and one ignore-errors policy. Groups
/// nest to arbitrary depth.
#[derive(Debug, Clone)]
pub enum Step {
    /// A single payload pair.
    Single {
        /// Payload run in the apply direction.
        apply: StepPayload,
        /// Payload run in the rollback direction, if any.
        rollback: Option<StepPayload>,
        /// Error policy for this step.
        ignore_errors: IgnoreErrors,
    },
    /// Nested steps sharing one savepoint.
    Group {
        /// The nested steps, in apply order.
        steps: Vec<Step>,
        /// Error policy governing the entire group.
        ignore_errors: IgnoreErrors,
    },
}

impl Step {
    /// Creates a step from an apply statement and an optional rollback.
    #[must_use]
    pub fn sql(apply: impl Into<String>, rollback: Option<String>) -> Self {
        Self::Single {
            apply: StepPayload::Sql(apply.into()),
            rollback: rollback.map(StepPayload::Sql),
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// Creates a step from in-language apply and rollback callables.
    #[must_use]
    pub fn code(apply: StepFn, rollback: Option<StepFn>) -> Self {
        Self::Single {
            apply: StepPayload::Code(apply),
            rollback: rollback.map(StepPayload::Code),
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// Creates a group of steps sharing one savepoint.
    #[must_use]
    pub fn group(steps: Vec<Step>) -> Self {
        Self::Group {
            steps,
            ignore_errors: IgnoreErrors::None,
        }
    }

    /// Sets the error policy for this step or group.
    #[must_use]
    pub fn ignore_errors(mut self, policy: IgnoreErrors) -> Self {
        match &mut self {
            Self::Single { ignore_errors, .. } | Self::Group { ignore_errors, .. } => {
                *ignore_errors = policy;
            }
        }
        self
    }

    /// Returns this step's error policy.
    #[must_use]
    pub fn policy(&self) -> IgnoreErrors {
        match self {
            Self::Single { ignore_errors, .. } | Self::Group { ignore_errors, .. } => {
                *ignore_errors
            }
        }
    }
}

/// How a migration was defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// A `<stem>.sql` file with an optional `<stem>.rollback.sql` sibling.
    SqlPair,
    /// Built in code through the [`Migration`] builder.
    Code,
}

/// A named unit of schema change.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Globally unique id: the filename stem.
    pub id: String,
    /// SHA-256 hex digest of the id, used as the bookkeeping key.
    pub hash: String,
    /// Absolute path of the source file, for diagnostics. Code migrations
    /// have none.
    pub source_path: Option<PathBuf>,
    /// How the migration was defined.
    pub kind: MigrationKind,
    /// Ids this migration depends on.
    pub depends_on: BTreeSet<String>,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Whether the engine wraps the migration in a transaction.
    pub transactional: bool,
    /// True iff the id carries the reserved `post-apply` stem. Post-apply
    /// migrations are not graph vertices and are never recorded in
    /// bookkeeping.
    pub is_post_apply: bool,
}

impl Migration {
    /// Creates an empty in-language migration with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let hash = migration_hash(&id);
        let is_post_apply = id.starts_with(POST_APPLY_STEM);
        Self {
            id,
            hash,
            source_path: None,
            kind: MigrationKind::Code,
            depends_on: BTreeSet::new(),
            steps: Vec::new(),
            transactional: true,
            is_post_apply,
        }
    }

    /// Adds a dependency on another migration id.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Adds a step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds steps.
    #[must_use]
    pub fn steps(mut self, steps: Vec<Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Disables the wrapping transaction.
    #[must_use]
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }
}

/// Returns the bookkeeping key for a migration id: its SHA-256 hex digest.
#[must_use]
pub fn migration_hash(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_hash_is_stable() {
        assert_eq!(migration_hash("0001"), migration_hash("0001"));
        assert_ne!(migration_hash("0001"), migration_hash("0002"));
        assert_eq!(migration_hash("0001").len(), 64);
    }

    #[test]
    fn test_builder() {
        let m = Migration::new("0002-add-index")
            .depends_on("0001-create-table")
            .step(Step::sql(
                "CREATE INDEX ix ON t (c)",
                Some("DROP INDEX ix".to_string()),
            ));
        assert_eq!(m.id, "0002-add-index");
        assert_eq!(m.kind, MigrationKind::Code);
        assert!(m.transactional);
        assert!(!m.is_post_apply);
        assert!(m.depends_on.contains("0001-create-table"));
        assert_eq!(m.steps.len(), 1);
    }

    #[test]
    fn test_post_apply_stem_is_reserved() {
        assert!(Migration::new("post-apply").is_post_apply);
        assert!(Migration::new("post-apply-grants").is_post_apply);
        assert!(!Migration::new("0001-post-apply").is_post_apply);
    }

    #[test]
    fn test_ignore_errors_coverage() {
        assert!(!IgnoreErrors::None.covers(Direction::Apply));
        assert!(IgnoreErrors::Apply.covers(Direction::Apply));
        assert!(!IgnoreErrors::Apply.covers(Direction::Rollback));
        assert!(IgnoreErrors::Rollback.covers(Direction::Rollback));
        assert!(IgnoreErrors::All.covers(Direction::Apply));
        assert!(IgnoreErrors::All.covers(Direction::Rollback));
    }

    #[test]
    fn test_payload_describe_truncates() {
        let long = format!("SELECT '{}'", "x".repeat(200));
        let description = StepPayload::Sql(long).describe();
        assert!(description.len() <= 83);
        assert!(description.ends_with("..."));
    }
}
