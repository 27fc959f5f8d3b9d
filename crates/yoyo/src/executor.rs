//! Plan execution.
//!
//! The executor drives one [`Plan`] over one backend connection, holding
//! the cross-process lock for the whole plan. Each transactional migration
//! runs inside its own transaction with one savepoint per step; a step
//! whose error policy covers the current direction rolls back to its
//! savepoint and execution continues, anything else rolls back the
//! migration, logs the failure and aborts the plan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::error::{Result, YoyoError};
use crate::history::{self, Operation};
use crate::lock;
use crate::migration::{migration_hash, Direction, Migration, Step, StepPayload};
use crate::planner::Plan;

/// Cooperative cancellation flag, checked between steps and migrations.
///
/// The CLI wires this to Ctrl-C; a cancelled executor rolls back the open
/// transaction, releases the lock and surfaces [`YoyoError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates an un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether the token was flagged.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes plans against a backend.
pub struct Executor<'a> {
    backend: &'a mut Backend,
    cancel: CancellationToken,
    lock_timeout: Duration,
}

impl<'a> Executor<'a> {
    /// Creates an executor over the given connection.
    pub fn new(backend: &'a mut Backend) -> Self {
        Self {
            backend,
            cancel: CancellationToken::new(),
            lock_timeout: lock::DEFAULT_TIMEOUT,
        }
    }

    /// Installs a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Overrides the lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Runs a plan, then the post-apply hooks, under the lock.
    ///
    /// A failing migration aborts the plan: remaining migrations are not
    /// attempted and the lock is released.
    pub async fn execute(&mut self, plan: &Plan, post_apply: &[Arc<Migration>]) -> Result<()> {
        if plan.is_empty() {
            info!("nothing to do");
            return Ok(());
        }
        lock::acquire(self.backend, self.lock_timeout).await?;
        let result = self.run_locked(plan, post_apply).await;
        let released = lock::release(self.backend).await;
        result.and(released)
    }

    /// Updates the applied-set without executing any steps.
    ///
    /// An apply-direction plan marks, a rollback-direction plan unmarks.
    /// Both are idempotent: rows already in the target state are skipped,
    /// and only actual changes are logged.
    pub async fn mark(&mut self, plan: &Plan) -> Result<()> {
        if plan.is_empty() {
            info!("nothing to do");
            return Ok(());
        }
        lock::acquire(self.backend, self.lock_timeout).await?;
        let result = self.mark_locked(plan).await;
        let released = lock::release(self.backend).await;
        result.and(released)
    }

    async fn mark_locked(&mut self, plan: &Plan) -> Result<()> {
        self.backend.begin().await?;
        let result = self.mark_rows(plan).await;
        match result {
            Ok(()) => self.backend.commit().await,
            Err(e) => {
                self.backend.rollback().await?;
                Err(e)
            }
        }
    }

    async fn mark_rows(&mut self, plan: &Plan) -> Result<()> {
        for m in &plan.migrations {
            match plan.direction {
                Direction::Apply => {
                    if history::mark_applied(self.backend, m).await? {
                        info!(migration = %m.id, "marked as applied");
                        history::log_operation(self.backend, &m.id, &m.hash, Operation::Mark, None)
                            .await?;
                    }
                }
                Direction::Rollback => {
                    if history::unmark_applied(self.backend, &m.hash).await? {
                        info!(migration = %m.id, "unmarked");
                        history::log_operation(
                            self.backend,
                            &m.id,
                            &m.hash,
                            Operation::Unmark,
                            None,
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_locked(&mut self, plan: &Plan, post_apply: &[Arc<Migration>]) -> Result<()> {
        for ghost in &plan.drop_ghost_records {
            let hash = migration_hash(ghost);
            if history::unmark_applied(self.backend, &hash).await? {
                warn!(migration = %ghost, "dropped applied record with no loaded migration");
                history::log_operation(
                    self.backend,
                    ghost,
                    &hash,
                    Operation::Unmark,
                    Some("no rollback steps: migration is absent from sources"),
                )
                .await?;
            }
        }

        for m in &plan.migrations {
            self.check_cancelled()?;
            self.run_migration(m, plan.direction, true).await?;
        }

        for hook in post_apply {
            self.check_cancelled()?;
            self.run_migration(hook, Direction::Apply, false).await?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(YoyoError::Interrupted);
        }
        Ok(())
    }

    async fn run_migration(
        &mut self,
        migration: &Migration,
        direction: Direction,
        record: bool,
    ) -> Result<()> {
        info!(migration = %migration.id, %direction, "running migration");

        if migration.transactional {
            self.backend.begin().await?;
            let result = self.run_steps(migration, direction).await;
            match result {
                Ok(()) => {
                    if record {
                        self.record(migration, direction).await?;
                    }
                    self.backend.commit().await?;
                    Ok(())
                }
                Err(e) => {
                    self.backend.rollback().await?;
                    if record {
                        self.log_failure(migration, direction, &e).await;
                    }
                    Err(e)
                }
            }
        } else {
            // No transaction, no savepoints. Anything already executed has
            // been committed; a failure leaves the database partially
            // migrated.
            let result = self.run_steps(migration, direction).await;
            match result {
                Ok(()) => {
                    if record {
                        self.record(migration, direction).await?;
                    }
                    Ok(())
                }
                Err(e) => {
                    let e = match e {
                        YoyoError::StepFailed {
                            migration,
                            statement,
                            source,
                        } => YoyoError::NonTransactionalFailure {
                            migration,
                            statement,
                            source,
                        },
                        other => other,
                    };
                    if record {
                        self.log_failure(migration, direction, &e).await;
                    }
                    Err(e)
                }
            }
        }
    }

    async fn run_steps(&mut self, migration: &Migration, direction: Direction) -> Result<()> {
        let ordered: Vec<&Step> = match direction {
            Direction::Apply => migration.steps.iter().collect(),
            Direction::Rollback => migration.steps.iter().rev().collect(),
        };
        for step in ordered {
            self.check_cancelled()?;
            self.run_step(step, direction, migration).await?;
        }
        Ok(())
    }

    /// Runs one step (or group) behind its own savepoint.
    ///
    /// Boxed because groups recurse.
    fn run_step<'b>(
        &'b mut self,
        step: &'b Step,
        direction: Direction,
        migration: &'b Migration,
    ) -> BoxFuture<'b, Result<()>> {
        Box::pin(async move {
            match step {
                Step::Single {
                    apply,
                    rollback,
                    ignore_errors,
                } => {
                    let payload = match direction {
                        Direction::Apply => Some(apply),
                        Direction::Rollback => rollback.as_ref(),
                    };
                    let Some(payload) = payload else {
                        return Ok(());
                    };

                    if migration.transactional {
                        let savepoint = self.backend.savepoint().await?;
                        match self.run_payload(payload).await {
                            Ok(()) => {
                                self.backend.release_savepoint(savepoint.as_deref()).await
                            }
                            Err(e) if ignore_errors.covers(direction) => {
                                warn!(migration = %migration.id, error = %e, "ignored step error");
                                self.backend
                                    .rollback_to_savepoint(savepoint.as_deref())
                                    .await
                            }
                            Err(e) => Err(YoyoError::StepFailed {
                                migration: migration.id.clone(),
                                statement: payload.describe(),
                                source: e,
                            }),
                        }
                    } else {
                        match self.run_payload(payload).await {
                            Ok(()) => Ok(()),
                            Err(e) if ignore_errors.covers(direction) => {
                                warn!(migration = %migration.id, error = %e, "ignored step error");
                                Ok(())
                            }
                            Err(e) => Err(YoyoError::StepFailed {
                                migration: migration.id.clone(),
                                statement: payload.describe(),
                                source: e,
                            }),
                        }
                    }
                }
                Step::Group {
                    steps,
                    ignore_errors,
                } => {
                    let ordered: Vec<&Step> = match direction {
                        Direction::Apply => steps.iter().collect(),
                        Direction::Rollback => steps.iter().rev().collect(),
                    };

                    if migration.transactional {
                        let savepoint = self.backend.savepoint().await?;
                        let mut result = Ok(());
                        for child in ordered {
                            if let Err(e) = self.run_step(child, direction, migration).await {
                                result = Err(e);
                                break;
                            }
                        }
                        match result {
                            Ok(()) => {
                                self.backend.release_savepoint(savepoint.as_deref()).await
                            }
                            Err(e) => {
                                // An unhandled failure inside the group
                                // undoes the whole group.
                                self.backend
                                    .rollback_to_savepoint(savepoint.as_deref())
                                    .await?;
                                if ignore_errors.covers(direction) {
                                    warn!(migration = %migration.id, error = %e, "ignored group error");
                                    Ok(())
                                } else {
                                    Err(e)
                                }
                            }
                        }
                    } else {
                        for child in ordered {
                            if let Err(e) = self.run_step(child, direction, migration).await {
                                if ignore_errors.covers(direction) {
                                    warn!(migration = %migration.id, error = %e, "ignored group error");
                                    return Ok(());
                                }
                                return Err(e);
                            }
                        }
                        Ok(())
                    }
                }
            }
        })
    }

    async fn run_payload(&mut self, payload: &StepPayload) -> std::result::Result<(), sqlx::Error> {
        match payload {
            StepPayload::Sql(sql) => self.backend.execute(sql).await,
            StepPayload::Batch(statements) => {
                for sql in statements {
                    self.backend.execute(sql).await?;
                }
                Ok(())
            }
            StepPayload::Code(call) => call(self.backend.connection()).await,
        }
    }

    /// Writes the applied/log rows for a finished migration. Inside the
    /// migration's transaction when there is one, autocommitted otherwise.
    async fn record(&mut self, migration: &Migration, direction: Direction) -> Result<()> {
        match direction {
            Direction::Apply => {
                history::mark_applied(self.backend, migration).await?;
                history::log_operation(
                    self.backend,
                    &migration.id,
                    &migration.hash,
                    Operation::Apply,
                    None,
                )
                .await
            }
            Direction::Rollback => {
                history::unmark_applied(self.backend, &migration.hash).await?;
                history::log_operation(
                    self.backend,
                    &migration.id,
                    &migration.hash,
                    Operation::Rollback,
                    None,
                )
                .await
            }
        }
    }

    /// Records a failed migration in the log, in a fresh autocommitted
    /// insert since the migration's transaction is already gone. Never
    /// masks the original error.
    async fn log_failure(&mut self, migration: &Migration, direction: Direction, error: &YoyoError) {
        let operation = match direction {
            Direction::Apply => Operation::Apply,
            Direction::Rollback => Operation::Rollback,
        };
        let mut comment = format!("failed: {error}");
        if comment.len() > 500 {
            let mut cut = 500;
            while !comment.is_char_boundary(cut) {
                cut -= 1;
            }
            comment.truncate(cut);
        }
        if let Err(log_error) = history::log_operation(
            self.backend,
            &migration.id,
            &migration.hash,
            operation,
            Some(&comment),
        )
        .await
        {
            warn!(migration = %migration.id, error = %log_error, "could not write failure log row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::migration::IgnoreErrors;
    use sqlx::Row;

    async fn test_backend() -> Backend {
        let registry = BackendRegistry::default();
        let mut backend = Backend::connect(&registry, "sqlite::memory:").await.unwrap();
        history::ensure_lock_table(&mut backend).await.unwrap();
        history::ensure_bookkeeping(&mut backend).await.unwrap();
        backend
    }

    fn plan(direction: Direction, migrations: Vec<Migration>) -> Plan {
        Plan {
            direction,
            migrations: migrations.into_iter().map(Arc::new).collect(),
            drop_ghost_records: Vec::new(),
        }
    }

    async fn table_exists(backend: &mut Backend, name: &str) -> bool {
        let row = sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(backend.connection())
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        count > 0
    }

    fn chain() -> Vec<Migration> {
        vec![
            Migration::new("0001").step(Step::sql(
                "CREATE TABLE t (id INT)",
                Some("DROP TABLE t".to_string()),
            )),
            Migration::new("0002").depends_on("0001").step(Step::sql(
                "ALTER TABLE t ADD c INT",
                Some("ALTER TABLE t DROP COLUMN c".to_string()),
            )),
        ]
    }

    #[tokio::test]
    async fn test_apply_then_rollback_restores_empty_applied_set() {
        let mut backend = test_backend().await;

        let apply = plan(Direction::Apply, chain());
        Executor::new(&mut backend).execute(&apply, &[]).await.unwrap();
        assert!(table_exists(&mut backend, "t").await);
        assert_eq!(
            history::applied_ids(&mut backend).await.unwrap(),
            vec!["0001", "0002"]
        );

        let mut reversed = chain();
        reversed.reverse();
        let rollback = plan(Direction::Rollback, reversed);
        Executor::new(&mut backend)
            .execute(&rollback, &[])
            .await
            .unwrap();
        assert!(!table_exists(&mut backend, "t").await);
        assert!(history::applied_ids(&mut backend).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_aborts_plan_and_rolls_back() {
        let mut backend = test_backend().await;

        let migrations = vec![
            Migration::new("0001")
                .step(Step::sql("CREATE TABLE a (id INT)", None))
                .step(Step::sql("THIS IS NOT SQL", None)),
            Migration::new("0002").step(Step::sql("CREATE TABLE b (id INT)", None)),
        ];
        let err = Executor::new(&mut backend)
            .execute(&plan(Direction::Apply, migrations), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, YoyoError::StepFailed { .. }));

        // The failing migration rolled back and 0002 was never attempted.
        assert!(!table_exists(&mut backend, "a").await);
        assert!(!table_exists(&mut backend, "b").await);
        assert!(history::applied_ids(&mut backend).await.unwrap().is_empty());

        // The failure is logged in a fresh insert.
        let row = sqlx::query("SELECT comment FROM \"_yoyo_log\" WHERE migration_id = '0001'")
            .fetch_one(backend.connection())
            .await
            .unwrap();
        let comment: Option<String> = row.try_get(0).unwrap();
        assert!(comment.unwrap().starts_with("failed:"));
    }

    #[tokio::test]
    async fn test_ignored_step_error_continues() {
        let mut backend = test_backend().await;

        let migrations = vec![
            Migration::new("0001").step(Step::sql("CREATE TABLE t (id INT)", None)),
            Migration::new("0002")
                .depends_on("0001")
                .step(Step::sql("BROKEN STATEMENT", None).ignore_errors(IgnoreErrors::Apply))
                .step(Step::sql("INSERT INTO t VALUES (1)", None)),
            Migration::new("0003")
                .depends_on("0002")
                .step(Step::sql("INSERT INTO t VALUES (2)", None)),
        ];
        Executor::new(&mut backend)
            .execute(&plan(Direction::Apply, migrations), &[])
            .await
            .unwrap();

        // 0002 recorded despite the swallowed failure; 0003 ran.
        assert_eq!(
            history::applied_ids(&mut backend).await.unwrap(),
            vec!["0001", "0002", "0003"]
        );
        let row = sqlx::query("SELECT COUNT(*) FROM t")
            .fetch_one(backend.connection())
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_group_failure_undoes_whole_group() {
        let mut backend = test_backend().await;

        let migrations = vec![Migration::new("0001")
            .step(Step::sql("CREATE TABLE t (id INT)", None))
            .step(
                Step::group(vec![
                    Step::sql("INSERT INTO t VALUES (1)", None),
                    Step::sql("BROKEN STATEMENT", None),
                ])
                .ignore_errors(IgnoreErrors::All),
            )
            .step(Step::sql("INSERT INTO t VALUES (2)", None))];
        Executor::new(&mut backend)
            .execute(&plan(Direction::Apply, migrations), &[])
            .await
            .unwrap();

        // The group's insert of 1 was rolled back with the group; the next
        // top-level step still ran.
        let rows = sqlx::query("SELECT id FROM t ORDER BY id")
            .fetch_all(backend.connection())
            .await
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.try_get(0).unwrap()).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_non_transactional_failure_leaves_partial_state() {
        let mut backend = test_backend().await;

        let migrations = vec![Migration::new("0001")
            .non_transactional()
            .step(Step::sql("CREATE TABLE kept (id INT)", None))
            .step(Step::sql("BROKEN STATEMENT", None))];
        let err = Executor::new(&mut backend)
            .execute(&plan(Direction::Apply, migrations), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, YoyoError::NonTransactionalFailure { .. }));

        // The first statement was committed; the migration is not recorded.
        assert!(table_exists(&mut backend, "kept").await);
        assert!(history::applied_ids(&mut backend).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_without_payload_is_a_noop() {
        let mut backend = test_backend().await;

        let forward = vec![Migration::new("0001").step(Step::sql("CREATE TABLE t (id INT)", None))];
        Executor::new(&mut backend)
            .execute(&plan(Direction::Apply, forward.clone()), &[])
            .await
            .unwrap();
        Executor::new(&mut backend)
            .execute(&plan(Direction::Rollback, forward), &[])
            .await
            .unwrap();

        // No rollback payload: the table stays, but the record is gone.
        assert!(table_exists(&mut backend, "t").await);
        assert!(history::applied_ids(&mut backend).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_apply_runs_unrecorded() {
        let mut backend = test_backend().await;

        let hook = Arc::new(
            Migration::new("post-apply").step(Step::sql("CREATE TABLE hooked (id INT)", None)),
        );
        let migrations = vec![Migration::new("0001").step(Step::sql("SELECT 1", None))];
        Executor::new(&mut backend)
            .execute(&plan(Direction::Apply, migrations), &[hook])
            .await
            .unwrap();

        assert!(table_exists(&mut backend, "hooked").await);
        assert_eq!(history::applied_ids(&mut backend).await.unwrap(), vec!["0001"]);
    }

    fn create_coded_table(
        conn: &mut sqlx::AnyConnection,
    ) -> BoxFuture<'_, std::result::Result<(), sqlx::Error>> {
        Box::pin(async move {
            sqlx::raw_sql("CREATE TABLE coded (id INT)").execute(conn).await?;
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_code_step_payload() {
        let mut backend = test_backend().await;

        let apply: crate::migration::StepFn = Arc::new(create_coded_table);
        let migrations = vec![Migration::new("0001").step(Step::code(apply, None))];
        Executor::new(&mut backend)
            .execute(&plan(Direction::Apply, migrations), &[])
            .await
            .unwrap();
        assert!(table_exists(&mut backend, "coded").await);
    }

    #[tokio::test]
    async fn test_mark_and_unmark_without_executing() {
        let mut backend = test_backend().await;

        let migrations = chain();
        Executor::new(&mut backend)
            .mark(&plan(Direction::Apply, migrations.clone()))
            .await
            .unwrap();
        // No steps ran.
        assert!(!table_exists(&mut backend, "t").await);
        assert_eq!(
            history::applied_ids(&mut backend).await.unwrap(),
            vec!["0001", "0002"]
        );

        let mut reversed = migrations;
        reversed.reverse();
        Executor::new(&mut backend)
            .mark(&plan(Direction::Rollback, reversed))
            .await
            .unwrap();
        assert!(history::applied_ids(&mut backend).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut backend = test_backend().await;
        let token = CancellationToken::new();
        token.cancel();

        let migrations = vec![Migration::new("0001").step(Step::sql("CREATE TABLE t (id INT)", None))];
        let err = Executor::new(&mut backend)
            .with_cancellation(token)
            .execute(&plan(Direction::Apply, migrations), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, YoyoError::Interrupted));
        assert!(!table_exists(&mut backend, "t").await);
        // The lock was still released.
        let row = sqlx::query("SELECT COUNT(*) FROM \"yoyo_lock\"")
            .fetch_one(backend.connection())
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_ghost_records_dropped_before_rollback() {
        let mut backend = test_backend().await;
        history::mark_applied(&mut backend, &Migration::new("gone"))
            .await
            .unwrap();

        let p = Plan {
            direction: Direction::Rollback,
            migrations: Vec::new(),
            drop_ghost_records: vec!["gone".to_string()],
        };
        Executor::new(&mut backend).execute(&p, &[]).await.unwrap();
        assert!(history::applied_ids(&mut backend).await.unwrap().is_empty());
    }
}
