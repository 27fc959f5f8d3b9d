//! The command surface.
//!
//! Each command is a thin front-end: build a plan from the graph and the
//! current applied-set, then hand it to the executor. A [`Session`] holds
//! everything a command needs — the loaded sources, the validated graph,
//! the applied-set and the connection — so the CLI can preview a plan,
//! confirm it with the user, and only then execute it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::backend::{Backend, BackendRegistry, DatabaseUrl};
use crate::error::{Result, YoyoError};
use crate::executor::{CancellationToken, Executor};
use crate::graph::{DependencyGraph, MigrationSet};
use crate::history;
use crate::loader::SourceLoader;
use crate::lock;
use crate::migration::Direction;
use crate::planner::{self, Plan};

/// The resolved, flat settings a command runs with. Produced by the CLI
/// (or any other front-end); the engine itself reads no configuration and
/// no environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Connection URL.
    pub database_url: String,
    /// Source specifiers, in order.
    pub sources: Vec<String>,
    /// How long to wait for the cross-process lock.
    pub lock_timeout: Duration,
}

impl Settings {
    /// Creates settings with the default lock timeout.
    #[must_use]
    pub fn new(database_url: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            database_url: database_url.into(),
            sources,
            lock_timeout: lock::DEFAULT_TIMEOUT,
        }
    }
}

/// One line of `list` output.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Migration id.
    pub id: String,
    /// Whether it is recorded as applied.
    pub applied: bool,
    /// When it was applied, if it is.
    pub applied_at: Option<DateTime<Utc>>,
    /// True for applied ids whose file is no longer present.
    pub ghost: bool,
}

/// A loaded source set, validated graph and live connection.
pub struct Session {
    backend: Backend,
    set: MigrationSet,
    graph: DependencyGraph,
    applied: Vec<String>,
    lock_timeout: Duration,
    cancel: CancellationToken,
}

impl Session {
    /// Loads sources, connects, brings bookkeeping up to date and
    /// validates the graph. Every load error surfaces before the
    /// connection is opened.
    pub async fn open(
        registry: &BackendRegistry,
        loader: &SourceLoader,
        settings: &Settings,
    ) -> Result<Self> {
        let set = loader.load(&settings.sources)?;
        crate::graph::check_cycles(&set)?;
        let url = DatabaseUrl::parse(&settings.database_url)?;
        let mut backend = Backend::connect_url(registry, url).await?;
        history::ensure_lock_table(&mut backend).await?;
        history::ensure_bookkeeping(&mut backend).await?;
        let applied = history::applied_ids(&mut backend).await?;
        let graph = DependencyGraph::new(&set, &applied)?;
        Ok(Self {
            backend,
            set,
            graph,
            applied,
            lock_timeout: settings.lock_timeout,
            cancel: CancellationToken::new(),
        })
    }

    /// Installs a cancellation token, checked between steps.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The loaded migration set.
    #[must_use]
    pub fn migrations(&self) -> &MigrationSet {
        &self.set
    }

    /// The applied ids, in applied order.
    #[must_use]
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    /// Plan for `apply`: all unapplied migrations, or the target and its
    /// unapplied ancestors.
    pub fn apply_plan(&self, target: Option<&str>) -> Result<Plan> {
        planner::apply_plan(&self.graph, &self.applied, target)
    }

    /// Plan for `rollback`: applied migrations in reverse apply order,
    /// restricted to the target and its descendants when one is named.
    pub fn rollback_plan(&self, target: Option<&str>, ghost_aware: bool) -> Result<Plan> {
        planner::rollback_plan(&self.graph, &self.applied, target, ghost_aware)
    }

    /// Plans for `reapply`: the rollback plan, then the same migrations in
    /// forward order.
    pub fn reapply_plans(&self, target: Option<&str>, ghost_aware: bool) -> Result<(Plan, Plan)> {
        let rollback = self.rollback_plan(target, ghost_aware)?;
        let mut forward = rollback.migrations.clone();
        forward.reverse();
        let apply = Plan {
            direction: Direction::Apply,
            migrations: forward,
            drop_ghost_records: Vec::new(),
        };
        Ok((rollback, apply))
    }

    /// Plans for `develop`: apply everything unapplied; when nothing is,
    /// roll back the `n` most recently applied migrations (newest first,
    /// from the log) and reapply them in forward order.
    pub async fn develop_plans(&mut self, n: usize) -> Result<Vec<Plan>> {
        let apply = self.apply_plan(None)?;
        if !apply.is_empty() {
            return Ok(vec![apply]);
        }

        let recent = history::recently_applied_ids(&mut self.backend, n).await?;
        let mut rollback_migrations = Vec::with_capacity(recent.len());
        for id in &recent {
            let m = self
                .graph
                .get(id)
                .ok_or_else(|| YoyoError::MigrationNotFound(id.clone()))?;
            rollback_migrations.push(m.clone());
        }
        let mut forward = rollback_migrations.clone();
        forward.reverse();
        Ok(vec![
            Plan {
                direction: Direction::Rollback,
                migrations: rollback_migrations,
                drop_ghost_records: Vec::new(),
            },
            Plan {
                direction: Direction::Apply,
                migrations: forward,
                drop_ghost_records: Vec::new(),
            },
        ])
    }

    /// Executes a plan (steps, bookkeeping and post-apply hooks) under the
    /// lock, then refreshes the cached applied-set.
    pub async fn execute(&mut self, plan: &Plan) -> Result<()> {
        let post_apply: Vec<_> = self.set.post_apply().to_vec();
        Executor::new(&mut self.backend)
            .with_cancellation(self.cancel.clone())
            .with_lock_timeout(self.lock_timeout)
            .execute(plan, &post_apply)
            .await?;
        self.refresh().await
    }

    /// Executes a plan as bookkeeping-only updates (`mark`/`unmark`).
    pub async fn execute_mark(&mut self, plan: &Plan) -> Result<()> {
        Executor::new(&mut self.backend)
            .with_cancellation(self.cancel.clone())
            .with_lock_timeout(self.lock_timeout)
            .mark(plan)
            .await?;
        self.refresh().await
    }

    /// Re-reads the applied-set and rebuilds the graph.
    pub async fn refresh(&mut self) -> Result<()> {
        self.applied = history::applied_ids(&mut self.backend).await?;
        self.graph = DependencyGraph::new(&self.set, &self.applied)?;
        Ok(())
    }

    /// `list`: every loaded migration in canonical order with its applied
    /// state, followed by any ghosts. Reads committed rows only and takes
    /// no lock.
    pub async fn list(&mut self) -> Result<Vec<MigrationStatus>> {
        let applied = history::applied_migrations(&mut self.backend).await?;
        let mut statuses = Vec::new();
        for m in self.graph.canonical() {
            let row = applied.iter().find(|a| a.id == m.id);
            statuses.push(MigrationStatus {
                id: m.id.clone(),
                applied: row.is_some(),
                applied_at: row.map(|a| a.applied_at),
                ghost: false,
            });
        }
        for ghost in self.graph.ghosts() {
            let row = applied.iter().find(|a| &a.id == ghost);
            statuses.push(MigrationStatus {
                id: ghost.clone(),
                applied: true,
                applied_at: row.map(|a| a.applied_at),
                ghost: true,
            });
        }
        Ok(statuses)
    }

    /// Closes the connection.
    pub async fn close(self) {
        self.backend.close().await;
    }
}

/// Connects without loading sources. `init` and `break-lock` use this so
/// they work even when the source directories are broken or absent.
pub async fn open_backend(registry: &BackendRegistry, settings: &Settings) -> Result<Backend> {
    let url = DatabaseUrl::parse(&settings.database_url)?;
    let mut backend = Backend::connect_url(registry, url).await?;
    history::ensure_lock_table(&mut backend).await?;
    Ok(backend)
}

/// `init`: create or upgrade the bookkeeping tables and do nothing else.
pub async fn init(registry: &BackendRegistry, settings: &Settings) -> Result<()> {
    let mut backend = open_backend(registry, settings).await?;
    history::ensure_bookkeeping(&mut backend).await?;
    backend.close().await;
    Ok(())
}

/// `break-lock`: remove any sentinel lock row left by a dead process.
pub async fn break_lock(registry: &BackendRegistry, settings: &Settings) -> Result<()> {
    let mut backend = open_backend(registry, settings).await?;
    lock::break_lock(&mut backend).await?;
    backend.close().await;
    Ok(())
}

/// `new`: write a skeleton migration file into `directory`, numbered after
/// the highest existing sequence and depending on the current heads of the
/// loaded graph. Editor launching and templating stay in the front-end.
pub fn new_migration(
    set: &MigrationSet,
    directory: &Path,
    message: Option<&str>,
) -> Result<PathBuf> {
    let next = set
        .migrations()
        .iter()
        .filter_map(|m| leading_number(&m.id))
        .max()
        .unwrap_or(0)
        + 1;

    let slug = message.map(slugify).filter(|s| !s.is_empty());
    let stem = match slug {
        Some(slug) => format!("{next:04}-{slug}"),
        None => format!("{next:04}"),
    };

    let mut content = String::new();
    if let Some(message) = message {
        content.push_str(&format!("-- {message}\n"));
    }
    let heads = depends_line(set);
    if !heads.is_empty() {
        content.push_str(&format!("-- depends: {heads}\n"));
    }
    content.push('\n');

    std::fs::create_dir_all(directory)?;
    let path = directory.join(format!("{stem}.sql"));
    std::fs::write(&path, content)?;
    info!(path = %path.display(), "created migration");
    Ok(path)
}

fn leading_number(id: &str) -> Option<u32> {
    let digits: String = id.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn slugify(message: &str) -> String {
    let mut slug = String::with_capacity(message.len());
    for c in message.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// The ids no loaded migration depends on, as a `depends:` value.
fn depends_line(set: &MigrationSet) -> String {
    let mut heads: Vec<&str> = set
        .migrations()
        .iter()
        .filter(|m| {
            !set.migrations()
                .iter()
                .any(|other| other.depends_on.contains(&m.id))
        })
        .map(|m| m.id.as_str())
        .collect();
    heads.sort_unstable();
    heads.join(" ")
}
