//! Plan construction.
//!
//! A plan is the ordered list of migrations one command will execute in a
//! single direction. Apply plans follow the canonical order; rollback plans
//! are exactly its reverse over the selected set, so dependents are always
//! undone before their dependencies.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, YoyoError};
use crate::graph::DependencyGraph;
use crate::migration::{Direction, Migration};

/// The ordered list of migrations a command will execute.
#[derive(Debug)]
pub struct Plan {
    /// Direction the migrations run in.
    pub direction: Direction,
    /// Migrations in execution order.
    pub migrations: Vec<Arc<Migration>>,
    /// Applied records of ghost migrations to delete before execution.
    ///
    /// Only populated by ghost-aware rollback: bookkeeping cannot
    /// reconstruct a ghost's steps, so dropping the record is all the
    /// engine can replay.
    pub drop_ghost_records: Vec<String>,
}

impl Plan {
    /// Returns whether the plan does nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty() && self.drop_ghost_records.is_empty()
    }

    /// The migration ids in execution order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.id.as_str()).collect()
    }
}

/// Builds the apply plan: the canonical order of unapplied migrations, or
/// of the target and its unapplied ancestors when a target is named.
pub fn apply_plan(
    graph: &DependencyGraph,
    applied: &[String],
    target: Option<&str>,
) -> Result<Plan> {
    let applied_set: HashSet<&str> = applied.iter().map(String::as_str).collect();

    let selected: Vec<Arc<Migration>> = match target {
        Some(id) => {
            require_loaded(graph, id)?;
            let mut ids = graph.ancestors(id);
            ids.insert(id.to_string());
            graph.canonical_subset(&ids)
        }
        None => graph.canonical(),
    };

    let migrations = selected
        .into_iter()
        .filter(|m| !applied_set.contains(m.id.as_str()))
        .collect();

    Ok(Plan {
        direction: Direction::Apply,
        migrations,
        drop_ghost_records: Vec::new(),
    })
}

/// Builds the rollback plan: the reverse canonical order of the applied
/// migrations, restricted to the target and its descendants when a target
/// is named.
///
/// A targeted rollback is refused while ghost migrations were applied after
/// the target, since their rollback steps cannot be reconstructed. In
/// ghost-aware mode the ghosts' applied records are dropped instead, newest
/// first, before the plan runs.
pub fn rollback_plan(
    graph: &DependencyGraph,
    applied: &[String],
    target: Option<&str>,
    ghost_aware: bool,
) -> Result<Plan> {
    let applied_set: HashSet<&str> = applied.iter().map(String::as_str).collect();

    let selected: Vec<Arc<Migration>> = match target {
        Some(id) => {
            require_loaded(graph, id)?;
            let mut ids = graph.descendants(id);
            ids.insert(id.to_string());
            graph.canonical_subset(&ids)
        }
        None => graph.canonical(),
    };

    let mut migrations: Vec<Arc<Migration>> = selected
        .into_iter()
        .filter(|m| applied_set.contains(m.id.as_str()))
        .collect();
    migrations.reverse();

    let mut drop_ghost_records = Vec::new();
    match target {
        Some(id) if applied_set.contains(id) => {
            // Ghosts applied after the target are, for all the engine can
            // tell, descendants it cannot roll back.
            let position = applied.iter().position(|a| a == id).expect("target is applied");
            let ghosts_after: Vec<String> = applied[position + 1..]
                .iter()
                .filter(|a| graph.ghosts().contains(*a))
                .cloned()
                .collect();
            if !ghosts_after.is_empty() {
                if !ghost_aware {
                    return Err(YoyoError::DanglingRollback {
                        migration: id.to_string(),
                        ghosts: ghosts_after,
                    });
                }
                drop_ghost_records = ghosts_after.into_iter().rev().collect();
            }
        }
        None if !graph.ghosts().is_empty() => {
            if ghost_aware {
                drop_ghost_records = applied
                    .iter()
                    .rev()
                    .filter(|id| graph.ghosts().contains(*id))
                    .cloned()
                    .collect();
            } else {
                warn!(
                    ghosts = %graph.ghosts().iter().cloned().collect::<Vec<_>>().join(", "),
                    "applied migrations not present in sources are left in place"
                );
            }
        }
        _ => {}
    }

    Ok(Plan {
        direction: Direction::Rollback,
        migrations,
        drop_ghost_records,
    })
}

fn require_loaded(graph: &DependencyGraph, id: &str) -> Result<()> {
    if graph.get(id).is_none() {
        return Err(YoyoError::MigrationNotFound(id.to_string()));
    }
    Ok(())
}
