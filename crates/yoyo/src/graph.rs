//! Migration dependency graph.
//!
//! [`MigrationSet`] is the loader's output: an ordered, duplicate-checked
//! collection of migrations plus any post-apply hooks. [`DependencyGraph`]
//! validates the set against the applied-set read from bookkeeping, owns
//! the ghost vertices (applied ids with no loaded counterpart), and
//! produces the canonical order every plan is built from.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Result, YoyoError};
use crate::migration::Migration;

/// An ordered collection of loaded migrations.
///
/// Post-apply hooks are kept separately: they are not graph vertices and
/// never take part in planning.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    items: Vec<Arc<Migration>>,
    post_apply: Vec<Arc<Migration>>,
    ids: HashSet<String>,
}

impl MigrationSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a migration, routing post-apply hooks to their own list.
    ///
    /// Two graph migrations with the same id are a load-time error, whatever
    /// sources they came from.
    pub fn push(&mut self, migration: Migration) -> Result<()> {
        if migration.is_post_apply {
            self.post_apply.push(Arc::new(migration));
            return Ok(());
        }
        if !self.ids.insert(migration.id.clone()) {
            return Err(YoyoError::DuplicateMigration(migration.id));
        }
        self.items.push(Arc::new(migration));
        Ok(())
    }

    /// The loaded migrations, in load order.
    #[must_use]
    pub fn migrations(&self) -> &[Arc<Migration>] {
        &self.items
    }

    /// The post-apply hooks, in load order.
    #[must_use]
    pub fn post_apply(&self) -> &[Arc<Migration>] {
        &self.post_apply
    }

    /// Looks up a migration by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Migration>> {
        self.items.iter().find(|m| m.id == id)
    }

    /// Returns whether the set contains the id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Number of loaded migrations (excluding post-apply hooks).
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether no migrations were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The validated dependency graph over a [`MigrationSet`].
///
/// Edges point from dependency to dependent. An applied id that is absent
/// from the loaded set becomes a ghost: it satisfies dependencies but is
/// never selected to apply and carries no edges of its own.
#[derive(Debug)]
pub struct DependencyGraph {
    vertices: BTreeMap<String, Arc<Migration>>,
    /// dependency id -> dependent ids, restricted to loaded vertices.
    dependents: HashMap<String, BTreeSet<String>>,
    ghosts: BTreeSet<String>,
    canonical: Vec<String>,
}

impl DependencyGraph {
    /// Builds and validates the graph.
    ///
    /// Fails on a dependency id that is neither loaded nor applied, and on
    /// cycles. Duplicate ids were already rejected by [`MigrationSet`].
    pub fn new(set: &MigrationSet, applied: &[String]) -> Result<Self> {
        let applied_ids: HashSet<&str> = applied.iter().map(String::as_str).collect();

        let mut vertices = BTreeMap::new();
        for m in set.migrations() {
            vertices.insert(m.id.clone(), Arc::clone(m));
        }

        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for m in set.migrations() {
            for dep in &m.depends_on {
                if vertices.contains_key(dep) {
                    dependents
                        .entry(dep.clone())
                        .or_default()
                        .insert(m.id.clone());
                } else if !applied_ids.contains(dep.as_str()) {
                    return Err(YoyoError::UnknownDependency {
                        migration: m.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let ghosts: BTreeSet<String> = applied
            .iter()
            .filter(|id| !vertices.contains_key(*id))
            .cloned()
            .collect();

        let canonical = canonical_order(&vertices, &dependents)?;

        Ok(Self {
            vertices,
            dependents,
            ghosts,
            canonical,
        })
    }

    /// Looks up a loaded vertex.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Migration>> {
        self.vertices.get(id)
    }

    /// Applied ids with no loaded counterpart.
    #[must_use]
    pub fn ghosts(&self) -> &BTreeSet<String> {
        &self.ghosts
    }

    /// The canonical order of all loaded migrations: a deterministic
    /// topological sort that picks, among ready vertices, the
    /// lexicographically smallest id. Dependency-then-filename order,
    /// stable across runs.
    #[must_use]
    pub fn canonical(&self) -> Vec<Arc<Migration>> {
        self.canonical
            .iter()
            .map(|id| Arc::clone(&self.vertices[id]))
            .collect()
    }

    /// Restricts the canonical order to the given ids.
    #[must_use]
    pub fn canonical_subset(&self, ids: &HashSet<String>) -> Vec<Arc<Migration>> {
        self.canonical
            .iter()
            .filter(|id| ids.contains(*id))
            .map(|id| Arc::clone(&self.vertices[id]))
            .collect()
    }

    /// Transitive dependencies of `id`, restricted to loaded vertices.
    #[must_use]
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(m) = self.vertices.get(current) {
                for dep in &m.depends_on {
                    if self.vertices.contains_key(dep) && seen.insert(dep.clone()) {
                        stack.push(dep);
                    }
                }
            }
        }
        seen
    }

    /// Transitive dependents of `id`.
    #[must_use]
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        stack.push(child);
                    }
                }
            }
        }
        seen
    }

    /// Loaded migrations that no other loaded migration depends on.
    #[must_use]
    pub fn heads(&self) -> Vec<Arc<Migration>> {
        self.canonical
            .iter()
            .filter(|id| {
                self.dependents
                    .get(*id)
                    .map_or(true, |children| children.is_empty())
            })
            .map(|id| Arc::clone(&self.vertices[id]))
            .collect()
    }
}

/// Validates that the loaded set is acyclic, without reference to an
/// applied-set. Commands run this before opening a connection so a cyclic
/// source tree never gets as far as the database.
pub fn check_cycles(set: &MigrationSet) -> Result<()> {
    let mut vertices = BTreeMap::new();
    for m in set.migrations() {
        vertices.insert(m.id.clone(), Arc::clone(m));
    }
    let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
    for m in set.migrations() {
        for dep in &m.depends_on {
            if vertices.contains_key(dep) {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(m.id.clone());
            }
        }
    }
    canonical_order(&vertices, &dependents).map(|_| ())
}

/// Kahn's algorithm with a deterministic tie-break: among vertices whose
/// in-set dependencies are all emitted, always pick the smallest id.
fn canonical_order(
    vertices: &BTreeMap<String, Arc<Migration>>,
    dependents: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    for (id, m) in vertices {
        let in_set = m
            .depends_on
            .iter()
            .filter(|dep| vertices.contains_key(*dep))
            .count();
        indegree.insert(id.as_str(), in_set);
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(vertices.len());
    while let Some(id) = ready.iter().next().copied() {
        ready.remove(id);
        order.push(id.to_string());
        if let Some(children) = dependents.get(id) {
            for child in children {
                let n = indegree
                    .get_mut(child.as_str())
                    .expect("dependent is a vertex");
                *n -= 1;
                if *n == 0 {
                    ready.insert(child.as_str());
                }
            }
        }
    }

    if order.len() != vertices.len() {
        let mut cycle: Vec<String> = indegree
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        cycle.sort();
        return Err(YoyoError::CircularDependencies(cycle));
    }
    Ok(order)
}
