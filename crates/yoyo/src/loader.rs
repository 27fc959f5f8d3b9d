//! Migration source loading.
//!
//! A source specifier is either a filesystem path (glob metacharacters
//! allowed; every match is scanned as a directory) or the form
//! `package:<name>:<subpath>`, resolved against a registry of directories
//! embedded with [`include_dir`] by the embedding application.
//!
//! Within a directory, `<stem>.sql` is an apply file whose optional sibling
//! `<stem>.rollback.sql` supplies the rollback, and files whose stem starts
//! with `post-apply` become post-apply hooks instead of graph vertices.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use include_dir::Dir;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Result, YoyoError};
use crate::graph::MigrationSet;
use crate::migration::{migration_hash, Migration, MigrationKind, Step, StepPayload};
use crate::sqlsplit::split_statements;

const SQL_EXTENSION: &str = "sql";
const ROLLBACK_SUFFIX: &str = ".rollback.sql";

/// A directive line: `-- depends: a b` or `-- transactional: false`,
/// case-insensitive, anywhere in the file.
static DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*--\s*(depends|transactional)\s*:\s*(.*)$").expect("directive pattern")
});

/// Loads migrations from source specifiers.
///
/// The loader owns the registry of embedded packages; it touches nothing
/// but the filesystem and performs no database work, so every load error
/// surfaces before a connection is opened.
#[derive(Default)]
pub struct SourceLoader {
    packages: HashMap<String, &'static Dir<'static>>,
}

impl SourceLoader {
    /// Creates a loader with no registered packages.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an embedded migration directory under a package name,
    /// making `package:<name>:<subpath>` specifiers resolvable.
    pub fn register_package(&mut self, name: impl Into<String>, dir: &'static Dir<'static>) {
        self.packages.insert(name.into(), dir);
    }

    /// Reads all migrations from the given source specifiers.
    ///
    /// Directories are processed in specifier order, files in name order
    /// within each directory. A stem appearing twice anywhere is fatal.
    pub fn load(&self, sources: &[String]) -> Result<MigrationSet> {
        let mut set = MigrationSet::new();
        for source in sources {
            match source.strip_prefix("package:") {
                Some(rest) => self.load_package(rest, source, &mut set)?,
                None => self.load_paths(source, &mut set)?,
            }
        }
        Ok(set)
    }

    fn load_package(&self, rest: &str, source: &str, set: &mut MigrationSet) -> Result<()> {
        let (name, subpath) = rest
            .split_once(':')
            .ok_or_else(|| YoyoError::BadSource(source.to_string()))?;
        let root = self
            .packages
            .get(name)
            .ok_or_else(|| YoyoError::UnknownPackage(name.to_string()))?;
        let dir = if subpath.is_empty() {
            *root
        } else {
            root.get_dir(subpath)
                .ok_or_else(|| YoyoError::BadSource(source.to_string()))?
        };

        let mut entries: Vec<&include_dir::File<'_>> = dir.files().collect();
        entries.sort_by_key(|f| f.path().to_path_buf());

        let read = |path: &Path| -> Result<Option<String>> {
            match dir.files().find(|f| f.path() == path) {
                Some(f) => f
                    .contents_utf8()
                    .map(|s| Some(s.to_string()))
                    .ok_or_else(|| YoyoError::BadSource(path.display().to_string())),
                None => Ok(None),
            }
        };

        for file in entries {
            let path = file.path().to_path_buf();
            if let Some(stem) = apply_stem(&path) {
                let apply = read(&path)?.expect("listed file is readable");
                let rollback = read(&rollback_path(&path))?;
                let display = PathBuf::from(format!("{source}/{}", path.display()));
                set.push(parse_sql_migration(&stem, display, &apply, rollback)?)?;
            }
        }
        Ok(())
    }

    fn load_paths(&self, source: &str, set: &mut MigrationSet) -> Result<()> {
        let pattern =
            glob::glob(source).map_err(|_| YoyoError::BadSource(source.to_string()))?;
        let mut matched = false;
        for entry in pattern {
            let dir = entry.map_err(|e| YoyoError::Io(e.into_error()))?;
            if !dir.is_dir() {
                continue;
            }
            matched = true;
            self.load_directory(&dir, set)?;
        }
        if !matched {
            warn!(source, "migration source matched no directories");
        }
        Ok(())
    }

    fn load_directory(&self, dir: &Path, set: &mut MigrationSet) -> Result<()> {
        debug!(dir = %dir.display(), "scanning migration directory");
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .collect();
        paths.sort();

        for path in paths {
            if let Some(stem) = apply_stem(&path) {
                let apply = fs::read_to_string(&path)?;
                let rollback = match fs::read_to_string(rollback_path(&path)) {
                    Ok(text) => Some(text),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(e.into()),
                };
                let display = fs::canonicalize(&path).unwrap_or(path);
                set.push(parse_sql_migration(&stem, display, &apply, rollback)?)?;
            }
        }
        Ok(())
    }
}

/// Returns the migration stem for an apply file, or `None` for anything
/// that is not one (rollback siblings, other extensions, directories).
fn apply_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.ends_with(ROLLBACK_SUFFIX) {
        return None;
    }
    if path.extension()?.to_str()? != SQL_EXTENSION {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_string())
}

fn rollback_path(apply: &Path) -> PathBuf {
    apply.with_extension("rollback.sql")
}

/// Parsed `--` directives of one SQL file.
#[derive(Debug, Default, PartialEq)]
struct Directives {
    depends: Vec<String>,
    transactional: Option<bool>,
}

fn parse_directives(path: &Path, sql: &str) -> Result<Directives> {
    let mut directives = Directives::default();
    for line in sql.lines() {
        let Some(captures) = DIRECTIVE.captures(line) else {
            continue;
        };
        let value = captures[2].trim();
        match captures[1].to_ascii_lowercase().as_str() {
            // Multiple depends lines accumulate.
            "depends" => directives
                .depends
                .extend(value.split_whitespace().map(str::to_string)),
            "transactional" => {
                let flag = match value.to_ascii_lowercase().as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(YoyoError::BadDirective {
                            path: path.to_path_buf(),
                            message: format!(
                                "transactional must be 'true' or 'false', got '{other}'"
                            ),
                        })
                    }
                };
                directives.transactional = Some(flag);
            }
            _ => unreachable!("pattern only matches known directives"),
        }
    }
    Ok(directives)
}

/// Builds a [`Migration`] from an apply file and its optional rollback
/// sibling.
///
/// When the statement counts match, apply statement `i` pairs with rollback
/// statement `n - 1 - i`; otherwise the entire rollback file, in file
/// order, attaches to the last apply step as one batch.
fn parse_sql_migration(
    stem: &str,
    path: PathBuf,
    apply_sql: &str,
    rollback_sql: Option<String>,
) -> Result<Migration> {
    let directives = parse_directives(&path, apply_sql)?;
    let apply_statements = split_statements(apply_sql);
    let rollback_statements = rollback_sql.as_deref().map(split_statements);

    let n = apply_statements.len();
    let mut steps = Vec::with_capacity(n);
    for (i, statement) in apply_statements.into_iter().enumerate() {
        let rollback = match &rollback_statements {
            Some(rb) if rb.len() == n => Some(StepPayload::Sql(rb[n - 1 - i].clone())),
            Some(rb) if !rb.is_empty() && i == n - 1 => Some(StepPayload::Batch(rb.clone())),
            _ => None,
        };
        steps.push(Step::Single {
            apply: StepPayload::Sql(statement),
            rollback,
            ignore_errors: Default::default(),
        });
    }

    Ok(Migration {
        id: stem.to_string(),
        hash: migration_hash(stem),
        source_path: Some(path),
        kind: MigrationKind::SqlPair,
        depends_on: directives.depends.into_iter().collect(),
        steps,
        transactional: directives.transactional.unwrap_or(true),
        is_post_apply: stem.starts_with(crate::migration::POST_APPLY_STEM),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn load(dir: &Path) -> MigrationSet {
        SourceLoader::new()
            .load(&[dir.display().to_string()])
            .unwrap()
    }

    #[test]
    fn test_load_sql_pair() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "0001.sql", "CREATE TABLE t (id INT);\n");
        write(tmp.path(), "0001.rollback.sql", "DROP TABLE t;\n");

        let set = load(tmp.path());
        assert_eq!(set.len(), 1);
        let m = set.get("0001").unwrap();
        assert_eq!(m.kind, MigrationKind::SqlPair);
        assert!(m.transactional);
        assert_eq!(m.steps.len(), 1);
        match &m.steps[0] {
            Step::Single {
                apply: StepPayload::Sql(apply),
                rollback: Some(StepPayload::Sql(rollback)),
                ..
            } => {
                assert_eq!(apply, "CREATE TABLE t (id INT)");
                assert_eq!(rollback, "DROP TABLE t");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_rollback_pairing_reverses_when_counts_match() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "0001.sql", "CREATE TABLE a (id INT);\nCREATE TABLE b (id INT);");
        write(tmp.path(), "0001.rollback.sql", "DROP TABLE b;\nDROP TABLE a;");

        let set = load(tmp.path());
        let m = set.get("0001").unwrap();
        let rollbacks: Vec<_> = m
            .steps
            .iter()
            .map(|s| match s {
                Step::Single {
                    rollback: Some(StepPayload::Sql(sql)),
                    ..
                } => sql.clone(),
                other => panic!("unexpected step: {other:?}"),
            })
            .collect();
        // Statement i pairs with rollback statement n-1-i.
        assert_eq!(rollbacks, vec!["DROP TABLE a", "DROP TABLE b"]);
    }

    #[test]
    fn test_rollback_count_mismatch_attaches_batch_to_last_step() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "0001.sql", "CREATE TABLE a (id INT);\nCREATE TABLE b (id INT);");
        write(
            tmp.path(),
            "0001.rollback.sql",
            "DROP TABLE b;\nDROP TABLE a;\nDROP TABLE z;",
        );

        let set = load(tmp.path());
        let m = set.get("0001").unwrap();
        match &m.steps[0] {
            Step::Single { rollback: None, .. } => {}
            other => panic!("first step should have no rollback: {other:?}"),
        }
        match &m.steps[1] {
            Step::Single {
                rollback: Some(StepPayload::Batch(stmts)),
                ..
            } => {
                assert_eq!(stmts, &["DROP TABLE b", "DROP TABLE a", "DROP TABLE z"]);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_directives() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "0002.sql",
            "-- depends: 0001 0000\n-- Transactional: FALSE\nCREATE INDEX i ON t (c);",
        );
        write(tmp.path(), "0001.sql", "SELECT 1;");
        write(tmp.path(), "0000.sql", "SELECT 1;");

        let set = load(tmp.path());
        let m = set.get("0002").unwrap();
        assert!(!m.transactional);
        assert!(m.depends_on.contains("0001"));
        assert!(m.depends_on.contains("0000"));
    }

    #[test]
    fn test_depends_lines_accumulate() {
        let path = PathBuf::from("x.sql");
        let d = parse_directives(&path, "-- depends: a b\nSELECT 1;\n-- depends: c\n").unwrap();
        assert_eq!(d.depends, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_malformed_transactional_directive() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "0001.sql", "-- transactional: maybe\nSELECT 1;");
        let err = SourceLoader::new()
            .load(&[tmp.path().display().to_string()])
            .unwrap_err();
        assert!(matches!(err, YoyoError::BadDirective { .. }));
    }

    #[test]
    fn test_post_apply_files_become_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "0001.sql", "SELECT 1;");
        write(tmp.path(), "post-apply.sql", "SELECT 2;");

        let set = load(tmp.path());
        assert_eq!(set.len(), 1);
        assert_eq!(set.post_apply().len(), 1);
        assert!(set.post_apply()[0].is_post_apply);
    }

    #[test]
    fn test_duplicate_stem_across_directories_is_fatal() {
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        write(tmp_a.path(), "0001.sql", "SELECT 1;");
        write(tmp_b.path(), "0001.sql", "SELECT 2;");

        let err = SourceLoader::new()
            .load(&[
                tmp_a.path().display().to_string(),
                tmp_b.path().display().to_string(),
            ])
            .unwrap_err();
        assert!(matches!(err, YoyoError::DuplicateMigration(id) if id == "0001"));
    }

    #[test]
    fn test_glob_source() {
        let tmp = tempfile::tempdir().unwrap();
        let sub_a = tmp.path().join("app-a");
        let sub_b = tmp.path().join("app-b");
        fs::create_dir(&sub_a).unwrap();
        fs::create_dir(&sub_b).unwrap();
        write(&sub_a, "0001.sql", "SELECT 1;");
        write(&sub_b, "0002.sql", "SELECT 2;");

        let pattern = tmp.path().join("app-*").display().to_string();
        let set = SourceLoader::new().load(&[pattern]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("0001") && set.contains("0002"));
    }

    #[test]
    fn test_missing_source_is_empty_not_fatal() {
        let set = SourceLoader::new()
            .load(&["/no/such/dir".to_string()])
            .unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_non_sql_files_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "README.md", "not a migration");
        write(tmp.path(), "0001.sql", "SELECT 1;");
        let set = load(tmp.path());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_rollback_file_not_loaded_alone() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "0001.rollback.sql", "DROP TABLE t;");
        let set = load(tmp.path());
        assert!(set.is_empty());
    }

    static EMBEDDED: Dir<'static> = include_dir::include_dir!("$CARGO_MANIFEST_DIR/testdata/embedded");

    #[test]
    fn test_package_source() {
        let mut loader = SourceLoader::new();
        loader.register_package("demo", &EMBEDDED);
        let set = loader.load(&["package:demo:".to_string()]).unwrap();
        assert!(set.contains("0001-init"));
    }

    #[test]
    fn test_unknown_package_is_fatal() {
        let err = SourceLoader::new()
            .load(&["package:nope:migrations".to_string()])
            .unwrap_err();
        assert!(matches!(err, YoyoError::UnknownPackage(name) if name == "nope"));
    }
}
