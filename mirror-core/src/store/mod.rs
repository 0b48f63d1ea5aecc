//! SQLite state store shared by the syncer and the webhook receiver.
//!
//! Three tables: `repos` (org/name identity with a surrogate id),
//! `branch_cursors` (last handled upstream PR per tuple) and `pending_prs`
//! (at most one in-flight sync attempt per tuple). Both processes open the
//! same database file; writes are serialized by SQLite and the tuple
//! uniqueness constraints arbitrate any race between them.
//!
//! # Schema versioning
//!
//! A `schema_version` table tracks the schema. Migrations run sequentially
//! from the stored version to [`CURRENT_SCHEMA_VERSION`] at open time.


use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;

/// Current schema version. Bump when the schema changes and add a matching
/// step in `run_migrations`.
const CURRENT_SCHEMA_VERSION: i64 = 2;

/// Author placeholder for rows predating the `upstream_authors` column.
pub const UNKNOWN_AUTHOR: &str = "not-applicable";

/// Errors from store operations. Storage failures are fatal to the caller
/// (the engine cannot make safe progress without its ledger); corruption
/// and invariant violations indicate a bug or manual tampering.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl StoreError {
    fn storage(operation: &'static str, message: impl ToString) -> Self {
        StoreError::Storage {
            operation,
            message: message.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A repository identity. Created on first reference, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub id: i64,
    pub organization: String,
    pub name: String,
}

/// The unit of synchronization state: one fork branch tracking one
/// upstream repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchTuple {
    pub fork_repo_id: i64,
    pub upstream_repo_id: i64,
    pub fork_branch: String,
}

/// Whether the in-flight attempt has an open sync PR or is quarantined
/// behind a tracking issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Created,
    Blocked,
}

impl PendingAction {
    fn as_str(self) -> &'static str {
        match self {
            PendingAction::Created => "created",
            PendingAction::Blocked => "blocked",
        }
    }

    fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "created" => Ok(PendingAction::Created),
            "blocked" => Ok(PendingAction::Blocked),
            other => Err(StoreError::Corruption(format!(
                "unknown pending action \"{other}\""
            ))),
        }
    }
}

/// The single in-flight sync attempt for a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPr {
    pub fork_repo_id: i64,
    pub upstream_repo_id: i64,
    pub fork_branch: String,
    /// Upstream PR ids this attempt propagates, strictly ascending.
    pub upstream_pr_ids: Vec<u64>,
    /// Authors aligned with `upstream_pr_ids`; [`UNKNOWN_AUTHOR`] when
    /// unknown.
    pub upstream_authors: Vec<String>,
    pub action: PendingAction,
    /// Fork-side sync PR, absent when the PR could never be opened.
    pub pr_id: Option<u64>,
    /// Fork-side tracking issue, set only on failure paths.
    pub github_issue: Option<u64>,
}

impl PendingPr {
    pub fn tuple(&self) -> BranchTuple {
        BranchTuple {
            fork_repo_id: self.fork_repo_id,
            upstream_repo_id: self.upstream_repo_id,
            fork_branch: self.fork_branch.clone(),
        }
    }

    fn validate(&self) -> StoreResult<()> {
        if self.upstream_pr_ids.is_empty() {
            return Err(StoreError::Invariant(
                "a pending PR must cover at least one upstream PR".to_string(),
            ));
        }
        if !self.upstream_pr_ids.windows(2).all(|w| w[0] < w[1]) {
            return Err(StoreError::Invariant(format!(
                "upstream PR ids must be strictly ascending, got {:?}",
                self.upstream_pr_ids
            )));
        }
        if self.upstream_authors.len() != self.upstream_pr_ids.len() {
            return Err(StoreError::Invariant(format!(
                "{} authors recorded for {} upstream PRs",
                self.upstream_authors.len(),
                self.upstream_pr_ids.len()
            )));
        }
        match self.action {
            PendingAction::Blocked if self.github_issue.is_none() => Err(StoreError::Invariant(
                "a blocked pending PR must reference a tracking issue".to_string(),
            )),
            PendingAction::Created if self.pr_id.is_none() => Err(StoreError::Invariant(
                "a created pending PR must reference a fork PR".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Handle to the shared SQLite database.
///
/// Synchronous rusqlite calls run under `tokio::task::spawn_blocking` so
/// they never stall the async runtime.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the database at `path`, configure
    /// durability pragmas and run pending migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy().to_string();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {e}", parent.display()),
                        )
                    })?;
                    restrict_permissions(parent, 0o700);
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e))?;

        if !is_in_memory {
            restrict_permissions(path_ref, 0o600);
        }

        // WAL can be silently refused on filesystems without shared-memory
        // support, so the result must be checked rather than assumed.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e))?;
        let journal_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!("WAL mode unavailable, SQLite reported \"{journal_mode}\""),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> StoreResult<Self> {
        Self::open(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> StoreResult<()> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "database schema version {from_version} is newer than supported \
                     version {CURRENT_SCHEMA_VERSION}; upgrade the application"
                ),
            ));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    organization TEXT NOT NULL,
                    name TEXT NOT NULL,
                    UNIQUE (organization, name)
                );

                CREATE TABLE IF NOT EXISTS branch_cursors (
                    fork_repo_id INTEGER NOT NULL REFERENCES repos(id),
                    upstream_repo_id INTEGER NOT NULL REFERENCES repos(id),
                    fork_branch TEXT NOT NULL,
                    last_handled_pr INTEGER NOT NULL,
                    PRIMARY KEY (fork_repo_id, upstream_repo_id, fork_branch)
                );

                CREATE TABLE IF NOT EXISTS pending_prs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    fork_repo_id INTEGER NOT NULL REFERENCES repos(id),
                    upstream_repo_id INTEGER NOT NULL REFERENCES repos(id),
                    fork_branch TEXT NOT NULL,
                    upstream_pr_ids TEXT NOT NULL,
                    action TEXT NOT NULL,
                    pr_id INTEGER,
                    github_issue INTEGER,
                    UNIQUE (fork_repo_id, upstream_repo_id, fork_branch),
                    UNIQUE (fork_repo_id, pr_id, github_issue)
                );

                CREATE INDEX IF NOT EXISTS idx_pending_by_issue
                    ON pending_prs(fork_repo_id, github_issue)
                    WHERE github_issue IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_pending_by_pr
                    ON pending_prs(fork_repo_id, pr_id)
                    WHERE pr_id IS NOT NULL;
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e))?;
        }

        // v2: author attribution was added after initial deployment; rows
        // written before it carry the sentinel.
        if from_version < 2 {
            conn.execute_batch(&format!(
                "ALTER TABLE pending_prs
                 ADD COLUMN upstream_authors TEXT NOT NULL DEFAULT '{UNKNOWN_AUTHOR}';"
            ))
            .map_err(|e| StoreError::storage("migration v2", e))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e))?;

        Ok(())
    }

    /// Insert-if-absent, then look up. The two steps are deliberate:
    /// `last_insert_rowid` is meaningless when the insert hits the
    /// uniqueness conflict.
    pub async fn get_or_create_repo(&self, organization: &str, name: &str) -> StoreResult<Repo> {
        let conn = self.conn.clone();
        let organization = organization.to_string();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO repos (organization, name) VALUES (?1, ?2)",
                params![organization, name],
            )
            .map_err(|e| StoreError::storage("get_or_create_repo", e))?;

            conn.query_row(
                "SELECT id, organization, name FROM repos
                 WHERE organization = ?1 AND name = ?2",
                params![organization, name],
                |row| {
                    Ok(Repo {
                        id: row.get(0)?,
                        organization: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .map_err(|e| StoreError::storage("get_or_create_repo", e))
        })
        .await
        .map_err(|e| StoreError::storage("get_or_create_repo", e))?
    }

    pub async fn get_repo(&self, id: i64) -> StoreResult<Option<Repo>> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT id, organization, name FROM repos WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Repo {
                        id: row.get(0)?,
                        organization: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::storage("get_repo", e))
        })
        .await
        .map_err(|e| StoreError::storage("get_repo", e))?
    }

    pub async fn get_last_handled_pr(&self, tuple: &BranchTuple) -> StoreResult<Option<u64>> {
        let conn = self.conn.clone();
        let tuple = tuple.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let value: Option<i64> = conn
                .query_row(
                    "SELECT last_handled_pr FROM branch_cursors
                     WHERE fork_repo_id = ?1 AND upstream_repo_id = ?2 AND fork_branch = ?3",
                    params![tuple.fork_repo_id, tuple.upstream_repo_id, tuple.fork_branch],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("get_last_handled_pr", e))?;

            value
                .map(|v| i64_to_pr_number(v, "get_last_handled_pr"))
                .transpose()
        })
        .await
        .map_err(|e| StoreError::storage("get_last_handled_pr", e))?
    }

    /// Upsert the cursor for a tuple. Monotonic: a lower value never
    /// overwrites a higher one.
    pub async fn set_last_handled_pr(&self, tuple: &BranchTuple, pr_id: u64) -> StoreResult<()> {
        let conn = self.conn.clone();
        let tuple = tuple.clone();
        let pr_id = pr_number_to_i64(pr_id, "set_last_handled_pr")?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO branch_cursors
                     (fork_repo_id, upstream_repo_id, fork_branch, last_handled_pr)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(fork_repo_id, upstream_repo_id, fork_branch) DO UPDATE SET
                     last_handled_pr = MAX(last_handled_pr, excluded.last_handled_pr)",
                params![
                    tuple.fork_repo_id,
                    tuple.upstream_repo_id,
                    tuple.fork_branch,
                    pr_id
                ],
            )
            .map_err(|e| StoreError::storage("set_last_handled_pr", e))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("set_last_handled_pr", e))?
    }

    pub async fn get_pending_pr(&self, tuple: &BranchTuple) -> StoreResult<Option<PendingPr>> {
        let conn = self.conn.clone();
        let tuple = tuple.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            query_pending(
                &conn,
                "WHERE fork_repo_id = ?1 AND upstream_repo_id = ?2 AND fork_branch = ?3",
                params![tuple.fork_repo_id, tuple.upstream_repo_id, tuple.fork_branch],
                "get_pending_pr",
            )
        })
        .await
        .map_err(|e| StoreError::storage("get_pending_pr", e))?
    }

    pub async fn get_pending_pr_by_issue(
        &self,
        fork_repo_id: i64,
        issue_id: u64,
    ) -> StoreResult<Option<PendingPr>> {
        let conn = self.conn.clone();
        let issue_id = pr_number_to_i64(issue_id, "get_pending_pr_by_issue")?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            query_pending(
                &conn,
                "WHERE fork_repo_id = ?1 AND github_issue = ?2",
                params![fork_repo_id, issue_id],
                "get_pending_pr_by_issue",
            )
        })
        .await
        .map_err(|e| StoreError::storage("get_pending_pr_by_issue", e))?
    }

    pub async fn get_pending_pr_by_pr_id(
        &self,
        fork_repo_id: i64,
        pr_id: u64,
    ) -> StoreResult<Option<PendingPr>> {
        let conn = self.conn.clone();
        let pr_id = pr_number_to_i64(pr_id, "get_pending_pr_by_pr_id")?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            query_pending(
                &conn,
                "WHERE fork_repo_id = ?1 AND pr_id = ?2",
                params![fork_repo_id, pr_id],
                "get_pending_pr_by_pr_id",
            )
        })
        .await
        .map_err(|e| StoreError::storage("get_pending_pr_by_pr_id", e))?
    }

    /// Upsert the pending PR for its tuple, enforcing the row invariants.
    pub async fn set_pending_pr(&self, pending: &PendingPr) -> StoreResult<()> {
        pending.validate()?;

        let conn = self.conn.clone();
        let pending = pending.clone();
        let pr_id = pending
            .pr_id
            .map(|id| pr_number_to_i64(id, "set_pending_pr"))
            .transpose()?;
        let github_issue = pending
            .github_issue
            .map(|id| pr_number_to_i64(id, "set_pending_pr"))
            .transpose()?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO pending_prs
                     (fork_repo_id, upstream_repo_id, fork_branch, upstream_pr_ids,
                      upstream_authors, action, pr_id, github_issue)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(fork_repo_id, upstream_repo_id, fork_branch) DO UPDATE SET
                     upstream_pr_ids = excluded.upstream_pr_ids,
                     upstream_authors = excluded.upstream_authors,
                     action = excluded.action,
                     pr_id = excluded.pr_id,
                     github_issue = excluded.github_issue",
                params![
                    pending.fork_repo_id,
                    pending.upstream_repo_id,
                    pending.fork_branch,
                    join_pr_ids(&pending.upstream_pr_ids),
                    pending.upstream_authors.join(","),
                    pending.action.as_str(),
                    pr_id,
                    github_issue
                ],
            )
            .map_err(|e| StoreError::storage("set_pending_pr", e))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("set_pending_pr", e))?
    }

    /// Returns whether a row existed.
    pub async fn delete_pending_pr(&self, tuple: &BranchTuple) -> StoreResult<bool> {
        let conn = self.conn.clone();
        let tuple = tuple.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let deleted = conn
                .execute(
                    "DELETE FROM pending_prs
                     WHERE fork_repo_id = ?1 AND upstream_repo_id = ?2 AND fork_branch = ?3",
                    params![tuple.fork_repo_id, tuple.upstream_repo_id, tuple.fork_branch],
                )
                .map_err(|e| StoreError::storage("delete_pending_pr", e))?;
            Ok(deleted > 0)
        })
        .await
        .map_err(|e| StoreError::storage("delete_pending_pr", e))?
    }
}

fn query_pending(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
    operation: &'static str,
) -> StoreResult<Option<PendingPr>> {
    let sql = format!(
        "SELECT fork_repo_id, upstream_repo_id, fork_branch, upstream_pr_ids,
                upstream_authors, action, pr_id, github_issue
         FROM pending_prs {where_clause}"
    );

    let row: Option<(i64, i64, String, String, String, String, Option<i64>, Option<i64>)> = conn
        .query_row(&sql, params, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })
        .optional()
        .map_err(|e| StoreError::storage(operation, e))?;

    let Some((fork_repo_id, upstream_repo_id, fork_branch, ids, authors, action, pr_id, issue)) =
        row
    else {
        return Ok(None);
    };

    let upstream_pr_ids = parse_pr_ids(&ids)?;
    let mut upstream_authors: Vec<String> = if authors.is_empty() {
        Vec::new()
    } else {
        authors.split(',').map(|s| s.to_string()).collect()
    };
    // Rows migrated from before author tracking carry a single sentinel;
    // realign with the id list.
    if upstream_authors.len() != upstream_pr_ids.len() {
        warn!(
            fork_repo_id,
            "realigning {} stored authors with {} upstream PRs",
            upstream_authors.len(),
            upstream_pr_ids.len()
        );
        upstream_authors.resize(upstream_pr_ids.len(), UNKNOWN_AUTHOR.to_string());
    }

    Ok(Some(PendingPr {
        fork_repo_id,
        upstream_repo_id,
        fork_branch,
        upstream_pr_ids,
        upstream_authors,
        action: PendingAction::parse(&action)?,
        pr_id: pr_id.map(|v| i64_to_pr_number(v, operation)).transpose()?,
        github_issue: issue.map(|v| i64_to_pr_number(v, operation)).transpose()?,
    }))
}

fn join_pr_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_pr_ids(raw: &str) -> StoreResult<Vec<u64>> {
    raw.split(',')
        .map(|part| {
            part.parse::<u64>().map_err(|_| {
                StoreError::Corruption(format!("invalid upstream PR id \"{part}\" in store"))
            })
        })
        .collect()
}

/// Guard against the silent wrap of `as i64` for ids beyond `i64::MAX`.
fn pr_number_to_i64(value: u64, operation: &'static str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| {
        StoreError::storage(operation, format!("id {value} exceeds the storable maximum"))
    })
}

fn i64_to_pr_number(value: i64, operation: &'static str) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::storage(operation, format!("negative id {value} in database")))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!("Failed to restrict permissions on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}
