//! Schema generations and the forward migration between them.
//!
//! Two layouts of the `sessions` table exist in the wild:
//!
//! | generation | uniqueness                                   | `user_version` |
//! |------------|----------------------------------------------|----------------|
//! | legacy     | `UNIQUE(session_id, project_root)`           | 0 or 1         |
//! | current    | `session_id` unique among active rows        | 2              |
//!
//! The generation is read from the uniqueness constraints actually present on
//! `sessions`, not from `user_version`, so stores written by older builds that
//! never set the pragma are still recognised.
//!
//! Migrating legacy → current happens inside one `BEGIN IMMEDIATE` transaction.
//! For every `session_id` with several active rows across projects, the row with
//! the earliest `created_at` (ties: lowest rowid) survives and the rest are
//! dropped. Legacy port allocations follow their surviving session; any that
//! would collide on port or service are dropped too.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{unavailable, RegistryError};
use crate::types::encode_timestamp;

pub const LEGACY_SCHEMA_VERSION: i32 = 1;
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Tables of the current generation. Indexes and triggers live in
/// [`CURRENT_INDEXES`] so a rebuild can create them after the legacy tables
/// (and their same-named indexes) are gone.
const CURRENT_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        project_root TEXT NOT NULL,
        session_dir TEXT NOT NULL,
        branch TEXT NOT NULL DEFAULT '',
        mode TEXT NOT NULL DEFAULT 'docker' CHECK (mode IN ('docker', 'native')),
        in_place INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        destroyed_at TEXT
    );

    CREATE TABLE IF NOT EXISTS port_allocations (
        session_key INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        session_id TEXT NOT NULL,
        service_name TEXT NOT NULL,
        port INTEGER NOT NULL UNIQUE CHECK (port BETWEEN 1 AND 65535),
        allocated_at TEXT NOT NULL,
        PRIMARY KEY (session_key, service_name)
    );

    CREATE TABLE IF NOT EXISTS port_reservations (
        port INTEGER PRIMARY KEY CHECK (port BETWEEN 1 AND 65535),
        reason TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    );
";

const CURRENT_INDEXES: &str = "
    CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_session_id
        ON sessions(session_id) WHERE destroyed_at IS NULL;
    CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_root, session_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_dir ON sessions(session_dir);
    CREATE INDEX IF NOT EXISTS idx_port_allocations_session_id ON port_allocations(session_id);

    CREATE TRIGGER IF NOT EXISTS trg_sessions_destroy_releases_ports
    AFTER UPDATE OF destroyed_at ON sessions
    WHEN NEW.destroyed_at IS NOT NULL
    BEGIN
        DELETE FROM port_allocations WHERE session_key = NEW.id;
    END;
";

/// Which layout a store file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaGeneration {
    /// No `sessions` table yet.
    Empty,
    /// Composite `(session_id, project_root)` uniqueness.
    Legacy,
    /// `session_id` unique among active rows.
    #[default]
    Current,
}

impl std::fmt::Display for SchemaGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaGeneration::Empty => write!(f, "empty"),
            SchemaGeneration::Legacy => write!(f, "legacy"),
            SchemaGeneration::Current => write!(f, "current"),
        }
    }
}

/// What [`migrate`] did on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Generation found before migrating.
    pub from: SchemaGeneration,
    /// `(session_id, project_root)` of active rows discarded as duplicates.
    pub dropped_sessions: Vec<(String, String)>,
    /// Legacy allocation rows that could not be carried forward.
    pub dropped_allocations: usize,
}

impl MigrationReport {
    pub fn migrated(&self) -> bool {
        self.from != SchemaGeneration::Current
    }
}

/// Inspect the uniqueness constraints on `sessions`.
pub(crate) fn detect(conn: &Connection, path: &Path) -> Result<SchemaGeneration, RegistryError> {
    if !table_exists(conn, "sessions")? {
        return Ok(SchemaGeneration::Empty);
    }

    let mut legacy = false;
    let mut current = false;
    for (index, partial) in unique_indexes(conn, "sessions")? {
        let mut columns = index_columns(conn, &index)?;
        columns.sort();
        match columns.as_slice() {
            [a, b] if a == "project_root" && b == "session_id" => legacy = true,
            [a] if a == "session_id" && partial => current = true,
            _ => {}
        }
    }

    if legacy {
        Ok(SchemaGeneration::Legacy)
    } else if current {
        Ok(SchemaGeneration::Current)
    } else {
        Err(unavailable(
            path,
            "sessions table carries no recognised uniqueness constraint",
        ))
    }
}

/// Bring the store to [`CURRENT_SCHEMA_VERSION`]. A no-op on a current store.
///
/// Any failure rolls the whole migration back and is reported as
/// [`RegistryError::StoreUnavailable`].
pub(crate) fn migrate(
    conn: &mut Connection,
    path: &Path,
) -> Result<MigrationReport, RegistryError> {
    // Fast path without taking the write lock.
    let observed = detect(conn, path)?;
    if observed == SchemaGeneration::Current {
        return Ok(MigrationReport::default());
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| unavailable(path, format!("cannot begin migration: {e}")))?;

    // Another process may have migrated between the probe and the lock.
    let from = detect(&tx, path)?;
    let mut report = MigrationReport {
        from,
        ..MigrationReport::default()
    };

    let outcome = match from {
        SchemaGeneration::Current => Ok(()),
        SchemaGeneration::Empty => create_current(&tx),
        SchemaGeneration::Legacy => rebuild_legacy(&tx, &mut report),
    };
    outcome
        .and_then(|()| tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION))
        .map_err(|e| unavailable(path, format!("migration from {from} schema failed: {e}")))?;

    tx.commit()
        .map_err(|e| unavailable(path, format!("migration commit failed: {e}")))?;

    match from {
        SchemaGeneration::Empty => {
            tracing::info!(path = %path.display(), "created registry schema")
        }
        SchemaGeneration::Legacy => {
            for (session_id, project_root) in &report.dropped_sessions {
                tracing::warn!(
                    session_id = %session_id,
                    project_root = %project_root,
                    "dropped duplicate active session during migration"
                );
            }
            tracing::info!(
                path = %path.display(),
                dropped_sessions = report.dropped_sessions.len(),
                dropped_allocations = report.dropped_allocations,
                "migrated legacy registry schema"
            );
        }
        SchemaGeneration::Current => {}
    }
    Ok(report)
}

fn create_current(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CURRENT_TABLES)?;
    conn.execute_batch(CURRENT_INDEXES)
}

fn rebuild_legacy(conn: &Connection, report: &mut MigrationReport) -> rusqlite::Result<()> {
    let has_legacy_ports = table_exists(conn, "port_allocations")?
        && table_columns(conn, "port_allocations")?
            .iter()
            .any(|c| c == "session_id");

    conn.execute_batch("ALTER TABLE sessions RENAME TO sessions_legacy;")?;
    if has_legacy_ports {
        conn.execute_batch("ALTER TABLE port_allocations RENAME TO port_allocations_legacy;")?;
    }
    conn.execute_batch(CURRENT_TABLES)?;

    let columns = table_columns(conn, "sessions_legacy")?;
    let has = |name: &str| columns.iter().any(|c| c == name);
    let branch = if has("branch") { "COALESCE(l.branch, '')" } else { "''" };
    let mode = if has("mode") {
        "CASE WHEN lower(l.mode) IN ('docker', 'native') THEN lower(l.mode) ELSE 'docker' END"
    } else {
        "'docker'"
    };
    let in_place = if has("in_place") { "COALESCE(l.in_place, 0)" } else { "0" };

    // An active row loses if some other active row with the same id is older,
    // or equally old but inserted first.
    let superseded = "
        l.destroyed_at IS NULL AND EXISTS (
            SELECT 1 FROM sessions_legacy o
            WHERE o.session_id = l.session_id
              AND o.destroyed_at IS NULL
              AND (o.created_at < l.created_at
                   OR (o.created_at = l.created_at AND o.rowid < l.rowid))
        )";

    let mut stmt = conn.prepare(&format!(
        "SELECT l.session_id, l.project_root FROM sessions_legacy l
         WHERE {superseded} ORDER BY l.rowid"
    ))?;
    report.dropped_sessions = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
    drop(stmt);

    conn.execute(
        &format!(
            "
            INSERT INTO sessions (
                id, session_id, project_root, session_dir, branch, mode, in_place,
                created_at, destroyed_at
            )
            SELECT l.rowid, l.session_id, l.project_root, l.session_dir,
                   {branch}, {mode}, {in_place}, l.created_at, l.destroyed_at
            FROM sessions_legacy l
            WHERE NOT ({superseded})
            ORDER BY l.rowid
            "
        ),
        [],
    )?;

    if has_legacy_ports {
        let legacy_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM port_allocations_legacy", [], |r| r.get(0))?;
        let carried = conn.execute(
            "
            INSERT OR IGNORE INTO port_allocations (
                session_key, session_id, service_name, port, allocated_at
            )
            SELECT s.id, s.session_id, p.service_name, p.port, ?1
            FROM port_allocations_legacy p
            JOIN sessions s ON s.session_id = p.session_id AND s.destroyed_at IS NULL
            WHERE p.port BETWEEN 1 AND 65535
            ORDER BY p.rowid
            ",
            params![encode_timestamp(Utc::now())],
        )?;
        report.dropped_allocations =
            usize::try_from(legacy_count).unwrap_or(0).saturating_sub(carried);
        conn.execute_batch("DROP TABLE port_allocations_legacy;")?;
    }

    conn.execute_batch("DROP TABLE sessions_legacy;")?;
    conn.execute_batch(CURRENT_INDEXES)
}

// ---------------------------------------------------------------------------
// Catalog helpers
// ---------------------------------------------------------------------------

pub(crate) fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|opt| opt.is_some())
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map(params![table], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(columns)
}

/// `(index name, is partial)` for every unique index on `table`, including the
/// automatic ones backing `UNIQUE` table constraints.
fn unique_indexes(conn: &Connection, table: &str) -> rusqlite::Result<Vec<(String, bool)>> {
    let mut stmt = conn.prepare(
        "SELECT name, partial FROM pragma_index_list(?1) WHERE \"unique\" = 1 ORDER BY seq",
    )?;
    let indexes = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(indexes)
}

fn index_columns(conn: &Connection, index: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let columns = stmt
        .query_map(params![index], |row| row.get::<_, Option<String>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.into_iter().flatten().collect())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
