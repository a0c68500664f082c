//! Session registry: CRUD over session rows with soft delete.
//!
//! Only rows whose `destroyed_at` is NULL are visible through the lookup and
//! list operations. Destroying a session releases its port allocations in the
//! same statement (see the `trg_sessions_destroy_releases_ports` trigger);
//! [`Store::remove`] hard-deletes and relies on the foreign-key cascade instead.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::{is_unique_violation, RegistryError};
use crate::store::Store;
use crate::types::{decode_timestamp, encode_timestamp, NewSession, SessionId, SessionRow};

const SESSION_COLUMNS: &str =
    "session_id, project_root, session_dir, branch, mode, in_place, created_at, destroyed_at";

/// Highest identifier in the conventional `001`..`999` format.
pub const MAX_SESSION_NUMBER: u16 = 999;

impl Store {
    /// Insert a new active session.
    ///
    /// Fails with `RegistryError::DuplicateSession` if any project already has an
    /// active session with the same `session_id`.
    pub fn insert(&mut self, session: NewSession) -> Result<SessionRow, RegistryError> {
        if session.session_id.as_str().is_empty() {
            return Err(RegistryError::InvalidRequest(
                "session id must not be empty".to_owned(),
            ));
        }
        let project_root = path_text(&session.project_root)?;
        let session_dir = path_text(&session.session_dir)?;
        let created_at = encode_timestamp(Utc::now());

        let tx = self.write_tx()?;
        let inserted = tx.execute(
            "
            INSERT INTO sessions (
                session_id, project_root, session_dir, branch, mode, in_place, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                session.session_id.as_str(),
                project_root,
                session_dir,
                session.branch,
                session.mode,
                session.in_place,
                created_at,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(RegistryError::DuplicateSession {
                    session_id: session.session_id.0,
                });
            }
            Err(err) => return Err(err.into()),
        }
        let key = tx.last_insert_rowid();
        let row = tx.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![key],
            map_session,
        )?;
        tx.commit()?;

        tracing::debug!(
            session_id = %row.session_id,
            project_root = %row.project_root.display(),
            "inserted session"
        );
        Ok(row)
    }

    /// The active session `session_id` within `project_root`, if any.
    pub fn find_session(
        &self,
        project_root: &Path,
        session_id: &SessionId,
    ) -> Result<Option<SessionRow>, RegistryError> {
        let project_root = path_text(project_root)?;
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE project_root = ?1 AND session_id = ?2 AND destroyed_at IS NULL"
                ),
                params![project_root, session_id.as_str()],
                map_session,
            )
            .optional()?)
    }

    /// The active session whose working directory is `session_dir`, if any.
    pub fn find_by_dir(&self, session_dir: &Path) -> Result<Option<SessionRow>, RegistryError> {
        let session_dir = path_text(session_dir)?;
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE session_dir = ?1 AND destroyed_at IS NULL
                     ORDER BY id ASC LIMIT 1"
                ),
                params![session_dir],
                map_session,
            )
            .optional()?)
    }

    /// The active session with this id in any project, if any.
    pub fn find_by_id(&self, session_id: &SessionId) -> Result<Option<SessionRow>, RegistryError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE session_id = ?1 AND destroyed_at IS NULL"
                ),
                params![session_id.as_str()],
                map_session,
            )
            .optional()?)
    }

    /// Project roots holding any row (active or destroyed) with this id.
    ///
    /// Used to resolve the key for [`Store::remove`] when only the id is known.
    pub fn project_roots_for(&self, session_id: &SessionId) -> Result<Vec<PathBuf>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT project_root FROM sessions
             WHERE session_id = ?1
             ORDER BY project_root ASC",
        )?;
        let roots = stmt
            .query_map(params![session_id.as_str()], |row| {
                row.get::<_, String>(0).map(PathBuf::from)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(roots)
    }

    /// Active sessions of one project, ordered by `session_id`.
    pub fn list_by_project(&self, project_root: &Path) -> Result<Vec<SessionRow>, RegistryError> {
        let project_root = path_text(project_root)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE project_root = ?1 AND destroyed_at IS NULL
             ORDER BY session_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![project_root], map_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Active sessions across all projects, ordered by project then `session_id`.
    pub fn list_all(&self) -> Result<Vec<SessionRow>, RegistryError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE destroyed_at IS NULL
             ORDER BY project_root ASC, session_id ASC"
        ))?;
        let rows = stmt
            .query_map([], map_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Identifiers held by active sessions in any project.
    pub fn used_session_ids(&self) -> Result<BTreeSet<SessionId>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM sessions WHERE destroyed_at IS NULL")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0).map(SessionId::from))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(ids)
    }

    /// Lowest identifier in `001`..`999` not held by an active session.
    ///
    /// This is only a suggestion: a concurrent process may take it first, in
    /// which case [`Store::insert`] reports `DuplicateSession`.
    pub fn next_session_id(&self) -> Result<SessionId, RegistryError> {
        let used = self.used_session_ids()?;
        (1..=MAX_SESSION_NUMBER)
            .map(|n| SessionId(format!("{n:03}")))
            .find(|id| !used.contains(id))
            .ok_or(RegistryError::SessionIdsExhausted)
    }

    /// Soft-delete the active session; its port allocations are released.
    ///
    /// Returns `false` if no active row matched.
    pub fn mark_destroyed(
        &mut self,
        project_root: &Path,
        session_id: &SessionId,
    ) -> Result<bool, RegistryError> {
        let project_root = path_text(project_root)?;
        let destroyed_at = encode_timestamp(Utc::now());
        let tx = self.write_tx()?;
        let changed = tx.execute(
            "UPDATE sessions SET destroyed_at = ?1
             WHERE project_root = ?2 AND session_id = ?3 AND destroyed_at IS NULL",
            params![destroyed_at, project_root, session_id.as_str()],
        )?;
        tx.commit()?;

        if changed > 0 {
            tracing::info!(
                session_id = %session_id,
                project_root = %project_root,
                "destroyed session"
            );
        }
        Ok(changed > 0)
    }

    /// Hard-delete every row (active or destroyed) for this key, with allocations.
    ///
    /// Returns `false` if nothing matched.
    pub fn remove(
        &mut self,
        project_root: &Path,
        session_id: &SessionId,
    ) -> Result<bool, RegistryError> {
        let project_root = path_text(project_root)?;
        let tx = self.write_tx()?;
        let deleted = tx.execute(
            "DELETE FROM sessions WHERE project_root = ?1 AND session_id = ?2",
            params![project_root, session_id.as_str()],
        )?;
        tx.commit()?;

        if deleted > 0 {
            tracing::info!(
                session_id = %session_id,
                project_root = %project_root,
                rows = deleted,
                "purged session"
            );
        }
        Ok(deleted > 0)
    }

    /// Hard-delete all soft-deleted rows. Returns how many were removed.
    pub fn purge_destroyed(&mut self) -> Result<usize, RegistryError> {
        let tx = self.write_tx()?;
        let deleted = tx.execute("DELETE FROM sessions WHERE destroyed_at IS NOT NULL", [])?;
        tx.commit()?;
        Ok(deleted)
    }
}

pub(crate) fn map_session(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let created_at: String = row.get(6)?;
    let destroyed_at: Option<String> = row.get(7)?;
    Ok(SessionRow {
        session_id: SessionId(row.get(0)?),
        project_root: PathBuf::from(row.get::<_, String>(1)?),
        session_dir: PathBuf::from(row.get::<_, String>(2)?),
        branch: row.get(3)?,
        mode: row.get(4)?,
        in_place: row.get(5)?,
        created_at: parse_column(6, &created_at)?,
        destroyed_at: destroyed_at
            .as_deref()
            .map(|text| parse_column(7, text))
            .transpose()?,
    })
}

fn parse_column(index: usize, text: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    decode_timestamp(text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(format!("invalid timestamp '{text}'"))),
        )
    })
}

/// Paths are stored as UTF-8 text; anything else cannot round-trip.
pub(crate) fn path_text(path: &Path) -> Result<&str, RegistryError> {
    path.to_str().ok_or_else(|| {
        RegistryError::InvalidRequest(format!("path is not valid UTF-8: {}", path.display()))
    })
}
