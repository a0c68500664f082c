//! Error types for berth-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from registry operations.
///
/// Lookups that find nothing are not errors: they return `None` (or `false`
/// for [`mark_destroyed`](crate::Store::mark_destroyed) and
/// [`remove`](crate::Store::remove)).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The store file is unreadable or corrupt, a required engine capability
    /// could not be enabled, or a schema migration failed and was rolled back.
    #[error("registry store at {path} is unavailable: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },

    /// An active session with this identifier already exists.
    #[error("session '{session_id}' already exists")]
    DuplicateSession { session_id: String },

    /// Port allocation lost the commit race on every attempt.
    #[error("port allocation for session '{session_id}' conflicted after {attempts} attempts")]
    AllocationConflict { session_id: String, attempts: u32 },

    /// Ports were requested for a session that has no active row.
    #[error("no active session '{session_id}'")]
    UnknownSession { session_id: String },

    /// The request itself is malformed (empty or repeated service names, bad port range).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The probe could not find a free port outside the exclusion set.
    #[error("no free port available: {detail}")]
    NoFreePort { detail: String },

    /// Every identifier in `001`..`999` is held by an active session.
    #[error("no free session identifier left in 001..999")]
    SessionIdsExhausted,

    /// Any other SQLite failure (busy timeout expired, I/O inside the engine, ...).
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure around the store directory, with annotated path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `config.yaml` exists but does not parse.
    #[error("failed to parse config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.berth/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

impl RegistryError {
    /// True for errors a caller may recover from by changing input or retrying later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RegistryError::DuplicateSession { .. }
                | RegistryError::AllocationConflict { .. }
                | RegistryError::UnknownSession { .. }
                | RegistryError::InvalidRequest(_)
                | RegistryError::NoFreePort { .. }
                | RegistryError::SessionIdsExhausted
        )
    }
}

/// Convenience constructor for [`RegistryError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`RegistryError::StoreUnavailable`].
pub(crate) fn unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> RegistryError {
    RegistryError::StoreUnavailable {
        path: path.into(),
        reason: reason.to_string(),
    }
}

/// True when `err` is a UNIQUE or PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_session_message_names_the_id() {
        let err = RegistryError::DuplicateSession {
            session_id: "001".into(),
        };
        assert_eq!(err.to_string(), "session '001' already exists");
        assert!(err.is_recoverable());
    }

    #[test]
    fn store_unavailable_is_fatal() {
        let err = unavailable("/tmp/x.db", "file is not a database");
        assert!(err.to_string().contains("/tmp/x.db"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn non_constraint_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&rusqlite::Error::QueryReturnedNoRows));
    }
}
