//! Domain types for the berth registry.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Timestamps are `DateTime<Utc>` and persist as fixed-width RFC 3339 text so
//! that lexical order in SQLite matches chronological order.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque session identifier, unique among active sessions process-wide.
///
/// The conventional external format is a zero-padded three digit decimal
/// (`001`..`999`), but the registry never interprets the contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How a session's services are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Docker,
    Native,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Docker => "docker",
            SessionMode::Native => "native",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(SessionMode::Docker),
            "native" => Ok(SessionMode::Native),
            other => Err(RegistryError::InvalidRequest(format!(
                "unknown session mode '{other}'; expected: docker, native"
            ))),
        }
    }
}

impl ToSql for SessionMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SessionMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: RegistryError| FromSqlError::Other(Box::new(e)))
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One row of the session table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: SessionId,
    /// Absolute path of the owning project.
    pub project_root: PathBuf,
    /// Absolute path of the session's working directory.
    pub session_dir: PathBuf,
    pub branch: String,
    pub mode: SessionMode,
    pub in_place: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn is_active(&self) -> bool {
        self.destroyed_at.is_none()
    }
}

/// Insert request for [`Store::insert`](crate::Store::insert).
///
/// `branch`, `mode` and `in_place` default to `""`, [`SessionMode::Docker`] and `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub session_id: SessionId,
    pub project_root: PathBuf,
    pub session_dir: PathBuf,
    pub branch: String,
    pub mode: SessionMode,
    pub in_place: bool,
}

impl NewSession {
    pub fn new(
        session_id: impl Into<SessionId>,
        project_root: impl Into<PathBuf>,
        session_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_root: project_root.into(),
            session_dir: session_dir.into(),
            branch: String::new(),
            mode: SessionMode::default(),
            in_place: false,
        }
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }
}

/// A committed `(session, service) -> port` binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub session_id: SessionId,
    pub service_name: String,
    pub port: u16,
}

/// An operator-withheld port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub port: u16,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Inclusive TCP port range used for automatic allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, RegistryError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Rejects empty ranges and ranges touching port 0.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.start == 0 || self.start > self.end {
            return Err(RegistryError::InvalidRequest(format!(
                "invalid port range {}-{}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of ports in the range.
    pub fn size(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Timestamp codec
// ---------------------------------------------------------------------------

/// `2026-10-15T08:30:00.000000Z` — fixed width, sorts lexically.
pub(crate) fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 and SQLite's `datetime('now')` shape (`YYYY-MM-DD HH:MM:SS`),
/// which older stores wrote.
pub(crate) fn decode_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_session_defaults() {
        let req = NewSession::new("001", "/p", "/s/001");
        assert_eq!(req.branch, "");
        assert_eq!(req.mode, SessionMode::Docker);
        assert!(!req.in_place);
    }

    #[test]
    fn session_mode_parses_case_insensitively() {
        assert_eq!("Native".parse::<SessionMode>().unwrap(), SessionMode::Native);
        assert!("podman".parse::<SessionMode>().is_err());
        assert_eq!(SessionMode::Docker.to_string(), "docker");
    }

    #[test]
    fn timestamps_are_fixed_width_and_roundtrip() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::microseconds(17);
        let (ea, eb) = (encode_timestamp(a), encode_timestamp(b));
        assert_eq!(ea.len(), eb.len());
        assert!(ea < eb);
        assert_eq!(decode_timestamp(&eb), Some(b));
    }

    #[test]
    fn legacy_sqlite_timestamps_decode() {
        let ts = decode_timestamp("2024-05-06 07:08:09").expect("decode");
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap());
        assert_eq!(decode_timestamp("yesterday"), None);
    }

    #[test]
    fn port_range_rejects_inverted_bounds() {
        assert!(PortRange::new(5000, 4000).is_err());
        assert!(PortRange::new(0, 10).is_err());
        let r = PortRange::new(4000, 4009).unwrap();
        assert_eq!(r.size(), 10);
        assert!(r.contains(4009));
        assert!(!r.contains(4010));
    }
}
