//! Store lifecycle: open, connection setup, close.
//!
//! A [`Store`] wraps one SQLite connection to the registry file. Independent
//! processes each open their own `Store`; all coordination between them goes
//! through SQLite's file locking, so nothing here holds in-process locks.
//!
//! On open:
//! 1. `busy_timeout` so concurrent writers queue instead of failing at once.
//! 2. `journal_mode = WAL`, `synchronous = NORMAL`.
//! 3. `foreign_keys = ON`, read back — the allocation cascade depends on it.
//! 4. [`schema::migrate`] to the current generation.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::config::{
    ensure_private_dir, home, load_config_at, set_file_permissions, RegistryConfig,
};
use crate::error::{unavailable, RegistryError};
use crate::schema::{self, MigrationReport, SchemaGeneration};
use crate::types::PortRange;

/// Handle to the registry store file.
#[derive(Debug)]
pub struct Store {
    pub(crate) conn: Connection,
    path: PathBuf,
    port_range: Option<PortRange>,
    migration: MigrationReport,
}

impl Store {
    /// Open (or create) the store at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::open_with(path, &RegistryConfig::default())
    }

    /// Open (or create) the store at `path`.
    ///
    /// Returns `RegistryError::StoreUnavailable` if the file is not a readable
    /// SQLite database, if foreign keys cannot be enabled, or if migration fails.
    pub fn open_with(
        path: impl AsRef<Path>,
        config: &RegistryConfig,
    ) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        config.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(parent)?;
        }
        let created = !path.exists();

        let conn = Connection::open(&path).map_err(|e| unavailable(&path, e))?;
        let store = Self::bootstrap(conn, path, config, true)?;
        if created {
            set_file_permissions(&store.path)?;
        }
        Ok(store)
    }

    /// Open the store configured under `<home>/.berth/`.
    pub fn open_default_at(home: &Path) -> Result<Self, RegistryError> {
        let config = load_config_at(home)?;
        Self::open_with(config.resolve_store_path(home), &config)
    }

    /// `open_default_at` convenience wrapper.
    pub fn open_default() -> Result<Self, RegistryError> {
        Self::open_default_at(&home()?)
    }

    /// A private, non-persistent store. Unit tests only need one process.
    pub fn in_memory() -> Result<Self, RegistryError> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|e| unavailable(&path, e))?;
        Self::bootstrap(conn, path, &RegistryConfig::default(), false)
    }

    fn bootstrap(
        mut conn: Connection,
        path: PathBuf,
        config: &RegistryConfig,
        on_disk: bool,
    ) -> Result<Self, RegistryError> {
        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| unavailable(&path, e))?;

        // Fails with "file is not a database" on garbage input.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|e| unavailable(&path, e))?;

        if on_disk {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(|e| unavailable(&path, format!("cannot set journal mode: {e}")))?;
            if !mode.eq_ignore_ascii_case("wal") {
                tracing::debug!(path = %path.display(), mode = %mode, "store not in WAL mode");
            }
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(|e| unavailable(&path, e))?;
        }

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| unavailable(&path, e))?;
        let enforced: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_err(|e| unavailable(&path, e))?;
        if enforced != 1 {
            return Err(unavailable(&path, "foreign key enforcement is unavailable"));
        }

        let migration = match schema::migrate(&mut conn, &path) {
            Ok(report) => report,
            Err(err @ RegistryError::StoreUnavailable { .. }) => return Err(err),
            Err(err) => return Err(unavailable(&path, err)),
        };

        tracing::debug!(
            path = %path.display(),
            from = %migration.from,
            "registry store opened"
        );

        Ok(Self {
            conn,
            path,
            port_range: config.port_range,
            migration,
        })
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<(), RegistryError> {
        self.conn.close().map_err(|(_, err)| RegistryError::Sqlite(err))
    }

    /// Path of the store file (`:memory:` for in-memory stores).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What the open-time migration found and did.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    /// Re-inspect the live schema. Always [`SchemaGeneration::Current`] after open
    /// unless another process has tampered with the file.
    pub fn schema_generation(&self) -> Result<SchemaGeneration, RegistryError> {
        schema::detect(&self.conn, &self.path)
    }

    /// Range automatic allocation draws from, if restricted by config.
    pub fn port_range(&self) -> Option<PortRange> {
        self.port_range
    }

    /// `BEGIN IMMEDIATE`: take the write lock up front so a concurrent writer
    /// waits on the busy timeout rather than failing mid-transaction.
    pub(crate) fn write_tx(&mut self) -> Result<Transaction<'_>, RegistryError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_file_and_parent_dirs() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("nested").join("registry.db");
        let store = Store::open(&path).expect("open");
        assert!(path.exists());
        assert_eq!(store.migration_report().from, SchemaGeneration::Empty);
        assert_eq!(store.schema_generation().unwrap(), SchemaGeneration::Current);
        store.close().expect("close");
    }

    #[cfg(unix)]
    #[test]
    fn new_store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("registry.db");
        Store::open(&path).expect("open").close().expect("close");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "expected 0600, got {mode:o}");
    }

    #[test]
    fn reopen_is_a_noop_migration() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("registry.db");
        Store::open(&path).expect("first").close().expect("close");
        let store = Store::open(&path).expect("second");
        assert!(!store.migration_report().migrated());
    }

    #[test]
    fn garbage_file_is_unavailable() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("registry.db");
        std::fs::write(&path, vec![0xAB; 8192]).unwrap();
        let err = Store::open(&path).unwrap_err();
        assert!(matches!(err, RegistryError::StoreUnavailable { .. }), "got: {err}");
        assert!(err.to_string().contains("registry.db"));
    }

    #[test]
    fn in_memory_store_enforces_foreign_keys() {
        let store = Store::in_memory().expect("open");
        let fk: i64 = store
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn open_default_at_honours_config_path() {
        let home = TempDir::new().expect("tempdir");
        let custom = home.path().join("elsewhere").join("ports.db");
        crate::config::save_config_at(
            home.path(),
            &RegistryConfig {
                store_path: Some(custom.clone()),
                ..RegistryConfig::default()
            },
        )
        .expect("save config");

        let store = Store::open_default_at(home.path()).expect("open");
        assert_eq!(store.path(), custom.as_path());
        assert!(custom.exists());
    }
}
