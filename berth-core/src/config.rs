//! Registry configuration and on-disk locations.
//!
//! # Storage layout
//!
//! ```text
//! ~/.berth/             (mode 0700, created on first open)
//!   config.yaml         (optional — defaults apply when absent)
//!   registry.db         (SQLite store — mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every home-relative function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, RegistryError};
use crate::types::PortRange;

pub const BERTH_DIR: &str = ".berth";
pub const CONFIG_FILE: &str = "config.yaml";
pub const STORE_FILE: &str = "registry.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Tunables read from `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Overrides `<home>/.berth/registry.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    /// How long a writer waits on a locked store before failing.
    pub busy_timeout_ms: u64,
    /// Restrict automatic allocation to this range. `None` lets the OS pick
    /// from its ephemeral range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            port_range: None,
        }
    }
}

impl RegistryConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// The store file this config points at, relative to `home` when not overridden.
    pub fn resolve_store_path(&self, home: &Path) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| default_store_path_at(home))
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some(range) = &self.port_range {
            range.validate()?;
        }
        Ok(())
    }
}

/// `<home>/.berth/`
pub fn berth_dir_at(home: &Path) -> PathBuf {
    home.join(BERTH_DIR)
}

/// `<home>/.berth/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    berth_dir_at(home).join(CONFIG_FILE)
}

/// `<home>/.berth/registry.db` — pure, no I/O.
pub fn default_store_path_at(home: &Path) -> PathBuf {
    berth_dir_at(home).join(STORE_FILE)
}

/// Load `<home>/.berth/config.yaml`, or defaults if the file does not exist.
///
/// Returns `RegistryError::Config` (with path and serde_yaml context) if malformed.
pub fn load_config_at(home: &Path) -> Result<RegistryConfig, RegistryError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(RegistryConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: RegistryConfig = serde_yaml::from_str(&contents)
        .map_err(|source| RegistryError::Config { path, source })?;
    config.validate()?;
    Ok(config)
}

/// `load_config_at` convenience wrapper.
pub fn load_config() -> Result<RegistryConfig, RegistryError> {
    load_config_at(&home()?)
}

/// Atomically write `config.yaml`: serialize → `.yaml.tmp` sibling → `rename`.
pub fn save_config_at(home: &Path, config: &RegistryConfig) -> Result<(), RegistryError> {
    let dir = berth_dir_at(home);
    ensure_private_dir(&dir)?;
    let path = config_path_at(home);
    let tmp_path = path.with_extension("yaml.tmp");

    let yaml = serde_yaml::to_string(config).map_err(|source| RegistryError::Config {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

pub fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

/// Creates `dir` (mode `0700`) if it does not yet exist.
pub(crate) fn ensure_private_dir(dir: &Path) -> Result<(), RegistryError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
pub(crate) fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}
