pub mod ports;
pub mod reserve;
pub mod session;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use berth_core::{config, RegistryConfig, Store};

/// Open the registry, honouring a `--store` override.
///
/// With an override the config file still supplies the busy timeout and port
/// range; a missing home directory just means defaults.
pub fn open_store(store_override: Option<&Path>) -> Result<Store> {
    let store = match store_override {
        Some(path) => {
            let config = match config::home() {
                Ok(home) => config::load_config_at(&home).with_context(|| {
                    format!("failed to load {}", config::config_path_at(&home).display())
                })?,
                Err(_) => RegistryConfig::default(),
            };
            Store::open_with(path, &config)
                .with_context(|| format!("failed to open registry at {}", path.display()))
        }
        None => Store::open_default().context("failed to open registry"),
    }?;
    tracing::debug!(path = %store.path().display(), "opened registry");
    Ok(store)
}

/// Absolute form of `path`, relative paths resolved against the working directory.
pub fn absolute(path: Option<PathBuf>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    Ok(match path {
        Some(p) if p.is_absolute() => p,
        Some(p) => cwd.join(p),
        None => cwd,
    })
}

pub fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(payload).context("failed to serialize JSON output")?
    );
    Ok(())
}
