//! Store options, optionally read from a `cairn.toml` beside the canonical file.

use crate::core::error::CairnError;
use crate::core::history::DEFAULT_MAX_COUNT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "cairn.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Refuse every write to the canonical file and the change directory.
    pub read_only: bool,
    /// Copy the canonical file into `Backup/` before replacing it.
    pub backup: bool,
    /// Fold key case when looking records up.
    pub ignore_case: bool,
    /// Skip all flag bookkeeping and act as master.
    pub unflagged: bool,
    /// Load the canonical file and merge change files on open.
    pub autoload: bool,
    /// Snapshots kept per key.
    pub max_count: usize,
    /// Tick distance under which two versions count as the same.
    pub sharpness_ticks: i64,
    /// Indent written JSON.
    pub pretty: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            backup: false,
            ignore_case: false,
            unflagged: false,
            autoload: true,
            max_count: DEFAULT_MAX_COUNT,
            sharpness_ticks: 0,
            pretty: false,
        }
    }
}

impl StoreOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Options for a throwaway copy used only to compare against disk.
    pub(crate) fn comparison(&self) -> Self {
        Self {
            read_only: true,
            unflagged: true,
            autoload: false,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), CairnError> {
        if self.max_count == 0 {
            return Err(CairnError::ConfigError(
                "max_count must be at least 1".to_string(),
            ));
        }
        if self.sharpness_ticks < 0 {
            return Err(CairnError::ConfigError(
                "sharpness_ticks must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn config_path(store_dir: &Path) -> PathBuf {
    store_dir.join(CONFIG_FILE_NAME)
}

/// Options from `<store_dir>/cairn.toml`; defaults when the file does not exist.
pub fn load_options(store_dir: &Path) -> Result<StoreOptions, CairnError> {
    let path = config_path(store_dir);
    if !path.exists() {
        return Ok(StoreOptions::default());
    }
    let content = fs::read_to_string(&path)?;
    let options: StoreOptions = toml::from_str(&content)
        .map_err(|e| {
            CairnError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })?;
    options.validate()?;
    tracing::debug!(config = %path.display(), "loaded store options");
    Ok(options)
}
