use crate::{error::IndexError, paths::is_hidden_path};
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};

/// Name of the per-workspace configuration file, looked up at the workspace root.
pub const CONFIG_FILE_NAME: &str = ".typst-oxide.toml";

/// Which metadata collaborator the extractor hands file content to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExtractorConfig {
    /// Native scanner for `#meta(...)` and `#metadata((...))` blocks
    #[default]
    Inline,
    /// Shell out to `typst query`
    Typst {
        #[serde(default = "default_typst_binary")]
        binary: String,
    },
}

fn default_typst_binary() -> String {
    "typst".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 50,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `initial_backoff_ms * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Cache database file, relative to the workspace root
    pub db_file: String,
    /// Extensions of notes that are parsed and indexed. Anything else is an external target.
    pub managed_extensions: Vec<String>,
    pub ignore_hidden: bool,
    pub debounce_ms: u64,
    pub store_retry: RetryConfig,
    pub extractor: ExtractorConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            db_file: ".pkm-cache.db".to_string(),
            managed_extensions: vec!["typ".to_string()],
            ignore_hidden: true,
            debounce_ms: 500,
            store_retry: RetryConfig::default(),
            extractor: ExtractorConfig::default(),
        }
    }
}

impl IndexConfig {
    pub fn is_managed_extension(&self, ext: &str) -> bool {
        self.managed_extensions
            .iter()
            .any(|managed| managed.eq_ignore_ascii_case(ext))
    }

    /// Whether a workspace file should be parsed and indexed. With `ignore_hidden`, a file is
    /// skipped when any component below `root` is hidden, not just its own name.
    pub fn is_managed_path(&self, root: &Path, path: &Path) -> bool {
        if self.ignore_hidden && is_hidden_path(root, path) {
            return false;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.is_managed_extension(ext))
    }

    pub fn db_path(&self, root: &Path) -> PathBuf {
        root.join(&self.db_file)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<IndexConfig, IndexError>;
    fn save(&self, config: &IndexConfig) -> Result<(), IndexError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    /// Provider for the configuration file at the root of `workspace`.
    pub fn for_workspace(workspace: &Path) -> Self {
        TomlConfigProvider::new(workspace.join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn load(&self) -> Result<IndexConfig, IndexError> {
        tracing::debug!("Attempting to read config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(IndexConfig::default());
        }
        let content = read_to_string(&self.path)?;
        let config: IndexConfig = toml::from_str(&content)?;
        if config.managed_extensions.is_empty() {
            return Err(IndexError::Config(
                "managed_extensions must name at least one extension".to_string(),
            ));
        }
        Ok(config)
    }

    fn save(&self, config: &IndexConfig) -> Result<(), IndexError> {
        tracing::debug!("Attempting to write config to: {:?}", &self.path);
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
