//! Runtime library layout configuration.
//!
//! The runtime for id `N` lives at `{library_dir}/{file_name}` where the
//! file name template expands `{id}` to `N` and `{prefix}`/`{suffix}` to
//! the platform's shared-library affixes (`lib`/`.so`, `lib`/`.dylib`,
//! `""`/`.dll`).

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DlrError;
use crate::runtime::RuntimeId;

/// Environment variable overriding [`RuntimeConfig::library_dir`].
pub const LIBRARY_PATH_ENV: &str = "DLR_LIBRARY_PATH";
/// Default file name template.
pub const DEFAULT_FILE_NAME: &str = "{prefix}dlr_{id}{suffix}";

/// Where runtime libraries are found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding the runtime libraries.
    pub library_dir: PathBuf,
    /// File name template; must contain `{id}`.
    pub file_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            library_dir: default_library_dir(),
            file_name: DEFAULT_FILE_NAME.to_string(),
        }
    }
}

fn default_library_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".djl.ai").join("dlr"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl RuntimeConfig {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
            ..Self::default()
        }
    }

    /// Default configuration with `DLR_LIBRARY_PATH` applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var(LIBRARY_PATH_ENV) {
            if !dir.is_empty() {
                cfg.library_dir = PathBuf::from(dir);
            }
        }
        cfg
    }

    /// Loads a configuration file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DlrError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("yaml")
            .to_lowercase();

        let cfg: Self = match ext.as_str() {
            "json" => serde_json::from_str(&content).map_err(|e| DlrError::Config(format!("{path:?}: {e}")))?,
            _ => serde_yaml::from_str(&content).map_err(|e| DlrError::Config(format!("{path:?}: {e}")))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Sets the file name template.
    pub fn with_file_name(mut self, template: impl Into<String>) -> Self {
        self.file_name = template.into();
        self
    }

    pub fn validate(&self) -> Result<(), DlrError> {
        if !self.file_name.contains("{id}") {
            return Err(DlrError::Config(format!(
                "file name template {:?} must contain {{id}}",
                self.file_name
            )));
        }
        Ok(())
    }

    /// Resolves the library path for a runtime id.
    pub fn library_path(&self, id: RuntimeId) -> Result<PathBuf, DlrError> {
        self.validate()?;
        let name = self
            .file_name
            .replace("{prefix}", DLL_PREFIX)
            .replace("{suffix}", DLL_SUFFIX)
            .replace("{id}", &id.to_string());
        Ok(self.library_dir.join(name))
    }
}
