//! GT-016: Project settings (gantry.toml).
//!
//! Every field is optional. Precedence, highest first: CLI flag,
//! gantry.toml, declaration policy, built-in default.

use super::error::GantryError;
use super::types::Policy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "gantry.toml";
pub const DEFAULT_STATE_DIR: &str = "state";
pub const DEFAULT_CLOUD_DIR: &str = ".gantry/cloud";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Shared root for every stack's state directory
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Where the local provider persists its resources
    #[serde(default)]
    pub cloud_dir: Option<PathBuf>,

    /// YAML map of secret values
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,

    #[serde(default)]
    pub parallelism: Option<usize>,

    #[serde(default)]
    pub refresh: Option<bool>,

    /// Keys secret fingerprints; changing it re-plans every secret property
    #[serde(default)]
    pub fingerprint_salt: Option<String>,
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn parse(text: &str) -> Result<Self, GantryError> {
        toml::from_str(text).map_err(|e| GantryError::Config(format!("{}: {}", SETTINGS_FILE, e)))
    }

    /// Load a settings file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, GantryError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| GantryError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let settings = Self::parse(&text)?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// `gantry.toml` in `dir`, if present.
    pub fn discover(dir: &Path) -> Result<Self, GantryError> {
        Self::load(&dir.join(SETTINGS_FILE))
    }

    pub fn state_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.state_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn cloud_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.cloud_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CLOUD_DIR))
    }

    pub fn secrets_file(&self, flag: Option<&Path>) -> Option<PathBuf> {
        flag.map(Path::to_path_buf).or_else(|| self.secrets_file.clone())
    }

    /// Salt for secret fingerprints. Without one, fingerprints are keyed by
    /// a fixed context only.
    pub fn fingerprint_salt(&self) -> &str {
        self.fingerprint_salt.as_deref().unwrap_or_default()
    }

    pub fn parallelism(&self, flag: Option<usize>, policy: &Policy) -> usize {
        flag.or(self.parallelism).unwrap_or(policy.parallelism).max(1)
    }

    pub fn refresh(&self, no_refresh: bool, policy: &Policy) -> bool {
        !no_refresh && self.refresh.unwrap_or(policy.refresh)
    }
}
