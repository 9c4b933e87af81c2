//! Secret stores: a source of plaintext wrapped by a sealing vault.

use super::{SecretHandle, SecretVault};
use crate::core::error::GantryError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// `require_secret(key) -> opaque handle`.
pub trait SecretStore: Send + Sync {
    fn require_secret(&self, key: &str) -> Result<SecretHandle, GantryError>;
}

/// Backing store of plaintext secrets.
pub trait SecretSource: Send + Sync {
    fn fetch(&self, key: &str) -> Result<Option<String>, GantryError>;
}

/// Seals every value fetched from its source.
pub struct SealingStore<S> {
    vault: Arc<SecretVault>,
    source: S,
}

impl<S: SecretSource> SealingStore<S> {
    pub fn new(vault: Arc<SecretVault>, source: S) -> Self {
        Self { vault, source }
    }
}

impl<S: SecretSource> SecretStore for SealingStore<S> {
    fn require_secret(&self, key: &str) -> Result<SecretHandle, GantryError> {
        let plain = self
            .source
            .fetch(key)?
            .ok_or_else(|| GantryError::MissingSecret(key.to_string()))?;
        tracing::debug!(key, "sealed secret");
        self.vault.seal(key, &plain)
    }
}

/// Secrets from environment variables: `openai-api-key` is read from
/// `GANTRY_SECRET_OPENAI_API_KEY`.
pub struct EnvSource {
    prefix: String,
}

impl EnvSource {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn var_name(&self, key: &str) -> String {
        let mangled: String = key
            .chars()
            .map(|c| match c {
                '-' | '.' | '/' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix, mangled)
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::new("GANTRY_SECRET_")
    }
}

impl SecretSource for EnvSource {
    fn fetch(&self, key: &str) -> Result<Option<String>, GantryError> {
        Ok(std::env::var(self.var_name(key)).ok())
    }
}

/// Secrets from a YAML map file (`key: value`).
pub struct FileSource {
    values: HashMap<String, String>,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, GantryError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GantryError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let values: HashMap<String, String> = serde_yaml_ng::from_str(&content).map_err(|e| {
            GantryError::Config(format!("invalid secrets file {}: {}", path.display(), e))
        })?;
        Ok(Self { values })
    }
}

impl SecretSource for FileSource {
    fn fetch(&self, key: &str) -> Result<Option<String>, GantryError> {
        Ok(self.values.get(key).cloned())
    }
}

/// In-memory secrets.
#[derive(Default)]
pub struct MemorySource {
    values: HashMap<String, String>,
}

impl MemorySource {
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl SecretSource for MemorySource {
    fn fetch(&self, key: &str) -> Result<Option<String>, GantryError> {
        Ok(self.values.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gt020_memory_store() {
        let store = SealingStore::new(
            SecretVault::generate(),
            MemorySource::default().with("db-password", "pw"),
        );
        let h = store.require_secret("db-password").unwrap();
        assert_eq!(h.reveal().unwrap(), "pw");
    }

    #[test]
    fn test_gt020_missing_secret() {
        let store = SealingStore::new(SecretVault::generate(), MemorySource::default());
        let err = store.require_secret("nope").unwrap_err();
        assert_eq!(err, GantryError::MissingSecret("nope".to_string()));
    }

    #[test]
    fn test_gt020_env_var_name() {
        let src = EnvSource::default();
        assert_eq!(
            src.var_name("openai-api-key"),
            "GANTRY_SECRET_OPENAI_API_KEY"
        );
        assert_eq!(src.var_name("a.b/c"), "GANTRY_SECRET_A_B_C");
    }

    #[test]
    fn test_gt020_env_source_missing_is_none() {
        let src = EnvSource::new("GANTRY_TEST_UNSET_PREFIX_");
        assert!(src.fetch("surely-not-set").unwrap().is_none());
    }

    #[test]
    fn test_gt020_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");
        std::fs::write(&path, "openai-api-key: sk-1\ndeepchecks-api-key: dc-2\n").unwrap();
        let store = SealingStore::new(SecretVault::generate(), FileSource::open(&path).unwrap());
        assert_eq!(
            store.require_secret("deepchecks-api-key").unwrap().reveal().unwrap(),
            "dc-2"
        );
        assert!(store.require_secret("other").is_err());
    }

    #[test]
    fn test_gt020_file_source_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");
        std::fs::write(&path, "- not\n- a map\n").unwrap();
        assert!(matches!(FileSource::open(&path), Err(GantryError::Config(_))));
    }
}
