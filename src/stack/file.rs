//! GT-041: Stack outputs read from another stack's state directory.

use super::{StackLookup, StackResolver};
use crate::core::error::GantryError;
use crate::core::state::{load_exports, stack_dir, IN_PROGRESS_MARKER};
use async_trait::async_trait;
use std::path::PathBuf;

/// Reads `exports.yaml` of sibling stacks under a shared state root.
/// A stack whose apply is running answers `Pending`.
#[derive(Debug, Clone)]
pub struct FileStackResolver {
    state_root: PathBuf,
}

impl FileStackResolver {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }
}

#[async_trait]
impl StackResolver for FileStackResolver {
    async fn resolve(&self, system_id: &str, output_key: &str) -> Result<StackLookup, GantryError> {
        let dir = stack_dir(&self.state_root, system_id);
        if dir.join(IN_PROGRESS_MARKER).exists() {
            return Ok(StackLookup::Pending);
        }
        let exports = load_exports(&dir).map_err(GantryError::State)?;
        Ok(exports
            .and_then(|mut e| e.shift_remove(output_key))
            .map_or(StackLookup::NotFound, StackLookup::Value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::save_exports;
    use indexmap::IndexMap;
    use serde_json::json;

    #[tokio::test]
    async fn test_gt041_reads_exports() {
        let root = tempfile::tempdir().unwrap();
        let core = stack_dir(root.path(), "org/booth-game/core");
        save_exports(
            &core,
            &IndexMap::from([("apiGatewayId".to_string(), json!("api-000001"))]),
        )
        .unwrap();

        let r = FileStackResolver::new(root.path());
        assert_eq!(
            r.resolve("org/booth-game/core", "apiGatewayId").await.unwrap(),
            StackLookup::Value(json!("api-000001"))
        );
        assert_eq!(
            r.resolve("org/booth-game/core", "nope").await.unwrap(),
            StackLookup::NotFound
        );
        assert_eq!(
            r.resolve("org/never-deployed", "x").await.unwrap(),
            StackLookup::NotFound
        );
    }

    #[tokio::test]
    async fn test_gt041_pending_while_applying() {
        let root = tempfile::tempdir().unwrap();
        let core = stack_dir(root.path(), "core");
        std::fs::create_dir_all(&core).unwrap();
        std::fs::write(core.join(IN_PROGRESS_MARKER), "2026-10-14T10:00:00Z").unwrap();
        let r = FileStackResolver::new(root.path());
        assert_eq!(r.resolve("core", "x").await.unwrap(), StackLookup::Pending);
    }
}
