//! GT-007: Versioned actual-state store with per-record locking.
//!
//! Layout under the state root:
//!
//! ```text
//! <root>/<stack>/resources/<type>/<name>.yaml   one record per resource
//! <root>/<stack>/exports.yaml                   published outputs
//! <root>/<stack>/events.jsonl                   provenance log
//! <root>/<stack>/apply.inprogress               present while applying
//! ```
//!
//! Every record lives behind its own async mutex. Writes to different
//! records never contend; writes to the same record are serialized and bump
//! its version.

use super::error::GantryError;
use super::types::{ResourceKey, ResourceRecord};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Marker file present while an apply runs against a stack.
pub const IN_PROGRESS_MARKER: &str = "apply.inprogress";

/// Directory of one stack under the state root. Stack names may contain
/// `/`, which nests directories.
pub fn stack_dir(state_root: &Path, stack: &str) -> PathBuf {
    stack
        .split('/')
        .fold(state_root.to_path_buf(), |p, segment| p.join(segment))
}

/// Path of a single record file.
pub fn record_path(stack_dir: &Path, key: &ResourceKey) -> PathBuf {
    stack_dir
        .join("resources")
        .join(key.resource_type.as_str())
        .join(format!("{}.yaml", key.name))
}

fn exports_path(stack_dir: &Path) -> PathBuf {
    stack_dir.join("exports.yaml")
}

/// Write a file atomically (temp file, then rename).
fn write_atomic(path: &Path, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content).map_err(|e| format!("cannot write {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| format!("cannot rename {} → {}: {}", tmp.display(), path.display(), e))
}

/// Load one record file.
pub fn load_record(path: &Path) -> Result<ResourceRecord, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_yaml_ng::from_str(&content).map_err(|e| format!("invalid record {}: {}", path.display(), e))
}

/// Save one record file atomically.
pub fn save_record(stack_dir: &Path, record: &ResourceRecord) -> Result<(), String> {
    let yaml = serde_yaml_ng::to_string(record).map_err(|e| format!("serialize error: {}", e))?;
    write_atomic(&record_path(stack_dir, &record.key()), &yaml)
}

/// Load a stack's published exports. `None` if the stack never published.
pub fn load_exports(stack_dir: &Path) -> Result<Option<IndexMap<String, serde_json::Value>>, String> {
    let path = exports_path(stack_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let exports = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid exports {}: {}", path.display(), e))?;
    Ok(Some(exports))
}

/// Publish a stack's exports atomically.
pub fn save_exports(stack_dir: &Path, exports: &IndexMap<String, serde_json::Value>) -> Result<(), String> {
    let yaml = serde_yaml_ng::to_string(exports).map_err(|e| format!("serialize error: {}", e))?;
    write_atomic(&exports_path(stack_dir), &yaml)
}

/// Every stack under a state root, as `/`-joined names, sorted.
/// A stack directory holds records or published exports.
pub fn list_stacks(state_root: &Path) -> Result<Vec<String>, String> {
    let mut stacks = Vec::new();
    if state_root.is_dir() {
        walk_stacks(state_root, &mut Vec::new(), &mut stacks)?;
    }
    stacks.sort();
    Ok(stacks)
}

fn walk_stacks(dir: &Path, segments: &mut Vec<String>, out: &mut Vec<String>) -> Result<(), String> {
    if !segments.is_empty() && (dir.join("resources").is_dir() || exports_path(dir).exists()) {
        out.push(segments.join("/"));
    }
    let entries = std::fs::read_dir(dir).map_err(|e| format!("cannot read {}: {}", dir.display(), e))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_dir() || name == "resources" {
            continue;
        }
        segments.push(name);
        walk_stacks(&path, segments, out)?;
        segments.pop();
    }
    Ok(())
}

fn read_records(stack_dir: &Path) -> Result<Vec<ResourceRecord>, String> {
    let root = stack_dir.join("resources");
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    let types = std::fs::read_dir(&root).map_err(|e| format!("cannot read {}: {}", root.display(), e))?;
    for type_dir in types.filter_map(|e| e.ok()) {
        if !type_dir.path().is_dir() {
            continue;
        }
        let files = std::fs::read_dir(type_dir.path())
            .map_err(|e| format!("cannot read {}: {}", type_dir.path().display(), e))?;
        for file in files.filter_map(|e| e.ok()) {
            let path = file.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                records.push(load_record(&path)?);
            }
        }
    }
    Ok(records)
}

#[derive(Debug, Default)]
struct Slot {
    record: Option<ResourceRecord>,
    version: u64,
}

/// Actual-state store for one stack.
#[derive(Debug)]
pub struct StateStore {
    stack: String,
    dir: Option<PathBuf>,
    index: RwLock<BTreeMap<ResourceKey, Arc<Mutex<Slot>>>>,
}

impl StateStore {
    /// Open (or start) a stack's state under `state_root`.
    pub fn open(state_root: &Path, stack: &str) -> Result<Self, GantryError> {
        let dir = stack_dir(state_root, stack);
        let mut index = BTreeMap::new();
        for record in read_records(&dir).map_err(GantryError::State)? {
            let version = record.version;
            index.insert(
                record.key(),
                Arc::new(Mutex::new(Slot {
                    record: Some(record),
                    version,
                })),
            );
        }
        tracing::debug!(stack, records = index.len(), dir = %dir.display(), "opened state");
        Ok(Self {
            stack: stack.to_string(),
            dir: Some(dir),
            index: RwLock::new(index),
        })
    }

    /// A store that persists nothing.
    pub fn in_memory(stack: &str) -> Self {
        Self {
            stack: stack.to_string(),
            dir: None,
            index: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Stack directory, for file-backed stores.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn slot(&self, key: &ResourceKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(slot);
        }
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(index.entry(key.clone()).or_default())
    }

    fn slots(&self) -> Vec<Arc<Mutex<Slot>>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.slot(key).lock().await.record.clone()
    }

    /// Current version of a record slot (0 if never written).
    pub async fn version(&self, key: &ResourceKey) -> u64 {
        self.slot(key).lock().await.version
    }

    /// Write a record. Returns its new version.
    pub async fn put(&self, mut record: ResourceRecord) -> Result<u64, GantryError> {
        let slot = self.slot(&record.key());
        let mut guard = slot.lock().await;
        let version = guard.version + 1;
        record.version = version;
        if let Some(dir) = &self.dir {
            save_record(dir, &record).map_err(GantryError::State)?;
        }
        guard.record = Some(record);
        guard.version = version;
        Ok(version)
    }

    /// Remove a record after its resource was deleted.
    pub async fn remove(&self, key: &ResourceKey) -> Result<(), GantryError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(dir) = &self.dir {
            let path = record_path(dir, key);
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| GantryError::State(format!("cannot remove {}: {}", path.display(), e)))?;
            }
        }
        guard.record = None;
        guard.version += 1;
        Ok(())
    }

    /// Every present record, ordered by key.
    pub async fn snapshot(&self) -> IndexMap<ResourceKey, ResourceRecord> {
        let mut out = IndexMap::new();
        for slot in self.slots() {
            if let Some(record) = slot.lock().await.record.clone() {
                out.insert(record.key(), record);
            }
        }
        out.sort_keys();
        out
    }

    /// Publish this stack's exports for other stacks.
    pub fn publish_exports(&self, exports: &IndexMap<String, serde_json::Value>) -> Result<(), GantryError> {
        match &self.dir {
            Some(dir) => save_exports(dir, exports).map_err(GantryError::State),
            None => Ok(()),
        }
    }

    pub fn exports(&self) -> Result<Option<IndexMap<String, serde_json::Value>>, GantryError> {
        match &self.dir {
            Some(dir) => load_exports(dir).map_err(GantryError::State),
            None => Ok(None),
        }
    }

    /// Mark the stack as being applied until the guard drops.
    pub fn begin_apply(&self) -> Result<ApplyMarker, GantryError> {
        let Some(dir) = &self.dir else {
            return Ok(ApplyMarker { path: None });
        };
        let path = dir.join(IN_PROGRESS_MARKER);
        write_atomic(&path, &crate::journal::eventlog::now_iso8601()).map_err(GantryError::State)?;
        Ok(ApplyMarker { path: Some(path) })
    }
}

/// Removes the in-progress marker on drop.
#[derive(Debug)]
pub struct ApplyMarker {
    path: Option<PathBuf>,
}

impl Drop for ApplyMarker {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}
