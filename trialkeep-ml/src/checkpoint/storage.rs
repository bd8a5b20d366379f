//! Storage engines behind the retention controller.
//!
//! The controller decides *when* to save and delete; a [`CheckpointStorage`]
//! decides *how* bytes land on disk. Every checkpoint is a flat directory
//! holding one item, an optional metrics record, and a finalization marker
//! written last.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use trialkeep_core::persistence::{atomic_write, atomic_write_json, load_json};
use trialkeep_core::{CheckpointError, Result};

use crate::metrics::Metrics;

/// File holding the checkpointed item inside a checkpoint directory.
pub const ITEM_FILE: &str = "item.json";
/// File holding the metrics record used by track-best mode.
pub const METRICS_FILE: &str = "metrics.json";
/// Marker written once every other file of a checkpoint is durable.
pub const COMMIT_MARKER: &str = "commit_success.txt";

/// Narrow interface to the checkpoint storage engine.
pub trait CheckpointStorage: Send + Sync {
    /// The checkpointed item. Opaque to the controller.
    type Item;

    fn save(&self, dir: &Path, item: &Self::Item) -> Result<()>;
    fn save_metrics(&self, dir: &Path, metrics: &Metrics) -> Result<()>;
    /// Mark `dir` as completely written.
    fn finalize(&self, dir: &Path) -> Result<()>;
    fn load(&self, dir: &Path) -> Result<Option<Self::Item>>;
    fn load_metrics(&self, dir: &Path) -> Result<Option<Metrics>>;
    /// Names of the direct children of `dir`.
    fn list_entries(&self, dir: &Path) -> Result<Vec<String>>;
    fn rename(&self, src: &Path, dst: &Path) -> Result<()>;
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn is_finalized(&self, path: &Path) -> bool;
    fn modified(&self, path: &Path) -> Result<DateTime<Utc>>;
    /// Structural description of the item saved in `dir`.
    fn structure(&self, dir: &Path) -> Result<serde_json::Value>;
    /// Simulated backends skip crash recovery.
    fn is_mock(&self) -> bool {
        false
    }
}

/// Replace every leaf of a JSON tree with the name of its type.
pub fn describe_structure(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), describe_structure(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(describe_structure).collect()),
        Value::Null => Value::String("null".into()),
        Value::Bool(_) => Value::String("bool".into()),
        Value::Number(_) => Value::String("number".into()),
        Value::String(_) => Value::String("string".into()),
    }
}

fn storage_error(path: &Path, message: impl Into<String>) -> CheckpointError {
    CheckpointError::Storage {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Local filesystem engine storing items as JSON.
pub struct LocalFsStorage<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for LocalFsStorage<T> {
    fn default() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> LocalFsStorage<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> CheckpointStorage for LocalFsStorage<T>
where
    T: Serialize + DeserializeOwned,
{
    type Item = T;

    fn save(&self, dir: &Path, item: &T) -> Result<()> {
        atomic_write_json(&dir.join(ITEM_FILE), item)?;
        Ok(())
    }

    fn save_metrics(&self, dir: &Path, metrics: &Metrics) -> Result<()> {
        atomic_write_json(&dir.join(METRICS_FILE), metrics)?;
        Ok(())
    }

    fn finalize(&self, dir: &Path) -> Result<()> {
        atomic_write(&dir.join(COMMIT_MARKER), Utc::now().to_rfc3339().as_bytes())?;
        Ok(())
    }

    fn load(&self, dir: &Path) -> Result<Option<T>> {
        Ok(load_json(&dir.join(ITEM_FILE))?)
    }

    fn load_metrics(&self, dir: &Path) -> Result<Option<Metrics>> {
        Ok(load_json(&dir.join(METRICS_FILE))?)
    }

    fn list_entries(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        // Destination is replaced, not conflict-checked: last writer wins.
        if dst.is_dir() {
            std::fs::remove_dir_all(dst)?;
        }
        std::fs::rename(src, dst)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_finalized(&self, path: &Path) -> bool {
        path.join(COMMIT_MARKER).is_file()
    }

    fn modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        let mtime = std::fs::metadata(path)?.modified()?;
        Ok(DateTime::<Utc>::from(mtime))
    }

    fn structure(&self, dir: &Path) -> Result<serde_json::Value> {
        let value: Option<serde_json::Value> = load_json(&dir.join(ITEM_FILE))?;
        let value = value.ok_or_else(|| storage_error(dir, "checkpoint has no item"))?;
        Ok(describe_structure(&value))
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry<T> {
    item: Option<T>,
    metrics: Option<Metrics>,
    finalized: bool,
    modified: DateTime<Utc>,
}

impl<T> MemoryEntry<T> {
    fn empty() -> Self {
        Self {
            item: None,
            metrics: None,
            finalized: false,
            modified: Utc::now(),
        }
    }
}

/// In-memory engine simulating a storage backend. Reports itself as a mock,
/// so crash recovery is skipped.
pub struct InMemoryStorage<T> {
    dirs: Mutex<BTreeMap<PathBuf, MemoryEntry<T>>>,
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self {
            dirs: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> InMemoryStorage<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_dirs<R>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut BTreeMap<PathBuf, MemoryEntry<T>>) -> Result<R>,
    ) -> Result<R> {
        let mut dirs = self
            .dirs
            .lock()
            .map_err(|_| storage_error(path, "in-memory storage poisoned"))?;
        f(&mut dirs)
    }

    fn entry_mut<'a>(
        dirs: &'a mut BTreeMap<PathBuf, MemoryEntry<T>>,
        dir: &Path,
    ) -> Result<&'a mut MemoryEntry<T>> {
        dirs.get_mut(dir)
            .ok_or_else(|| storage_error(dir, "directory does not exist").into())
    }
}

impl<T> CheckpointStorage for InMemoryStorage<T>
where
    T: Clone + Serialize + Send,
{
    type Item = T;

    fn save(&self, dir: &Path, item: &T) -> Result<()> {
        self.with_dirs(dir, |dirs| {
            let entry = Self::entry_mut(dirs, dir)?;
            entry.item = Some(item.clone());
            entry.modified = Utc::now();
            Ok(())
        })
    }

    fn save_metrics(&self, dir: &Path, metrics: &Metrics) -> Result<()> {
        self.with_dirs(dir, |dirs| {
            Self::entry_mut(dirs, dir)?.metrics = Some(metrics.clone());
            Ok(())
        })
    }

    fn finalize(&self, dir: &Path) -> Result<()> {
        self.with_dirs(dir, |dirs| {
            Self::entry_mut(dirs, dir)?.finalized = true;
            Ok(())
        })
    }

    fn load(&self, dir: &Path) -> Result<Option<T>> {
        self.with_dirs(dir, |dirs| Ok(dirs.get(dir).and_then(|e| e.item.clone())))
    }

    fn load_metrics(&self, dir: &Path) -> Result<Option<Metrics>> {
        self.with_dirs(dir, |dirs| Ok(dirs.get(dir).and_then(|e| e.metrics.clone())))
    }

    fn list_entries(&self, dir: &Path) -> Result<Vec<String>> {
        self.with_dirs(dir, |dirs| {
            Ok(dirs
                .keys()
                .filter(|p| p.parent() == Some(dir))
                .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
                .collect())
        })
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        self.with_dirs(src, |dirs| {
            let entry = dirs
                .remove(src)
                .ok_or_else(|| storage_error(src, "directory does not exist"))?;
            dirs.insert(dst.to_path_buf(), entry);
            Ok(())
        })
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        self.with_dirs(path, |dirs| {
            dirs.retain(|p, _| !p.starts_with(path));
            Ok(())
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.with_dirs(path, |dirs| {
            for ancestor in path.ancestors() {
                if ancestor.as_os_str().is_empty() {
                    continue;
                }
                dirs.entry(ancestor.to_path_buf())
                    .or_insert_with(MemoryEntry::empty);
            }
            Ok(())
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.dirs
            .lock()
            .map(|d| d.contains_key(path))
            .unwrap_or(false)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.exists(path)
    }

    fn is_finalized(&self, path: &Path) -> bool {
        self.dirs
            .lock()
            .map(|d| d.get(path).is_some_and(|e| e.finalized))
            .unwrap_or(false)
    }

    fn modified(&self, path: &Path) -> Result<DateTime<Utc>> {
        self.with_dirs(path, |dirs| Ok(Self::entry_mut(dirs, path)?.modified))
    }

    fn structure(&self, dir: &Path) -> Result<serde_json::Value> {
        let item = self
            .load(dir)?
            .ok_or_else(|| storage_error(dir, "checkpoint has no item"))?;
        Ok(describe_structure(&serde_json::to_value(item)?))
    }

    fn is_mock(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_describe_structure() {
        let value = json!({"params": {"w": [1.0, 2.0], "name": "dense"}, "step": 3});
        assert_eq!(
            describe_structure(&value),
            json!({"params": {"w": ["number", "number"], "name": "string"}, "step": "number"})
        );
    }

    #[test]
    fn test_local_fs_save_finalize_load() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::<serde_json::Value>::new();
        let ckpt = dir.path().join("checkpoint_1");
        storage.create_dir_all(&ckpt).unwrap();

        storage.save(&ckpt, &json!({"w": 1})).unwrap();
        assert!(!storage.is_finalized(&ckpt));
        storage.finalize(&ckpt).unwrap();
        assert!(storage.is_finalized(&ckpt));
        assert_eq!(storage.load(&ckpt).unwrap(), Some(json!({"w": 1})));
        assert_eq!(storage.load_metrics(&ckpt).unwrap(), None);
    }

    #[test]
    fn test_local_fs_list_missing_dir() {
        let storage = LocalFsStorage::<serde_json::Value>::new();
        let entries = storage.list_entries(Path::new("/nonexistent/ckpts")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_local_fs_rename_replaces_destination() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::<serde_json::Value>::new();
        let src = dir.path().join("checkpoint_2");
        let dst = dir.path().join("archive").join("checkpoint_2");
        storage.create_dir_all(&src).unwrap();
        storage.save(&src, &json!("new")).unwrap();
        storage.create_dir_all(&dst).unwrap();
        storage.save(&dst, &json!("old")).unwrap();

        storage.rename(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(storage.load(&dst).unwrap(), Some(json!("new")));
    }

    #[test]
    fn test_in_memory_listing_and_rename() {
        let storage = InMemoryStorage::<u32>::new();
        let root = Path::new("/ckpt");
        storage.create_dir_all(&root.join("checkpoint_1")).unwrap();
        storage.create_dir_all(&root.join("checkpoint_2")).unwrap();
        storage.save(&root.join("checkpoint_2"), &7).unwrap();

        let mut entries = storage.list_entries(root).unwrap();
        entries.sort();
        assert_eq!(entries, vec!["checkpoint_1", "checkpoint_2"]);

        storage.create_dir_all(&root.join("archive")).unwrap();
        storage
            .rename(&root.join("checkpoint_2"), &root.join("archive/checkpoint_2"))
            .unwrap();
        assert_eq!(storage.load(&root.join("archive/checkpoint_2")).unwrap(), Some(7));
        assert!(!storage.exists(&root.join("checkpoint_2")));
        assert!(storage.is_mock());
    }

    #[test]
    fn test_in_memory_save_into_missing_dir_fails() {
        let storage = InMemoryStorage::<u32>::new();
        assert!(storage.save(Path::new("/nowhere"), &1).is_err());
    }
}
