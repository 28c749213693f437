//! Snapshot persistence shared by the tracker and the limiter.
//!
//! A snapshot is one JSON document per component. Loading deep-merges the file
//! into the component's default shape and parses each branch on its own, so a
//! corrupt branch only costs that branch. Saving writes a sibling temp file and
//! renames it over the target.

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Current on-disk schema version.
pub const SNAPSHOT_VERSION: &str = "1.0.0";

/// Atomic JSON snapshot file.
///
/// Clones share the write lock, so writes from the autosave task, detached
/// writes and explicit saves never interleave on the temp file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    // generation of the last snapshot written to disk
    written: Arc<Mutex<u64>>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), written: Arc::new(Mutex::new(0)) }
    }

    /// The snapshot file this store writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Read and parse the snapshot. `Ok(None)` when no file exists yet.
    pub fn load(&self) -> Result<Option<Value>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path: self.path.clone(), source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Json { path: self.path.clone(), source })
    }

    /// Load the snapshot merged over `default`.
    ///
    /// Missing files, unreadable files and unparseable JSON all yield
    /// `default`; the latter two are logged.
    pub fn load_merged(&self, default: Value) -> Value {
        match self.load() {
            Ok(Some(loaded)) if loaded.is_object() => merge_defaults(default, loaded),
            Ok(Some(_)) => {
                warn!(path = %self.path.display(), "snapshot root is not an object; using defaults");
                default
            }
            Ok(None) => default,
            Err(e) => {
                warn!(error = %e, "snapshot unreadable; using defaults");
                default
            }
        }
    }

    /// Write `doc` atomically, regardless of generation.
    pub fn save(&self, doc: &Value) -> Result<(), StoreError> {
        let _written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_atomic(doc)
    }

    /// Write `doc` tagged with `generation`, skipping it when a newer snapshot
    /// already reached disk.
    pub fn save_generation(&self, doc: &Value, generation: u64) -> Result<bool, StoreError> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if generation <= *written {
            debug!(path = %self.path.display(), generation, latest = *written, "stale snapshot skipped");
            return Ok(false);
        }
        self.write_atomic(doc)?;
        *written = generation;
        Ok(true)
    }

    /// Fire-and-forget save. Runs on tokio's blocking pool when called inside
    /// a runtime, inline otherwise. Failures are logged.
    pub fn save_detached(&self, doc: Value, generation: u64) {
        let store = self.clone();
        let job = move || {
            if let Err(e) = store.save_generation(&doc, generation) {
                warn!(error = %e, "detached snapshot write failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    fn write_atomic(&self, doc: &Value) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io { path: self.path.clone(), source };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(doc)
            .map_err(|source| StoreError::Json { path: self.path.clone(), source })?;
        let tmp = self.temp_path();
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

/// Recursively fill keys missing from `loaded` with values from `default`.
///
/// Keys only present in `loaded` survive untouched. When the two sides
/// disagree on whether a key holds an object, `loaded` wins and the typed
/// parse decides later whether it is usable.
pub fn merge_defaults(default: Value, loaded: Value) -> Value {
    match (default, loaded) {
        (Value::Object(defaults), Value::Object(mut existing)) => {
            for (key, default_value) in defaults {
                match existing.remove(&key) {
                    Some(current) => {
                        let merged = merge_defaults(default_value, current);
                        existing.insert(key, merged);
                    }
                    None => {
                        existing.insert(key, default_value);
                    }
                }
            }
            Value::Object(existing)
        }
        (_, loaded) => loaded,
    }
}

/// Remove `key` from `doc` and parse it, falling back to `T::default()`.
pub fn parse_branch<T>(doc: &mut Map<String, Value>, key: &str) -> T
where
    T: DeserializeOwned + Default,
{
    match doc.remove(key) {
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!(branch = key, error = %e, "malformed snapshot branch replaced with default");
            T::default()
        }),
        None => T::default(),
    }
}

/// Remove the map at `key` and parse each entry independently, dropping
/// entries whose key or value is unusable.
pub fn parse_entries<K, T>(
    doc: &mut Map<String, Value>,
    key: &str,
    parse_key: impl Fn(&str) -> Option<K>,
) -> BTreeMap<K, T>
where
    K: Ord,
    T: DeserializeOwned,
{
    let entries = match doc.remove(key) {
        Some(Value::Object(entries)) => entries,
        Some(Value::Null) | None => return BTreeMap::new(),
        Some(_) => {
            warn!(branch = key, "snapshot branch is not a map; replaced with default");
            return BTreeMap::new();
        }
    };
    let mut out = BTreeMap::new();
    for (entry_key, value) in entries {
        let Some(parsed_key) = parse_key(&entry_key) else {
            warn!(branch = key, entry = %entry_key, "unparseable snapshot key dropped");
            continue;
        };
        match serde_json::from_value(value) {
            Ok(parsed) => {
                out.insert(parsed_key, parsed);
            }
            Err(e) => warn!(branch = key, entry = %entry_key, error = %e, "malformed snapshot entry dropped"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_fills_missing_nested_keys_and_keeps_unknown() {
        let default = json!({"metadata": {"version": "1.0.0", "total_calls_ever": 0}, "daily_stats": {}});
        let loaded = json!({"metadata": {"total_calls_ever": 7, "platform": "linux"}, "extra": [1, 2]});
        let merged = merge_defaults(default, loaded);
        assert_eq!(
            merged,
            json!({
                "metadata": {"version": "1.0.0", "total_calls_ever": 7, "platform": "linux"},
                "daily_stats": {},
                "extra": [1, 2]
            })
        );
    }

    #[test]
    fn merge_is_noop_on_complete_input() {
        let default = json!({"a": {"b": 1, "c": [1]}, "d": "x"});
        assert_eq!(merge_defaults(default.clone(), default.clone()), default);
    }

    #[test]
    fn loaded_scalar_beats_default_object() {
        let merged = merge_defaults(json!({"a": {"b": 1}}), json!({"a": 3}));
        assert_eq!(merged, json!({"a": 3}));
    }

    #[test]
    fn parse_branch_falls_back_on_bad_shape() {
        let mut doc = json!({"n": "not a number", "m": 4}).as_object().cloned().unwrap();
        let n: u64 = parse_branch(&mut doc, "n");
        let m: u64 = parse_branch(&mut doc, "m");
        let missing: u64 = parse_branch(&mut doc, "missing");
        assert_eq!((n, m, missing), (0, 4, 0));
        assert!(doc.is_empty());
    }

    #[test]
    fn parse_entries_drops_only_bad_entries() {
        let mut doc = json!({"m": {"a": 1, "b": "bad", "c": 3}}).as_object().cloned().unwrap();
        let parsed: BTreeMap<String, u32> = parse_entries(&mut doc, "m", |k| Some(k.to_string()));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["c"], 3);
    }

    #[test]
    fn save_then_load_round_trips_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("nested").join("snap.json"));
        assert!(store.load().unwrap().is_none());
        store.save(&json!({"k": 1})).unwrap();
        assert_eq!(store.load().unwrap(), Some(json!({"k": 1})));
        assert!(!dir.path().join("nested").join("snap.json.tmp").exists());
    }

    #[test]
    fn stale_generation_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snap.json"));
        assert!(store.save_generation(&json!({"g": 2}), 2).unwrap());
        assert!(!store.save_generation(&json!({"g": 1}), 1).unwrap());
        assert_eq!(store.load().unwrap(), Some(json!({"g": 2})));
    }

    #[test]
    fn corrupt_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        fs::write(&path, "{ not json").unwrap();
        let store = SnapshotStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Json { .. })));
        assert_eq!(store.load_merged(json!({"a": 1})), json!({"a": 1}));
    }
}
