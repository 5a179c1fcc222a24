use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};

/// A single stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum KvValue {
    Bool(bool),
    Int(i64),
    Date(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
}

/// Writes applied together or not at all
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<(String, KvValue)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.writes.push((key.into(), KvValue::Bool(value)));
        self
    }

    pub fn set_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.writes.push((key.into(), KvValue::Int(value)));
        self
    }

    pub fn set_date(mut self, key: impl Into<String>, value: OffsetDateTime) -> Self {
        self.writes.push((key.into(), KvValue::Date(value)));
        self
    }

    pub fn append(mut self, other: WriteBatch) -> Self {
        self.writes.extend(other.writes);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    fn apply_to(self, map: &mut BTreeMap<String, KvValue>) {
        for (key, value) in self.writes {
            map.insert(key, value);
        }
    }
}

/// Secure device-local persistence. Every write is durable when it returns.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<KvValue>>;

    /// Apply every write in the batch atomically
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key)? {
            None => Ok(None),
            Some(KvValue::Bool(value)) => Ok(Some(value)),
            Some(other) => Err(type_mismatch(key, "bool", &other)),
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.commit(WriteBatch::new().set_bool(key, value))
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key)? {
            None => Ok(None),
            Some(KvValue::Int(value)) => Ok(Some(value)),
            Some(other) => Err(type_mismatch(key, "int", &other)),
        }
    }

    fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.commit(WriteBatch::new().set_int(key, value))
    }

    fn get_date(&self, key: &str) -> Result<Option<OffsetDateTime>> {
        match self.get(key)? {
            None => Ok(None),
            Some(KvValue::Date(value)) => Ok(Some(value)),
            Some(other) => Err(type_mismatch(key, "date", &other)),
        }
    }

    fn set_date(&self, key: &str, value: OffsetDateTime) -> Result<()> {
        self.commit(WriteBatch::new().set_date(key, value))
    }
}

fn type_mismatch(key: &str, expected: &str, found: &KvValue) -> StoreError {
    StoreError::Persistence(format!(
        "Key {} holds {:?}, expected {}",
        key, found, expected
    ))
}

/// Process-local store, used by tests and previews
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<String, KvValue>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<KvValue>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Persistence("Store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Persistence("Store lock poisoned".to_string()))?;
        batch.apply_to(&mut entries);
        Ok(())
    }
}

/// JSON document on disk, replaced atomically on every commit
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, KvValue>>,
}

impl FileKeyValueStore {
    #[instrument]
    pub fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::Persistence(format!("Corrupt store {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StoreError::Persistence(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        debug!(path = %path.display(), keys = entries.len(), "Opened entitlement store");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, KvValue>) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)
    }
}

/// Flush the directory entry so a completed rename survives power loss
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::File::open(parent)?.sync_all()
}

// Directories cannot be opened as files here; the rename is the commit point
#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<KvValue>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Persistence("Store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StoreError::Persistence("Store lock poisoned".to_string()))?;

        // Stage on a copy so a failed write leaves memory and disk in agreement
        let mut staged = entries.clone();
        batch.apply_to(&mut staged);

        self.persist(&staged).map_err(|e| {
            StoreError::Persistence(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        *entries = staged;
        Ok(())
    }
}
