use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Key-value store remembering which base images were already pulled.
///
/// Implementations must give read-your-writes for a single key within one process.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheAccessError>;
    fn put(&self, key: &str, value: &str) -> Result<(), CacheAccessError>;
}

#[derive(Debug, Error)]
pub enum CacheAccessError {
    #[error("failed to read pull cache {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write pull cache {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("pull cache {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Session scoped store, forgotten when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheAccessError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CacheAccessError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store persisted as a JSON object, so pull decisions survive across sessions.
#[derive(Debug)]
pub struct FileCacheStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileCacheStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheAccessError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| {
                CacheAccessError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(CacheAccessError::Read { path, source }),
        };
        info!(
            "Opened pull cache {} with {} entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), CacheAccessError> {
        let write_err = |source| CacheAccessError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| write_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        // Write to a sibling file first so a crash never leaves a truncated cache behind
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        debug!("Persisted pull cache to {}", self.path.display());
        Ok(())
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheAccessError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CacheAccessError> {
        let mut entries = self.entries.lock();
        let mut updated = entries.clone();
        updated.insert(key.to_string(), value.to_string());
        self.persist(&updated)?;
        *entries = updated;
        Ok(())
    }
}
