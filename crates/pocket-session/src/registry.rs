//! Model registry: logical names → file paths, gated by content checksum.
//!
//! A registered name always refers to byte-identical content. Its path may
//! move, but only to a file whose checksum matches the one recorded at
//! registration.

use std::collections::HashMap;
use std::fs::File;
use std::hash::Hasher;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use pocket_engine::ModelKind;
use pocket_store::{ModelRecord, Store, StoreError};
use tracing::{debug, info};
use twox_hash::XxHash64;

use crate::error::{Result, SessionError};

/// Block size for streaming checksums.
pub const CHECKSUM_BLOCK: usize = 64 * 1024;

/// Hex-encoded XxHash64 of a file's contents, read in 64 KiB blocks.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| SessionError::io(path, e))?;
    let mut hasher = XxHash64::with_seed(0);
    let mut block = vec![0u8; CHECKSUM_BLOCK];
    loop {
        let n = file.read(&mut block).map_err(|e| SessionError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.write(&block[..n]);
    }
    Ok(format!("{:016x}", hasher.finish()))
}

/// Name → path resolution with an in-memory cache over the store.
pub struct ModelRegistry {
    store: Arc<dyn Store>,
    cache: RwLock<HashMap<String, PathBuf>>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Record `name` as the model at `path`, checksumming its contents.
    pub fn register(&self, name: &str, path: &Path, kind: ModelKind) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SessionError::ConfigInvalid("model name is empty".to_string()));
        }
        let checksum = checksum_file(path)?;
        let record = ModelRecord::new(name, path, checksum.clone(), kind);
        match self.store.insert_model(&record) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(SessionError::AlreadyRegistered(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        self.cache_path(name, path);
        info!(name, %kind, path = %path.display(), %checksum, "model registered");
        Ok(())
    }

    /// Point `name` at `new_path`, which must hold the same bytes.
    pub fn update_path(&self, name: &str, new_path: &Path) -> Result<()> {
        let record = self.record(name)?;
        let actual = checksum_file(new_path)?;
        if actual != record.checksum {
            return Err(SessionError::ChecksumMismatch {
                name: name.to_string(),
                expected: record.checksum,
                actual,
            });
        }
        self.store.update_model_path(name, new_path)?;
        self.cache_path(name, new_path);
        info!(name, path = %new_path.display(), "model path updated");
        Ok(())
    }

    /// Path currently registered for `name`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if let Some(path) = self.cached(name) {
            return Ok(path);
        }
        let record = self.record(name)?;
        debug!(name, "model path cache miss");
        self.cache_path(name, &record.path);
        Ok(record.path)
    }

    /// Full stored record for `name`.
    pub fn record(&self, name: &str) -> Result<ModelRecord> {
        self.store
            .get_model(name)?
            .ok_or_else(|| SessionError::NotFound(format!("model '{name}'")))
    }

    fn cached(&self, name: &str) -> Option<PathBuf> {
        self.cache
            .read()
            .ok()
            .and_then(|cache| cache.get(name).cloned())
    }

    fn cache_path(&self, name: &str, path: &Path) {
        // A poisoned cache only costs a store lookup next time.
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(name.to_string(), path.to_path_buf());
        }
    }
}
