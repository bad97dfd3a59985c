//! Script registry shared by every interpreter slot
//!
//! Maps a content hash to the script body so EVALSHA works no matter which
//! slot first compiled the script. Reads take the shared lock only; the
//! exclusive lock is taken when a new body is registered or on flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of `data`
pub fn sha1hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Name of the global function a script body is compiled into
pub fn function_name(content_hash: &str) -> String {
    format!("f_{}", content_hash)
}

/// One registered script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    content_hash: String,
    generated_name: String,
    body: Arc<[u8]>,
}

impl ScriptEntry {
    /// Entry for `body`, hashing it
    pub fn new(body: &[u8]) -> Self {
        let content_hash = sha1hex(body);
        ScriptEntry {
            generated_name: function_name(&content_hash),
            content_hash,
            body: Arc::from(body),
        }
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// `f_` followed by the content hash
    pub fn generated_name(&self) -> &str {
        &self.generated_name
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Thread-safe content hash to script map
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, Arc<ScriptEntry>>>,
    generation: AtomicU64,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // the map stays consistent across a panic, so poisoning is ignored
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ScriptEntry>>> {
        self.scripts.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ScriptEntry>>> {
        self.scripts.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look a script up by its lowercase content hash
    pub fn get(&self, content_hash: &str) -> Option<Arc<ScriptEntry>> {
        self.read().get(content_hash).cloned()
    }

    pub fn contains(&self, content_hash: &str) -> bool {
        self.read().contains_key(content_hash)
    }

    /// Register `entry` unless a script with the same hash already exists
    pub fn register(&self, entry: ScriptEntry) -> Arc<ScriptEntry> {
        if let Some(existing) = self.get(entry.content_hash()) {
            return existing;
        }
        let mut scripts = self.write();
        Arc::clone(
            scripts
                .entry(entry.content_hash.clone())
                .or_insert_with(|| Arc::new(entry)),
        )
    }

    /// Drop every script
    pub fn flush(&self) {
        let mut scripts = self.write();
        scripts.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Counter bumped by every flush
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
