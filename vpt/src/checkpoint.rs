//! Key-value checkpoint store backing the representation and coupled-space
//! caches.
//!
//! The store is strictly best-effort: a missing key is a cache miss and the
//! caller rebuilds, a failed write is swallowed (a read-only cache directory
//! must never kill a calculation).

use std::fs;
use std::path::PathBuf;

use tracing::debug;

pub trait Checkpointer: Send + Sync {
    /// Fetches a blob; `None` means "not cached", never an error.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Persists a blob; failures are logged and dropped.
    fn set(&self, key: &str, value: &[u8]);
}

/// The no-op store: everything is a miss, nothing is persisted.
pub struct NullCheckpointer;

impl Checkpointer for NullCheckpointer {
    fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    fn set(&self, _key: &str, _value: &[u8]) {}
}

/// One file per key under a root directory.
pub struct DiskCheckpointer {
    root: PathBuf,
}

impl DiskCheckpointer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Err(err) = fs::create_dir_all(&root) {
            // set() will keep failing softly; get() just misses
            debug!("could not create checkpoint directory {:?}: {}", root, err);
        }
        DiskCheckpointer { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.json", safe))
    }
}

impl Checkpointer for DiskCheckpointer {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                debug!("checkpoint miss for key '{}'", key);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &[u8]) {
        if let Err(err) = fs::write(self.path_for(key), value) {
            debug!(
                "failed to persist checkpoint key '{}' ({}); proceeding without cache",
                key, err
            );
        }
    }
}
