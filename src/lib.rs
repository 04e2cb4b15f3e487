//! # B+ Tree Index
//!
//! A disk-backed, single-file B+ tree index storing sorted key/value
//! pairs that persist across process restarts.
//!
//! ## Architecture
//!
//! The storage stack is layered, leaves first:
//!
//! - **Storage Layer** (`storage`): paged data file plus a garbage
//!   file persisting the free-page pool
//! - **Buffer Pool** (`buffer`): fixed frame cache with LRU-K eviction
//!   and scoped pin-tracking page guards
//! - **Page Layer** (`page`): typed views over raw page bytes (header,
//!   internal, leaf)
//! - **B+ Tree Layer** (`btree`): two-phase optimistic/pessimistic
//!   insert and remove, prefix lookup, and leaf-chain iteration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bptree_index::{open, Config, OrdComparator};
//!
//! let config = Config::new("my_index_dir");
//! let tree = open::<i64, i64, OrdComparator>(config)?;
//!
//! tree.insert(&1, &10)?;
//! assert_eq!(tree.find(&1)?, vec![1]);
//! tree.remove(&1)?;
//! tree.close()?;
//! ```
//!
//! Duplicate user keys are supported through composite `(prefix, tag)`
//! keys ordered by the full pair; `find` matches on the prefix alone.

pub mod btree;
pub mod buffer;
pub mod error;
pub mod page;
pub mod storage;
pub mod types;

pub use btree::{BPlusTree, Cursor};
pub use buffer::BufferPool;
pub use error::{Result, StorageError};
pub use storage::{DiskManager, FileDiskManager};
pub use types::{
    CompositeKey, CompositeKeyComparator, FixedBytes, KeyComparator, OrdComparator, PageId,
    PAGE_SIZE,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use types::{DEFAULT_POOL_SIZE, DEFAULT_REPLACER_K};

/// Index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory holding the data and garbage files
    pub dir: PathBuf,
    /// Name of the index, used in diagnostics
    pub name: String,
    /// Buffer pool size in frames
    pub pool_size: usize,
    /// K for the LRU-K replacer
    pub replacer_k: usize,
    /// Leaf fan-out; 0 derives it from the page capacity
    pub leaf_max_size: usize,
    /// Internal fan-out; 0 derives it from the page capacity
    pub internal_max_size: usize,
}

impl Config {
    /// Create a configuration with default pool and fan-out settings
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            name: "bptree".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            replacer_k: DEFAULT_REPLACER_K,
            leaf_max_size: 0,
            internal_max_size: 0,
        }
    }

    /// Set the index name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the buffer pool size
    pub fn pool_size(mut self, frames: usize) -> Self {
        self.pool_size = frames;
        self
    }

    /// Set the replacer K
    pub fn replacer_k(mut self, k: usize) -> Self {
        self.replacer_k = k;
        self
    }

    /// Set the leaf and internal fan-outs
    pub fn fan_out(mut self, leaf_max: usize, internal_max: usize) -> Self {
        self.leaf_max_size = leaf_max;
        self.internal_max_size = internal_max;
        self
    }
}

/// Open an index: wires a disk manager and buffer pool to a tree whose
/// header lives on page 0.
pub fn open<K, V, C>(config: Config) -> Result<BPlusTree<K, V, C>>
where
    K: FixedBytes + Default,
    V: FixedBytes,
    C: KeyComparator<K>,
{
    let disk = Arc::new(FileDiskManager::open(&config.dir)?);
    let bpm = Arc::new(BufferPool::new(disk, config.pool_size, config.replacer_k));
    BPlusTree::open(
        config.name,
        PageId::new(0),
        bpm,
        config.leaf_max_size,
        config.internal_max_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_insert_find() -> Result<()> {
        let dir = tempdir().unwrap();
        let tree = open::<i64, i64, OrdComparator>(Config::new(dir.path()))?;

        assert!(tree.insert(&5, &50)?);
        assert!(tree.insert(&3, &30)?);
        assert_eq!(tree.find(&5)?, vec![5]);
        assert!(tree.find(&4)?.is_empty());

        tree.remove(&5)?;
        assert!(tree.find(&5)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_reopen_after_close() -> Result<()> {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path()).fan_out(4, 4).pool_size(16);

        {
            let tree = open::<i64, i64, OrdComparator>(config.clone())?;
            for i in 1..=30 {
                tree.insert(&i, &i)?;
            }
            tree.close()?;
        }

        let tree = open::<i64, i64, OrdComparator>(config)?;
        assert!(!tree.is_empty()?);
        assert_eq!(tree.find(&17)?, vec![17]);
        Ok(())
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/x")
            .name("orders")
            .pool_size(64)
            .replacer_k(3)
            .fan_out(100, 50);
        assert_eq!(config.name, "orders");
        assert_eq!(config.pool_size, 64);
        assert_eq!(config.replacer_k, 3);
        assert_eq!(config.leaf_max_size, 100);
        assert_eq!(config.internal_max_size, 50);
    }
}
