//! Storage layer: disk I/O and page id recycling.

mod disk_manager;
mod free_pool;

pub use disk_manager::{DiskManager, FileDiskManager, DATA_FILE_NAME, GARBAGE_FILE_NAME};
pub use free_pool::FreePool;
