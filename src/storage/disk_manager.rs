//! Disk manager implementation.
//!
//! The disk manager owns two files in the database directory: `data`,
//! an array of fixed-size pages addressed by page id, and `garbage`,
//! which persists the free-page pool and the allocation high-water
//! mark across restarts. The trait abstracts file I/O so the buffer
//! pool can be tested against mock backends.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use parking_lot::RwLock;

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::storage::FreePool;
use crate::types::{PageId, PAGE_SIZE};

/// Name of the page array file inside the database directory
pub const DATA_FILE_NAME: &str = "data";

/// Name of the free-pool file inside the database directory
pub const GARBAGE_FILE_NAME: &str = "garbage";

/// Trait for disk I/O and page id management
pub trait DiskManager: Send + Sync {
    /// Read a page; offsets past end-of-file read back zero-filled
    fn read_page(&self, page_id: PageId) -> Result<PageBuf>;

    /// Write exactly one page worth of bytes
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Hand out a page id, recycling deallocated ids first. The page
    /// contents are undefined until the caller initializes them.
    fn allocate_page(&self) -> PageId;

    /// Return a page id to the free pool. The data file is not
    /// truncated.
    fn deallocate_page(&self, page_id: PageId);

    /// True iff the garbage file did not exist when this manager opened
    fn is_new(&self) -> bool;

    /// Persist the free pool. Required for the pool to survive a
    /// restart; idempotent.
    fn close(&self) -> Result<()>;
}

/// File-backed disk manager
pub struct FileDiskManager {
    data_file: RwLock<File>,
    pool: RwLock<FreePool>,
    garbage_path: PathBuf,
    fresh: bool,
    closed: AtomicBool,
}

impl FileDiskManager {
    /// Open or create a database directory
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE_NAME))?;

        let garbage_path = dir.join(GARBAGE_FILE_NAME);
        let fresh = !garbage_path.exists();
        let pool = if fresh {
            FreePool::new()
        } else {
            let mut reader = File::open(&garbage_path)?;
            let pool = FreePool::load(&mut reader)?;
            debug!(
                "reloaded free pool: {} ids, max page id {}",
                pool.len(),
                pool.max_page_id()
            );
            pool
        };

        Ok(Self {
            data_file: RwLock::new(data_file),
            pool: RwLock::new(pool),
            garbage_path,
            fresh,
            closed: AtomicBool::new(false),
        })
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId) -> Result<PageBuf> {
        if !page_id.is_valid() {
            return Err(StorageError::invalid_operation(
                "cannot read an invalid page id",
            ));
        }

        let mut buf = PageBuf::new();
        let mut file = self.data_file.write();
        file.seek(SeekFrom::Start(page_id.file_offset(PAGE_SIZE)))?;

        // A page in the sparse tail may read short; the remainder of
        // the zeroed buffer stands in for the missing bytes.
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf.as_bytes_mut()[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(StorageError::invalid_operation(
                "cannot write an invalid page id",
            ));
        }
        if data.len() != PAGE_SIZE {
            return Err(StorageError::invalid_operation(format!(
                "page data must be {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }

        let mut file = self.data_file.write();
        file.seek(SeekFrom::Start(page_id.file_offset(PAGE_SIZE)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn allocate_page(&self) -> PageId {
        self.pool.write().allocate()
    }

    fn deallocate_page(&self, page_id: PageId) {
        debug!("deallocating page {page_id}");
        self.pool.write().release(page_id);
    }

    fn is_new(&self) -> bool {
        self.fresh
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = File::create(&self.garbage_path)?;
        self.pool.read().save(&mut writer)?;
        writer.flush()?;
        debug!("persisted free pool to {}", self.garbage_path.display());
        Ok(())
    }
}

impl Drop for FileDiskManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to persist free pool on drop: {e}");
        }
    }
}
