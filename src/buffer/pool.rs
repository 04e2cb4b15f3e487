//! Buffer pool implementation.
//!
//! The buffer pool manages a fixed set of in-memory page frames,
//! caching pages read from disk and writing dirty frames back on
//! eviction. Frames are handed out exclusively through scoped page
//! guards whose lifetimes drive the pinning protocol: a frame with a
//! live guard is never evicted, and a dropped guard returns its pin.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::buffer::guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
use crate::buffer::replacer::LruKReplacer;
use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::storage::DiskManager;
use crate::types::{FrameId, PageId};

/// A frame in the buffer pool
pub(crate) struct Frame {
    /// The resident page's bytes
    pub(crate) buf: PageBuf,
    /// Page currently bound to this frame, `INVALID` if none
    pub(crate) page_id: PageId,
    /// Number of active guards on this frame
    pub(crate) pin_count: u32,
    /// Whether the frame diverged from its on-disk image
    pub(crate) dirty: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            buf: PageBuf::new(),
            page_id: PageId::INVALID,
            pin_count: 0,
            dirty: false,
        }
    }
}

/// Buffer pool over a disk manager
pub struct BufferPool {
    disk: Arc<dyn DiskManager>,
    pub(crate) frames: Vec<Arc<RwLock<Frame>>>,
    pub(crate) page_table: RwLock<HashMap<PageId, FrameId>>,
    free_list: RwLock<VecDeque<FrameId>>,
    replacer: RwLock<LruKReplacer>,
}

impl BufferPool {
    /// Create a pool of `pool_size` frames with an LRU-K replacer
    pub fn new(disk: Arc<dyn DiskManager>, pool_size: usize, replacer_k: usize) -> Self {
        let frames = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(Frame::new())))
            .collect();
        let free_list = (0..pool_size).collect();
        Self {
            disk,
            frames,
            page_table: RwLock::new(HashMap::with_capacity(pool_size)),
            free_list: RwLock::new(free_list),
            replacer: RwLock::new(LruKReplacer::new(pool_size, replacer_k)),
        }
    }

    /// Number of frames in the pool
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// True iff the underlying database was created by this process
    pub fn is_new(&self) -> bool {
        self.disk.is_new()
    }

    /// Take a frame from the free list, or evict a victim. A dirty
    /// victim is written back before the frame is rebound.
    fn take_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.write().pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self
            .replacer
            .write()
            .evict()
            .ok_or(StorageError::BufferPoolExhausted)?;
        let mut frame = self.frames[frame_id].write();
        debug!("evicting page {} from frame {frame_id}", frame.page_id);
        if frame.dirty {
            self.disk.write_page(frame.page_id, frame.buf.as_bytes())?;
            frame.dirty = false;
        }
        self.page_table.write().remove(&frame.page_id);
        frame.page_id = PageId::INVALID;
        Ok(frame_id)
    }

    /// Bind a freshly taken frame to a page and pin it
    fn bind_frame(&self, frame_id: FrameId, page_id: PageId, buf: PageBuf) {
        {
            let mut frame = self.frames[frame_id].write();
            frame.buf = buf;
            frame.page_id = page_id;
            frame.pin_count = 1;
            frame.dirty = false;
        }
        self.page_table.write().insert(page_id, frame_id);
        let mut replacer = self.replacer.write();
        replacer.record_access(frame_id);
        replacer.set_evictable(frame_id, false);
    }

    fn fetch_frame(&self, page_id: PageId) -> Result<FrameId> {
        if let Some(&frame_id) = self.page_table.read().get(&page_id) {
            self.frames[frame_id].write().pin_count += 1;
            let mut replacer = self.replacer.write();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.take_frame()?;
        let buf = self.disk.read_page(page_id)?;
        self.bind_frame(frame_id, page_id, buf);
        Ok(frame_id)
    }

    /// Allocate a fresh page and return it pinned. The page bytes start
    /// zeroed; the caller must initialize them.
    pub fn new_page(&self) -> Result<BasicPageGuard<'_>> {
        let frame_id = self.take_frame()?;
        let page_id = self.disk.allocate_page();
        self.bind_frame(frame_id, page_id, PageBuf::new());
        Ok(BasicPageGuard::new(
            self,
            Arc::clone(&self.frames[frame_id]),
            page_id,
        ))
    }

    /// Fetch a page with a neutral guard
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<BasicPageGuard<'_>> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(BasicPageGuard::new(
            self,
            Arc::clone(&self.frames[frame_id]),
            page_id,
        ))
    }

    /// Fetch a page for reading
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard<'_>> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(ReadPageGuard::new(
            self,
            Arc::clone(&self.frames[frame_id]),
            page_id,
        ))
    }

    /// Fetch a page for writing
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard<'_>> {
        let frame_id = self.fetch_frame(page_id)?;
        Ok(WritePageGuard::new(
            self,
            Arc::clone(&self.frames[frame_id]),
            page_id,
        ))
    }

    /// Return one pin on a page, folding `is_dirty` into the frame's
    /// dirty flag. Fails if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let page_table = self.page_table.read();
        let Some(&frame_id) = page_table.get(&page_id) else {
            return false;
        };
        let mut frame = self.frames[frame_id].write();
        if frame.pin_count == 0 {
            return false;
        }
        frame.pin_count -= 1;
        if is_dirty {
            frame.dirty = true;
        }
        if frame.pin_count == 0 {
            self.replacer.write().set_evictable(frame_id, true);
        }
        true
    }

    /// Write a resident page back to disk regardless of its dirty
    /// state, clearing the dirty flag. Returns false for a non-resident
    /// or invalid page id.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Ok(false);
        }
        let page_table = self.page_table.read();
        let Some(&frame_id) = page_table.get(&page_id) else {
            return Ok(false);
        };
        let mut frame = self.frames[frame_id].write();
        self.disk.write_page(page_id, frame.buf.as_bytes())?;
        frame.dirty = false;
        Ok(true)
    }

    /// Flush every resident page
    pub fn flush_all_pages(&self) -> Result<()> {
        let resident: Vec<PageId> = self.page_table.read().keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from the pool and return its id to the disk
    /// manager. A non-resident page deletes trivially; a pinned page
    /// cannot be deleted.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Ok(false);
        }
        let frame_id = {
            let page_table = self.page_table.read();
            match page_table.get(&page_id) {
                Some(&frame_id) => frame_id,
                None => return Ok(true),
            }
        };

        let mut frame = self.frames[frame_id].write();
        if frame.pin_count > 0 {
            return Ok(false);
        }
        if frame.dirty {
            self.disk.write_page(page_id, frame.buf.as_bytes())?;
            frame.dirty = false;
        }
        frame.page_id = PageId::INVALID;
        frame.pin_count = 0;
        drop(frame);

        self.page_table.write().remove(&page_id);
        self.replacer.write().remove(frame_id);
        self.free_list.write().push_back(frame_id);
        self.disk.deallocate_page(page_id);
        Ok(true)
    }

    /// Flush everything and persist the disk manager's free pool
    pub fn close(&self) -> Result<()> {
        self.flush_all_pages()?;
        self.disk.close()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all_pages() {
            log::warn!("failed to flush pages on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileDiskManager;
    use tempfile::tempdir;

    fn make_pool(dir: &std::path::Path, pool_size: usize) -> BufferPool {
        let dm = Arc::new(FileDiskManager::open(dir).unwrap());
        BufferPool::new(dm, pool_size, 2)
    }

    #[test]
    fn test_new_page_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 4);

        let page_id = {
            let guard = pool.new_page()?;
            guard.page_mut().data_mut()[0..4].copy_from_slice(b"abcd");
            guard.page_id()
        };
        assert_eq!(page_id, PageId::new(1));

        let guard = pool.fetch_page_read(page_id)?;
        assert_eq!(&guard.page().data()[0..4], b"abcd");
        Ok(())
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 2);

        let first = {
            let guard = pool.new_page()?;
            guard.page_mut().data_mut()[0] = 0x5a;
            guard.page_id()
        };

        // Fill the pool past capacity so `first` gets evicted.
        for _ in 0..3 {
            let guard = pool.new_page()?;
            drop(guard);
        }

        // Fetch reads the written-back image from disk.
        let guard = pool.fetch_page_read(first)?;
        assert_eq!(guard.page().data()[0], 0x5a);
        Ok(())
    }

    #[test]
    fn test_pool_exhausted_when_all_pinned() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 2);

        let _g1 = pool.new_page()?;
        let _g2 = pool.new_page()?;
        assert!(matches!(
            pool.new_page(),
            Err(StorageError::BufferPoolExhausted)
        ));
        Ok(())
    }

    #[test]
    fn test_fetch_basic_guard() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 4);

        let page_id = {
            let guard = pool.new_page()?;
            guard.page_mut().data_mut()[0] = 1;
            guard.page_id()
        };

        // A basic guard reads cleanly and dirties only through its
        // mutable accessor.
        let guard = pool.fetch_page_basic(page_id)?;
        assert_eq!(guard.page().data()[0], 1);
        guard.page_mut().data_mut()[0] = 2;
        drop(guard);

        assert!(pool.flush_page(page_id)?);
        Ok(())
    }

    #[test]
    fn test_unpin_semantics() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 4);

        let page_id = {
            let guard = pool.new_page()?;
            guard.page_id()
        };

        // Guard already returned its pin.
        assert!(!pool.unpin_page(page_id, false));
        assert!(!pool.unpin_page(PageId::new(99), false));
        Ok(())
    }

    #[test]
    fn test_page_table_frame_consistency() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 4);

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(pool.new_page()?.page_id());
        }
        for (&page_id, &frame_id) in pool.page_table.read().iter() {
            assert_eq!(pool.frames[frame_id].read().page_id, page_id);
        }
        assert_eq!(ids.len(), 4);
        Ok(())
    }

    #[test]
    fn test_delete_page_semantics() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 4);

        let guard = pool.new_page()?;
        let page_id = guard.page_id();

        // Pinned pages cannot be deleted.
        assert!(!pool.delete_page(page_id)?);
        drop(guard);
        assert!(pool.delete_page(page_id)?);

        // Non-resident delete succeeds trivially; the resident delete
        // above recycled its id for the next allocation.
        assert!(pool.delete_page(PageId::new(77))?);
        assert_eq!(pool.new_page()?.page_id(), page_id);
        Ok(())
    }

    #[test]
    fn test_flush_page_clears_dirty() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = make_pool(dir.path(), 4);

        let guard = pool.new_page()?;
        let page_id = guard.page_id();
        guard.page_mut().data_mut()[10] = 9;
        drop(guard);

        assert!(pool.flush_page(page_id)?);
        assert!(!pool.flush_page(PageId::INVALID)?);
        assert!(!pool.frames[pool.page_table.read()[&page_id]].read().dirty);
        Ok(())
    }
}
