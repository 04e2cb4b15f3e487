//! Free-page pool.
//!
//! Tracks deallocated page ids for reuse together with the high-water
//! page id, and encodes both in the garbage file layout:
//!
//! ```text
//! u64 size | i32 max_page_id | i32[size] free page ids
//! ```
//!
//! All fields are little-endian. The pool is reloaded on open and
//! written back on clean close; an unclean close leaks the queued ids
//! but never corrupts the tree.

use std::collections::VecDeque;
use std::io::{Read, Write};

use crate::error::{Result, StorageError};
use crate::types::PageId;

/// Manages free page ids and the allocation high-water mark
#[derive(Debug, Default)]
pub struct FreePool {
    pages: VecDeque<PageId>,
    max_page_id: i32,
}

impl FreePool {
    /// Create an empty pool for a fresh database
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a page id, preferring recycled ids
    pub fn allocate(&mut self) -> PageId {
        if let Some(page_id) = self.pages.pop_front() {
            return page_id;
        }
        self.max_page_id += 1;
        PageId::new(self.max_page_id)
    }

    /// Return a page id to the pool
    pub fn release(&mut self, page_id: PageId) {
        self.pages.push_back(page_id);
    }

    /// Number of queued free page ids
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check if the pool has no queued ids
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Largest page id ever handed out
    pub fn max_page_id(&self) -> i32 {
        self.max_page_id
    }

    /// Reconstruct a pool from the garbage file layout
    pub fn load(reader: &mut impl Read) -> Result<Self> {
        let mut word = [0u8; 8];
        reader
            .read_exact(&mut word)
            .map_err(|_| StorageError::corruption("garbage file truncated"))?;
        let size = u64::from_le_bytes(word) as usize;

        let mut raw = [0u8; 4];
        reader
            .read_exact(&mut raw)
            .map_err(|_| StorageError::corruption("garbage file truncated"))?;
        let max_page_id = i32::from_le_bytes(raw);

        let mut pages = VecDeque::with_capacity(size);
        for _ in 0..size {
            reader
                .read_exact(&mut raw)
                .map_err(|_| StorageError::corruption("garbage file truncated"))?;
            pages.push_back(PageId::new(i32::from_le_bytes(raw)));
        }

        Ok(Self { pages, max_page_id })
    }

    /// Write the pool in the garbage file layout
    pub fn save(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&(self.pages.len() as u64).to_le_bytes())?;
        writer.write_all(&self.max_page_id.to_le_bytes())?;
        for page_id in &self.pages {
            writer.write_all(&page_id.value().to_le_bytes())?;
        }
        Ok(())
    }
}
