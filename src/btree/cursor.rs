//! Forward cursor over the leaf chain.
//!
//! A cursor pins exactly one leaf at a time with a read guard. Walking
//! off the end of a leaf drops that guard before the successor is
//! fetched, so at most one tree page stays pinned per cursor. The end
//! cursor pins nothing.

use std::marker::PhantomData;

use crate::buffer::{BufferPool, ReadPageGuard};
use crate::error::Result;
use crate::types::{FixedBytes, PageId};

/// Cursor over `(key, value)` records in ascending key order
pub struct Cursor<'a, K, V> {
    bpm: &'a BufferPool,
    guard: Option<ReadPageGuard<'a>>,
    page_id: PageId,
    pos: usize,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K, V> Cursor<'a, K, V>
where
    K: FixedBytes,
    V: FixedBytes,
{
    pub(crate) fn at(bpm: &'a BufferPool, page_id: PageId, pos: usize) -> Result<Self> {
        let guard = bpm.fetch_page_read(page_id)?;
        Ok(Self {
            bpm,
            guard: Some(guard),
            page_id,
            pos,
            _marker: PhantomData,
        })
    }

    pub(crate) fn end(bpm: &'a BufferPool) -> Self {
        Self {
            bpm,
            guard: None,
            page_id: PageId::INVALID,
            pos: 0,
            _marker: PhantomData,
        }
    }

    /// True once the cursor has moved past the last record
    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }

    /// Page id of the pinned leaf, `INVALID` at the end
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Record under the cursor, `None` at the end
    pub fn entry(&self) -> Option<(K, V)> {
        let guard = self.guard.as_ref()?;
        let page = guard.page();
        let leaf = page.leaf::<K, V>();
        (self.pos < leaf.size()).then(|| leaf.pair_at(self.pos))
    }

    /// Key under the cursor, `None` at the end
    pub fn key(&self) -> Option<K> {
        self.entry().map(|(k, _)| k)
    }

    /// Step to the next record, following the leaf chain. Returns
    /// false once the end is reached.
    pub fn advance(&mut self) -> Result<bool> {
        let Some(guard) = self.guard.as_ref() else {
            return Ok(false);
        };
        self.pos += 1;
        let (size, next) = {
            let page = guard.page();
            let leaf = page.leaf::<K, V>();
            (leaf.size(), leaf.next_page_id())
        };
        if self.pos < size {
            return Ok(true);
        }

        // Release the current leaf before pinning its successor.
        self.guard = None;
        self.pos = 0;
        if next.is_valid() {
            self.page_id = next;
            self.guard = Some(self.bpm.fetch_page_read(next)?);
            Ok(true)
        } else {
            self.page_id = PageId::INVALID;
            Ok(false)
        }
    }

    /// Drain the cursor into a vector of records
    pub fn collect_all(mut self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        while let Some(entry) = self.entry() {
            out.push(entry);
            self.advance()?;
        }
        Ok(out)
    }
}
