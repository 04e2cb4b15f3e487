//! Scoped page guards.
//!
//! A guard owns one pin on a buffer frame for its lifetime and returns
//! it on drop via `unpin_page(id, dirty)`. Three flavors exist:
//!
//! - [`BasicPageGuard`]: neutral; becomes dirty only through its
//!   mutable accessor.
//! - [`ReadPageGuard`]: read-only view; never dirties the frame.
//! - [`WritePageGuard`]: mutable view; any access through
//!   `page_mut` marks the frame dirty on release.
//!
//! Guards are move-only. Dropping a guard early is the way to release
//! a pin before scope end; the tree's latch-crabbing descent relies on
//! this.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::pool::{BufferPool, Frame};
use crate::page::{page_type_of, HeaderPage, InternalPage, LeafPage, PageType};
use crate::types::{FixedBytes, PageId};

/// Read-only access to a frame's page bytes
pub struct PageRef<'a> {
    frame: RwLockReadGuard<'a, Frame>,
}

impl<'a> PageRef<'a> {
    /// Raw page bytes
    pub fn data(&self) -> &[u8] {
        self.frame.buf.as_bytes()
    }

    /// Page type tag of the resident page
    pub fn page_type(&self) -> Option<PageType> {
        page_type_of(self.data())
    }

    /// True iff the resident page is a leaf
    pub fn is_leaf(&self) -> bool {
        self.page_type() == Some(PageType::Leaf)
    }

    /// View the page as the tree header
    pub fn header(&self) -> HeaderPage<&[u8]> {
        HeaderPage::attach(self.data())
    }

    /// View the page as a leaf
    pub fn leaf<K: FixedBytes, V: FixedBytes>(&self) -> LeafPage<&[u8], K, V> {
        LeafPage::attach(self.data())
    }

    /// View the page as an internal node
    pub fn internal<K: FixedBytes>(&self) -> InternalPage<&[u8], K> {
        InternalPage::attach(self.data())
    }
}

/// Mutable access to a frame's page bytes
pub struct PageRefMut<'a> {
    frame: RwLockWriteGuard<'a, Frame>,
}

impl<'a> PageRefMut<'a> {
    /// Raw page bytes
    pub fn data(&self) -> &[u8] {
        self.frame.buf.as_bytes()
    }

    /// Raw page bytes, mutable
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.frame.buf.as_bytes_mut()
    }

    /// Page type tag of the resident page
    pub fn page_type(&self) -> Option<PageType> {
        page_type_of(self.data())
    }

    /// True iff the resident page is a leaf
    pub fn is_leaf(&self) -> bool {
        self.page_type() == Some(PageType::Leaf)
    }

    /// View the page as the tree header
    pub fn header_mut(&mut self) -> HeaderPage<&mut [u8]> {
        HeaderPage::attach(self.data_mut())
    }

    /// View the page as a leaf
    pub fn leaf_mut<K: FixedBytes, V: FixedBytes>(&mut self) -> LeafPage<&mut [u8], K, V> {
        LeafPage::attach(self.data_mut())
    }

    /// View the page as an internal node
    pub fn internal_mut<K: FixedBytes>(&mut self) -> InternalPage<&mut [u8], K> {
        InternalPage::attach(self.data_mut())
    }
}

macro_rules! impl_guard_common {
    ($guard:ident) => {
        impl<'a> $guard<'a> {
            /// Page id this guard pins
            pub fn page_id(&self) -> PageId {
                self.page_id
            }

            /// Borrow the page for reading. The returned view holds the
            /// frame lock, so it must be dropped before the guard is.
            pub fn page(&self) -> PageRef<'_> {
                PageRef {
                    frame: self.frame.read(),
                }
            }
        }
    };
}

/// Neutral scoped guard over a pinned frame
pub struct BasicPageGuard<'a> {
    pool: &'a BufferPool,
    frame: Arc<RwLock<Frame>>,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl<'a> BasicPageGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPool, frame: Arc<RwLock<Frame>>, page_id: PageId) -> Self {
        Self {
            pool,
            frame,
            page_id,
            dirty: Cell::new(false),
        }
    }

    /// Borrow the page for writing; the frame will be unpinned dirty
    pub fn page_mut(&self) -> PageRefMut<'_> {
        self.dirty.set(true);
        PageRefMut {
            frame: self.frame.write(),
        }
    }
}

impl_guard_common!(BasicPageGuard);

impl<'a> Drop for BasicPageGuard<'a> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}

/// Scoped guard handing out a read-only page view
pub struct ReadPageGuard<'a> {
    pool: &'a BufferPool,
    frame: Arc<RwLock<Frame>>,
    page_id: PageId,
}

impl<'a> ReadPageGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPool, frame: Arc<RwLock<Frame>>, page_id: PageId) -> Self {
        Self {
            pool,
            frame,
            page_id,
        }
    }
}

impl_guard_common!(ReadPageGuard);

impl<'a> Drop for ReadPageGuard<'a> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, false);
    }
}

/// Scoped guard handing out a mutable page view
pub struct WritePageGuard<'a> {
    pool: &'a BufferPool,
    frame: Arc<RwLock<Frame>>,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl<'a> WritePageGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPool, frame: Arc<RwLock<Frame>>, page_id: PageId) -> Self {
        Self {
            pool,
            frame,
            page_id,
            dirty: Cell::new(false),
        }
    }

    /// Borrow the page for writing; the frame will be unpinned dirty
    pub fn page_mut(&self) -> PageRefMut<'_> {
        self.dirty.set(true);
        PageRefMut {
            frame: self.frame.write(),
        }
    }
}

impl_guard_common!(WritePageGuard);

impl<'a> Drop for WritePageGuard<'a> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}
