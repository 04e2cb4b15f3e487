//! B+ tree core implementation.
//!
//! The tree orchestrates pages through the buffer pool and its scoped
//! guards. Every operation runs in up to two passes:
//!
//! 1. An *optimistic* pass descends with read guards, releasing each
//!    parent as soon as the child is pinned, and takes a single write
//!    guard on the target leaf. It succeeds only when the leaf alone
//!    can absorb the change.
//! 2. A *pessimistic* pass takes write guards along the whole path,
//!    releasing ancestors early whenever the current node is safe
//!    (cannot propagate a split or merge upward), then restructures:
//!    splits bubble up on insert, adopt-then-merge repairs underflow
//!    on remove.
//!
//! Guard lifetimes are the whole concurrency story here: the core is
//! single-threaded and uses them purely to drive pinning and dirty
//! tracking.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;

use crate::btree::Cursor;
use crate::buffer::{BufferPool, ReadPageGuard, WritePageGuard};
use crate::error::{Result, StorageError};
use crate::page::{InternalPage, LeafPage};
use crate::types::{FixedBytes, KeyComparator, PageId};

/// Per-operation bookkeeping for the pessimistic pass.
///
/// `write_set` holds the guards along the current path, root end
/// first. `index_set` runs parallel to it, holding each node's slot in
/// its parent (the root has none).
struct Context<'a> {
    header_write: Option<WritePageGuard<'a>>,
    root_page_id: PageId,
    write_set: VecDeque<WritePageGuard<'a>>,
    index_set: VecDeque<usize>,
}

impl<'a> Context<'a> {
    fn new() -> Self {
        Self {
            header_write: None,
            root_page_id: PageId::INVALID,
            write_set: VecDeque::new(),
            index_set: VecDeque::new(),
        }
    }

    fn is_root(&self, page_id: PageId) -> bool {
        page_id == self.root_page_id
    }
}

/// A disk-backed B+ tree index over fixed-width keys and values.
///
/// Keys are unique under the comparator's full ordering; duplicate
/// user keys are expressed as composite keys whose ordering makes
/// them distinct (see [`crate::types::CompositeKey`]).
pub struct BPlusTree<K, V, C> {
    name: String,
    bpm: Arc<BufferPool>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
    header_page_id: PageId,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: FixedBytes + Default,
    V: FixedBytes,
    C: KeyComparator<K>,
{
    /// Open a tree whose header lives at `header_page_id`
    /// (conventionally page 0). Fan-outs of 0 derive from the page
    /// capacity; explicit values are validated against it.
    pub fn open(
        name: impl Into<String>,
        header_page_id: PageId,
        bpm: Arc<BufferPool>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let leaf_cap = LeafPage::<&[u8], K, V>::capacity();
        // Internal pages hold one record past max while a split is in
        // flight, so they need a slot of slack.
        let internal_cap = InternalPage::<&[u8], K>::capacity() - 1;
        let leaf_max_size = if leaf_max_size == 0 {
            leaf_cap
        } else {
            leaf_max_size
        };
        let internal_max_size = if internal_max_size == 0 {
            internal_cap
        } else {
            internal_max_size
        };
        if !(3..=leaf_cap).contains(&leaf_max_size) {
            return Err(StorageError::invalid_config(format!(
                "leaf max size {leaf_max_size} outside 3..={leaf_cap}"
            )));
        }
        if !(3..=internal_cap).contains(&internal_max_size) {
            return Err(StorageError::invalid_config(format!(
                "internal max size {internal_max_size} outside 3..={internal_cap}"
            )));
        }

        let tree = Self {
            name: name.into(),
            bpm,
            comparator: C::default(),
            leaf_max_size,
            internal_max_size,
            header_page_id,
            _marker: PhantomData,
        };
        if tree.bpm.is_new() {
            let guard = tree.bpm.fetch_page_write(tree.header_page_id)?;
            guard.page_mut().header_mut().set_root_page_id(PageId::INVALID);
        }
        debug!(
            "opened b+ tree {} (leaf max {}, internal max {})",
            tree.name, tree.leaf_max_size, tree.internal_max_size
        );
        Ok(tree)
    }

    /// Insert a key/value pair. Returns false iff the key was already
    /// present.
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        let (inserted, retry) = self.insert_optimistic(key, value)?;
        if inserted {
            return Ok(true);
        }
        if retry {
            return self.insert_pessimistic(key, value);
        }
        Ok(false)
    }

    /// Remove a key. Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let (done, retry) = self.remove_optimistic(key)?;
        if !done && retry {
            self.remove_pessimistic(key)?;
        }
        Ok(())
    }

    /// Collect every stored key equal to `key` under the comparator's
    /// prefix ordering, in ascending full order.
    pub fn find(&self, key: &K) -> Result<Vec<K>> {
        let mut out = Vec::new();
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = header_guard.page().header().root_page_id();
        if !root_page_id.is_valid() {
            return Ok(out);
        }
        let guard = self.bpm.fetch_page_read(root_page_id)?;
        drop(header_guard);
        self.collect_matches(key, guard, &mut out)?;
        Ok(out)
    }

    /// Cursor over the whole tree in ascending key order
    pub fn iter(&self) -> Result<Cursor<'_, K, V>> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = header_guard.page().header().root_page_id();
        if !root_page_id.is_valid() {
            return Ok(Cursor::end(&self.bpm));
        }
        let mut page_id = root_page_id;
        let mut guard = self.bpm.fetch_page_read(page_id)?;
        drop(header_guard);
        loop {
            let next = {
                let page = guard.page();
                if page.is_leaf() {
                    None
                } else {
                    Some(page.internal::<K>().value_at(0))
                }
            };
            match next {
                Some(child) => {
                    page_id = child;
                    guard = self.bpm.fetch_page_read(page_id)?;
                }
                None => break,
            }
        }
        drop(guard);
        Cursor::at(&self.bpm, page_id, 0)
    }

    /// Cursor positioned at `key`, or at the end if it is absent
    pub fn iter_from(&self, key: &K) -> Result<Cursor<'_, K, V>> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = header_guard.page().header().root_page_id();
        if !root_page_id.is_valid() {
            return Ok(Cursor::end(&self.bpm));
        }
        let mut page_id = root_page_id;
        let mut guard = self.bpm.fetch_page_read(page_id)?;
        drop(header_guard);
        loop {
            let next = {
                let page = guard.page();
                if page.is_leaf() {
                    None
                } else {
                    let internal = page.internal::<K>();
                    Some(internal.value_at(self.descend_index(&internal, key)))
                }
            };
            match next {
                Some(child) => {
                    page_id = child;
                    guard = self.bpm.fetch_page_read(page_id)?;
                }
                None => break,
            }
        }
        let slot = {
            let page = guard.page();
            let leaf = page.leaf::<K, V>();
            self.leaf_slot_of(&leaf, key)
        };
        drop(guard);
        match slot {
            Some(pos) => Cursor::at(&self.bpm, page_id, pos),
            None => Ok(Cursor::end(&self.bpm)),
        }
    }

    /// Page id of the tree root, `INVALID` while empty
    pub fn get_root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = guard.page().header().root_page_id();
        Ok(root_page_id)
    }

    /// True iff the tree stores no keys
    pub fn is_empty(&self) -> Result<bool> {
        Ok(!self.get_root_page_id()?.is_valid())
    }

    /// Write every cached page back to disk
    pub fn flush(&self) -> Result<()> {
        self.bpm.flush_all_pages()
    }

    /// Flush and persist the free-page pool; required for a clean
    /// shutdown
    pub fn close(&self) -> Result<()> {
        self.bpm.close()
    }

    fn descend_index<Buf: AsRef<[u8]>>(&self, internal: &InternalPage<Buf, K>, key: &K) -> usize {
        internal.upper_bound(|k| self.comparator.cmp(k, key)) - 1
    }

    /// Slot of `key` in the leaf, under the full ordering
    fn leaf_slot_of<Buf: AsRef<[u8]>>(
        &self,
        leaf: &LeafPage<Buf, K, V>,
        key: &K,
    ) -> Option<usize> {
        let slot = leaf.lower_bound(|k| self.comparator.cmp(k, key));
        if slot == leaf.size() || self.comparator.cmp(key, &leaf.key_at(slot)) != Ordering::Equal {
            None
        } else {
            Some(slot)
        }
    }

    /// Returns `(inserted, retry_pessimistic)`
    fn insert_optimistic(&self, key: &K, value: &V) -> Result<(bool, bool)> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = header_guard.page().header().root_page_id();
        if !root_page_id.is_valid() {
            return Ok((false, true));
        }

        let mut page_id = root_page_id;
        let mut guard = self.bpm.fetch_page_read(page_id)?;
        drop(header_guard);
        loop {
            let next = {
                let page = guard.page();
                if page.is_leaf() {
                    None
                } else {
                    let internal = page.internal::<K>();
                    Some(internal.value_at(self.descend_index(&internal, key)))
                }
            };
            match next {
                Some(child) => {
                    page_id = child;
                    guard = self.bpm.fetch_page_read(page_id)?;
                }
                None => break,
            }
        }
        drop(guard);

        let guard = self.bpm.fetch_page_write(page_id)?;
        let decision = {
            let page = guard.page();
            let leaf = page.leaf::<K, V>();
            let slot = leaf.lower_bound(|k| self.comparator.cmp(k, key));
            if slot < leaf.size()
                && self.comparator.cmp(key, &leaf.key_at(slot)) == Ordering::Equal
            {
                None
            } else if leaf.size() + 1 < leaf.max_size() {
                Some(Some(slot))
            } else {
                // The insert could fill the leaf; fall back to the
                // pessimistic pass which can split.
                Some(None)
            }
        };
        match decision {
            None => Ok((false, false)),
            Some(None) => Ok((false, true)),
            Some(Some(slot)) => {
                guard.page_mut().leaf_mut::<K, V>().insert_at(slot, key, value);
                Ok((true, false))
            }
        }
    }

    fn insert_pessimistic(&self, key: &K, value: &V) -> Result<bool> {
        let mut ctx = Context::new();
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        ctx.root_page_id = header_guard.page().header().root_page_id();
        ctx.header_write = Some(header_guard);

        if !ctx.root_page_id.is_valid() {
            // Start a new tree: a single leaf becomes the root.
            let root_guard = self.bpm.new_page()?;
            let root_id = root_guard.page_id();
            {
                let mut page = root_guard.page_mut();
                let mut leaf = page.leaf_mut::<K, V>();
                leaf.init(self.leaf_max_size);
                leaf.insert_at(0, key, value);
            }
            if let Some(header) = &ctx.header_write {
                header.page_mut().header_mut().set_root_page_id(root_id);
            }
            debug!("{}: created root leaf {root_id}", self.name);
            return Ok(true);
        }

        ctx.write_set
            .push_back(self.bpm.fetch_page_write(ctx.root_page_id)?);
        loop {
            let step = {
                let guard = ctx.write_set.back().unwrap();
                let page = guard.page();
                if page.is_leaf() {
                    None
                } else {
                    let internal = page.internal::<K>();
                    let safe = internal.size() < internal.max_size();
                    Some((safe, internal.value_at(self.descend_index(&internal, key))))
                }
            };
            let Some((safe, child)) = step else { break };
            if safe {
                while ctx.write_set.len() > 1 {
                    ctx.write_set.pop_front();
                }
            }
            ctx.write_set.push_back(self.bpm.fetch_page_write(child)?);
        }

        let slot = {
            let guard = ctx.write_set.back().unwrap();
            let page = guard.page();
            let leaf = page.leaf::<K, V>();
            let slot = leaf.lower_bound(|k| self.comparator.cmp(k, key));
            if slot < leaf.size()
                && self.comparator.cmp(key, &leaf.key_at(slot)) == Ordering::Equal
            {
                None
            } else {
                Some(slot)
            }
        };
        let Some(slot) = slot else {
            return Ok(false);
        };

        let full = {
            let guard = ctx.write_set.back().unwrap();
            let mut page = guard.page_mut();
            let mut leaf = page.leaf_mut::<K, V>();
            leaf.insert_at(slot, key, value);
            leaf.size() == leaf.max_size()
        };
        if full {
            self.split_leaf(&mut ctx)?;
            while ctx.write_set.len() > 1 {
                self.split_internal(&mut ctx)?;
            }
            // The survivor is the root or a safe ancestor; only the
            // root can still be overfull here.
            let overfull = match ctx.write_set.back() {
                Some(guard) => {
                    let page = guard.page();
                    let internal = page.internal::<K>();
                    internal.size() > internal.max_size()
                }
                None => false,
            };
            if overfull {
                self.split_internal(&mut ctx)?;
            }
        }
        Ok(true)
    }

    /// Create a new internal root over the old root and a freshly
    /// split-off right page, and point the header at it.
    fn install_new_root(
        &self,
        ctx: &mut Context<'_>,
        split_key: &K,
        new_page_id: PageId,
    ) -> Result<()> {
        let root_guard = self.bpm.new_page()?;
        let new_root_id = root_guard.page_id();
        {
            let mut page = root_guard.page_mut();
            let mut root = page.internal_mut::<K>();
            root.init(self.internal_max_size);
            root.insert_at(0, &K::default(), ctx.root_page_id);
            let slot = root.upper_bound(|k| self.comparator.cmp(k, split_key));
            root.insert_at(slot, split_key, new_page_id);
        }
        if let Some(header) = &ctx.header_write {
            header.page_mut().header_mut().set_root_page_id(new_root_id);
        }
        debug!("{}: new root {new_root_id}", self.name);
        Ok(())
    }

    /// Split the overfull leaf at the back of the write set and push
    /// the separator into its parent (or a new root).
    fn split_leaf(&self, ctx: &mut Context<'_>) -> Result<()> {
        let new_guard = self.bpm.new_page()?;
        let new_page_id = new_guard.page_id();

        let split_key = {
            let leaf_guard = ctx.write_set.back().unwrap();
            let mut page = leaf_guard.page_mut();
            let mut leaf = page.leaf_mut::<K, V>();
            let mut n_page = new_guard.page_mut();
            let mut new_leaf = n_page.leaf_mut::<K, V>();
            new_leaf.init(self.leaf_max_size);
            let size = leaf.size();
            for i in size / 2..size {
                let (k, v) = leaf.pair_at(i);
                let pos = new_leaf.size();
                new_leaf.insert_at(pos, &k, &v);
            }
            leaf.set_size(size / 2);
            new_leaf.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_page_id);
            new_leaf.key_at(0)
        };

        let leaf_page_id = ctx.write_set.back().unwrap().page_id();
        ctx.write_set.pop_back();
        if ctx.is_root(leaf_page_id) {
            return self.install_new_root(ctx, &split_key, new_page_id);
        }
        let parent_guard = ctx.write_set.back().unwrap();
        let mut page = parent_guard.page_mut();
        let mut parent = page.internal_mut::<K>();
        let slot = parent.upper_bound(|k| self.comparator.cmp(k, &split_key));
        parent.insert_at(slot, &split_key, new_page_id);
        Ok(())
    }

    /// Split the overfull internal node at the back of the write set.
    ///
    /// The upper half moves wholesale: the moved slot 0 key doubles as
    /// the separator carried up and stays in place unread, keeping
    /// slot 0 a sentinel in every internal page.
    fn split_internal(&self, ctx: &mut Context<'_>) -> Result<()> {
        let new_guard = self.bpm.new_page()?;
        let new_page_id = new_guard.page_id();

        let split_key = {
            let guard = ctx.write_set.back().unwrap();
            let mut page = guard.page_mut();
            let mut node = page.internal_mut::<K>();
            let mut n_page = new_guard.page_mut();
            let mut new_node = n_page.internal_mut::<K>();
            new_node.init(self.internal_max_size);
            let size = node.size();
            for i in size / 2..size {
                let (k, child) = node.pair_at(i);
                let pos = new_node.size();
                new_node.insert_at(pos, &k, child);
            }
            node.set_size(size / 2);
            new_node.key_at(0)
        };

        let page_id = ctx.write_set.back().unwrap().page_id();
        ctx.write_set.pop_back();
        if ctx.is_root(page_id) {
            return self.install_new_root(ctx, &split_key, new_page_id);
        }
        let parent_guard = ctx.write_set.back().unwrap();
        let mut page = parent_guard.page_mut();
        let mut parent = page.internal_mut::<K>();
        let slot = parent.upper_bound(|k| self.comparator.cmp(k, &split_key));
        parent.insert_at(slot, &split_key, new_page_id);
        Ok(())
    }

    /// Returns `(done, retry_pessimistic)`
    fn remove_optimistic(&self, key: &K) -> Result<(bool, bool)> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = header_guard.page().header().root_page_id();
        if !root_page_id.is_valid() {
            return Ok((true, false));
        }

        let mut page_id = root_page_id;
        let mut guard = self.bpm.fetch_page_read(page_id)?;
        drop(header_guard);
        loop {
            let next = {
                let page = guard.page();
                if page.is_leaf() {
                    None
                } else {
                    let internal = page.internal::<K>();
                    Some(internal.value_at(self.descend_index(&internal, key)))
                }
            };
            match next {
                Some(child) => {
                    page_id = child;
                    guard = self.bpm.fetch_page_read(page_id)?;
                }
                None => break,
            }
        }
        drop(guard);

        enum LeafAction {
            Done,
            Retry,
            Remove(usize),
        }

        let guard = self.bpm.fetch_page_write(page_id)?;
        let action = {
            let page = guard.page();
            let leaf = page.leaf::<K, V>();
            match self.leaf_slot_of(&leaf, key) {
                None => LeafAction::Done,
                Some(slot) if page_id == root_page_id => {
                    // Emptying the root means tearing the tree down;
                    // leave that to the pessimistic pass.
                    if leaf.size() == 1 {
                        LeafAction::Retry
                    } else {
                        LeafAction::Remove(slot)
                    }
                }
                Some(slot) if leaf.size() > leaf.min_size() => LeafAction::Remove(slot),
                Some(_) => LeafAction::Retry,
            }
        };
        match action {
            LeafAction::Done => Ok((true, false)),
            LeafAction::Retry => Ok((false, true)),
            LeafAction::Remove(slot) => {
                guard.page_mut().leaf_mut::<K, V>().remove_at(slot);
                Ok((true, false))
            }
        }
    }

    fn remove_pessimistic(&self, key: &K) -> Result<()> {
        let mut ctx = Context::new();
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        ctx.root_page_id = header_guard.page().header().root_page_id();
        ctx.header_write = Some(header_guard);
        if !ctx.root_page_id.is_valid() {
            return Ok(());
        }

        ctx.write_set
            .push_back(self.bpm.fetch_page_write(ctx.root_page_id)?);
        loop {
            let step = {
                let guard = ctx.write_set.back().unwrap();
                let page = guard.page();
                if page.is_leaf() {
                    None
                } else {
                    let internal = page.internal::<K>();
                    let safe = internal.size() > internal.min_size();
                    let slot = self.descend_index(&internal, key);
                    Some((safe, slot, internal.value_at(slot)))
                }
            };
            let Some((safe, slot, child)) = step else { break };
            if safe {
                while ctx.write_set.len() > 1 {
                    ctx.write_set.pop_front();
                    ctx.index_set.pop_front();
                }
            }
            ctx.write_set.push_back(self.bpm.fetch_page_write(child)?);
            ctx.index_set.push_back(slot);
        }

        {
            let guard = ctx.write_set.back().unwrap();
            let slot = {
                let page = guard.page();
                let leaf = page.leaf::<K, V>();
                self.leaf_slot_of(&leaf, key)
            };
            if let Some(slot) = slot {
                guard.page_mut().leaf_mut::<K, V>().remove_at(slot);
            }
        }

        let (leaf_size, leaf_min, leaf_page_id) = {
            let guard = ctx.write_set.back().unwrap();
            let page = guard.page();
            let leaf = page.leaf::<K, V>();
            (leaf.size(), leaf.min_size(), guard.page_id())
        };

        if ctx.is_root(leaf_page_id) {
            if leaf_size == 0 {
                if let Some(header) = &ctx.header_write {
                    header.page_mut().header_mut().set_root_page_id(PageId::INVALID);
                }
                ctx.write_set.pop_back();
                self.bpm.delete_page(ctx.root_page_id)?;
                debug!("{}: tree emptied", self.name);
            }
            return Ok(());
        }
        if leaf_size >= leaf_min {
            return Ok(());
        }

        if self.adopt_into_leaf(&mut ctx)? {
            return Ok(());
        }
        self.merge_leaf(&mut ctx)?;

        while ctx.write_set.len() > 1 {
            if self.adopt_into_internal(&mut ctx)? {
                return Ok(());
            }
            self.merge_internal(&mut ctx)?;
        }

        // Only the root (or a safe ancestor) remains; a root down to a
        // single child hands its role to that child.
        let (size, survivor_id, first_child) = {
            let guard = ctx.write_set.back().unwrap();
            let page = guard.page();
            let internal = page.internal::<K>();
            (internal.size(), guard.page_id(), internal.value_at(0))
        };
        if ctx.is_root(survivor_id) && size == 1 {
            if let Some(header) = &ctx.header_write {
                header.page_mut().header_mut().set_root_page_id(first_child);
            }
            ctx.write_set.pop_back();
            self.bpm.delete_page(ctx.root_page_id)?;
            debug!("{}: root collapsed into {first_child}", self.name);
        }
        Ok(())
    }

    /// Try to repair the underflowing leaf at the back of the write
    /// set by adopting one record from a sibling. Returns true on
    /// success, having released the leaf's guard.
    fn adopt_into_leaf(&self, ctx: &mut Context<'_>) -> Result<bool> {
        let slot = *ctx.index_set.back().unwrap();
        let parent_pos = ctx.write_set.len() - 2;

        let right_id = {
            let page = ctx.write_set[parent_pos].page();
            let parent = page.internal::<K>();
            (slot + 1 < parent.size()).then(|| parent.value_at(slot + 1))
        };
        if let Some(right_id) = right_id {
            let right_guard = self.bpm.fetch_page_write(right_id)?;
            let donated = {
                let page = right_guard.page();
                let right = page.leaf::<K, V>();
                (right.size() > right.min_size()).then(|| right.pair_at(0))
            };
            if let Some((k, v)) = donated {
                {
                    let guard = ctx.write_set.back().unwrap();
                    let mut page = guard.page_mut();
                    let mut leaf = page.leaf_mut::<K, V>();
                    let pos = leaf.size();
                    leaf.insert_at(pos, &k, &v);
                }
                right_guard.page_mut().leaf_mut::<K, V>().remove_at(0);
                let separator = {
                    let page = right_guard.page();
                    page.leaf::<K, V>().key_at(0)
                };
                ctx.write_set[parent_pos]
                    .page_mut()
                    .internal_mut::<K>()
                    .set_key_at(slot + 1, &separator);
                ctx.write_set.pop_back();
                ctx.index_set.pop_back();
                return Ok(true);
            }
        }

        if slot > 0 {
            let left_id = {
                let page = ctx.write_set[parent_pos].page();
                page.internal::<K>().value_at(slot - 1)
            };
            let left_guard = self.bpm.fetch_page_write(left_id)?;
            let donated = {
                let page = left_guard.page();
                let left = page.leaf::<K, V>();
                (left.size() > left.min_size()).then(|| left.pair_at(left.size() - 1))
            };
            if let Some((k, v)) = donated {
                {
                    let guard = ctx.write_set.back().unwrap();
                    guard.page_mut().leaf_mut::<K, V>().insert_at(0, &k, &v);
                }
                {
                    let mut page = left_guard.page_mut();
                    let mut left = page.leaf_mut::<K, V>();
                    let last = left.size() - 1;
                    left.remove_at(last);
                }
                ctx.write_set[parent_pos]
                    .page_mut()
                    .internal_mut::<K>()
                    .set_key_at(slot, &k);
                ctx.write_set.pop_back();
                ctx.index_set.pop_back();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Fold the underflowing leaf into a sibling. Adoption must have
    /// been tried first; once both siblings are at minimum a merge
    /// always fits.
    fn merge_leaf(&self, ctx: &mut Context<'_>) -> Result<()> {
        let slot = *ctx.index_set.back().unwrap();
        let parent_pos = ctx.write_set.len() - 2;

        let right_id = {
            let page = ctx.write_set[parent_pos].page();
            let parent = page.internal::<K>();
            (slot + 1 < parent.size()).then(|| parent.value_at(slot + 1))
        };
        if let Some(right_id) = right_id {
            let right_guard = self.bpm.fetch_page_write(right_id)?;
            {
                let guard = ctx.write_set.back().unwrap();
                let mut page = guard.page_mut();
                let mut leaf = page.leaf_mut::<K, V>();
                let mut r_page = right_guard.page_mut();
                let mut right = r_page.leaf_mut::<K, V>();
                for i in 0..right.size() {
                    let (k, v) = right.pair_at(i);
                    let pos = leaf.size();
                    leaf.insert_at(pos, &k, &v);
                }
                leaf.set_next_page_id(right.next_page_id());
                right.set_size(0);
            }
            ctx.write_set[parent_pos]
                .page_mut()
                .internal_mut::<K>()
                .remove_at(slot + 1);
            drop(right_guard);
            self.bpm.delete_page(right_id)?;
            ctx.write_set.pop_back();
            ctx.index_set.pop_back();
            return Ok(());
        }

        // Rightmost child: fold into the left sibling instead.
        let left_id = {
            let page = ctx.write_set[parent_pos].page();
            page.internal::<K>().value_at(slot - 1)
        };
        let left_guard = self.bpm.fetch_page_write(left_id)?;
        {
            let guard = ctx.write_set.back().unwrap();
            let mut page = guard.page_mut();
            let mut leaf = page.leaf_mut::<K, V>();
            let mut l_page = left_guard.page_mut();
            let mut left = l_page.leaf_mut::<K, V>();
            for i in 0..leaf.size() {
                let (k, v) = leaf.pair_at(i);
                let pos = left.size();
                left.insert_at(pos, &k, &v);
            }
            left.set_next_page_id(leaf.next_page_id());
            leaf.set_size(0);
        }
        ctx.write_set[parent_pos]
            .page_mut()
            .internal_mut::<K>()
            .remove_at(slot);
        let page_id = ctx.write_set.back().unwrap().page_id();
        ctx.write_set.pop_back();
        ctx.index_set.pop_back();
        self.bpm.delete_page(page_id)?;
        Ok(())
    }

    /// Adoption for internal nodes. Moved records carry their stored
    /// keys wholesale; the sentinel invariant keeps every slot 0 key
    /// equal to the parent's separator for that child, so the moves
    /// stay consistent without recomputing keys.
    fn adopt_into_internal(&self, ctx: &mut Context<'_>) -> Result<bool> {
        let slot = *ctx.index_set.back().unwrap();
        let parent_pos = ctx.write_set.len() - 2;

        let right_id = {
            let page = ctx.write_set[parent_pos].page();
            let parent = page.internal::<K>();
            (slot + 1 < parent.size()).then(|| parent.value_at(slot + 1))
        };
        if let Some(right_id) = right_id {
            let right_guard = self.bpm.fetch_page_write(right_id)?;
            let donated = {
                let page = right_guard.page();
                let right = page.internal::<K>();
                (right.size() > right.min_size()).then(|| right.pair_at(0))
            };
            if let Some((k, child)) = donated {
                {
                    let guard = ctx.write_set.back().unwrap();
                    let mut page = guard.page_mut();
                    let mut node = page.internal_mut::<K>();
                    let pos = node.size();
                    node.insert_at(pos, &k, child);
                }
                right_guard.page_mut().internal_mut::<K>().remove_at(0);
                let separator = {
                    let page = right_guard.page();
                    page.internal::<K>().key_at(0)
                };
                ctx.write_set[parent_pos]
                    .page_mut()
                    .internal_mut::<K>()
                    .set_key_at(slot + 1, &separator);
                ctx.write_set.pop_back();
                ctx.index_set.pop_back();
                return Ok(true);
            }
        }

        if slot > 0 {
            let left_id = {
                let page = ctx.write_set[parent_pos].page();
                page.internal::<K>().value_at(slot - 1)
            };
            let left_guard = self.bpm.fetch_page_write(left_id)?;
            let donated = {
                let page = left_guard.page();
                let left = page.internal::<K>();
                (left.size() > left.min_size()).then(|| left.pair_at(left.size() - 1))
            };
            if let Some((k, child)) = donated {
                {
                    let guard = ctx.write_set.back().unwrap();
                    guard
                        .page_mut()
                        .internal_mut::<K>()
                        .insert_at(0, &k, child);
                }
                {
                    let mut page = left_guard.page_mut();
                    let mut left = page.internal_mut::<K>();
                    let last = left.size() - 1;
                    left.remove_at(last);
                }
                ctx.write_set[parent_pos]
                    .page_mut()
                    .internal_mut::<K>()
                    .set_key_at(slot, &k);
                ctx.write_set.pop_back();
                ctx.index_set.pop_back();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merge for internal nodes; same shape as the leaf merge but with
    /// no successor pointer to relink.
    fn merge_internal(&self, ctx: &mut Context<'_>) -> Result<()> {
        let slot = *ctx.index_set.back().unwrap();
        let parent_pos = ctx.write_set.len() - 2;

        let right_id = {
            let page = ctx.write_set[parent_pos].page();
            let parent = page.internal::<K>();
            (slot + 1 < parent.size()).then(|| parent.value_at(slot + 1))
        };
        if let Some(right_id) = right_id {
            let right_guard = self.bpm.fetch_page_write(right_id)?;
            {
                let guard = ctx.write_set.back().unwrap();
                let mut page = guard.page_mut();
                let mut node = page.internal_mut::<K>();
                let mut r_page = right_guard.page_mut();
                let mut right = r_page.internal_mut::<K>();
                for i in 0..right.size() {
                    let (k, child) = right.pair_at(i);
                    let pos = node.size();
                    node.insert_at(pos, &k, child);
                }
                right.set_size(0);
            }
            ctx.write_set[parent_pos]
                .page_mut()
                .internal_mut::<K>()
                .remove_at(slot + 1);
            drop(right_guard);
            self.bpm.delete_page(right_id)?;
            ctx.write_set.pop_back();
            ctx.index_set.pop_back();
            return Ok(());
        }

        let left_id = {
            let page = ctx.write_set[parent_pos].page();
            page.internal::<K>().value_at(slot - 1)
        };
        let left_guard = self.bpm.fetch_page_write(left_id)?;
        {
            let guard = ctx.write_set.back().unwrap();
            let mut page = guard.page_mut();
            let mut node = page.internal_mut::<K>();
            let mut l_page = left_guard.page_mut();
            let mut left = l_page.internal_mut::<K>();
            for i in 0..node.size() {
                let (k, child) = node.pair_at(i);
                let pos = left.size();
                left.insert_at(pos, &k, child);
            }
            node.set_size(0);
        }
        ctx.write_set[parent_pos]
            .page_mut()
            .internal_mut::<K>()
            .remove_at(slot);
        let page_id = ctx.write_set.back().unwrap().page_id();
        ctx.write_set.pop_back();
        ctx.index_set.pop_back();
        self.bpm.delete_page(page_id)?;
        Ok(())
    }

    fn collect_matches(
        &self,
        key: &K,
        guard: ReadPageGuard<'_>,
        out: &mut Vec<K>,
    ) -> Result<()> {
        let children = {
            let page = guard.page();
            if page.is_leaf() {
                let leaf = page.leaf::<K, V>();
                let lo = leaf.lower_bound(|k| self.comparator.cmp_prefix(k, key));
                let hi = leaf.upper_bound(|k| self.comparator.cmp_prefix(k, key));
                for i in lo..hi {
                    out.push(leaf.key_at(i));
                }
                Vec::new()
            } else {
                // Every child whose interval may overlap the prefix
                // class gets visited.
                let internal = page.internal::<K>();
                let lo = internal.lower_bound(|k| self.comparator.cmp_prefix(k, key)) - 1;
                let hi = internal.upper_bound(|k| self.comparator.cmp_prefix(k, key)) - 1;
                let mut guards = Vec::with_capacity(hi - lo + 1);
                for i in lo..=hi {
                    guards.push(self.bpm.fetch_page_read(internal.value_at(i))?);
                }
                guards
            }
        };
        drop(guard);
        for child in children {
            self.collect_matches(key, child, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileDiskManager;
    use crate::types::{CompositeKey, CompositeKeyComparator, OrdComparator};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::tempdir;

    type IntTree = BPlusTree<i64, i64, OrdComparator>;

    fn make_tree(
        dir: &Path,
        pool_size: usize,
        leaf_max: usize,
        internal_max: usize,
    ) -> (IntTree, Arc<BufferPool>) {
        let dm = Arc::new(FileDiskManager::open(dir).unwrap());
        let bpm = Arc::new(BufferPool::new(dm, pool_size, 2));
        let tree = IntTree::open(
            "test_index",
            PageId::new(0),
            Arc::clone(&bpm),
            leaf_max,
            internal_max,
        )
        .unwrap();
        (tree, bpm)
    }

    fn collect_keys(tree: &IntTree) -> Vec<i64> {
        tree.iter()
            .unwrap()
            .collect_all()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }

    /// Walk the tree asserting that every parent separator equals the
    /// first stored key of the child it bounds. Only valid on trees
    /// that never deleted a leaf's first key.
    fn assert_separators(bpm: &BufferPool, page_id: PageId) {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        let (children, separators) = {
            let page = guard.page();
            if page.is_leaf() {
                return;
            }
            let internal = page.internal::<i64>();
            let children: Vec<PageId> = (0..internal.size()).map(|i| internal.value_at(i)).collect();
            let separators: Vec<i64> = (0..internal.size()).map(|i| internal.key_at(i)).collect();
            (children, separators)
        };
        drop(guard);

        for (i, &child) in children.iter().enumerate() {
            if i >= 1 {
                let child_guard = bpm.fetch_page_read(child).unwrap();
                let page = child_guard.page();
                let first_key = if page.is_leaf() {
                    page.leaf::<i64, i64>().key_at(0)
                } else {
                    page.internal::<i64>().key_at(0)
                };
                assert_eq!(separators[i], first_key, "separator mismatch at child {i}");
            }
            assert_separators(bpm, child);
        }
    }

    #[test]
    fn test_empty_tree() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 16, 4, 4);

        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.get_root_page_id().unwrap(), PageId::INVALID);
        assert!(tree.find(&1).unwrap().is_empty());
        assert!(tree.iter().unwrap().is_end());
        tree.remove(&1).unwrap();
    }

    #[test]
    fn test_insert_then_iterate_sorted() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 16, 4, 4);

        assert!(tree.insert(&3, &30).unwrap());
        assert!(tree.insert(&1, &10).unwrap());
        assert!(tree.insert(&2, &20).unwrap());

        let entries = tree.iter().unwrap().collect_all().unwrap();
        assert_eq!(entries, vec![(1, 10), (2, 20), (3, 30)]);
        assert!(!tree.is_empty().unwrap());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 16, 4, 4);

        assert!(tree.insert(&7, &70).unwrap());
        assert!(!tree.insert(&7, &71).unwrap());

        // The original value is untouched.
        let entries = tree.iter().unwrap().collect_all().unwrap();
        assert_eq!(entries, vec![(7, 70)]);
    }

    #[test]
    fn test_sequential_inserts_with_splits() {
        let dir = tempdir().unwrap();
        let (tree, bpm) = make_tree(dir.path(), 32, 4, 4);

        for i in 1..=100 {
            assert!(tree.insert(&i, &(i * 10)).unwrap(), "insert {i}");
        }

        assert_eq!(collect_keys(&tree), (1..=100).collect::<Vec<_>>());
        assert_eq!(tree.find(&50).unwrap(), vec![50]);
        assert!(tree.find(&101).unwrap().is_empty());

        let from_50: Vec<i64> = tree
            .iter_from(&50)
            .unwrap()
            .collect_all()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(from_50, (50..=100).collect::<Vec<_>>());

        let root = tree.get_root_page_id().unwrap();
        assert!(root.is_valid());
        assert_separators(&bpm, root);
    }

    #[test]
    fn test_reverse_inserts_with_splits() {
        let dir = tempdir().unwrap();
        let (tree, bpm) = make_tree(dir.path(), 32, 4, 4);

        for i in (1..=100).rev() {
            assert!(tree.insert(&i, &i).unwrap());
        }
        assert_eq!(collect_keys(&tree), (1..=100).collect::<Vec<_>>());
        assert_separators(&bpm, tree.get_root_page_id().unwrap());
    }

    #[test]
    fn test_delete_even_keys() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 32, 4, 4);

        for i in 1..=100 {
            tree.insert(&i, &i).unwrap();
        }
        for i in (2..=100).step_by(2) {
            tree.remove(&i).unwrap();
        }

        let odds: Vec<i64> = (1..=100).step_by(2).collect();
        assert_eq!(collect_keys(&tree), odds);

        // Deleting an absent key is a no-op, twice over.
        tree.remove(&2).unwrap();
        tree.remove(&2).unwrap();
        assert_eq!(collect_keys(&tree), odds);
    }

    #[test]
    fn test_root_lifecycle_down_to_empty() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 16, 4, 4);

        // Leaf root first, then force a split so the root goes internal.
        for i in 1..=8 {
            tree.insert(&i, &i).unwrap();
        }
        let tall_root = tree.get_root_page_id().unwrap();
        assert!(tall_root.is_valid());

        // Shrink back down; the root collapses to a leaf and finally away.
        for i in 1..=8 {
            tree.remove(&i).unwrap();
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.get_root_page_id().unwrap(), PageId::INVALID);

        // The tree is still usable afterwards.
        tree.insert(&42, &1).unwrap();
        assert_eq!(collect_keys(&tree), vec![42]);
    }

    #[test]
    fn test_interleaved_delete_orders() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 32, 4, 4);

        for i in 1..=40 {
            tree.insert(&i, &i).unwrap();
        }
        // Deleting from the middle exercises right-sibling adoption and
        // merges; deleting the tail exercises the left-sibling paths.
        for i in 15..=25 {
            tree.remove(&i).unwrap();
        }
        for i in (33..=40).rev() {
            tree.remove(&i).unwrap();
        }

        let expected: Vec<i64> = (1..=14).chain(26..=32).collect();
        assert_eq!(collect_keys(&tree), expected);
        for i in 15..=25 {
            assert!(tree.find(&i).unwrap().is_empty());
        }
        assert_eq!(tree.find(&30).unwrap(), vec![30]);
    }

    #[test]
    fn test_iter_from_absent_key_is_end() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 16, 4, 4);

        for i in [10i64, 20, 30] {
            tree.insert(&i, &i).unwrap();
        }
        assert!(tree.iter_from(&15).unwrap().is_end());
        assert_eq!(tree.iter_from(&20).unwrap().key(), Some(20));
    }

    #[test]
    fn test_composite_duplicate_keys() {
        let dir = tempdir().unwrap();
        let dm = Arc::new(FileDiskManager::open(dir.path()).unwrap());
        let bpm = Arc::new(BufferPool::new(dm, 16, 2));
        let tree: BPlusTree<CompositeKey, i32, CompositeKeyComparator> =
            BPlusTree::open("dup_index", PageId::new(0), bpm, 4, 4).unwrap();

        let abc = 0xabc_u64;
        let xyz = 0x789_u64;
        for tag in [2, 1, 3] {
            assert!(tree.insert(&CompositeKey::new(abc, tag), &0).unwrap());
        }
        tree.insert(&CompositeKey::new(xyz, 9), &0).unwrap();

        // Prefix lookup returns every tag for the user key, ascending.
        let hits = tree.find(&CompositeKey::new(abc, 0)).unwrap();
        assert_eq!(
            hits,
            vec![
                CompositeKey::new(abc, 1),
                CompositeKey::new(abc, 2),
                CompositeKey::new(abc, 3),
            ]
        );
        assert!(tree.find(&CompositeKey::new(0x555, 0)).unwrap().is_empty());

        // Removing one composite leaves its siblings alone.
        tree.remove(&CompositeKey::new(abc, 2)).unwrap();
        let hits = tree.find(&CompositeKey::new(abc, 0)).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();

        {
            let (tree, _bpm) = make_tree(dir.path(), 32, 4, 4);
            for i in 1..=50 {
                tree.insert(&i, &(i * 2)).unwrap();
            }
            tree.remove(&13).unwrap();
            tree.close().unwrap();
        }

        {
            let (tree, _bpm) = make_tree(dir.path(), 32, 4, 4);
            assert!(!tree.is_empty().unwrap());
            let expected: Vec<i64> = (1..=50).filter(|&i| i != 13).collect();
            assert_eq!(collect_keys(&tree), expected);
            assert_eq!(tree.find(&25).unwrap(), vec![25]);
            assert!(tree.find(&13).unwrap().is_empty());
        }
    }

    #[test]
    fn test_small_pool_random_workload() {
        // Eight frames is enough for a three-level path plus the
        // header and split scratch pages, but nothing to spare.
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 8, 16, 16);

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut shadow = BTreeSet::new();
        for _ in 0..1000 {
            let key = rng.gen_range(0..200i64);
            if rng.gen_bool(0.5) {
                let fresh = tree.insert(&key, &key).unwrap();
                assert_eq!(fresh, shadow.insert(key));
            } else {
                let hits = tree.find(&key).unwrap();
                if shadow.contains(&key) {
                    assert_eq!(hits, vec![key]);
                } else {
                    assert!(hits.is_empty());
                }
            }
        }

        let expected: Vec<i64> = shadow.iter().copied().collect();
        assert_eq!(collect_keys(&tree), expected);
    }

    #[test]
    fn test_random_insert_delete_churn() {
        let dir = tempdir().unwrap();
        let (tree, _bpm) = make_tree(dir.path(), 16, 4, 4);

        let mut rng = StdRng::seed_from_u64(7);
        let mut shadow = BTreeSet::new();
        for _ in 0..2000 {
            let key = rng.gen_range(0..100i64);
            if rng.gen_bool(0.6) {
                let fresh = tree.insert(&key, &key).unwrap();
                assert_eq!(fresh, shadow.insert(key));
            } else {
                tree.remove(&key).unwrap();
                shadow.remove(&key);
            }
        }

        let expected: Vec<i64> = shadow.iter().copied().collect();
        assert_eq!(collect_keys(&tree), expected);
        assert_eq!(tree.is_empty().unwrap(), shadow.is_empty());
    }

    #[test]
    fn test_rejects_oversized_fanout() {
        let dir = tempdir().unwrap();
        let dm = Arc::new(FileDiskManager::open(dir.path()).unwrap());
        let bpm = Arc::new(BufferPool::new(dm, 16, 2));
        let huge = LeafPage::<&[u8], i64, i64>::capacity() + 1;
        let result = IntTree::open("bad", PageId::new(0), bpm, huge, 4);
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }
}
