use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::common::types::{PageId, Rid, SlotId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header;
use crate::index::btree::iterator::TreeIterator;
use crate::index::btree::key::BTreeKey;
use crate::index::btree::node::{
    internal_max_size, is_leaf_page, leaf_max_size, BTreeNode, InternalNode, LeafNode,
};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::page::{PageReadGuard, PageWriteGuard};

/// One write-latched, pinned page on the current traversal path.
struct LatchedNode<K> {
    page_id: PageId,
    guard: PageWriteGuard,
    node: BTreeNode<K>,
    dirty: bool,
    /// Page staged for deletion; skipped at write-back
    deleted: bool,
}

/// The set of latches a structural operation currently holds: the root
/// pointer latch (until the root is safe) and the retained suffix of the
/// traversal path, which doubles as the release order on unwind. Page
/// deletions are staged here and applied only after every latch is gone.
struct OpContext<'a, K> {
    root_guard: Option<MutexGuard<'a, PageId>>,
    frames: Vec<LatchedNode<K>>,
    deleted_pages: Vec<PageId>,
}

impl<'a, K> OpContext<'a, K> {
    fn new(root_guard: MutexGuard<'a, PageId>) -> Self {
        Self {
            root_guard: Some(root_guard),
            frames: Vec::new(),
            deleted_pages: Vec::new(),
        }
    }

    fn frame_mut(&mut self, page_id: PageId) -> Option<&mut LatchedNode<K>> {
        self.frames.iter_mut().find(|f| f.page_id == page_id)
    }
}

/// Concurrent B+tree index over the buffer pool. Lookups crab down with
/// read latches; writers first try a read-latched descent that write-latches
/// only the target leaf, and fall back to a pessimistic write-latched
/// descent that releases ancestors as soon as the current node is safe.
/// The root page id is persisted in the header page under the index name.
pub struct BPlusTree<K: BTreeKey> {
    name: String,
    bpm: Arc<BufferPoolManager>,
    root_page_id: Mutex<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _key: PhantomData<K>,
}

impl<K: BTreeKey> BPlusTree<K> {
    pub fn new(name: &str, bpm: Arc<BufferPoolManager>) -> Result<Self, BTreeError> {
        let leaf = leaf_max_size::<K>();
        let internal = internal_max_size::<K>();
        Self::with_max_sizes(name, bpm, leaf, internal)
    }

    /// Constructor with explicit node capacities, used by tests to build
    /// small trees that split after a handful of keys.
    pub fn with_max_sizes(
        name: &str,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 2 && internal_max_size >= 2);

        let root_page_id = if bpm.disk_manager().num_allocated_pages() == 0 {
            let (page, page_id) = bpm.new_page()?;
            debug_assert_eq!(page_id, HEADER_PAGE_ID);
            {
                let mut guard = page.write();
                header::insert_record(&mut guard.data, name, INVALID_PAGE_ID);
            }
            bpm.unpin_page(page_id, true)?;
            INVALID_PAGE_ID
        } else {
            let page = bpm.fetch_page(HEADER_PAGE_ID)?;
            let existing = {
                let guard = page.read();
                header::get_root_id(&guard.data, name)
            };
            match existing {
                Some(root) => {
                    bpm.unpin_page(HEADER_PAGE_ID, false)?;
                    root
                }
                None => {
                    {
                        let mut guard = page.write();
                        header::insert_record(&mut guard.data, name, INVALID_PAGE_ID);
                    }
                    bpm.unpin_page(HEADER_PAGE_ID, true)?;
                    INVALID_PAGE_ID
                }
            }
        };

        Ok(Self {
            name: name.to_string(),
            bpm,
            root_page_id: Mutex::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.lock() == INVALID_PAGE_ID
    }

    /// Point lookup. Crabs down with read latches, releasing each parent as
    /// soon as the child is latched.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(None),
            Some((page_id, guard, leaf)) => {
                let result = leaf.lookup(key);
                drop(guard);
                self.bpm.unpin_page(page_id, false)?;
                Ok(result)
            }
        }
    }

    /// Insert; duplicate keys are rejected with `Ok(false)`.
    pub fn insert(&self, key: K, value: Rid) -> Result<bool, BTreeError> {
        match self.insert_optimistic(key, value)? {
            Some(done) => Ok(done),
            None => self.insert_pessimistic(key, value),
        }
    }

    /// Remove `key` if present; removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        if self.remove_optimistic(key)? {
            return Ok(());
        }
        self.remove_pessimistic(key)
    }

    /// Iterator positioned at the leftmost entry.
    pub fn begin(&self) -> Result<TreeIterator<K>, BTreeError> {
        match self.find_leaf_read(None)? {
            None => Ok(TreeIterator::empty(Arc::clone(&self.bpm))),
            Some((page_id, guard, leaf)) => Ok(TreeIterator::new(
                Arc::clone(&self.bpm),
                page_id,
                guard,
                leaf,
                0,
            )),
        }
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(TreeIterator::empty(Arc::clone(&self.bpm))),
            Some((page_id, guard, leaf)) => {
                let index = leaf.key_index(key);
                Ok(TreeIterator::new(
                    Arc::clone(&self.bpm),
                    page_id,
                    guard,
                    leaf,
                    index,
                ))
            }
        }
    }

    /// Test helper: insert one integer key per line of `path`.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading keys from {}", path.display()))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key: i64 = line
                .parse()
                .with_context(|| format!("parsing key {:?}", line))?;
            self.insert(K::from_i64(key), Rid::new(key as PageId, key as SlotId))?;
        }
        Ok(())
    }

    /// Test helper: remove one integer key per line of `path`.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading keys from {}", path.display()))?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key: i64 = line
                .parse()
                .with_context(|| format!("parsing key {:?}", line))?;
            self.remove(&K::from_i64(key))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Crab down to the leaf for `key` (leftmost leaf when `None`) under
    /// read latches. Returns the still-latched, pinned leaf.
    fn find_leaf_read(
        &self,
        key: Option<&K>,
    ) -> Result<Option<(PageId, PageReadGuard, LeafNode<K>)>, BTreeError> {
        let root_guard = self.root_page_id.lock();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut page_id = *root_guard;
        let ptr = self.bpm.fetch_page(page_id)?;
        let mut guard = ptr.read_arc();
        drop(root_guard);

        loop {
            let node = match BTreeNode::<K>::decode(&guard.data) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    let _ = self.bpm.unpin_page(page_id, false);
                    return Err(e);
                }
            };
            match node {
                BTreeNode::Leaf(leaf) => return Ok(Some((page_id, guard, leaf))),
                BTreeNode::Internal(internal) => {
                    let child_id = match key {
                        Some(key) => internal.lookup(key),
                        None => internal.child_at(0),
                    };
                    let child_ptr = match self.bpm.fetch_page(child_id) {
                        Ok(ptr) => ptr,
                        Err(e) => {
                            drop(guard);
                            let _ = self.bpm.unpin_page(page_id, false);
                            return Err(e.into());
                        }
                    };
                    let child_guard = child_ptr.read_arc();
                    drop(guard);
                    self.bpm.unpin_page(page_id, false)?;
                    page_id = child_id;
                    guard = child_guard;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // optimistic write path
    // ------------------------------------------------------------------

    /// Read-crab to the leaf, write-latch it while its parent (or the root
    /// pointer) is still latched, and mutate in place if the leaf is safe.
    /// `Ok(None)` means the leaf would split and the caller must retraverse
    /// pessimistically.
    fn insert_optimistic(&self, key: K, value: Rid) -> Result<Option<bool>, BTreeError> {
        let mut root_guard = self.root_page_id.lock();
        if *root_guard == INVALID_PAGE_ID {
            self.start_new_tree(&mut root_guard, key, value)?;
            return Ok(Some(true));
        }

        let root_id = *root_guard;
        let root_ptr = self.bpm.fetch_page(root_id)?;
        let root_is_leaf = is_leaf_page(&root_ptr.read().data);

        if root_is_leaf {
            // The root pointer latch stands in for the missing parent latch.
            let mut guard = root_ptr.write_arc();
            let mut node = match BTreeNode::<K>::decode(&guard.data) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    let _ = self.bpm.unpin_page(root_id, false);
                    return Err(e);
                }
            };
            let leaf = node.as_leaf_mut();
            if leaf.lookup(&key).is_some() {
                drop(guard);
                self.bpm.unpin_page(root_id, false)?;
                return Ok(Some(false));
            }
            if leaf.size() + 1 <= leaf.max_size {
                leaf.insert(key, value);
                leaf.encode(&mut guard.data);
                drop(guard);
                self.bpm.unpin_page(root_id, true)?;
                return Ok(Some(true));
            }
            drop(guard);
            self.bpm.unpin_page(root_id, false)?;
            return Ok(None);
        }

        let mut parent_id = root_id;
        let mut parent_guard = root_ptr.read_arc();
        drop(root_guard);

        loop {
            let child_id = {
                let node = match BTreeNode::<K>::decode(&parent_guard.data) {
                    Ok(node) => node,
                    Err(e) => {
                        drop(parent_guard);
                        let _ = self.bpm.unpin_page(parent_id, false);
                        return Err(e);
                    }
                };
                node.as_internal().lookup(&key)
            };
            let child_ptr = match self.bpm.fetch_page(child_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    drop(parent_guard);
                    let _ = self.bpm.unpin_page(parent_id, false);
                    return Err(e.into());
                }
            };
            let child_guard = child_ptr.read_arc();
            if !is_leaf_page(&child_guard.data) {
                drop(parent_guard);
                self.bpm.unpin_page(parent_id, false)?;
                parent_id = child_id;
                parent_guard = child_guard;
                continue;
            }

            // Leaf found. Re-latch it in write mode; the parent's read latch
            // keeps any structural change away during the gap.
            drop(child_guard);
            let mut guard = child_ptr.write_arc();
            let result = (|| -> Result<Option<bool>, BTreeError> {
                let mut node = BTreeNode::<K>::decode(&guard.data)?;
                let leaf = node.as_leaf_mut();
                if leaf.lookup(&key).is_some() {
                    return Ok(Some(false));
                }
                if leaf.size() + 1 <= leaf.max_size {
                    leaf.insert(key, value);
                    leaf.encode(&mut guard.data);
                    return Ok(Some(true));
                }
                Ok(None)
            })();
            let dirty = matches!(result, Ok(Some(true)));
            drop(guard);
            self.bpm.unpin_page(child_id, dirty)?;
            drop(parent_guard);
            self.bpm.unpin_page(parent_id, false)?;
            return result;
        }
    }

    /// Optimistic twin of [`insert_optimistic`]; `Ok(false)` means the leaf
    /// would underflow and the caller must retraverse pessimistically.
    fn remove_optimistic(&self, key: &K) -> Result<bool, BTreeError> {
        let mut root_guard = self.root_page_id.lock();
        if *root_guard == INVALID_PAGE_ID {
            return Ok(true);
        }

        let root_id = *root_guard;
        let root_ptr = self.bpm.fetch_page(root_id)?;
        let root_is_leaf = is_leaf_page(&root_ptr.read().data);

        if root_is_leaf {
            let mut guard = root_ptr.write_arc();
            let mut node = match BTreeNode::<K>::decode(&guard.data) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    let _ = self.bpm.unpin_page(root_id, false);
                    return Err(e);
                }
            };
            let leaf = node.as_leaf_mut();
            if !leaf.remove(key) {
                drop(guard);
                self.bpm.unpin_page(root_id, false)?;
                return Ok(true);
            }
            if leaf.size() == 0 {
                // Last entry gone: the tree is empty again.
                *root_guard = INVALID_PAGE_ID;
                self.persist_root(INVALID_PAGE_ID)?;
                drop(guard);
                self.bpm.unpin_page(root_id, false)?;
                self.delete_tree_page(root_id)?;
                return Ok(true);
            }
            leaf.encode(&mut guard.data);
            drop(guard);
            self.bpm.unpin_page(root_id, true)?;
            return Ok(true);
        }

        let mut parent_id = root_id;
        let mut parent_guard = root_ptr.read_arc();
        drop(root_guard);

        loop {
            let child_id = {
                let node = match BTreeNode::<K>::decode(&parent_guard.data) {
                    Ok(node) => node,
                    Err(e) => {
                        drop(parent_guard);
                        let _ = self.bpm.unpin_page(parent_id, false);
                        return Err(e);
                    }
                };
                node.as_internal().lookup(key)
            };
            let child_ptr = match self.bpm.fetch_page(child_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    drop(parent_guard);
                    let _ = self.bpm.unpin_page(parent_id, false);
                    return Err(e.into());
                }
            };
            let child_guard = child_ptr.read_arc();
            if !is_leaf_page(&child_guard.data) {
                drop(parent_guard);
                self.bpm.unpin_page(parent_id, false)?;
                parent_id = child_id;
                parent_guard = child_guard;
                continue;
            }

            drop(child_guard);
            let mut guard = child_ptr.write_arc();
            let result = (|| -> Result<bool, BTreeError> {
                let mut node = BTreeNode::<K>::decode(&guard.data)?;
                let leaf = node.as_leaf_mut();
                if leaf.lookup(key).is_none() {
                    return Ok(true);
                }
                if leaf.size() > leaf.min_size() {
                    leaf.remove(key);
                    leaf.encode(&mut guard.data);
                    return Ok(true);
                }
                Ok(false)
            })();
            let dirty = matches!(result, Ok(true));
            drop(guard);
            self.bpm.unpin_page(child_id, dirty)?;
            drop(parent_guard);
            self.bpm.unpin_page(parent_id, false)?;
            return result;
        }
    }

    // ------------------------------------------------------------------
    // pessimistic write path
    // ------------------------------------------------------------------

    fn insert_pessimistic(&self, key: K, value: Rid) -> Result<bool, BTreeError> {
        let mut ctx = OpContext::new(self.root_page_id.lock());
        if **ctx.root_guard.as_ref().expect("fresh context") == INVALID_PAGE_ID {
            let mut root_guard = ctx.root_guard.take().expect("fresh context");
            self.start_new_tree(&mut root_guard, key, value)?;
            return Ok(true);
        }

        let result = self.insert_latched(&mut ctx, key, value);
        match result {
            Ok(inserted) => {
                self.finish(ctx)?;
                Ok(inserted)
            }
            Err(e) => {
                self.abandon(ctx);
                Err(e)
            }
        }
    }

    fn insert_latched(&self, ctx: &mut OpContext<'_, K>, key: K, value: Rid) -> Result<bool, BTreeError> {
        self.descend_write(ctx, &key, |node| match node {
            BTreeNode::Leaf(leaf) => leaf.size() + 1 <= leaf.max_size,
            BTreeNode::Internal(internal) => internal.size() + 1 < internal.max_size,
        })?;

        let overflow = {
            let frame = ctx.frames.last_mut().expect("descent latched the leaf");
            let leaf = frame.node.as_leaf_mut();
            if leaf.lookup(&key).is_some() {
                return Ok(false);
            }
            leaf.insert(key, value);
            frame.dirty = true;
            leaf.size() > leaf.max_size
        };
        if overflow {
            self.split_and_propagate(ctx)?;
        }
        Ok(true)
    }

    fn remove_pessimistic(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = OpContext::new(self.root_page_id.lock());
        if **ctx.root_guard.as_ref().expect("fresh context") == INVALID_PAGE_ID {
            return Ok(());
        }

        let result = self.remove_latched(&mut ctx, key);
        match result {
            Ok(()) => self.finish(ctx),
            Err(e) => {
                self.abandon(ctx);
                Err(e)
            }
        }
    }

    fn remove_latched(&self, ctx: &mut OpContext<'_, K>, key: &K) -> Result<(), BTreeError> {
        self.descend_write(ctx, key, |node| {
            let is_root = node.parent_page_id() == INVALID_PAGE_ID;
            match node {
                BTreeNode::Leaf(leaf) if is_root => leaf.size() > 1,
                BTreeNode::Internal(internal) if is_root => internal.size() > 2,
                BTreeNode::Leaf(leaf) => leaf.size() > leaf.min_size(),
                BTreeNode::Internal(internal) => internal.size() > internal.min_size(),
            }
        })?;

        {
            let frame = ctx.frames.last_mut().expect("descent latched the leaf");
            let leaf = frame.node.as_leaf_mut();
            if !leaf.remove(key) {
                return Ok(());
            }
            frame.dirty = true;
        }
        self.coalesce_or_redistribute(ctx)
    }

    /// Write-latched descent. Ancestors (and the root pointer latch) are
    /// released as soon as the node just latched is safe for the pending
    /// operation; the retained suffix lands in the context, leaf last.
    fn descend_write(
        &self,
        ctx: &mut OpContext<'_, K>,
        key: &K,
        is_safe: impl Fn(&BTreeNode<K>) -> bool,
    ) -> Result<(), BTreeError> {
        let mut page_id = **ctx.root_guard.as_ref().expect("descent starts at the root");
        loop {
            let ptr = self.bpm.fetch_page(page_id)?;
            let guard = ptr.write_arc();
            let node = match BTreeNode::<K>::decode(&guard.data) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    let _ = self.bpm.unpin_page(page_id, false);
                    return Err(e);
                }
            };

            if is_safe(&node) {
                self.release_ancestors(ctx)?;
            }
            let next = match &node {
                BTreeNode::Internal(internal) => Some(internal.lookup(key)),
                BTreeNode::Leaf(_) => None,
            };
            ctx.frames.push(LatchedNode {
                page_id,
                guard,
                node,
                dirty: false,
                deleted: false,
            });
            match next {
                Some(child_id) => page_id = child_id,
                None => return Ok(()),
            }
        }
    }

    /// Split the overflowed node at the top of the context and push the
    /// separator into its parent, recursing up the retained path. A root
    /// split grows the tree by one level.
    fn split_and_propagate(&self, ctx: &mut OpContext<'_, K>) -> Result<(), BTreeError> {
        let mut level = ctx.frames.len() - 1;
        loop {
            let (sibling_ptr, sibling_id) = self.bpm.new_page()?;

            // Detach the upper half into the freshly allocated sibling.
            let (separator, mut sibling_node, moved_children) = {
                let frame = &mut ctx.frames[level];
                match &mut frame.node {
                    BTreeNode::Leaf(leaf) => {
                        let mut sibling =
                            LeafNode::new(sibling_id, leaf.parent_page_id, leaf.max_size);
                        let separator = leaf.move_half_to(&mut sibling);
                        frame.dirty = true;
                        (separator, BTreeNode::Leaf(sibling), Vec::new())
                    }
                    BTreeNode::Internal(internal) => {
                        let mut sibling = InternalNode::new(
                            sibling_id,
                            internal.parent_page_id,
                            internal.max_size,
                        );
                        let (separator, moved) = internal.move_half_to(&mut sibling);
                        frame.dirty = true;
                        (separator, BTreeNode::Internal(sibling), moved)
                    }
                }
            };
            self.reparent_children(ctx, &moved_children, sibling_id)?;

            let old_id = ctx.frames[level].page_id;
            let old_parent = ctx.frames[level].node.parent_page_id();

            if old_parent == INVALID_PAGE_ID {
                // Root split: both halves hang off a brand-new root.
                let (root_ptr, new_root_id) = self.bpm.new_page()?;
                debug!("btree {}: root split, new root page {}", self.name, new_root_id);
                let mut new_root =
                    InternalNode::new(new_root_id, INVALID_PAGE_ID, self.internal_max_size);
                new_root.populate_new_root(old_id, separator, sibling_id);
                {
                    let mut guard = root_ptr.write();
                    new_root.encode(&mut guard.data);
                }
                self.bpm.unpin_page(new_root_id, true)?;

                ctx.frames[level].node.set_parent_page_id(new_root_id);
                sibling_node.set_parent_page_id(new_root_id);
                {
                    let mut guard = sibling_ptr.write();
                    sibling_node.encode(&mut guard.data);
                }
                self.bpm.unpin_page(sibling_id, true)?;

                let root_guard = ctx
                    .root_guard
                    .as_mut()
                    .expect("an unsafe root keeps the root pointer latched");
                **root_guard = new_root_id;
                self.persist_root(new_root_id)?;
                return Ok(());
            }

            {
                let mut guard = sibling_ptr.write();
                sibling_node.encode(&mut guard.data);
            }
            self.bpm.unpin_page(sibling_id, true)?;

            debug_assert!(level > 0, "an unsafe child keeps its parent latched");
            let parent_frame = &mut ctx.frames[level - 1];
            let parent = parent_frame.node.as_internal_mut();
            parent.insert_node_after(old_id, separator, sibling_id);
            parent_frame.dirty = true;
            if parent.size() <= parent.max_size {
                return Ok(());
            }
            level -= 1;
        }
    }

    /// Rebalance upward from the underflowed leaf at the top of the
    /// context: borrow from a sibling when it can spare an entry, otherwise
    /// merge the pair and recurse into the parent.
    fn coalesce_or_redistribute(&self, ctx: &mut OpContext<'_, K>) -> Result<(), BTreeError> {
        let mut level = ctx.frames.len() - 1;
        loop {
            let is_root = ctx.frames[level].node.parent_page_id() == INVALID_PAGE_ID;
            let underflow = match (&ctx.frames[level].node, is_root) {
                (BTreeNode::Leaf(leaf), true) => leaf.size() == 0,
                (BTreeNode::Internal(internal), true) => internal.size() == 1,
                (BTreeNode::Leaf(leaf), false) => leaf.size() < leaf.min_size(),
                (BTreeNode::Internal(internal), false) => internal.size() < internal.min_size(),
            };
            if !underflow {
                return Ok(());
            }
            if is_root {
                debug_assert_eq!(level, 0, "the root can only sit at the bottom of the stack");
                return self.adjust_root(ctx);
            }

            debug_assert!(level > 0, "an unsafe node keeps its parent latched");
            let node_id = ctx.frames[level].page_id;
            let (sibling_id, node_idx) = {
                let parent = ctx.frames[level - 1].node.as_internal();
                let idx = parent
                    .value_index(node_id)
                    .expect("latched child must appear in its parent");
                let sibling = if idx == 0 {
                    parent.child_at(1)
                } else {
                    parent.child_at(idx - 1)
                };
                (sibling, idx)
            };

            let sibling_ptr = self.bpm.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_ptr.write_arc();
            let mut sibling_node = match BTreeNode::<K>::decode(&sibling_guard.data) {
                Ok(node) => node,
                Err(e) => {
                    drop(sibling_guard);
                    let _ = self.bpm.unpin_page(sibling_id, false);
                    return Err(e);
                }
            };

            if sibling_node.size() > sibling_node.min_size() {
                // Redistribute one end entry across and fix the separator.
                let reparented = {
                    let (ancestors, rest) = ctx.frames.split_at_mut(level);
                    let parent = ancestors[level - 1].node.as_internal_mut();
                    let frame = &mut rest[0];
                    let moved = match (&mut frame.node, &mut sibling_node) {
                        (BTreeNode::Leaf(node), BTreeNode::Leaf(sibling)) => {
                            if node_idx == 0 {
                                let separator = sibling.move_first_to_end_of(node);
                                parent.set_key_at(1, separator);
                            } else {
                                let separator = sibling.move_last_to_front_of(node);
                                parent.set_key_at(node_idx, separator);
                            }
                            None
                        }
                        (BTreeNode::Internal(node), BTreeNode::Internal(sibling)) => {
                            if node_idx == 0 {
                                let old_separator = parent.key_at(1);
                                let (separator, child) =
                                    sibling.move_first_to_end_of(node, old_separator);
                                parent.set_key_at(1, separator);
                                Some(child)
                            } else {
                                let old_separator = parent.key_at(node_idx);
                                let (separator, child) =
                                    sibling.move_last_to_front_of(node, old_separator);
                                parent.set_key_at(node_idx, separator);
                                Some(child)
                            }
                        }
                        _ => unreachable!("siblings share a node kind"),
                    };
                    frame.dirty = true;
                    ancestors[level - 1].dirty = true;
                    moved
                };
                if let Some(child) = reparented {
                    self.reparent_children(ctx, &[child], node_id)?;
                }
                sibling_node.encode(&mut sibling_guard.data);
                drop(sibling_guard);
                self.bpm.unpin_page(sibling_id, true)?;
                return Ok(());
            }

            // Coalesce the pair; the right page of the pair is staged for
            // deletion and freed only after all latches are released.
            if node_idx == 0 {
                // The right sibling drains into the latched node.
                let moved = {
                    let (ancestors, rest) = ctx.frames.split_at_mut(level);
                    let parent = ancestors[level - 1].node.as_internal_mut();
                    let frame = &mut rest[0];
                    let moved = match (&mut frame.node, &mut sibling_node) {
                        (BTreeNode::Leaf(node), BTreeNode::Leaf(sibling)) => {
                            sibling.move_all_to(node);
                            Vec::new()
                        }
                        (BTreeNode::Internal(node), BTreeNode::Internal(sibling)) => {
                            let separator = parent.key_at(1);
                            sibling.move_all_to(node, separator)
                        }
                        _ => unreachable!("siblings share a node kind"),
                    };
                    parent.remove(1);
                    frame.dirty = true;
                    ancestors[level - 1].dirty = true;
                    moved
                };
                self.reparent_children(ctx, &moved, node_id)?;
                drop(sibling_guard);
                self.bpm.unpin_page(sibling_id, false)?;
                ctx.deleted_pages.push(sibling_id);
            } else {
                // The latched node drains into its left sibling.
                let moved = {
                    let (ancestors, rest) = ctx.frames.split_at_mut(level);
                    let parent = ancestors[level - 1].node.as_internal_mut();
                    let frame = &mut rest[0];
                    let moved = match (&mut frame.node, &mut sibling_node) {
                        (BTreeNode::Leaf(node), BTreeNode::Leaf(sibling)) => {
                            node.move_all_to(sibling);
                            Vec::new()
                        }
                        (BTreeNode::Internal(node), BTreeNode::Internal(sibling)) => {
                            let separator = parent.key_at(node_idx);
                            node.move_all_to(sibling, separator)
                        }
                        _ => unreachable!("siblings share a node kind"),
                    };
                    parent.remove(node_idx);
                    frame.deleted = true;
                    ancestors[level - 1].dirty = true;
                    moved
                };
                self.reparent_children(ctx, &moved, sibling_id)?;
                ctx.deleted_pages.push(node_id);
                sibling_node.encode(&mut sibling_guard.data);
                drop(sibling_guard);
                self.bpm.unpin_page(sibling_id, true)?;
            }
            level -= 1;
        }
    }

    /// The root underflowed: an internal root with a single child hands the
    /// tree to that child; an empty leaf root empties the tree.
    fn adjust_root(&self, ctx: &mut OpContext<'_, K>) -> Result<(), BTreeError> {
        let root_id = ctx.frames[0].page_id;
        let promoted_child = match &ctx.frames[0].node {
            BTreeNode::Internal(root) => {
                debug_assert_eq!(root.size(), 1);
                Some(root.child_at(0))
            }
            BTreeNode::Leaf(root) => {
                debug_assert_eq!(root.size(), 0);
                None
            }
        };

        let new_root_id = match promoted_child {
            Some(child) => {
                debug!("btree {}: height shrinks, new root page {}", self.name, child);
                self.reparent_children(ctx, &[child], INVALID_PAGE_ID)?;
                child
            }
            None => {
                debug!("btree {}: last key removed, tree is empty", self.name);
                INVALID_PAGE_ID
            }
        };

        let root_guard = ctx
            .root_guard
            .as_mut()
            .expect("an unsafe root keeps the root pointer latched");
        **root_guard = new_root_id;
        self.persist_root(new_root_id)?;

        ctx.frames[0].deleted = true;
        ctx.deleted_pages.push(root_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // shared plumbing
    // ------------------------------------------------------------------

    fn start_new_tree(
        &self,
        root_guard: &mut MutexGuard<'_, PageId>,
        key: K,
        value: Rid,
    ) -> Result<(), BTreeError> {
        let (page, page_id) = self.bpm.new_page()?;
        let mut leaf = LeafNode::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key, value);
        {
            let mut guard = page.write();
            leaf.encode(&mut guard.data);
        }
        self.bpm.unpin_page(page_id, true)?;
        **root_guard = page_id;
        self.persist_root(page_id)
    }

    /// Point `parent_page_id` of every page in `children` at `new_parent`.
    /// A child that is latched in the context is patched in place; anything
    /// else is fetched and write-latched briefly.
    fn reparent_children(
        &self,
        ctx: &mut OpContext<'_, K>,
        children: &[PageId],
        new_parent: PageId,
    ) -> Result<(), BTreeError> {
        for &child_id in children {
            if let Some(frame) = ctx.frame_mut(child_id) {
                frame.node.set_parent_page_id(new_parent);
                frame.dirty = true;
                continue;
            }
            let ptr = self.bpm.fetch_page(child_id)?;
            {
                let mut guard = ptr.write();
                let mut node = match BTreeNode::<K>::decode(&guard.data) {
                    Ok(node) => node,
                    Err(e) => {
                        drop(guard);
                        let _ = self.bpm.unpin_page(child_id, false);
                        return Err(e);
                    }
                };
                node.set_parent_page_id(new_parent);
                node.encode(&mut guard.data);
            }
            self.bpm.unpin_page(child_id, true)?;
        }
        Ok(())
    }

    /// Drop every latch currently held (the just-visited node is not yet in
    /// the context). Only clean ancestors are ever released this way.
    fn release_ancestors(&self, ctx: &mut OpContext<'_, K>) -> Result<(), BTreeError> {
        ctx.root_guard = None;
        for frame in ctx.frames.drain(..) {
            debug_assert!(!frame.dirty && !frame.deleted);
            let page_id = frame.page_id;
            drop(frame);
            self.bpm.unpin_page(page_id, false)?;
        }
        Ok(())
    }

    /// Unwind the context: write dirty nodes back, release latches in
    /// reverse acquisition order, unpin, then free staged pages.
    fn finish(&self, mut ctx: OpContext<'_, K>) -> Result<(), BTreeError> {
        while let Some(mut frame) = ctx.frames.pop() {
            let dirty = frame.dirty && !frame.deleted;
            if dirty {
                frame.node.encode(&mut frame.guard.data);
            }
            let page_id = frame.page_id;
            drop(frame);
            self.bpm.unpin_page(page_id, dirty)?;
        }
        ctx.root_guard = None;
        for page_id in ctx.deleted_pages.drain(..) {
            self.delete_tree_page(page_id)?;
        }
        Ok(())
    }

    /// Error-path unwind: release everything without writing back.
    fn abandon(&self, mut ctx: OpContext<'_, K>) {
        while let Some(frame) = ctx.frames.pop() {
            let page_id = frame.page_id;
            drop(frame);
            let _ = self.bpm.unpin_page(page_id, false);
        }
    }

    /// Free a page that has become unreachable from the tree. A reader that
    /// latched the page before it was unlinked may still pin it for a
    /// moment; the page is simply left to the buffer pool in that case.
    fn delete_tree_page(&self, page_id: PageId) -> Result<(), BTreeError> {
        match self.bpm.delete_page(page_id) {
            Err(BufferPoolError::PagePinned(_)) => {
                debug!("btree {}: page {} still pinned, delete skipped", self.name, page_id);
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Persist the root pointer into the header page. Called under the root
    /// pointer latch.
    fn persist_root(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let page = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = page.write();
            if !header::update_record(&mut guard.data, &self.name, root_page_id) {
                header::insert_record(&mut guard.data, &self.name, root_page_id);
            }
        }
        self.bpm.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Walk the whole tree and assert its structural invariants: sorted
    /// keys, parent pointers that match reality, and a leaf chain in key
    /// order. Intended for tests on a quiescent tree.
    pub fn check_integrity(&self) -> Result<(), BTreeError> {
        let root_id = *self.root_page_id.lock();
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut leftmost_leaf = INVALID_PAGE_ID;
        self.check_subtree(root_id, INVALID_PAGE_ID, &mut leftmost_leaf)?;

        // the leaf chain must be globally sorted
        let mut page_id = leftmost_leaf;
        let mut prev_key: Option<K> = None;
        while page_id != INVALID_PAGE_ID {
            let ptr = self.bpm.fetch_page(page_id)?;
            let leaf = {
                let guard = ptr.read();
                let node = BTreeNode::<K>::decode(&guard.data)?;
                match node {
                    BTreeNode::Leaf(leaf) => leaf,
                    _ => panic!("leaf chain reached a non-leaf page {}", page_id),
                }
            };
            self.bpm.unpin_page(page_id, false)?;
            for (key, _) in &leaf.entries {
                if let Some(prev) = prev_key {
                    assert!(prev < *key, "leaf chain out of order at page {}", page_id);
                }
                prev_key = Some(*key);
            }
            page_id = leaf.next_page_id;
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        leftmost_leaf: &mut PageId,
    ) -> Result<(), BTreeError> {
        let ptr = self.bpm.fetch_page(page_id)?;
        let node = {
            let guard = ptr.read();
            BTreeNode::<K>::decode(&guard.data)?
        };
        self.bpm.unpin_page(page_id, false)?;

        assert_eq!(
            node.parent_page_id(),
            expected_parent,
            "page {} has a stale parent pointer",
            page_id
        );
        let is_root = expected_parent == INVALID_PAGE_ID;
        if !is_root {
            assert!(
                node.size() >= node.min_size() && node.size() <= node.max_size(),
                "page {} violates the size bounds: {} not in [{}, {}]",
                page_id,
                node.size(),
                node.min_size(),
                node.max_size()
            );
        }

        match node {
            BTreeNode::Leaf(leaf) => {
                if *leftmost_leaf == INVALID_PAGE_ID {
                    *leftmost_leaf = page_id;
                }
                for pair in leaf.entries.windows(2) {
                    assert!(pair[0].0 < pair[1].0, "unsorted leaf page {}", page_id);
                }
            }
            BTreeNode::Internal(internal) => {
                for pair in internal.entries.windows(2).skip(1) {
                    assert!(pair[0].0 < pair[1].0, "unsorted internal page {}", page_id);
                }
                for (_, child) in &internal.entries {
                    self.check_subtree(*child, page_id, leftmost_leaf)?;
                }
            }
        }
        Ok(())
    }
}
