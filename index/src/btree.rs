//! A concurrent B+-tree over the buffer pool, using latch coupling.
//!
//! Descents acquire latches parent-then-child and release the parent once
//! the child is safely latched. Lookups crab with read latches only. Insert
//! and remove first run an optimistic pass (read latches down, write latch
//! on the leaf) and restart pessimistically when the leaf cannot absorb the
//! change; the pessimistic pass takes a write guard on the header page, then
//! write latches down the path, releasing the unresolved prefix as soon as
//! the current node proves safe. Pinned ancestors live in an explicit
//! write-set owned by the operation; pages carry no parent pointers.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use log::error;
use thiserror::Error;

use storage::buffer_pool::BufferPool;
use storage::config::{INVALID_PAGE_ID, PageId};
use storage::page_guard::{ReadPageGuard, WritePageGuard};

use crate::iter::TreeIter;
use crate::page::{
    HeaderNode, IndexKey, InternalNode, LeafNode, NodeKind, Rid, internal_capacity,
    leaf_capacity, node_kind,
};

/// Error for B+-tree operations. Duplicate and missing keys are not errors;
/// these are structural failures only.
#[derive(Debug, Error)]
pub enum BTreeError {
    #[error("buffer pool has no frame available")]
    PoolExhausted,
    #[error("page {0} does not hold a b+-tree node")]
    CorruptNode(PageId),
}

/// Guards held by one pessimistic descent: the header page while no node
/// has proven safe yet, and the unresolved suffix of the path.
struct Context {
    header: Option<WritePageGuard>,
    write_set: VecDeque<WritePageGuard>,
}

impl Context {
    /// Releases every latch above the node about to be pushed; called when
    /// that node is safe for the current operation.
    fn release_prefix(&mut self) {
        self.header = None;
        self.write_set.clear();
    }
}

enum Optimistic<T> {
    Done(T),
    Restart,
}

/// A B+-tree index mapping unique `K` keys to [`Rid`]s.
///
/// `TOMBS` fixes the per-leaf tombstone buffer capacity at type
/// instantiation; `0` disables it.
pub struct BPlusTree<K: IndexKey, const TOMBS: usize = 0> {
    pool: Arc<BufferPool>,
    header_page_id: PageId,
    leaf_max_size: u32,
    internal_max_size: u32,
    _key: PhantomData<K>,
}

impl<K: IndexKey, const TOMBS: usize> BPlusTree<K, TOMBS> {
    /// Creates a tree rooted in the (already allocated) header page, which
    /// is initialized to an empty tree.
    pub fn new(
        pool: Arc<BufferPool>,
        header_page_id: PageId,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self, BTreeError> {
        assert!(
            (2..=leaf_capacity::<K>(TOMBS) as u32).contains(&leaf_max_size),
            "leaf fanout must fit the page"
        );
        assert!(
            (3..=internal_capacity::<K>() as u32).contains(&internal_max_size),
            "internal fanout must fit the page"
        );
        let tree = BPlusTree {
            pool,
            header_page_id,
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        };
        let mut header = tree.write_guard(header_page_id)?;
        HeaderNode::new(&mut header).set_root_page_id(INVALID_PAGE_ID);
        Ok(tree)
    }

    /// Root page id as recorded in the header page; `INVALID_PAGE_ID` for an
    /// empty tree.
    pub fn root_page_id(&self) -> Result<PageId, BTreeError> {
        let header = self.read_guard(self.header_page_id)?;
        Ok(HeaderNode::new(&header).root_page_id())
    }

    pub fn is_empty(&self) -> Result<bool, BTreeError> {
        Ok(self.root_page_id()? == INVALID_PAGE_ID)
    }

    /// Point lookup. Crabs down with read latches.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let Some(mut guard) = self.latch_root_read()? else {
            return Ok(None);
        };
        loop {
            match self.kind_of(&guard)? {
                NodeKind::Internal => {
                    let child = InternalNode::<_, K>::new(&guard).child_for_key(key);
                    let child_guard = self.read_guard(child)?;
                    guard = child_guard;
                }
                NodeKind::Leaf => {
                    let leaf = LeafNode::<_, K, TOMBS>::new(&guard);
                    let index = leaf.find_first_ge(key);
                    if index < leaf.size() && leaf.key_at(index) == *key {
                        return Ok(Some(leaf.rid_at(index)));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Unique-key insert. Returns `Ok(false)` on a duplicate.
    pub fn insert(&self, key: &K, rid: Rid) -> Result<bool, BTreeError> {
        match self.insert_optimistic(key, rid)? {
            Optimistic::Done(inserted) => Ok(inserted),
            Optimistic::Restart => self.insert_pessimistic(key, rid),
        }
    }

    /// Removes `key`; absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        match self.remove_optimistic(key)? {
            Optimistic::Done(()) => Ok(()),
            Optimistic::Restart => self.remove_pessimistic(key),
        }
    }

    /// Forward iterator over the whole tree in key order.
    pub fn iter(&self) -> Result<TreeIter<K, TOMBS>, BTreeError> {
        let Some(mut guard) = self.latch_root_read()? else {
            return Ok(TreeIter::end(Arc::clone(&self.pool)));
        };
        loop {
            match self.kind_of(&guard)? {
                NodeKind::Internal => {
                    let child = InternalNode::<_, K>::new(&guard).child_at(0);
                    let child_guard = self.read_guard(child)?;
                    guard = child_guard;
                }
                NodeKind::Leaf => {
                    return Ok(TreeIter::new(Arc::clone(&self.pool), guard.page_id(), 0));
                }
            }
        }
    }

    /// Forward iterator positioned at the first key `>= key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIter<K, TOMBS>, BTreeError> {
        let Some(mut guard) = self.latch_root_read()? else {
            return Ok(TreeIter::end(Arc::clone(&self.pool)));
        };
        loop {
            match self.kind_of(&guard)? {
                NodeKind::Internal => {
                    let child = InternalNode::<_, K>::new(&guard).child_for_key(key);
                    let child_guard = self.read_guard(child)?;
                    guard = child_guard;
                }
                NodeKind::Leaf => {
                    let leaf = LeafNode::<_, K, TOMBS>::new(&guard);
                    let slot = leaf.find_first_ge(key);
                    return Ok(TreeIter::new(
                        Arc::clone(&self.pool),
                        guard.page_id(),
                        slot,
                    ));
                }
            }
        }
    }

    fn read_guard(&self, page_id: PageId) -> Result<ReadPageGuard, BTreeError> {
        self.pool
            .checked_read_page(page_id)
            .ok_or(BTreeError::PoolExhausted)
    }

    fn write_guard(&self, page_id: PageId) -> Result<WritePageGuard, BTreeError> {
        self.pool
            .checked_write_page(page_id)
            .ok_or(BTreeError::PoolExhausted)
    }

    fn kind_of(&self, guard: &ReadPageGuard) -> Result<NodeKind, BTreeError> {
        node_kind(guard).ok_or(BTreeError::CorruptNode(guard.page_id()))
    }

    fn kind_of_mut(&self, guard: &WritePageGuard) -> Result<NodeKind, BTreeError> {
        node_kind(guard).ok_or(BTreeError::CorruptNode(guard.page_id()))
    }

    fn leaf_min(&self) -> usize {
        (self.leaf_max_size as usize + 1) / 2
    }

    fn internal_min(&self) -> usize {
        (self.internal_max_size as usize + 1) / 2
    }

    /// Read-latches the root while still holding a read guard on the header,
    /// so a concurrent root change cannot slip between the two. `None` for
    /// an empty tree.
    fn latch_root_read(&self) -> Result<Option<ReadPageGuard>, BTreeError> {
        let header = self.read_guard(self.header_page_id)?;
        let root = HeaderNode::new(&header).root_page_id();
        if root == INVALID_PAGE_ID {
            return Ok(None);
        }
        let guard = self.read_guard(root)?;
        drop(header);
        Ok(Some(guard))
    }

    /// Optimistic insert: read latches down to the leaf's parent, then a
    /// write latch on the leaf alone. Restarts pessimistically when the tree
    /// is empty, the root itself is a leaf, or the leaf is full.
    fn insert_optimistic(&self, key: &K, rid: Rid) -> Result<Optimistic<bool>, BTreeError> {
        let Some(mut parent) = self.latch_root_read()? else {
            return Ok(Optimistic::Restart);
        };
        if self.kind_of(&parent)? == NodeKind::Leaf {
            return Ok(Optimistic::Restart);
        }
        loop {
            let child_pid = InternalNode::<_, K>::new(&parent).child_for_key(key);
            let child = self.read_guard(child_pid)?;
            match self.kind_of(&child)? {
                NodeKind::Internal => parent = child,
                NodeKind::Leaf => {
                    // The parent read latch is still held, so this leaf
                    // cannot be split or merged while we upgrade.
                    drop(child);
                    let mut leaf_guard = self.write_guard(child_pid)?;
                    let mut leaf = LeafNode::<_, K, TOMBS>::new(&mut leaf_guard);
                    let index = leaf.find_first_ge(key);
                    if index < leaf.size() && leaf.key_at(index) == *key {
                        return Ok(Optimistic::Done(false));
                    }
                    if leaf.size() < self.leaf_max_size as usize {
                        leaf.insert_at(index, *key, rid);
                        return Ok(Optimistic::Done(true));
                    }
                    return Ok(Optimistic::Restart);
                }
            }
        }
    }

    /// Optimistic remove: like [`BPlusTree::insert_optimistic`], in place
    /// only when the leaf stays at or above its minimum.
    fn remove_optimistic(&self, key: &K) -> Result<Optimistic<()>, BTreeError> {
        let Some(mut parent) = self.latch_root_read()? else {
            // Empty tree: removing is a no-op.
            return Ok(Optimistic::Done(()));
        };
        if self.kind_of(&parent)? == NodeKind::Leaf {
            return Ok(Optimistic::Restart);
        }
        loop {
            let child_pid = InternalNode::<_, K>::new(&parent).child_for_key(key);
            let child = self.read_guard(child_pid)?;
            match self.kind_of(&child)? {
                NodeKind::Internal => parent = child,
                NodeKind::Leaf => {
                    drop(child);
                    let mut leaf_guard = self.write_guard(child_pid)?;
                    let mut leaf = LeafNode::<_, K, TOMBS>::new(&mut leaf_guard);
                    let index = leaf.find_first_ge(key);
                    if index >= leaf.size() || leaf.key_at(index) != *key {
                        return Ok(Optimistic::Done(()));
                    }
                    if leaf.size() > self.leaf_min() {
                        leaf.remove_at(index);
                        return Ok(Optimistic::Done(()));
                    }
                    return Ok(Optimistic::Restart);
                }
            }
        }
    }

    /// Pessimistic descent: pushes write guards onto `ctx.write_set` down to
    /// the leaf covering `key`, releasing the prefix whenever a node is safe
    /// according to `is_safe(kind, size, is_root)`.
    fn descend_pessimistic(
        &self,
        ctx: &mut Context,
        root: PageId,
        key: &K,
        is_safe: impl Fn(NodeKind, usize, bool) -> bool,
    ) -> Result<(), BTreeError> {
        let mut current = root;
        loop {
            let guard = self.write_guard(current)?;
            let kind = self.kind_of_mut(&guard)?;
            let is_root = current == root;
            let (size, next) = match kind {
                NodeKind::Leaf => (LeafNode::<_, K, TOMBS>::new(&guard).size(), None),
                NodeKind::Internal => {
                    let node = InternalNode::<_, K>::new(&guard);
                    (node.size(), Some(node.child_for_key(key)))
                }
            };
            if is_safe(kind, size, is_root) {
                ctx.release_prefix();
            }
            ctx.write_set.push_back(guard);
            match next {
                Some(child) => current = child,
                None => return Ok(()),
            }
        }
    }

    fn insert_pessimistic(&self, key: &K, rid: Rid) -> Result<bool, BTreeError> {
        let mut header_guard = self.write_guard(self.header_page_id)?;
        let root = HeaderNode::new(&header_guard).root_page_id();

        if root == INVALID_PAGE_ID {
            // First key: mint a leaf root.
            let root_pid = self.pool.new_page().ok_or(BTreeError::PoolExhausted)?;
            let Some(mut root_guard) = self.pool.checked_write_page(root_pid) else {
                self.pool.delete_page(root_pid);
                return Err(BTreeError::PoolExhausted);
            };
            let mut leaf = LeafNode::<_, K, TOMBS>::new(&mut root_guard);
            leaf.init(self.leaf_max_size);
            leaf.insert_at(0, *key, rid);
            HeaderNode::new(&mut header_guard).set_root_page_id(root_pid);
            return Ok(true);
        }

        let mut ctx = Context {
            header: Some(header_guard),
            write_set: VecDeque::new(),
        };
        let leaf_max = self.leaf_max_size as usize;
        let internal_max = self.internal_max_size as usize;
        self.descend_pessimistic(&mut ctx, root, key, |kind, size, _| match kind {
            NodeKind::Leaf => size < leaf_max,
            NodeKind::Internal => size < internal_max,
        })?;

        // Examine the leaf.
        let leaf_guard = ctx.write_set.back_mut().expect("descent reached a leaf");
        let mut leaf = LeafNode::<_, K, TOMBS>::new(&mut *leaf_guard);
        let index = leaf.find_first_ge(key);
        if index < leaf.size() && leaf.key_at(index) == *key {
            return Ok(false);
        }
        if leaf.size() < leaf_max {
            leaf.insert_at(index, *key, rid);
            return Ok(true);
        }

        // Split chain: every node left in the write set is full. With the
        // header still held the root splits too and needs one extra page.
        // Allocating everything up front means no failure can interrupt the
        // mutation halfway.
        let splitting = if ctx.header.is_some() {
            ctx.write_set.len()
        } else {
            ctx.write_set.len() - 1
        };
        let mut fresh = self.allocate_guarded(splitting + ctx.header.is_some() as usize)?;

        // Split the leaf, inserting the new entry in the same pass.
        let mut leaf_guard = ctx.write_set.pop_back().expect("descent reached a leaf");
        let mut left_pid = leaf_guard.page_id();
        let (right_pid, mut right_guard) = fresh.pop_front().expect("leaf split page");
        let mut separator;
        {
            let mut left = LeafNode::<_, K, TOMBS>::new(&mut leaf_guard);
            let mut right = LeafNode::<_, K, TOMBS>::new(&mut right_guard);
            right.init(self.leaf_max_size);
            separator = left.split_with(&mut right, index, *key, rid);
            right.set_next_page_id(left.next_page_id());
            left.set_next_page_id(right_pid);
        }
        drop(leaf_guard);
        drop(right_guard);
        let mut risen_child = right_pid;

        // Propagate the separator up the pinned ancestors.
        loop {
            match ctx.write_set.pop_back() {
                Some(mut parent_guard) => {
                    let parent_pid = parent_guard.page_id();
                    let mut parent = InternalNode::<_, K>::new(&mut parent_guard);
                    let at = parent
                        .index_of_child(left_pid)
                        .expect("split child under its parent")
                        + 1;
                    if parent.size() < internal_max {
                        parent.insert_at(at, separator, risen_child);
                        return Ok(true);
                    }
                    let (new_pid, mut new_guard) = fresh.pop_front().expect("split page");
                    let mut right = InternalNode::<_, K>::new(&mut new_guard);
                    right.init(self.internal_max_size);
                    separator = parent.split_with(&mut right, at, separator, risen_child);
                    risen_child = new_pid;
                    left_pid = parent_pid;
                }
                None => {
                    // The root itself split: mint a new internal root and
                    // point the header at it.
                    let (new_root_pid, mut new_root_guard) =
                        fresh.pop_front().expect("new root page");
                    let mut new_root = InternalNode::<_, K>::new(&mut new_root_guard);
                    new_root.init(self.internal_max_size);
                    new_root.init_root(left_pid, separator, risen_child);
                    let mut header_guard =
                        ctx.header.take().expect("unsafe root keeps the header");
                    HeaderNode::new(&mut header_guard).set_root_page_id(new_root_pid);
                    return Ok(true);
                }
            }
        }
    }

    /// Allocates `n` pages and write-latches them. On any failure every
    /// allocated page is deleted again, leaving no trace.
    fn allocate_guarded(
        &self,
        n: usize,
    ) -> Result<VecDeque<(PageId, WritePageGuard)>, BTreeError> {
        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            match self.pool.new_page() {
                Some(page_id) => pages.push(page_id),
                None => {
                    for page_id in pages {
                        self.pool.delete_page(page_id);
                    }
                    return Err(BTreeError::PoolExhausted);
                }
            }
        }
        let mut guards = VecDeque::with_capacity(n);
        for &page_id in &pages {
            match self.pool.checked_write_page(page_id) {
                Some(guard) => guards.push_back((page_id, guard)),
                None => {
                    drop(guards);
                    for page_id in pages {
                        self.pool.delete_page(page_id);
                    }
                    return Err(BTreeError::PoolExhausted);
                }
            }
        }
        Ok(guards)
    }

    fn remove_pessimistic(&self, key: &K) -> Result<(), BTreeError> {
        let header_guard = self.write_guard(self.header_page_id)?;
        let root = HeaderNode::new(&header_guard).root_page_id();
        if root == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut ctx = Context {
            header: Some(header_guard),
            write_set: VecDeque::new(),
        };
        let leaf_min = self.leaf_min();
        let internal_min = self.internal_min();
        self.descend_pessimistic(&mut ctx, root, key, |kind, size, is_root| match kind {
            // A root leaf may empty the tree; a root internal with two
            // children may demote. Anything else is safe above its minimum.
            NodeKind::Leaf if is_root => size > 1,
            NodeKind::Leaf => size > leaf_min,
            NodeKind::Internal if is_root => size > 2,
            NodeKind::Internal => size > internal_min,
        })?;

        // Locate the key in the leaf first; an absent key touches nothing.
        let index = {
            let leaf_guard = ctx.write_set.back().expect("descent reached a leaf");
            let leaf = LeafNode::<_, K, TOMBS>::new(leaf_guard);
            let index = leaf.find_first_ge(key);
            if index >= leaf.size() || leaf.key_at(index) != *key {
                return Ok(());
            }
            index
        };

        // A leaf alone in the write set is either the root or was safe, so
        // it absorbs the removal in place. Only a root leaf can empty, and
        // the header is still held whenever that can happen.
        if ctx.write_set.len() == 1 {
            let emptied = {
                let leaf_guard = ctx.write_set.back_mut().expect("descent reached a leaf");
                let mut leaf = LeafNode::<_, K, TOMBS>::new(&mut *leaf_guard);
                leaf.remove_at(index);
                leaf.size() == 0
            };
            if emptied {
                let mut header_guard =
                    ctx.header.take().expect("an emptying root keeps the header");
                HeaderNode::new(&mut header_guard).set_root_page_id(INVALID_PAGE_ID);
                let old_root = ctx.write_set.pop_back().expect("root leaf guard");
                let old_pid = old_root.page_id();
                drop(old_root);
                self.pool.delete_page(old_pid);
            }
            return Ok(());
        }

        // The leaf will underflow. Latch its siblings before mutating so a
        // pool failure cannot strand a half-rebalanced level.
        let mut cur_guard = ctx.write_set.pop_back().expect("descent reached a leaf");
        let cur_pid = cur_guard.page_id();
        let (cur_at, left_pid, right_pid) = self.sibling_info(&ctx, cur_pid)?;
        let mut left_guard = match left_pid {
            Some(pid) => Some(self.write_guard(pid)?),
            None => None,
        };
        let mut right_guard = match right_pid {
            Some(pid) => Some(self.write_guard(pid)?),
            None => None,
        };

        let mut cur = LeafNode::<_, K, TOMBS>::new(&mut cur_guard);
        cur.remove_at(index);

        // Prefer borrowing from a sibling that is strictly above minimum.
        if let Some(lg) = left_guard.as_mut() {
            let mut left = LeafNode::<_, K, TOMBS>::new(&mut *lg);
            if left.size() > leaf_min {
                let (k, v) = left.pop_back();
                cur.insert_at(0, k, v);
                let mut parent =
                    InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
                parent.set_key_at(cur_at, k);
                return Ok(());
            }
        }
        if let Some(rg) = right_guard.as_mut() {
            let mut right = LeafNode::<_, K, TOMBS>::new(&mut *rg);
            if right.size() > leaf_min {
                let (k, v) = right.pop_front();
                cur.push_back(k, v);
                let new_first = right.key_at(0);
                let mut parent =
                    InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
                parent.set_key_at(cur_at + 1, new_first);
                return Ok(());
            }
        }

        // No sibling can lend: merge, preferring the left sibling.
        let deleted_pid;
        if let Some(lg) = left_guard.as_mut() {
            let mut left = LeafNode::<_, K, TOMBS>::new(&mut *lg);
            left.absorb(&cur);
            let mut parent =
                InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
            parent.remove_at(cur_at);
            deleted_pid = cur_pid;
        } else {
            let rg = right_guard.as_mut().expect("a non-root leaf has a sibling");
            let right = LeafNode::<_, K, TOMBS>::new(&*rg);
            cur.absorb(&right);
            let mut parent =
                InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
            parent.remove_at(cur_at + 1);
            deleted_pid = rg.page_id();
        }
        drop(cur_guard);
        drop(left_guard);
        drop(right_guard);
        self.pool.delete_page(deleted_pid);

        self.propagate_underflow(&mut ctx)
    }

    /// Slot of `page_id` under its parent (the back of the write set) plus
    /// its immediate siblings' page ids.
    fn sibling_info(
        &self,
        ctx: &Context,
        page_id: PageId,
    ) -> Result<(usize, Option<PageId>, Option<PageId>), BTreeError> {
        let parent_guard = ctx.write_set.back().expect("parent held for underflow");
        let parent = InternalNode::<_, K>::new(parent_guard);
        let at = parent
            .index_of_child(page_id)
            .ok_or(BTreeError::CorruptNode(page_id))?;
        let left = (at > 0).then(|| parent.child_at(at - 1));
        let right = (at + 1 < parent.size()).then(|| parent.child_at(at + 1));
        Ok((at, left, right))
    }

    /// Walks the write set upward after a merge, rebalancing each internal
    /// node that fell below its minimum; demotes the root when it is left
    /// with a single child.
    fn propagate_underflow(&self, ctx: &mut Context) -> Result<(), BTreeError> {
        loop {
            let is_root = ctx.header.is_some() && ctx.write_set.len() == 1;
            let size = {
                let guard = ctx.write_set.back().expect("underflow has a current node");
                InternalNode::<_, K>::new(guard).size()
            };

            if is_root {
                if size == 1 {
                    // The root forwards to a single child: demote.
                    let new_root = {
                        let guard = ctx.write_set.back().expect("root guard");
                        InternalNode::<_, K>::new(guard).child_at(0)
                    };
                    let mut header_guard = ctx.header.take().expect("root keeps the header");
                    HeaderNode::new(&mut header_guard).set_root_page_id(new_root);
                    let old_root = ctx.write_set.pop_back().expect("root guard");
                    let old_pid = old_root.page_id();
                    drop(old_root);
                    self.pool.delete_page(old_pid);
                }
                return Ok(());
            }
            if size >= self.internal_min() {
                return Ok(());
            }

            let mut cur_guard = ctx.write_set.pop_back().expect("underflowed node");
            let cur_pid = cur_guard.page_id();
            let (cur_at, left_pid, right_pid) = self.sibling_info(ctx, cur_pid)?;
            // Rebalancing needs the siblings in memory. If the pool cannot
            // load one, the level is left under-full: every key stays
            // reachable, only the occupancy invariant is deferred.
            let mut left_guard = match left_pid {
                Some(pid) => match self.pool.checked_write_page(pid) {
                    Some(guard) => Some(guard),
                    None => {
                        error!("pool exhausted while rebalancing page {cur_pid}");
                        return Ok(());
                    }
                },
                None => None,
            };
            let mut right_guard = match right_pid {
                Some(pid) => match self.pool.checked_write_page(pid) {
                    Some(guard) => Some(guard),
                    None => {
                        error!("pool exhausted while rebalancing page {cur_pid}");
                        return Ok(());
                    }
                },
                None => None,
            };

            let mut cur = InternalNode::<_, K>::new(&mut cur_guard);

            if let Some(lg) = left_guard.as_mut() {
                let mut left = InternalNode::<_, K>::new(&mut *lg);
                if left.size() > self.internal_min() {
                    let (borrowed_key, borrowed_child) = left.pop_back();
                    let mut parent =
                        InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
                    let old_separator = parent.key_at(cur_at);
                    cur.push_front(borrowed_child, old_separator);
                    parent.set_key_at(cur_at, borrowed_key);
                    return Ok(());
                }
            }
            if let Some(rg) = right_guard.as_mut() {
                let mut right = InternalNode::<_, K>::new(&mut *rg);
                if right.size() > self.internal_min() {
                    let (borrowed_child, risen_key) = right.pop_front();
                    let mut parent =
                        InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
                    let old_separator = parent.key_at(cur_at + 1);
                    cur.push_back(old_separator, borrowed_child);
                    parent.set_key_at(cur_at + 1, risen_key);
                    return Ok(());
                }
            }

            let deleted_pid;
            if let Some(lg) = left_guard.as_mut() {
                let mut left = InternalNode::<_, K>::new(&mut *lg);
                let mut parent =
                    InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
                let separator = parent.key_at(cur_at);
                left.absorb(separator, &cur);
                parent.remove_at(cur_at);
                deleted_pid = cur_pid;
            } else {
                let rg = right_guard
                    .as_mut()
                    .expect("a non-root internal node has a sibling");
                let right = InternalNode::<_, K>::new(&*rg);
                let mut parent =
                    InternalNode::<_, K>::new(ctx.write_set.back_mut().expect("parent held"));
                let separator = parent.key_at(cur_at + 1);
                cur.absorb(separator, &right);
                parent.remove_at(cur_at + 1);
                deleted_pid = rg.page_id();
            }
            drop(cur_guard);
            drop(left_guard);
            drop(right_guard);
            self.pool.delete_page(deleted_pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::BTreeMap;
    use std::thread;

    use storage::config::PoolOptions;
    use storage::disk_manager::DiskManager;

    fn create_tree(
        leaf_max: u32,
        internal_max: u32,
        pool_frames: usize,
    ) -> (tempfile::TempDir, Arc<BPlusTree<i64>>) {
        let dir = tempfile::tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(dir.path().join("index.db")).unwrap());
        let options = PoolOptions::default().with_pool_frames(pool_frames);
        let pool = Arc::new(BufferPool::new(options, dm));
        let header = pool.new_page().unwrap();
        let tree = BPlusTree::<i64>::new(pool, header, leaf_max, internal_max).unwrap();
        (dir, Arc::new(tree))
    }

    fn rid(n: i64) -> Rid {
        Rid::new(n as u32, n as u32)
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let (_dir, tree) = create_tree(4, 3, 16);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.root_page_id().unwrap(), INVALID_PAGE_ID);
        assert_eq!(tree.get_value(&42).unwrap(), None);
        tree.remove(&42).unwrap();
        assert_eq!(tree.iter().unwrap().count(), 0);
    }

    /// Insert five keys through a root split, look them all up, then remove
    /// them until the tree collapses back to empty.
    #[test]
    fn insert_then_remove_round_trip() {
        let (_dir, tree) = create_tree(4, 3, 16);
        for key in 1..=5i64 {
            assert!(tree.insert(&key, rid(key)).unwrap());
        }
        assert!(!tree.is_empty().unwrap());
        for key in 1..=5i64 {
            assert_eq!(tree.get_value(&key).unwrap(), Some(rid(key)));
        }

        for key in [1i64, 5, 3, 4] {
            tree.remove(&key).unwrap();
        }
        assert_eq!(tree.get_value(&2).unwrap(), Some(rid(2)));
        for key in [1i64, 3, 4, 5] {
            assert_eq!(tree.get_value(&key).unwrap(), None);
        }

        tree.remove(&2).unwrap();
        assert_eq!(tree.root_page_id().unwrap(), INVALID_PAGE_ID);
        assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_dir, tree) = create_tree(4, 3, 16);
        assert!(tree.insert(&7, rid(7)).unwrap());
        assert!(!tree.insert(&7, Rid::new(99, 99)).unwrap());
        assert_eq!(tree.get_value(&7).unwrap(), Some(rid(7)));
    }

    #[test]
    fn removing_an_absent_key_is_idempotent() {
        let (_dir, tree) = create_tree(4, 3, 16);
        for key in [10i64, 20, 30] {
            tree.insert(&key, rid(key)).unwrap();
        }
        tree.remove(&15).unwrap();
        tree.remove(&20).unwrap();
        tree.remove(&20).unwrap();
        assert_eq!(tree.get_value(&10).unwrap(), Some(rid(10)));
        assert_eq!(tree.get_value(&20).unwrap(), None);
        assert_eq!(tree.get_value(&30).unwrap(), Some(rid(30)));
    }

    /// Scan 1..=25 with the forward iterator, from the start and from a
    /// midpoint lower bound.
    #[test]
    fn iterator_scans_in_key_order() {
        let (_dir, tree) = create_tree(4, 3, 32);
        for key in 1..=25i64 {
            assert!(tree.insert(&key, rid(key)).unwrap());
        }

        let scanned: Vec<i64> = tree.iter().unwrap().map(|(key, _)| key).collect();
        assert_eq!(scanned, (1..=25).collect::<Vec<_>>());

        let from_mid: Vec<i64> = tree.iter_from(&15).unwrap().map(|(key, _)| key).collect();
        assert_eq!(from_mid, (15..=25).collect::<Vec<_>>());

        // A lower bound between keys starts at the next larger key; past the
        // end the scan is empty.
        for key in (2..=24i64).step_by(2) {
            tree.remove(&key).unwrap();
        }
        let from_gap: Vec<i64> = tree.iter_from(&4).unwrap().map(|(key, _)| key).collect();
        assert_eq!(from_gap, (5..=25).step_by(2).collect::<Vec<_>>());
        assert_eq!(tree.iter_from(&26).unwrap().count(), 0);
    }

    /// Ascending removal drains through right-sibling borrows and merges.
    #[test]
    fn ascending_removal_collapses_the_tree() {
        let (_dir, tree) = create_tree(4, 3, 64);
        for key in 1..=100i64 {
            assert!(tree.insert(&key, rid(key)).unwrap());
        }
        for key in 1..=100i64 {
            tree.remove(&key).unwrap();
            assert_eq!(tree.get_value(&key).unwrap(), None);
            if key < 100 {
                assert_eq!(tree.get_value(&(key + 1)).unwrap(), Some(rid(key + 1)));
            }
        }
        assert!(tree.is_empty().unwrap());
    }

    /// Descending removal drains through left-sibling borrows and merges.
    #[test]
    fn descending_removal_collapses_the_tree() {
        let (_dir, tree) = create_tree(4, 3, 64);
        for key in 1..=100i64 {
            assert!(tree.insert(&key, rid(key)).unwrap());
        }
        for key in (1..=100i64).rev() {
            tree.remove(&key).unwrap();
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.iter().unwrap().count(), 0);
    }

    /// Random workload checked against an in-memory model, including the
    /// final full scan.
    #[test]
    fn random_workload_matches_a_model() {
        let (_dir, tree) = create_tree(6, 5, 64);
        let mut model = BTreeMap::new();
        let mut rng = rand::thread_rng();

        for _ in 0..2000 {
            let key = rng.gen_range(0..300i64);
            if rng.gen_bool(0.6) {
                let inserted = tree.insert(&key, rid(key)).unwrap();
                assert_eq!(inserted, model.insert(key, rid(key)).is_none());
            } else {
                tree.remove(&key).unwrap();
                model.remove(&key);
            }
        }

        for key in 0..300i64 {
            assert_eq!(tree.get_value(&key).unwrap(), model.get(&key).copied());
        }
        let scanned: Vec<i64> = tree.iter().unwrap().map(|(key, _)| key).collect();
        let expected: Vec<i64> = model.keys().copied().collect();
        assert_eq!(scanned, expected);
    }

    /// Writers on disjoint key ranges share the tree; latch coupling keeps
    /// every insert intact.
    #[test]
    fn concurrent_disjoint_inserts() {
        let (_dir, tree) = create_tree(8, 8, 64);

        let handles: Vec<_> = (0..4i64)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..100i64 {
                        let key = i * 4 + t;
                        assert!(tree.insert(&key, rid(key)).unwrap());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..400i64 {
            assert_eq!(tree.get_value(&key).unwrap(), Some(rid(key)));
        }
        let scanned: Vec<i64> = tree.iter().unwrap().map(|(key, _)| key).collect();
        assert_eq!(scanned, (0..400).collect::<Vec<_>>());
    }

    /// Readers scan while writers insert and remove in a disjoint range; the
    /// readers' own range stays stable throughout.
    #[test]
    fn readers_race_structure_changes() {
        let (_dir, tree) = create_tree(4, 4, 64);
        for key in 0..50i64 {
            tree.insert(&key, rid(key)).unwrap();
        }

        let writer = {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for round in 0..20i64 {
                    for key in 1000..1050i64 {
                        tree.insert(&(key + round * 100), rid(key)).unwrap();
                    }
                    for key in 1000..1050i64 {
                        tree.remove(&(key + round * 100)).unwrap();
                    }
                }
            })
        };

        for _ in 0..50 {
            for key in 0..50i64 {
                assert_eq!(tree.get_value(&key).unwrap(), Some(rid(key)));
            }
        }
        writer.join().unwrap();

        let low: Vec<i64> = tree.iter().unwrap().map(|(key, _)| key).take(50).collect();
        assert_eq!(low, (0..50).collect::<Vec<_>>());
    }
}
