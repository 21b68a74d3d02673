//! On-page layouts for the B+-tree: the header page holding the root
//! pointer, internal pages with separator keys and child pointers, and leaf
//! pages with sorted key/RID pairs, a right-sibling link and a fixed
//! tombstone buffer.
//!
//! Every layout fits in one page. Scalars and slots are accessed with
//! unaligned pod reads and writes, so the underlying buffer carries no
//! alignment contract. The node types are views over any [`PageRead`] /
//! [`PageWrite`] handle; callers hold the page latched while a view exists.

use std::fmt::Debug;
use std::marker::PhantomData;

use bytemuck::{Pod, Zeroable};

use storage::config::{PAGE_SIZE, PageId};
use storage::page_guard::{PageRead, PageWrite};

/// Keys stored in the tree: plain-old-data with a total order.
pub trait IndexKey: Pod + Ord + Debug {}
impl<T: Pod + Ord + Debug> IndexKey for T {}

/// Record identifier stored in leaf slots: the heap page and slot a tuple
/// lives in.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Rid { page_id, slot }
    }
}

/// Common node header: kind, current size, max size. 12 bytes.
const KIND_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 4;
const MAX_SIZE_OFFSET: usize = 8;
pub(crate) const COMMON_HEADER_SIZE: usize = 12;

const KIND_LEAF: u32 = 1;
const KIND_INTERNAL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Leaf,
    Internal,
}

/// Kind of the node stored in a latched page, `None` for anything that is
/// not an initialized tree node.
pub(crate) fn node_kind(page: &impl PageRead) -> Option<NodeKind> {
    match read_pod::<u32>(page.data(), KIND_OFFSET) {
        KIND_LEAF => Some(NodeKind::Leaf),
        KIND_INTERNAL => Some(NodeKind::Internal),
        _ => None,
    }
}

/// Largest number of key/RID pairs a leaf with `tombs` tombstone slots can
/// hold for key type `K`.
pub fn leaf_capacity<K: IndexKey>(tombs: usize) -> usize {
    (PAGE_SIZE - LEAF_TOMB_ARRAY_OFFSET - tombs * size_of::<u32>())
        / (size_of::<K>() + size_of::<Rid>())
}

/// Largest number of children an internal page can hold for key type `K`.
pub fn internal_capacity<K: IndexKey>() -> usize {
    (PAGE_SIZE - COMMON_HEADER_SIZE) / (size_of::<K>() + size_of::<PageId>())
}

fn read_pod<T: Pod>(data: &[u8], offset: usize) -> T {
    bytemuck::pod_read_unaligned(&data[offset..offset + size_of::<T>()])
}

fn write_pod<T: Pod>(data: &mut [u8], offset: usize, value: &T) {
    data[offset..offset + size_of::<T>()].copy_from_slice(bytemuck::bytes_of(value));
}

/// View of the tree's header page, which carries only the root page id.
pub(crate) struct HeaderNode<P> {
    page: P,
}

impl<P: PageRead> HeaderNode<P> {
    pub(crate) fn new(page: P) -> Self {
        HeaderNode { page }
    }

    pub(crate) fn root_page_id(&self) -> PageId {
        read_pod(self.page.data(), 0)
    }
}

impl<P: PageWrite> HeaderNode<P> {
    pub(crate) fn set_root_page_id(&mut self, root: PageId) {
        write_pod(self.page.data_mut(), 0, &root);
    }
}

/// View of a leaf page.
///
/// Layout after the common header: `next_page_id` (4), tombstone count (4),
/// `TOMBS` tombstone slots (4 each), then the key array and the RID array,
/// each sized to the page-derived slot capacity.
///
/// Keys are strictly ascending. A non-root leaf keeps its size in
/// `[(max+1)/2, max]`. The tombstone buffer records indices of logically
/// deleted slots; it is a reserved capability that no tree operation
/// consults.
pub(crate) struct LeafNode<P, K, const TOMBS: usize> {
    page: P,
    _key: PhantomData<K>,
}

const LEAF_NEXT_OFFSET: usize = COMMON_HEADER_SIZE;
const LEAF_TOMB_COUNT_OFFSET: usize = LEAF_NEXT_OFFSET + 4;
const LEAF_TOMB_ARRAY_OFFSET: usize = LEAF_TOMB_COUNT_OFFSET + 4;

impl<P: PageRead, K: IndexKey, const TOMBS: usize> LeafNode<P, K, TOMBS> {
    pub(crate) fn new(page: P) -> Self {
        LeafNode {
            page,
            _key: PhantomData,
        }
    }

    fn keys_offset() -> usize {
        LEAF_TOMB_ARRAY_OFFSET + TOMBS * size_of::<u32>()
    }

    fn key_offset(index: usize) -> usize {
        Self::keys_offset() + index * size_of::<K>()
    }

    fn rid_offset(index: usize) -> usize {
        Self::keys_offset()
            + leaf_capacity::<K>(TOMBS) * size_of::<K>()
            + index * size_of::<Rid>()
    }

    pub(crate) fn size(&self) -> usize {
        read_pod::<u32>(self.page.data(), SIZE_OFFSET) as usize
    }

    pub(crate) fn max_size(&self) -> usize {
        read_pod::<u32>(self.page.data(), MAX_SIZE_OFFSET) as usize
    }

    /// Smallest legal size for a non-root leaf: half full, rounded up.
    pub(crate) fn min_size(&self) -> usize {
        (self.max_size() + 1) / 2
    }

    pub(crate) fn next_page_id(&self) -> PageId {
        read_pod(self.page.data(), LEAF_NEXT_OFFSET)
    }

    pub(crate) fn key_at(&self, index: usize) -> K {
        debug_assert!(index < self.size());
        read_pod(self.page.data(), Self::key_offset(index))
    }

    pub(crate) fn rid_at(&self, index: usize) -> Rid {
        debug_assert!(index < self.size());
        read_pod(self.page.data(), Self::rid_offset(index))
    }

    /// Index of the first key `>= key`, or `size()` when all keys are
    /// smaller.
    pub(crate) fn find_first_ge(&self, key: &K) -> usize {
        let mut lo = 0;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub(crate) fn entries(&self) -> Vec<(K, Rid)> {
        (0..self.size())
            .map(|i| (self.key_at(i), self.rid_at(i)))
            .collect()
    }

    pub(crate) fn tombstone_count(&self) -> usize {
        read_pod::<u32>(self.page.data(), LEAF_TOMB_COUNT_OFFSET) as usize
    }

    pub(crate) fn tombstone_at(&self, index: usize) -> u32 {
        debug_assert!(index < self.tombstone_count());
        read_pod(
            self.page.data(),
            LEAF_TOMB_ARRAY_OFFSET + index * size_of::<u32>(),
        )
    }
}

impl<P: PageWrite, K: IndexKey, const TOMBS: usize> LeafNode<P, K, TOMBS> {
    pub(crate) fn init(&mut self, max_size: u32) {
        debug_assert!(max_size as usize <= leaf_capacity::<K>(TOMBS));
        let data = self.page.data_mut();
        write_pod(data, KIND_OFFSET, &KIND_LEAF);
        write_pod(data, SIZE_OFFSET, &0u32);
        write_pod(data, MAX_SIZE_OFFSET, &max_size);
        write_pod(data, LEAF_NEXT_OFFSET, &storage::config::INVALID_PAGE_ID);
        write_pod(data, LEAF_TOMB_COUNT_OFFSET, &0u32);
    }

    fn set_size(&mut self, size: usize) {
        write_pod(self.page.data_mut(), SIZE_OFFSET, &(size as u32));
    }

    pub(crate) fn set_next_page_id(&mut self, next: PageId) {
        write_pod(self.page.data_mut(), LEAF_NEXT_OFFSET, &next);
    }

    /// Inserts at `index`, shifting later slots right. The caller keeps the
    /// keys sorted by inserting at `find_first_ge`.
    pub(crate) fn insert_at(&mut self, index: usize, key: K, rid: Rid) {
        let size = self.size();
        debug_assert!(index <= size && size < self.max_size());
        let key_size = size_of::<K>();
        let rid_size = size_of::<Rid>();
        let data = self.page.data_mut();
        let key_start = Self::key_offset(index);
        data.copy_within(key_start..Self::key_offset(size), key_start + key_size);
        let rid_start = Self::rid_offset(index);
        data.copy_within(rid_start..Self::rid_offset(size), rid_start + rid_size);
        write_pod(data, key_start, &key);
        write_pod(data, rid_start, &rid);
        self.set_size(size + 1);
    }

    /// Removes the slot at `index`, shifting later slots left.
    pub(crate) fn remove_at(&mut self, index: usize) {
        let size = self.size();
        debug_assert!(index < size);
        let data = self.page.data_mut();
        data.copy_within(
            Self::key_offset(index + 1)..Self::key_offset(size),
            Self::key_offset(index),
        );
        data.copy_within(
            Self::rid_offset(index + 1)..Self::rid_offset(size),
            Self::rid_offset(index),
        );
        self.set_size(size - 1);
    }

    pub(crate) fn push_back(&mut self, key: K, rid: Rid) {
        self.insert_at(self.size(), key, rid);
    }

    pub(crate) fn pop_back(&mut self) -> (K, Rid) {
        let last = self.size() - 1;
        let entry = (self.key_at(last), self.rid_at(last));
        self.remove_at(last);
        entry
    }

    pub(crate) fn pop_front(&mut self) -> (K, Rid) {
        let entry = (self.key_at(0), self.rid_at(0));
        self.remove_at(0);
        entry
    }

    fn replace_entries(&mut self, entries: &[(K, Rid)]) {
        for (i, (key, rid)) in entries.iter().enumerate() {
            write_pod(self.page.data_mut(), Self::key_offset(i), key);
            write_pod(self.page.data_mut(), Self::rid_offset(i), rid);
        }
        self.set_size(entries.len());
    }

    /// Splits this full leaf while inserting `(key, rid)` at `index`: the
    /// merged sorted list of old entries plus the new one is cut at
    /// `(n + 1) / 2`, the left half stays here, the right half fills
    /// `right`. Returns the separator, the first key of the right page.
    /// The caller relinks `next_page_id` on both pages.
    pub(crate) fn split_with<Q: PageWrite>(
        &mut self,
        right: &mut LeafNode<Q, K, TOMBS>,
        index: usize,
        key: K,
        rid: Rid,
    ) -> K {
        let mut all = self.entries();
        all.insert(index, (key, rid));
        let split = (all.len() + 1) / 2;
        let separator = all[split].0;
        self.replace_entries(&all[..split]);
        right.replace_entries(&all[split..]);
        separator
    }

    /// Appends every entry of `other` (the right sibling being merged away)
    /// and takes over its sibling link.
    pub(crate) fn absorb<Q: PageRead>(&mut self, other: &LeafNode<Q, K, TOMBS>) {
        for (key, rid) in other.entries() {
            self.push_back(key, rid);
        }
        self.set_next_page_id(other.next_page_id());
    }

    /// Records a logical deletion of slot `index`. Returns `false` when the
    /// tombstone buffer is full.
    pub(crate) fn push_tombstone(&mut self, index: u32) -> bool {
        let count = self.tombstone_count();
        if count >= TOMBS {
            return false;
        }
        let data = self.page.data_mut();
        write_pod(
            data,
            LEAF_TOMB_ARRAY_OFFSET + count * size_of::<u32>(),
            &index,
        );
        write_pod(data, LEAF_TOMB_COUNT_OFFSET, &((count + 1) as u32));
        true
    }

    pub(crate) fn clear_tombstones(&mut self) {
        write_pod(self.page.data_mut(), LEAF_TOMB_COUNT_OFFSET, &0u32);
    }
}

/// View of an internal page.
///
/// Layout after the common header: the key array, then the child page-id
/// array, each sized to the page-derived slot capacity. `size` counts
/// children; slot 0 carries no valid key, and keys at `1..size` are strictly
/// ascending. The child at slot 0 covers keys below `key(1)`; the child at
/// slot `i` covers `[key(i), key(i + 1))`.
pub(crate) struct InternalNode<P, K> {
    page: P,
    _key: PhantomData<K>,
}

impl<P: PageRead, K: IndexKey> InternalNode<P, K> {
    pub(crate) fn new(page: P) -> Self {
        InternalNode {
            page,
            _key: PhantomData,
        }
    }

    fn key_offset(index: usize) -> usize {
        COMMON_HEADER_SIZE + index * size_of::<K>()
    }

    fn child_offset(index: usize) -> usize {
        COMMON_HEADER_SIZE
            + internal_capacity::<K>() * size_of::<K>()
            + index * size_of::<PageId>()
    }

    /// Number of children. The number of valid separator keys is one less.
    pub(crate) fn size(&self) -> usize {
        read_pod::<u32>(self.page.data(), SIZE_OFFSET) as usize
    }

    pub(crate) fn max_size(&self) -> usize {
        read_pod::<u32>(self.page.data(), MAX_SIZE_OFFSET) as usize
    }

    /// Smallest legal child count for a non-root internal page.
    pub(crate) fn min_size(&self) -> usize {
        (self.max_size() + 1) / 2
    }

    pub(crate) fn key_at(&self, index: usize) -> K {
        debug_assert!(index >= 1 && index < self.size());
        read_pod(self.page.data(), Self::key_offset(index))
    }

    pub(crate) fn child_at(&self, index: usize) -> PageId {
        debug_assert!(index < self.size());
        read_pod(self.page.data(), Self::child_offset(index))
    }

    /// Index of the child whose subtree covers `key`.
    pub(crate) fn child_index_for_key(&self, key: &K) -> usize {
        let mut lo = 1;
        let mut hi = self.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo - 1
    }

    pub(crate) fn child_for_key(&self, key: &K) -> PageId {
        self.child_at(self.child_index_for_key(key))
    }

    /// Slot of a specific child pointer, `None` when `page_id` is not a
    /// child of this node.
    pub(crate) fn index_of_child(&self, page_id: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.child_at(i) == page_id)
    }

    fn pairs(&self) -> Vec<(K, PageId)> {
        (0..self.size())
            .map(|i| {
                let key = if i == 0 {
                    K::zeroed()
                } else {
                    self.key_at(i)
                };
                (key, self.child_at(i))
            })
            .collect()
    }
}

impl<P: PageWrite, K: IndexKey> InternalNode<P, K> {
    pub(crate) fn init(&mut self, max_size: u32) {
        debug_assert!(max_size as usize <= internal_capacity::<K>());
        let data = self.page.data_mut();
        write_pod(data, KIND_OFFSET, &KIND_INTERNAL);
        write_pod(data, SIZE_OFFSET, &0u32);
        write_pod(data, MAX_SIZE_OFFSET, &max_size);
    }

    fn set_size(&mut self, size: usize) {
        write_pod(self.page.data_mut(), SIZE_OFFSET, &(size as u32));
    }

    pub(crate) fn set_key_at(&mut self, index: usize, key: K) {
        debug_assert!(index >= 1 && index < self.size());
        write_pod(self.page.data_mut(), Self::key_offset(index), &key);
    }

    fn set_child_at(&mut self, index: usize, child: PageId) {
        write_pod(self.page.data_mut(), Self::child_offset(index), &child);
    }

    /// Makes this node a fresh root with two children separated by `key`.
    pub(crate) fn init_root(&mut self, left: PageId, key: K, right: PageId) {
        self.set_size(2);
        self.set_child_at(0, left);
        self.set_child_at(1, right);
        self.set_key_at(1, key);
    }

    /// Inserts separator `key` and pointer `child` at slot `index >= 1`,
    /// shifting later slots right.
    pub(crate) fn insert_at(&mut self, index: usize, key: K, child: PageId) {
        let size = self.size();
        debug_assert!((1..=size).contains(&index) && size < self.max_size());
        let key_size = size_of::<K>();
        let child_size = size_of::<PageId>();
        let data = self.page.data_mut();
        let key_start = Self::key_offset(index);
        data.copy_within(key_start..Self::key_offset(size), key_start + key_size);
        let child_start = Self::child_offset(index);
        data.copy_within(
            child_start..Self::child_offset(size),
            child_start + child_size,
        );
        write_pod(data, key_start, &key);
        write_pod(data, child_start, &child);
        self.set_size(size + 1);
    }

    /// Removes separator `key(index)` and pointer `child(index)` for
    /// `index >= 1`, shifting later slots left.
    pub(crate) fn remove_at(&mut self, index: usize) {
        let size = self.size();
        debug_assert!(index >= 1 && index < size);
        let data = self.page.data_mut();
        data.copy_within(
            Self::key_offset(index + 1)..Self::key_offset(size),
            Self::key_offset(index),
        );
        data.copy_within(
            Self::child_offset(index + 1)..Self::child_offset(size),
            Self::child_offset(index),
        );
        self.set_size(size - 1);
    }

    /// Prepends `child` as the new leftmost pointer; `key` becomes the
    /// separator in front of the old leftmost child.
    pub(crate) fn push_front(&mut self, child: PageId, key: K) {
        let size = self.size();
        debug_assert!(size < self.max_size());
        let key_size = size_of::<K>();
        let child_size = size_of::<PageId>();
        let data = self.page.data_mut();
        data.copy_within(
            Self::key_offset(1)..Self::key_offset(size),
            Self::key_offset(1) + key_size,
        );
        data.copy_within(
            Self::child_offset(0)..Self::child_offset(size),
            Self::child_offset(0) + child_size,
        );
        write_pod(data, Self::key_offset(1), &key);
        write_pod(data, Self::child_offset(0), &child);
        self.set_size(size + 1);
    }

    /// Removes the leftmost pointer, returning it together with the
    /// separator that stood after it.
    pub(crate) fn pop_front(&mut self) -> (PageId, K) {
        let size = self.size();
        let child = self.child_at(0);
        let key = self.key_at(1);
        let data = self.page.data_mut();
        data.copy_within(
            Self::key_offset(2)..Self::key_offset(size),
            Self::key_offset(1),
        );
        data.copy_within(
            Self::child_offset(1)..Self::child_offset(size),
            Self::child_offset(0),
        );
        self.set_size(size - 1);
        (child, key)
    }

    /// Removes the rightmost separator/pointer pair.
    pub(crate) fn pop_back(&mut self) -> (K, PageId) {
        let last = self.size() - 1;
        let entry = (self.key_at(last), self.child_at(last));
        self.set_size(last);
        entry
    }

    pub(crate) fn push_back(&mut self, key: K, child: PageId) {
        let size = self.size();
        debug_assert!(size < self.max_size());
        write_pod(self.page.data_mut(), Self::key_offset(size), &key);
        self.set_child_at(size, child);
        self.set_size(size + 1);
    }

    fn replace_pairs(&mut self, pairs: &[(K, PageId)]) {
        for (i, (key, child)) in pairs.iter().enumerate() {
            write_pod(self.page.data_mut(), Self::key_offset(i), key);
            write_pod(self.page.data_mut(), Self::child_offset(i), child);
        }
        self.set_size(pairs.len());
    }

    /// Splits this full node while inserting `(key, child)` at `index`. The
    /// merged child list is cut at `(n + 1) / 2`; the entry at the cut moves
    /// up as the returned separator and its child becomes the leftmost
    /// pointer of `right`.
    pub(crate) fn split_with<Q: PageWrite>(
        &mut self,
        right: &mut InternalNode<Q, K>,
        index: usize,
        key: K,
        child: PageId,
    ) -> K {
        let mut all = self.pairs();
        all.insert(index, (key, child));
        let split = (all.len() + 1) / 2;
        let separator = all[split].0;
        self.replace_pairs(&all[..split]);
        right.replace_pairs(&all[split..]);
        separator
    }

    /// Merges the right sibling into this node: `separator` (pulled from the
    /// parent) rejoins the two child sequences.
    pub(crate) fn absorb<Q: PageRead>(&mut self, separator: K, other: &InternalNode<Q, K>) {
        self.push_back(separator, other.child_at(0));
        for i in 1..other.size() {
            self.push_back(other.key_at(i), other.child_at(i));
        }
    }
}
