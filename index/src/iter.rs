//! Forward iterator over the B+-tree's leaf chain.

use std::marker::PhantomData;
use std::sync::Arc;

use log::warn;

use storage::buffer_pool::BufferPool;
use storage::config::{INVALID_PAGE_ID, PageId};

use crate::page::{IndexKey, LeafNode, NodeKind, Rid, node_kind};

/// Cursor over `(key, rid)` pairs in key order.
///
/// The cursor is only a `(page_id, slot)` pair; each step pins and
/// read-latches the current leaf for the duration of the call and crosses to
/// the right sibling through `next_page_id`. No latch is held between calls,
/// so concurrent structure changes may be observed mid-scan, as with any
/// latch-free cursor.
pub struct TreeIter<K: IndexKey, const TOMBS: usize = 0> {
    pool: Arc<BufferPool>,
    page_id: PageId,
    slot: usize,
    _key: PhantomData<K>,
}

impl<K: IndexKey, const TOMBS: usize> TreeIter<K, TOMBS> {
    pub(crate) fn new(pool: Arc<BufferPool>, page_id: PageId, slot: usize) -> Self {
        TreeIter {
            pool,
            page_id,
            slot,
            _key: PhantomData,
        }
    }

    /// The exhausted cursor.
    pub(crate) fn end(pool: Arc<BufferPool>) -> Self {
        Self::new(pool, INVALID_PAGE_ID, 0)
    }
}

impl<K: IndexKey, const TOMBS: usize> Iterator for TreeIter<K, TOMBS> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            if self.page_id == INVALID_PAGE_ID {
                return None;
            }
            let Some(guard) = self.pool.checked_read_page(self.page_id) else {
                warn!("buffer pool exhausted mid-scan at page {}", self.page_id);
                self.page_id = INVALID_PAGE_ID;
                return None;
            };
            if node_kind(&guard) != Some(NodeKind::Leaf) {
                // The leaf was recycled under the cursor; end the scan.
                self.page_id = INVALID_PAGE_ID;
                return None;
            }
            let leaf = LeafNode::<_, K, TOMBS>::new(&guard);
            if self.slot < leaf.size() {
                let entry = (leaf.key_at(self.slot), leaf.rid_at(self.slot));
                self.slot += 1;
                return Some(entry);
            }
            self.page_id = leaf.next_page_id();
            self.slot = 0;
        }
    }
}
