//! Concurrent B+-tree index built on the storage kernel: byte-level page
//! layouts, crabbing-style latch coupling for point lookup, insert and
//! delete, and a forward range iterator over the leaf chain.

pub mod btree;
pub mod iter;
pub mod page;

pub use btree::{BPlusTree, BTreeError};
pub use iter::TreeIter;
pub use page::{IndexKey, Rid, internal_capacity, leaf_capacity};
