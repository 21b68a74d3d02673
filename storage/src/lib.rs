//! Storage kernel of a disk-oriented relational database: a fixed-size
//! buffer pool with a pluggable replacement policy, an ARC victim selector,
//! RAII page guards, and an asynchronous disk scheduler over a paged
//! database file.

pub mod buffer_pool;
pub mod config;
pub mod disk_manager;
pub mod disk_scheduler;
pub mod frame;
pub mod page_guard;
pub mod replacer;

pub use buffer_pool::BufferPool;
pub use config::{FrameId, INVALID_PAGE_ID, PAGE_SIZE, Page, PageId, PoolOptions};
pub use disk_manager::{DiskManager, DiskManagerError};
pub use disk_scheduler::{DiskRequest, DiskScheduler, DiskSchedulerError, RequestKind};
pub use page_guard::{PageRead, PageWrite, ReadPageGuard, WritePageGuard};
pub use replacer::{ArcReplacer, Replacer, ReplacerError};
