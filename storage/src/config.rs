//! Shared identifier types and sizing knobs for the storage kernel.

/// Size of each page, in memory and on disk.
pub const PAGE_SIZE: usize = 4096; // 4 kB

/// Type representing a page worth of bytes, should be used instead of bare byte arrays.
pub type Page = [u8; PAGE_SIZE];

/// Type representing page id, should be used instead of bare `u32`.
pub type PageId = u32;

/// Index into the buffer pool's frame array, in `[0, pool_frames)`.
pub type FrameId = usize;

/// Sentinel for "no page". Never minted by the buffer pool.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Sizing knobs for the buffer pool and its disk scheduler.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of frames, the hard cap on resident pages.
    pub pool_frames: usize,
    /// Number of disk scheduler workers. Requests for one page always run on
    /// the same worker, so this is also the per-page serialization
    /// granularity.
    pub scheduler_workers: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            pool_frames: 64,
            scheduler_workers: 4,
        }
    }
}

impl PoolOptions {
    pub fn with_pool_frames(mut self, pool_frames: usize) -> Self {
        self.pool_frames = pool_frames;
        self
    }

    pub fn with_scheduler_workers(mut self, scheduler_workers: usize) -> Self {
        self.scheduler_workers = scheduler_workers;
        self
    }
}
