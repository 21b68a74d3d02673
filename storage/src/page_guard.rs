//! Page guards — RAII handles that pin and latch a buffer pool frame for the
//! duration of an access.
//!
//! The only way to reach page bytes is through a guard. The pool hands out
//! guards over frames it has pinned and marked non-evictable; dropping a
//! guard releases the latch, unpins, and at pin count zero hands the frame
//! back to the replacer. Every exit path releases the frame, because every
//! exit path runs `Drop`.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use log::error;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer_pool::PoolState;
use crate::config::{Page, PageId};
use crate::disk_scheduler::{DiskScheduler, DiskSchedulerError, RequestKind};
use crate::frame::FrameHeader;
use crate::replacer::Replacer;

/// Read access to a latched page's bytes.
pub trait PageRead {
    fn data(&self) -> &[u8];
}

/// Mutable access to a page's bytes under an exclusive latch.
pub trait PageWrite: PageRead {
    fn data_mut(&mut self) -> &mut [u8];
}

impl<T: PageRead> PageRead for &T {
    fn data(&self) -> &[u8] {
        (*self).data()
    }
}

impl<T: PageRead> PageRead for &mut T {
    fn data(&self) -> &[u8] {
        (**self).data()
    }
}

impl<T: PageWrite> PageWrite for &mut T {
    fn data_mut(&mut self) -> &mut [u8] {
        (**self).data_mut()
    }
}

/// Handles a guard needs to release itself: the pool latch to serialize the
/// evictable toggle, the replacer to toggle it, and the scheduler to flush.
pub(crate) struct GuardPlumbing {
    pub(crate) pool_latch: Arc<Mutex<PoolState>>,
    pub(crate) replacer: Arc<dyn Replacer>,
    pub(crate) scheduler: Arc<DiskScheduler>,
}

impl GuardPlumbing {
    /// The shared tail of both guards' `Drop`: run after the frame latch is
    /// released, never before, so no path holds a frame latch while taking
    /// the pool latch.
    fn release(&self, frame: &FrameHeader) {
        if frame.unpin() == 0 {
            let _pool = self.pool_latch.lock();
            if let Err(e) = self.replacer.set_evictable(frame.frame_id(), true) {
                error!(
                    "failed to mark frame {} evictable on guard drop: {e}",
                    frame.frame_id()
                );
            }
        }
    }

    fn flush(&self, page_id: PageId, bytes: &Page, frame: &FrameHeader) -> Result<(), DiskSchedulerError> {
        self.scheduler
            .run_to_completion(RequestKind::Write, page_id, Box::new(*bytes))?;
        frame.set_dirty(false);
        Ok(())
    }
}

/// A RAII object granting shared read access to one page's data.
///
/// Any number of `ReadPageGuard`s may exist for a page at once; while any of
/// them lives, no thread can mutate the page.
pub struct ReadPageGuard {
    page_id: PageId,
    /// The latched page bytes. Dropped first in `Drop`; the `'static`
    /// lifetime is backed by the `Arc<FrameHeader>` stored below it.
    guard: ManuallyDrop<RwLockReadGuard<'static, Box<Page>>>,
    frame: Arc<FrameHeader>,
    plumbing: GuardPlumbing,
}

impl ReadPageGuard {
    /// Wraps an already-pinned, non-evictable frame whose latch the pool
    /// acquired on the caller's behalf.
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        guard: RwLockReadGuard<'_, Box<Page>>,
        plumbing: GuardPlumbing,
    ) -> Self {
        // SAFETY: the guard borrows the lock inside `frame`. Extending it to
        // 'static is sound because `Drop` releases it before the owning
        // `Arc<FrameHeader>` held next to it can go away.
        let guard: RwLockReadGuard<'static, Box<Page>> = unsafe {
            std::mem::transmute::<RwLockReadGuard<'_, Box<Page>>, RwLockReadGuard<'static, Box<Page>>>(
                guard,
            )
        };
        ReadPageGuard {
            page_id,
            guard: ManuallyDrop::new(guard),
            frame,
            plumbing,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        let page: &Page = &self.guard;
        page.as_slice()
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Writes the page through the scheduler and clears the dirty flag on
    /// success. The read latch held by this guard keeps the bytes stable.
    pub fn flush(&self) -> Result<(), DiskSchedulerError> {
        let page: &Page = &self.guard;
        self.plumbing.flush(self.page_id, page, &self.frame)
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // SAFETY: `guard` is dropped exactly once, here, and never touched
        // again; `frame` is still alive at this point.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.plumbing.release(&self.frame);
    }
}

impl PageRead for ReadPageGuard {
    fn data(&self) -> &[u8] {
        ReadPageGuard::data(self)
    }
}

/// A RAII object granting exclusive mutable access to one page's data.
///
/// While a `WritePageGuard` lives, no other guard of either kind exists for
/// the page. Mutable access sets the frame's dirty flag.
pub struct WritePageGuard {
    page_id: PageId,
    /// The latched page bytes. Dropped first in `Drop`; the `'static`
    /// lifetime is backed by the `Arc<FrameHeader>` stored below it.
    guard: ManuallyDrop<RwLockWriteGuard<'static, Box<Page>>>,
    frame: Arc<FrameHeader>,
    plumbing: GuardPlumbing,
}

impl WritePageGuard {
    /// Wraps an already-pinned, non-evictable frame whose latch the pool
    /// acquired on the caller's behalf.
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        guard: RwLockWriteGuard<'_, Box<Page>>,
        plumbing: GuardPlumbing,
    ) -> Self {
        // SAFETY: as for `ReadPageGuard::new`.
        let guard: RwLockWriteGuard<'static, Box<Page>> = unsafe {
            std::mem::transmute::<
                RwLockWriteGuard<'_, Box<Page>>,
                RwLockWriteGuard<'static, Box<Page>>,
            >(guard)
        };
        WritePageGuard {
            page_id,
            guard: ManuallyDrop::new(guard),
            frame,
            plumbing,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        let page: &Page = &self.guard;
        page.as_slice()
    }

    /// Mutable view of the page bytes. Marks the frame dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.frame.set_dirty(true);
        let page: &mut Page = &mut self.guard;
        page.as_mut_slice()
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Writes the page through the scheduler and clears the dirty flag on
    /// success.
    pub fn flush(&self) -> Result<(), DiskSchedulerError> {
        let page: &Page = &self.guard;
        self.plumbing.flush(self.page_id, page, &self.frame)
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // SAFETY: as for `ReadPageGuard::drop`.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.plumbing.release(&self.frame);
    }
}

impl PageRead for WritePageGuard {
    fn data(&self) -> &[u8] {
        WritePageGuard::data(self)
    }
}

impl PageWrite for WritePageGuard {
    fn data_mut(&mut self) -> &mut [u8] {
        WritePageGuard::data_mut(self)
    }
}
