//! DiskScheduler module — a bounded worker pool that executes page I/O,
//! serializing requests per page while distinct pages run in parallel.

use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use log::{error, info};
use thiserror::Error;

use crate::config::{Page, PageId};
use crate::disk_manager::{DiskManager, DiskManagerError};

/// Error observed while waiting on a request completion.
#[derive(Debug, Error)]
pub enum DiskSchedulerError {
    #[error("disk i/o failed: {0}")]
    Io(#[from] DiskManagerError),
    #[error("scheduler shut down before the request completed")]
    ShutDown,
}

/// Whether a request moves bytes from disk into the buffer or the other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Sending half of a request completion. Reads resolve to the filled buffer;
/// writes hand the buffer back untouched.
pub type Promise = channel::Sender<Result<Box<Page>, DiskManagerError>>;
/// Receiving half of a request completion.
pub type Future = channel::Receiver<Result<Box<Page>, DiskManagerError>>;

/// A single read or write to be executed by a scheduler worker.
pub struct DiskRequest {
    pub kind: RequestKind,
    pub page_id: PageId,
    /// For writes, the bytes to persist; for reads, the buffer to fill.
    pub data: Box<Page>,
    pub completion: Promise,
}

/// Schedules reads and writes against the [`DiskManager`].
///
/// Each worker owns one FIFO queue, and a request lands on the queue
/// `page_id % workers`. All outstanding I/O for a single page therefore
/// executes in submission order, while different pages proceed concurrently.
/// Submission never blocks; callers wait on the per-request completion when
/// they need the result.
///
/// Dropping the scheduler sends a sentinel down every queue and joins the
/// workers, draining whatever was already submitted.
pub struct DiskScheduler {
    disk_manager: Arc<DiskManager>,
    queues: Vec<channel::Sender<Option<DiskRequest>>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>, num_workers: usize) -> Self {
        assert!(num_workers > 0, "disk scheduler needs at least one worker");
        let mut queues = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (tx, rx) = channel::unbounded();
            let dm = Arc::clone(&disk_manager);
            queues.push(tx);
            workers.push(thread::spawn(move || Self::run_worker(worker_id, dm, rx)));
        }
        DiskScheduler {
            disk_manager,
            queues,
            workers,
        }
    }

    /// Submits a batch of requests. Routing is by `page_id % workers`, which
    /// pins every request for one page to the same queue.
    pub fn schedule(&self, requests: Vec<DiskRequest>) {
        for request in requests {
            let queue = request.page_id as usize % self.queues.len();
            if self.queues[queue].send(Some(request)).is_err() {
                error!("disk scheduler queue {queue} is closed, dropping request");
            }
        }
    }

    /// Creates a completion pair for a single request.
    pub fn create_promise() -> (Promise, Future) {
        channel::bounded(1)
    }

    /// Reclaims the page's slot in the database file.
    pub fn deallocate_page(&self, page_id: PageId) {
        self.disk_manager.delete_page(page_id);
    }

    /// Submits one request and blocks on its completion.
    pub(crate) fn run_to_completion(
        &self,
        kind: RequestKind,
        page_id: PageId,
        data: Box<Page>,
    ) -> Result<Box<Page>, DiskSchedulerError> {
        let (promise, future) = Self::create_promise();
        self.schedule(vec![DiskRequest {
            kind,
            page_id,
            data,
            completion: promise,
        }]);
        match future.recv() {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(DiskSchedulerError::Io(e)),
            Err(_) => Err(DiskSchedulerError::ShutDown),
        }
    }

    fn run_worker(
        worker_id: usize,
        disk_manager: Arc<DiskManager>,
        queue: channel::Receiver<Option<DiskRequest>>,
    ) {
        info!("disk scheduler worker {worker_id} started");
        while let Ok(Some(request)) = queue.recv() {
            let DiskRequest {
                kind,
                page_id,
                mut data,
                completion,
            } = request;
            let io_result = match kind {
                RequestKind::Read => disk_manager.read_page(page_id, &mut data),
                RequestKind::Write => disk_manager.write_page(page_id, &data),
            };
            if completion.send(io_result.map(|()| data)).is_err() {
                // The requester gave up on the completion; nothing to signal.
            }
        }
        info!("disk scheduler worker {worker_id} shutting down");
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        for queue in &self.queues {
            let _ = queue.send(None);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("disk scheduler worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;

    fn create_scheduler(workers: usize) -> (tempfile::TempDir, DiskScheduler) {
        let dir = tempfile::tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(dir.path().join("test.db")).unwrap());
        (dir, DiskScheduler::new(dm, workers))
    }

    fn page_filled(byte: u8) -> Box<Page> {
        Box::new([byte; PAGE_SIZE])
    }

    #[test]
    fn schedule_write_then_read() {
        let (_dir, scheduler) = create_scheduler(4);

        let (write_promise, write_future) = DiskScheduler::create_promise();
        let (read_promise, read_future) = DiskScheduler::create_promise();
        scheduler.schedule(vec![DiskRequest {
            kind: RequestKind::Write,
            page_id: 7,
            data: page_filled(0x5A),
            completion: write_promise,
        }]);
        assert!(write_future.recv().unwrap().is_ok());

        scheduler.schedule(vec![DiskRequest {
            kind: RequestKind::Read,
            page_id: 7,
            data: page_filled(0),
            completion: read_promise,
        }]);
        let read = read_future.recv().unwrap().unwrap();
        assert_eq!(*read, [0x5A; PAGE_SIZE]);
    }

    #[test]
    fn requests_for_one_page_run_in_submission_order() {
        let (_dir, scheduler) = create_scheduler(4);

        // Ten writes to the same page land on one queue; the read scheduled
        // last must observe the last write.
        let mut futures = Vec::new();
        for i in 0..10u8 {
            let (promise, future) = DiskScheduler::create_promise();
            scheduler.schedule(vec![DiskRequest {
                kind: RequestKind::Write,
                page_id: 3,
                data: page_filled(i),
                completion: promise,
            }]);
            futures.push(future);
        }
        let (promise, read_future) = DiskScheduler::create_promise();
        scheduler.schedule(vec![DiskRequest {
            kind: RequestKind::Read,
            page_id: 3,
            data: page_filled(0),
            completion: promise,
        }]);

        for future in futures {
            assert!(future.recv().unwrap().is_ok());
        }
        let read = read_future.recv().unwrap().unwrap();
        assert_eq!(*read, [9u8; PAGE_SIZE]);
    }

    #[test]
    fn distinct_pages_complete_independently() {
        let (_dir, scheduler) = create_scheduler(2);

        let mut futures = Vec::new();
        for page_id in 0..16u32 {
            let (promise, future) = DiskScheduler::create_promise();
            scheduler.schedule(vec![DiskRequest {
                kind: RequestKind::Write,
                page_id,
                data: page_filled(page_id as u8),
                completion: promise,
            }]);
            futures.push((page_id, future));
        }
        for (page_id, future) in futures {
            assert!(future.recv().unwrap().is_ok(), "write of {page_id} failed");
        }

        for page_id in 0..16u32 {
            let data = scheduler
                .run_to_completion(RequestKind::Read, page_id, page_filled(0))
                .unwrap();
            assert_eq!(*data, [page_id as u8; PAGE_SIZE]);
        }
    }

    #[test]
    fn drop_drains_outstanding_requests() {
        let (_dir, scheduler) = create_scheduler(1);

        let mut futures = Vec::new();
        for i in 0..32u8 {
            let (promise, future) = DiskScheduler::create_promise();
            scheduler.schedule(vec![DiskRequest {
                kind: RequestKind::Write,
                page_id: i as PageId,
                data: page_filled(i),
                completion: promise,
            }]);
            futures.push(future);
        }
        drop(scheduler);

        // Every submitted request completed before the workers joined.
        for future in futures {
            assert!(future.recv().unwrap().is_ok());
        }
    }
}
