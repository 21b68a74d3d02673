//! DiskManager module — page allocation and byte-level access for a single
//! database file, plus the append-only log file next to it.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{PAGE_SIZE, Page, PageId};

/// Initial capacity of the database file, in pages. The file doubles its
/// capacity whenever the mapped pages would outgrow it.
const INITIAL_PAGE_CAPACITY: usize = 16;

/// Error for [`DiskManager`] related operations.
#[derive(Debug, Error)]
pub enum DiskManagerError {
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
}

/// Responsible for moving pages between memory and the database file.
///
/// Space is allocated lazily: a page id is assigned a byte offset in the file
/// on its first read or write. Offsets of deleted pages are kept in a
/// free-slot vector and handed out again before the file grows, so ids never
/// alias until deleted. The file grows by doubling its page capacity and may
/// contain holes.
///
/// All database-file operations hold a single file latch. The log file is a
/// separate append-only stream under its own latch, so log writes never
/// contend with page I/O.
pub struct DiskManager {
    db: Mutex<DbFile>,
    log: Mutex<LogFile>,
}

struct DbFile {
    io: fs::File,
    path: PathBuf,
    /// Byte offset of every page currently mapped in the file.
    pages: HashMap<PageId, u64>,
    /// Offsets of deleted pages, reused before the file grows.
    free_slots: Vec<u64>,
    /// First never-allocated offset, at the end of the used region.
    next_slot: u64,
    /// Current file capacity in pages.
    page_capacity: usize,
    num_writes: usize,
    num_deletes: usize,
}

struct LogFile {
    io: fs::File,
    num_flushes: usize,
}

impl DiskManager {
    /// Opens (or creates) the database file at `db_path` and the log file
    /// next to it, with the same file name plus a `.log` extension.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let io = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_path)?;
        io.set_len((INITIAL_PAGE_CAPACITY * PAGE_SIZE) as u64)?;

        let mut log_path = db_path.clone();
        log_path.as_mut_os_string().push(".log");
        let log_io = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;

        Ok(DiskManager {
            db: Mutex::new(DbFile {
                io,
                path: db_path,
                pages: HashMap::new(),
                free_slots: Vec::new(),
                next_slot: 0,
                page_capacity: INITIAL_PAGE_CAPACITY,
                num_writes: 0,
                num_deletes: 0,
            }),
            log: Mutex::new(LogFile {
                io: log_io,
                num_flushes: 0,
            }),
        })
    }

    /// Reads the page with `page_id` into `buf`. A page that was never
    /// written reads as zeroes, and a short read zero-fills the tail.
    pub fn read_page(&self, page_id: PageId, buf: &mut Page) -> Result<(), DiskManagerError> {
        let mut db = self.db.lock();
        let offset = db.offset_for(page_id)?;

        db.io.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = db.io.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf[read..].fill(0);
        Ok(())
    }

    /// Writes `buf` as the content of the page with `page_id`, allocating a
    /// file slot on the first write.
    pub fn write_page(&self, page_id: PageId, buf: &Page) -> Result<(), DiskManagerError> {
        let mut db = self.db.lock();
        let offset = db.offset_for(page_id)?;

        db.io.seek(SeekFrom::Start(offset))?;
        db.io.write_all(buf)?;
        db.io.flush()?;
        db.num_writes += 1;
        Ok(())
    }

    /// Deallocates the page with `page_id`, pushing its file slot onto the
    /// free-slot vector for reuse. Unknown page ids are ignored.
    pub fn delete_page(&self, page_id: PageId) {
        let mut db = self.db.lock();
        if let Some(offset) = db.pages.remove(&page_id) {
            db.free_slots.push(offset);
            db.num_deletes += 1;
        }
    }

    /// Appends `data` to the log file and flushes it. An empty slice is a
    /// no-op and does not count as a flush.
    pub fn write_log(&self, data: &[u8]) -> Result<(), DiskManagerError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut log = self.log.lock();
        log.io.write_all(data)?;
        log.io.flush()?;
        log.num_flushes += 1;
        Ok(())
    }

    /// Reads log bytes at `offset` into `buf`. Returns `false` when `offset`
    /// is at or past the end of the log; a short read zero-fills the tail.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<bool, DiskManagerError> {
        let mut log = self.log.lock();
        let len = log.io.metadata()?.len();
        if offset >= len {
            return Ok(false);
        }
        log.io.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            let n = log.io.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf[read..].fill(0);
        Ok(true)
    }

    /// Size of the database file in bytes.
    pub fn db_file_size(&self) -> Result<u64, DiskManagerError> {
        let db = self.db.lock();
        Ok(fs::metadata(&db.path)?.len())
    }

    pub fn num_writes(&self) -> usize {
        self.db.lock().num_writes
    }

    pub fn num_deletes(&self) -> usize {
        self.db.lock().num_deletes
    }

    pub fn num_flushes(&self) -> usize {
        self.log.lock().num_flushes
    }
}

impl DbFile {
    /// Byte offset of `page_id`, allocating a slot on first access. Free
    /// slots are reused before the used region grows; growth doubles the
    /// file's page capacity.
    fn offset_for(&mut self, page_id: PageId) -> Result<u64, DiskManagerError> {
        if let Some(&offset) = self.pages.get(&page_id) {
            return Ok(offset);
        }

        let offset = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                let used = (self.next_slot as usize) / PAGE_SIZE;
                if used + 1 >= self.page_capacity {
                    self.page_capacity *= 2;
                    self.io.set_len((self.page_capacity * PAGE_SIZE) as u64)?;
                }
                let slot = self.next_slot;
                self.next_slot += PAGE_SIZE as u64;
                slot
            }
        };
        self.pages.insert(page_id, offset);
        Ok(offset)
    }
}
