//! Filesystem access
//!
//! The filesystem itself is a platform collaborator. This module owns the
//! single lock that serializes every call into it, together with the
//! per-process descriptor tables it protects.
//!
//! # Locking
//! - One `spin::Mutex` guards the filesystem and every descriptor table
//! - Callers that also touch a page directory take this lock first

pub mod fdtable;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::fmt;

use log::debug;
use spin::{Mutex, MutexGuard};

use crate::process::Tid;

pub use fdtable::{Fd, FdError, FdTable};

/// Error type for file I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The device or medium failed.
    Device,
    /// The file cannot grow to hold the data.
    NoSpace,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => write!(f, "device error"),
            Self::NoSpace => write!(f, "no space left"),
        }
    }
}

/// An open file. Dropping it closes it.
pub trait File: Send {
    /// Read at the current position, returning the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Write at the current position, returning the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> Result<usize, IoError>;

    /// Size of the file in bytes.
    fn length(&self) -> u32;
}

/// The filesystem.
pub trait FileSystem: Send {
    /// Create a file of `size` bytes. `false` if it exists or cannot be
    /// created.
    fn create(&mut self, name: &str, size: u32) -> bool;

    fn open(&mut self, name: &str) -> Option<Box<dyn File>>;
}

/// The filesystem lock.
pub struct FileSys {
    state: Mutex<FsState>,
}

impl FileSys {
    pub fn new(fs: Box<dyn FileSystem>, max_open: usize) -> Self {
        Self {
            state: Mutex::new(FsState {
                fs,
                tables: BTreeMap::new(),
                max_open,
            }),
        }
    }

    /// Acquire the filesystem lock.
    pub fn lock(&self) -> MutexGuard<'_, FsState> {
        self.state.lock()
    }
}

/// Everything behind the filesystem lock.
pub struct FsState {
    fs: Box<dyn FileSystem>,
    tables: BTreeMap<Tid, FdTable>,
    max_open: usize,
}

impl FsState {
    pub fn create(&mut self, name: &str, size: u32) -> bool {
        self.fs.create(name, size)
    }

    /// Open `name` for `tid`, returning its new descriptor.
    pub fn open(&mut self, tid: Tid, name: &str) -> Option<Fd> {
        let file = self.fs.open(name)?;
        let max_open = self.max_open;
        let table = self
            .tables
            .entry(tid)
            .or_insert_with(|| FdTable::new(max_open));
        match table.insert(file) {
            Ok(fd) => Some(fd),
            Err(e) => {
                debug!("tid {}: open {:?}: {}", tid, name, e);
                None
            }
        }
    }

    /// The file open under `fd` in process `tid`.
    pub fn file(&mut self, tid: Tid, fd: Fd) -> Option<&mut dyn File> {
        self.tables.get_mut(&tid)?.get_mut(fd).ok()
    }

    pub fn filesize(&mut self, tid: Tid, fd: Fd) -> Option<u32> {
        self.file(tid, fd).map(|file| file.length())
    }

    /// Close `fd`. Returns whether it was open.
    pub fn close(&mut self, tid: Tid, fd: Fd) -> bool {
        self.tables
            .get_mut(&tid)
            .is_some_and(|table| table.remove(fd).is_ok())
    }

    /// Close every file `tid` still has open.
    pub fn close_all(&mut self, tid: Tid) -> usize {
        self.tables
            .remove(&tid)
            .map_or(0, |mut table| table.clear())
    }

    pub fn open_count(&self, tid: Tid) -> usize {
        self.tables.get(&tid).map_or(0, FdTable::len)
    }
}
