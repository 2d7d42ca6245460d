//! File Descriptor Table
//!
//! Holds the open files of one process, indexed by descriptor.
//!
//! # Design
//! - Descriptors 0, 1 and 2 are reserved for the console
//! - Descriptors are handed out monotonically from 3 and never reused
//! - Running out of descriptor numbers or table slots is an error, not a wrap

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::File;

/// A process-local file descriptor.
///
/// This is a newtype to keep raw syscall integers apart from validated
/// descriptors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(transparent)]
pub struct Fd(i32);

impl Fd {
    /// Console input.
    pub const STDIN: Self = Self(0);

    /// Console output.
    pub const STDOUT: Self = Self(1);

    /// First descriptor handed out by `open`.
    pub const FIRST_USER: Self = Self(3);

    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

/// Error type for descriptor table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdError {
    /// Every descriptor number has been used.
    Exhausted,
    /// The table already holds the maximum number of open files.
    TableFull,
    /// The descriptor is not open.
    NotOpen,
}

impl core::fmt::Display for FdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "descriptor numbers exhausted"),
            Self::TableFull => write!(f, "too many open files"),
            Self::NotOpen => write!(f, "descriptor not open"),
        }
    }
}

struct Entry {
    fd: Fd,
    file: Box<dyn File>,
}

/// Open files of a single process.
pub struct FdTable {
    entries: Vec<Entry>,
    /// Next descriptor to hand out, `None` once the numbers are used up.
    next: Option<i32>,
    limit: usize,
}

impl FdTable {
    /// Create an empty table allowing at most `limit` open files.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            next: Some(Fd::FIRST_USER.0),
            limit,
        }
    }

    /// Store `file` under a fresh descriptor.
    ///
    /// On failure the file is dropped, which closes it.
    pub fn insert(&mut self, file: Box<dyn File>) -> Result<Fd, FdError> {
        if self.entries.len() >= self.limit {
            return Err(FdError::TableFull);
        }
        let raw = self.next.ok_or(FdError::Exhausted)?;
        self.next = raw.checked_add(1);

        let fd = Fd(raw);
        self.entries.push(Entry { fd, file });
        Ok(fd)
    }

    /// Look up an open file.
    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut dyn File, FdError> {
        self.entries
            .iter_mut()
            .find(|e| e.fd == fd)
            .map(|e| &mut *e.file as &mut dyn File)
            .ok_or(FdError::NotOpen)
    }

    /// Remove a descriptor, handing back its file.
    pub fn remove(&mut self, fd: Fd) -> Result<Box<dyn File>, FdError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.fd == fd)
            .ok_or(FdError::NotOpen)?;
        Ok(self.entries.remove(index).file)
    }

    /// Close every open file, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn with_next(limit: usize, next: i32) -> Self {
        Self {
            entries: Vec::new(),
            next: Some(next),
            limit,
        }
    }
}
