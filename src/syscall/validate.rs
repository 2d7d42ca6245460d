//! System Call Input Validation
//!
//! Every pointer a user process hands to the kernel is checked against the
//! process's page directory before a single byte is copied.
//!
//! # Security Principles
//! - Validate ALL inputs before use
//! - Fail-secure: a bad pointer is fatal to the process
//! - Prevent common vulnerabilities:
//!   - Kernel memory disclosure (addresses at or above `PHYS_BASE`)
//!   - Wrap-around (checked arithmetic on every range)
//!   - Writes to read-only user pages (WRITABLE is checked for outputs)
//!   - TOCTOU races (data is copied into kernel buffers, never aliased)

use alloc::vec::Vec;
use core::fmt;

use crate::mm::{PageDir, PageFlags, UserAddr, PAGE_SIZE};

/// Why a user pointer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Null pointer with a non-zero extent.
    Null,
    /// The range reaches `PHYS_BASE` or above.
    KernelAddress,
    /// The page containing this address is not mapped.
    Unmapped(UserAddr),
    /// The page containing this address cannot be written by user code.
    ReadOnly(UserAddr),
    /// Pointer plus length wraps the address space.
    Overflow,
    /// No NUL terminator within the length limit.
    Unterminated(UserAddr),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null pointer"),
            Self::KernelAddress => write!(f, "pointer into kernel space"),
            Self::Unmapped(addr) => write!(f, "unmapped address {}", addr),
            Self::ReadOnly(addr) => write!(f, "read-only address {}", addr),
            Self::Overflow => write!(f, "range wraps around"),
            Self::Unterminated(addr) => write!(f, "unterminated string at {}", addr),
        }
    }
}

/// Check that `len` bytes starting at `addr` are user-accessible, and
/// writable if `write` is set. Every page the range touches is checked.
pub fn check_range(pd: &PageDir, addr: UserAddr, len: usize, write: bool) -> Result<(), Fault> {
    if len == 0 {
        return Ok(());
    }
    if addr.is_null() {
        return Err(Fault::Null);
    }

    let extent = u32::try_from(len - 1).map_err(|_| Fault::Overflow)?;
    let last = addr.checked_add(extent).ok_or(Fault::Overflow)?;
    if !addr.is_user() || !last.is_user() {
        return Err(Fault::KernelAddress);
    }

    let mut page = addr.page_base();
    loop {
        // The first page reports the pointer itself, later ones their base.
        let reported = if page < addr { addr } else { page };
        let flags = pd.flags(page).ok_or(Fault::Unmapped(reported))?;
        if !flags.contains(PageFlags::USER) {
            return Err(Fault::Unmapped(reported));
        }
        if write && !flags.contains(PageFlags::WRITABLE) {
            return Err(Fault::ReadOnly(reported));
        }
        if page.page_number() == last.page_number() {
            return Ok(());
        }
        page = page.checked_add(PAGE_SIZE as u32).ok_or(Fault::Overflow)?;
    }
}

/// A validated user-space source buffer.
///
/// Holds no pointer into user memory, only the checked range. Bytes are
/// copied out through the page directory on demand.
#[derive(Debug, Clone, Copy)]
pub struct UserBuffer {
    addr: UserAddr,
    len: usize,
}

impl UserBuffer {
    /// Copy `dst.len()` bytes starting `offset` bytes into the buffer.
    pub fn copy_in(&self, pd: &PageDir, offset: usize, dst: &mut [u8]) -> Result<(), Fault> {
        let start = sub_range(self.addr, self.len, offset, dst.len())?;
        pd.read(start, dst).map_err(Fault::Unmapped)
    }
}

/// A validated, writable user-space destination buffer.
#[derive(Debug, Clone, Copy)]
pub struct UserBufferMut {
    addr: UserAddr,
    len: usize,
}

impl UserBufferMut {
    /// Copy `src` into the buffer starting `offset` bytes in.
    pub fn copy_out(&self, pd: &mut PageDir, offset: usize, src: &[u8]) -> Result<(), Fault> {
        let start = sub_range(self.addr, self.len, offset, src.len())?;
        pd.write(start, src).map_err(Fault::Unmapped)
    }
}

fn sub_range(addr: UserAddr, len: usize, offset: usize, n: usize) -> Result<UserAddr, Fault> {
    let end = offset.checked_add(n).ok_or(Fault::Overflow)?;
    if end > len {
        return Err(Fault::Overflow);
    }
    let offset = u32::try_from(offset).map_err(|_| Fault::Overflow)?;
    addr.checked_add(offset).ok_or(Fault::Overflow)
}

/// Validate a user-space buffer the kernel will read from.
///
/// # Security Checks
/// 1. Non-null unless the length is zero
/// 2. Pointer + length doesn't overflow
/// 3. The whole range is below `PHYS_BASE`
/// 4. Every page in the range is mapped for user access
pub fn validate_user_read(pd: &PageDir, ptr: u32, len: usize) -> Result<UserBuffer, Fault> {
    let addr = UserAddr::new(ptr);
    check_range(pd, addr, len, false)?;
    Ok(UserBuffer { addr, len })
}

/// Validate a user-space buffer the kernel will write into.
///
/// Same as read validation, plus every page must be writable.
pub fn validate_user_write(pd: &PageDir, ptr: u32, len: usize) -> Result<UserBufferMut, Fault> {
    let addr = UserAddr::new(ptr);
    check_range(pd, addr, len, true)?;
    Ok(UserBufferMut { addr, len })
}

/// Read a little-endian 32-bit word from user memory.
pub fn read_u32(pd: &PageDir, addr: UserAddr) -> Result<u32, Fault> {
    let mut bytes = [0u8; 4];
    check_range(pd, addr, bytes.len(), false)?;
    pd.read(addr, &mut bytes).map_err(Fault::Unmapped)?;
    Ok(u32::from_le_bytes(bytes))
}

#[inline]
pub fn read_i32(pd: &PageDir, addr: UserAddr) -> Result<i32, Fault> {
    read_u32(pd, addr).map(|word| word as i32)
}

/// Copy a NUL-terminated string out of user memory.
///
/// The terminator must appear within the first `limit` bytes; a longer
/// string is rejected with [`Fault::Unterminated`]. The string is validated
/// byte by byte as it is scanned, so a terminator on a mapped page followed
/// by an unmapped one is fine.
pub fn read_cstr(pd: &PageDir, addr: UserAddr, limit: usize) -> Result<Vec<u8>, Fault> {
    let mut out = Vec::new();
    let mut cursor = addr;
    for _ in 0..limit {
        let mut byte = [0u8; 1];
        check_range(pd, cursor, 1, false)?;
        pd.read(cursor, &mut byte).map_err(Fault::Unmapped)?;
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
        cursor = cursor.checked_add(1).ok_or(Fault::Overflow)?;
    }
    Err(Fault::Unterminated(addr))
}
