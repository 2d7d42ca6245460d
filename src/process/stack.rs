//! Initial user stack
//!
//! Lays out `argc` and `argv` on a fresh user stack the way the x86 C
//! runtime expects to find them at `_start`, from high to low addresses:
//!
//! ```text
//!   argument strings, last token first, each NUL-terminated
//!   zero padding down to a 4-byte boundary
//!   argv[argc] = NULL
//!   argv[argc - 1] .. argv[0]
//!   argv            (address of argv[0])
//!   argc
//!   return address  (0)       <- initial esp
//! ```
//!
//! All words are little-endian 32-bit.

use alloc::vec::Vec;
use core::fmt;

use crate::mm::{PageDir, UserAddr, WORD_SIZE};

/// Error type for stack construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// No page is mapped just below the stack top.
    Unmapped(UserAddr),
    /// The arguments do not fit in the stack page.
    Overflow,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped(addr) => write!(f, "no stack page below {}", addr),
            Self::Overflow => write!(f, "arguments overflow the stack page"),
        }
    }
}

/// Split a command line into its whitespace-separated tokens.
pub fn tokenize(cmdline: &str) -> Vec<&str> {
    cmdline.split_ascii_whitespace().collect()
}

/// A stack page being filled downward from its top.
pub struct StackImage<'a> {
    page: &'a mut [u8],
    /// User address of `page[0]`.
    base: UserAddr,
    /// Offset of the current stack pointer within `page`.
    cursor: usize,
}

impl<'a> StackImage<'a> {
    /// Start an image whose stack pointer is `base + top`.
    pub fn new(page: &'a mut [u8], base: UserAddr, top: usize) -> Self {
        let cursor = top.min(page.len());
        Self { page, base, cursor }
    }

    /// Current stack pointer.
    pub fn sp(&self) -> UserAddr {
        // The page lies in user space, so the offset always fits.
        UserAddr::new(self.base.as_u32() + self.cursor as u32)
    }

    /// Push raw bytes and return the address they now start at.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<UserAddr, StackError> {
        let start = self
            .cursor
            .checked_sub(bytes.len())
            .ok_or(StackError::Overflow)?;
        self.page[start..self.cursor].copy_from_slice(bytes);
        self.cursor = start;
        Ok(self.sp())
    }

    /// Push a string followed by its NUL terminator.
    pub fn push_cstr(&mut self, s: &str) -> Result<UserAddr, StackError> {
        self.push_bytes(&[0])?;
        self.push_bytes(s.as_bytes())
    }

    /// Move the stack pointer down to a multiple of `align`, zeroing the gap.
    pub fn align_down(&mut self, align: u32) -> Result<(), StackError> {
        let misalign = (self.sp().as_u32() % align) as usize;
        let start = self
            .cursor
            .checked_sub(misalign)
            .ok_or(StackError::Overflow)?;
        self.page[start..self.cursor].fill(0);
        self.cursor = start;
        Ok(())
    }

    pub fn push_word(&mut self, word: u32) -> Result<UserAddr, StackError> {
        self.push_bytes(&word.to_le_bytes())
    }
}

/// Write the `argc/argv` frame for `args` into `image`.
pub fn build_argv(image: &mut StackImage<'_>, args: &[&str]) -> Result<(), StackError> {
    let mut addrs = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        addrs.push(image.push_cstr(arg)?);
    }

    image.align_down(WORD_SIZE)?;
    image.push_word(0)?;

    // `addrs` runs from the last token to the first, which is the order
    // the array is filled downward in.
    for addr in &addrs {
        image.push_word(addr.as_u32())?;
    }
    let argv = image.sp();

    image.push_word(argv.as_u32())?;
    image.push_word(args.len() as u32)?;
    image.push_word(0)?;
    Ok(())
}

/// Build the initial stack below `stack_top` in `pagedir` and return the
/// initial stack pointer.
pub fn build(
    pagedir: &mut PageDir,
    stack_top: UserAddr,
    args: &[&str],
) -> Result<UserAddr, StackError> {
    let below = stack_top
        .checked_sub(1)
        .ok_or(StackError::Unmapped(stack_top))?;
    let base = below.page_base();
    let top = below.page_offset() + 1;
    let page = pagedir
        .page_mut(below)
        .ok_or(StackError::Unmapped(stack_top))?;

    let mut image = StackImage::new(page, base, top);
    build_argv(&mut image, args)?;
    Ok(image.sp())
}
