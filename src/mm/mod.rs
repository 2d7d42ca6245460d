//! Memory management module
//!
//! Provides:
//! - Typed user virtual addresses and the user/kernel split
//! - A pool of zeroed kernel pages
//! - Per-process user page directories
//!
//! # Security Principles
//! - User addresses are plain numbers until validated
//! - Pages are zeroed before reuse
//! - Unsafe code is confined to the page pool

pub mod address;
pub mod pagedir;
pub mod pool;

pub use address::{UserAddr, PAGE_SIZE, PHYS_BASE, WORD_SIZE};
pub use pagedir::{MapError, Mmu, PageDir, PageFlags};
pub use pool::{Page, PagePool};
