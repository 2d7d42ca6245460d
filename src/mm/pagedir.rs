//! User Page Directory
//!
//! The kernel's record of which user virtual pages a process has mapped,
//! the kernel page backing each one, and its permissions. The hardware
//! tables are built from this by the MMU collaborator on activation.
//!
//! # Security Properties
//! - Only page-aligned addresses below `PHYS_BASE` can be mapped
//! - Every mapping carries `USER`; kernel pages never appear here
//! - Copies in and out stop at the first unmapped page

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use bitflags::bitflags;

use super::address::{UserAddr, PAGE_SIZE, PHYS_BASE};
use super::pool::{Page, PagePool};

bitflags! {
    /// x86 page table entry permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Mapping is present.
        const PRESENT = 1 << 0;
        /// User code may write the page.
        const WRITABLE = 1 << 1;
        /// User code may access the page.
        const USER = 1 << 2;
    }
}

/// Error type for mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The address is at or above `PHYS_BASE`.
    NotUser,
    /// The address is not page-aligned.
    Unaligned,
    /// A page is already mapped there.
    AlreadyMapped,
    /// No page could be allocated.
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotUser => write!(f, "address is not in user space"),
            Self::Unaligned => write!(f, "address is not page-aligned"),
            Self::AlreadyMapped => write!(f, "page already mapped"),
            Self::OutOfMemory => write!(f, "out of pages"),
        }
    }
}

/// The hardware side of address spaces.
pub trait Mmu: Send + Sync {
    /// Make `dir` the active user address space, or run with the kernel-only
    /// address space when `None`.
    fn activate(&self, dir: Option<&PageDir>);

    /// Tear down a directory. It must no longer be active.
    fn destroy(&self, dir: PageDir) {
        drop(dir);
    }
}

struct Mapping {
    page: Page,
    flags: PageFlags,
}

/// A process's user address space.
#[derive(Default)]
pub struct PageDir {
    pages: BTreeMap<u32, Mapping>,
}

impl PageDir {
    /// Create an empty page directory.
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Map `page` at user virtual address `upage`.
    pub fn map(&mut self, upage: UserAddr, page: Page, writable: bool) -> Result<(), MapError> {
        if !upage.is_user() {
            return Err(MapError::NotUser);
        }
        if !upage.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if self.pages.contains_key(&upage.page_number()) {
            return Err(MapError::AlreadyMapped);
        }

        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        flags.set(PageFlags::WRITABLE, writable);
        self.pages.insert(upage.page_number(), Mapping { page, flags });
        Ok(())
    }

    /// Map a zeroed, writable stack page just below `PHYS_BASE` and return
    /// the initial stack pointer (the top of that page).
    pub fn map_stack(&mut self, pool: &Arc<PagePool>) -> Result<UserAddr, MapError> {
        let page = pool.alloc_page().ok_or(MapError::OutOfMemory)?;
        self.map(UserAddr::new(PHYS_BASE - PAGE_SIZE as u32), page, true)?;
        Ok(UserAddr::new(PHYS_BASE))
    }

    /// Remove a mapping, handing back its page.
    pub fn unmap(&mut self, upage: UserAddr) -> Option<Page> {
        self.pages.remove(&upage.page_number()).map(|m| m.page)
    }

    /// Permissions of the page containing `addr`, if mapped.
    pub fn flags(&self, addr: UserAddr) -> Option<PageFlags> {
        self.pages.get(&addr.page_number()).map(|m| m.flags)
    }

    /// Check if the page containing `addr` is mapped.
    pub fn is_mapped(&self, addr: UserAddr) -> bool {
        self.flags(addr).is_some()
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    /// Mutable view of the page containing `addr`.
    pub fn page_mut(&mut self, addr: UserAddr) -> Option<&mut [u8]> {
        self.pages
            .get_mut(&addr.page_number())
            .map(|m| &mut m.page[..])
    }

    /// Copy user memory starting at `addr` into `dst`.
    ///
    /// On failure returns the first address that is not mapped.
    pub fn read(&self, addr: UserAddr, dst: &mut [u8]) -> Result<(), UserAddr> {
        let mut cursor = addr;
        let mut done = 0;
        while done < dst.len() {
            let mapping = self.pages.get(&cursor.page_number()).ok_or(cursor)?;
            let offset = cursor.page_offset();
            let n = (PAGE_SIZE - offset).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&mapping.page[offset..offset + n]);
            done += n;
            if done < dst.len() {
                cursor = cursor.checked_add(n as u32).ok_or(cursor)?;
            }
        }
        Ok(())
    }

    /// Copy `src` into user memory starting at `addr`.
    ///
    /// Permissions are not checked here; that is the validation layer's job.
    pub fn write(&mut self, addr: UserAddr, src: &[u8]) -> Result<(), UserAddr> {
        let mut cursor = addr;
        let mut done = 0;
        while done < src.len() {
            let mapping = self.pages.get_mut(&cursor.page_number()).ok_or(cursor)?;
            let offset = cursor.page_offset();
            let n = (PAGE_SIZE - offset).min(src.len() - done);
            mapping.page[offset..offset + n].copy_from_slice(&src[done..done + n]);
            done += n;
            if done < src.len() {
                cursor = cursor.checked_add(n as u32).ok_or(cursor)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PageDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageDir({} pages)", self.pages.len())
    }
}
