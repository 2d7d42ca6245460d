//! Kernel Page Pool
//!
//! Hands out zeroed, page-sized, page-aligned buffers. The pool owns one
//! contiguous region and uses `linked_list_allocator` to track which pages
//! of it are in use.
//!
//! # Design
//! - Every allocation is exactly one page with page alignment
//! - `Page` is an RAII guard: dropping it returns the page to the pool
//! - Exhaustion is reported as `None`, never as a panic
//!
//! # Security Properties
//! - Pages are zeroed before they are handed out
//! - The region is only reachable through live `Page` guards

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use linked_list_allocator::Heap;
use spin::Mutex;

use super::address::PAGE_SIZE;

/// Layout of a single pool allocation.
const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(layout) => layout,
    Err(_) => panic!("page layout"),
};

/// Backing storage unit, forces page alignment of the region.
#[repr(C, align(4096))]
struct PageFrame([u8; PAGE_SIZE]);

/// A fixed-size pool of pages.
pub struct PagePool {
    heap: Mutex<Heap>,
    region: NonNull<[PageFrame]>,
    pages: usize,
}

// SAFETY: the region is only accessed through `heap` (behind a lock) or
// through `Page` guards, each of which owns a disjoint page.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Create a pool holding `pages` pages (at least one).
    pub fn new(pages: usize) -> Arc<Self> {
        let pages = pages.max(1);
        let frames: Box<[PageFrame]> = (0..pages).map(|_| PageFrame([0; PAGE_SIZE])).collect();
        let region = NonNull::from(Box::leak(frames));

        // SAFETY:
        // - The region was just leaked from a Box, so nothing else references it
        // - It stays alive until `Drop for PagePool` reclaims it
        // - Its size is exactly `pages * PAGE_SIZE` bytes
        let heap = unsafe { Heap::new(region.as_ptr() as *mut u8, pages * PAGE_SIZE) };

        Arc::new(Self {
            heap: Mutex::new(heap),
            region,
            pages,
        })
    }

    /// Allocate one zeroed page, or `None` when the pool is exhausted.
    pub fn alloc_page(self: &Arc<Self>) -> Option<Page> {
        let ptr = self.heap.lock().allocate_first_fit(PAGE_LAYOUT).ok()?;

        // SAFETY: the allocator just handed us PAGE_SIZE bytes that no other
        // guard owns.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, PAGE_SIZE) };

        Some(Page {
            ptr,
            pool: Arc::clone(self),
        })
    }

    /// Total number of pages managed by this pool.
    pub fn capacity(&self) -> usize {
        self.pages
    }

    /// Number of pages currently available.
    pub fn free_pages(&self) -> usize {
        self.heap.lock().free() / PAGE_SIZE
    }

    fn release(&self, ptr: NonNull<u8>) {
        // SAFETY: `ptr` came from `allocate_first_fit` with PAGE_LAYOUT and
        // its guard is being dropped, so it is released exactly once.
        unsafe { self.heap.lock().deallocate(ptr, PAGE_LAYOUT) };
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        // SAFETY: every Page holds an Arc to the pool, so no page is alive
        // once the pool itself is dropped. The region came from Box::leak.
        unsafe { drop(Box::from_raw(self.region.as_ptr())) };
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PagePool({}/{} free)", self.free_pages(), self.pages)
    }
}

/// A page owned by the holder. Returned to its pool on drop.
pub struct Page {
    ptr: NonNull<u8>,
    pool: Arc<PagePool>,
}

// SAFETY: a Page is the unique owner of its bytes.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the guard owns PAGE_SIZE valid bytes at `ptr`.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.pool.release(self.ptr);
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:p})", self.ptr)
    }
}
