//! Kernel context
//!
//! One `Kernel` is created at boot. It owns the collaborators, the page
//! pool and the filesystem lock, and every process operation and syscall
//! handler is a method on it.

use alloc::boxed::Box;
use alloc::sync::Arc;

use log::info;

use crate::config::KernelConfig;
use crate::drivers::Console;
use crate::fs::{FileSys, FileSystem};
use crate::mm::pagedir::Mmu;
use crate::mm::PagePool;
use crate::process::{Loader, Threads, UserEntry};

/// Platform services the process layer is built on.
pub struct Platform {
    pub threads: Arc<dyn Threads>,
    pub loader: Arc<dyn Loader>,
    pub user: Arc<dyn UserEntry>,
    pub mmu: Arc<dyn Mmu>,
    pub console: Arc<dyn Console>,
    pub filesys: Box<dyn FileSystem>,
}

pub struct Kernel {
    config: KernelConfig,
    pool: Arc<PagePool>,
    pub(crate) threads: Arc<dyn Threads>,
    pub(crate) loader: Arc<dyn Loader>,
    pub(crate) user: Arc<dyn UserEntry>,
    pub(crate) mmu: Arc<dyn Mmu>,
    console: Arc<dyn Console>,
    files: FileSys,
}

impl Kernel {
    pub fn new(config: KernelConfig, platform: Platform) -> Arc<Self> {
        let pool = PagePool::new(config.pool_pages);
        info!(
            "process layer up: {} pool pages, {} descriptors per process",
            pool.capacity(),
            config.max_open_files
        );

        Arc::new(Self {
            config,
            pool,
            threads: platform.threads,
            loader: platform.loader,
            user: platform.user,
            mmu: platform.mmu,
            console: platform.console,
            files: FileSys::new(platform.filesys, config.max_open_files),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn console(&self) -> &dyn Console {
        &*self.console
    }

    /// The filesystem lock and the descriptor tables behind it.
    pub fn files(&self) -> &FileSys {
        &self.files
    }
}
