//! Kernel tunables.

/// Default thread priority (`PRI_DEFAULT`).
pub const PRI_DEFAULT: u8 = 31;

/// Sizing knobs for the process subsystem, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Pages in the kernel page pool (command lines, stacks, loaded images).
    pub pool_pages: usize,
    /// Maximum simultaneously open descriptors per process.
    pub max_open_files: usize,
    /// Priority given to newly spawned process threads.
    pub thread_priority: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            pool_pages: 64,
            max_open_files: 128,
            thread_priority: PRI_DEFAULT,
        }
    }
}
