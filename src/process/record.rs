//! Process lifecycle record
//!
//! The control block a parent keeps for each child it started. The child
//! thread holds the other reference, so the record lives until the later
//! of the two lets go.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use spin::{Mutex, Once};

use super::{Threads, Tid, EXIT_KILLED};
use crate::mm::Page;
use crate::sync::Semaphore;

/// Shared parent/child state for one child process.
///
/// Only the child writes `pid`, the exit status and the finished flag. The
/// parent reads them after observing the matching signal.
pub struct LifecycleRecord {
    pid: Once<Tid>,
    /// Command line, owned here until the child takes it.
    cmdline: Mutex<Option<Page>>,
    exit_status: AtomicI32,
    finished: AtomicBool,
    loaded: AtomicBool,
    orphaned: AtomicBool,
    started: Box<dyn Semaphore>,
    exited: Box<dyn Semaphore>,
}

impl LifecycleRecord {
    /// Both signals are scheduler semaphores, so a parent waiting on them
    /// sleeps until the child posts.
    pub fn new(cmdline: Page, threads: &dyn Threads) -> Self {
        Self {
            pid: Once::new(),
            cmdline: Mutex::new(Some(cmdline)),
            exit_status: AtomicI32::new(EXIT_KILLED),
            finished: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            orphaned: AtomicBool::new(false),
            started: threads.semaphore(0),
            exited: threads.semaphore(0),
        }
    }

    /// The child's id, or `None` before its thread has run.
    pub fn pid(&self) -> Option<Tid> {
        self.pid.get().copied()
    }

    pub fn set_pid(&self, tid: Tid) {
        self.pid.call_once(|| tid);
    }

    /// Take the command line page. Only the first call gets it.
    pub fn take_cmdline(&self) -> Option<Page> {
        self.cmdline.lock().take()
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Startup complete, successfully or not.
    pub fn signal_started(&self) {
        self.started.up();
    }

    pub fn wait_started(&self) {
        self.started.down();
    }

    /// Mark the child finished and wake a waiting parent.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.exited.up();
    }

    pub fn wait_exited(&self) {
        self.exited.down();
    }

    /// The parent exited without reaping this child.
    pub fn orphan(&self) {
        self.orphaned.store(true, Ordering::Release);
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LifecycleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleRecord")
            .field("pid", &self.pid())
            .field("exit_status", &self.exit_status())
            .field("finished", &self.is_finished())
            .field("loaded", &self.is_loaded())
            .field("orphaned", &self.is_orphaned())
            .finish_non_exhaustive()
    }
}
