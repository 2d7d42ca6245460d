//! User processes
//!
//! Creating a process from a command line, waiting for it, and tearing it
//! down when its thread ends.
//!
//! # Protocol
//! 1. The parent copies the command line into a pool page, wraps it in a
//!    `LifecycleRecord` and spawns a thread running `start_process`
//! 2. The parent blocks until the child signals that startup is over,
//!    whether or not the program loaded
//! 3. The child loads the program, builds its stack and enters user mode
//! 4. When the child's thread ends, `process_exit` publishes the status and
//!    signals any waiting parent
//!
//! # Ownership
//! The record is shared by the parent's children list and the child's
//! `Process`. It is freed when both sides have let go, which covers a
//! parent that exits without waiting.

pub mod record;
pub mod stack;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, info, warn};
use spin::{Mutex, MutexGuard};

use crate::exception::{Flow, IntrFrame};
use crate::kernel::Kernel;
use crate::mm::{PageDir, PagePool, UserAddr, PAGE_SIZE};
use crate::sync::Semaphore;

pub use record::LifecycleRecord;
pub use stack::StackError;

/// Exit status of a process the kernel killed, and of one that never
/// loaded.
pub const EXIT_KILLED: i32 = -1;

/// Thread (and process) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub i32);

impl Tid {
    /// Returned when a process could not be created.
    pub const ERROR: Self = Self(-1);
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body of a new kernel thread. Receives the thread's own id.
pub type ThreadEntry = Box<dyn FnOnce(Tid) + Send>;

/// The thread scheduler.
pub trait Threads: Send + Sync {
    /// Create a thread and make it runnable. `None` if no thread could be
    /// created.
    fn spawn(&self, name: &str, priority: u8, entry: ThreadEntry) -> Option<Tid>;

    /// A semaphore whose `down` blocks the calling thread until another
    /// thread calls `up`. Used for the exec and wait handshakes.
    fn semaphore(&self, value: u32) -> Box<dyn Semaphore>;
}

/// A program image ready to run.
#[derive(Debug)]
pub struct LoadedImage {
    /// Address space with the program's segments and a mapped stack page.
    pub pagedir: PageDir,
    pub entry: UserAddr,
    /// Initial stack pointer, before any arguments are pushed.
    pub stack_top: UserAddr,
}

/// The executable loader.
pub trait Loader: Send + Sync {
    /// Load `program` into a fresh address space, taking pages from `pool`.
    fn load(&self, program: &str, pool: &Arc<PagePool>) -> Option<LoadedImage>;
}

/// The jump into user mode.
pub trait UserEntry: Send + Sync {
    /// Start running user code with `frame`. On hardware this never
    /// returns; once it does, the process is treated as finished.
    fn enter(&self, kernel: &Arc<Kernel>, process: &Arc<Process>, frame: IntrFrame);
}

/// A running process.
pub struct Process {
    tid: Tid,
    name: String,
    /// Shared with the parent. `None` for kernel threads.
    record: Option<Arc<LifecycleRecord>>,
    children: Mutex<Vec<Arc<LifecycleRecord>>>,
    pagedir: Mutex<Option<PageDir>>,
    /// `esp` at the most recent system call.
    user_sp: AtomicU32,
    exited: AtomicBool,
}

impl Process {
    /// A kernel thread that can start and wait for user processes but was
    /// not started by one.
    pub fn kernel(tid: Tid, name: &str) -> Self {
        Self::with_record(tid, String::from(name), None)
    }

    fn user(tid: Tid, name: String, record: Arc<LifecycleRecord>) -> Self {
        Self::with_record(tid, name, Some(record))
    }

    fn with_record(tid: Tid, name: String, record: Option<Arc<LifecycleRecord>>) -> Self {
        Self {
            tid,
            name,
            record,
            children: Mutex::new(Vec::new()),
            pagedir: Mutex::new(None),
            user_sp: AtomicU32::new(0),
            exited: AtomicBool::new(false),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> Option<&Arc<LifecycleRecord>> {
        self.record.as_ref()
    }

    pub fn set_exit_status(&self, status: i32) {
        if let Some(record) = &self.record {
            record.set_exit_status(status);
        }
    }

    pub fn exit_status(&self) -> i32 {
        self.record
            .as_ref()
            .map_or(EXIT_KILLED, |record| record.exit_status())
    }

    /// The process's user address space, `None` if it has none (yet).
    pub fn pagedir(&self) -> MutexGuard<'_, Option<PageDir>> {
        self.pagedir.lock()
    }

    pub fn set_user_sp(&self, sp: UserAddr) {
        self.user_sp.store(sp.as_u32(), Ordering::Relaxed);
    }

    pub fn user_sp(&self) -> UserAddr {
        UserAddr::new(self.user_sp.load(Ordering::Relaxed))
    }

    /// Number of children not yet waited for.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    fn is_loaded(&self) -> bool {
        self.record.as_ref().is_some_and(|record| record.is_loaded())
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .finish()
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Text of a NUL-terminated command line page.
fn page_text(page: &[u8]) -> &str {
    let len = page.iter().position(|&b| b == 0).unwrap_or(page.len());
    core::str::from_utf8(&page[..len]).unwrap_or("")
}

impl Kernel {
    /// Start a user process running `cmdline` as a child of `parent`.
    ///
    /// Returns once the child has finished starting up. A program that
    /// fails to load still gets a valid id; waiting for it yields -1.
    /// Returns `Tid::ERROR` if no page or thread was available.
    pub fn process_execute(self: &Arc<Self>, parent: &Process, cmdline: &str) -> Tid {
        let Some(mut page) = self.pool().alloc_page() else {
            warn!("exec {:?}: out of pages", cmdline);
            return Tid::ERROR;
        };
        let text = truncate(cmdline, PAGE_SIZE - 1);
        page[..text.len()].copy_from_slice(text.as_bytes());

        let name = String::from(stack::tokenize(text).first().copied().unwrap_or(text));
        let record = Arc::new(LifecycleRecord::new(page, &*self.threads));

        let entry: ThreadEntry = {
            let kernel = Arc::clone(self);
            let record = Arc::clone(&record);
            Box::new(move |tid| kernel.start_process(record, tid))
        };
        let Some(tid) = self
            .threads
            .spawn(&name, self.config().thread_priority, entry)
        else {
            warn!("exec {:?}: thread creation failed", name);
            return Tid::ERROR;
        };

        record.wait_started();
        parent.children.lock().push(record);
        debug!("{} started child {} ({})", parent.name(), tid, name);
        tid
    }

    /// Body of a new process's thread.
    fn start_process(self: &Arc<Self>, record: Arc<LifecycleRecord>, tid: Tid) {
        record.set_pid(tid);

        let (process, frame) = {
            let cmdline = record.take_cmdline();
            let args = stack::tokenize(cmdline.as_deref().map_or("", page_text));
            let name = String::from(args.first().copied().unwrap_or(""));
            let process = Arc::new(Process::user(tid, name, Arc::clone(&record)));
            let frame = self.load(&process, &args);
            (process, frame)
        };

        record.set_loaded(frame.is_some());
        record.signal_started();

        if let Some(frame) = frame {
            info!("{} (tid {}) loaded, entry {:#010x}", process.name(), tid, frame.eip);
            self.user.enter(self, &process, frame);
        }
        self.process_exit(&process);
    }

    /// Load the program named by `args[0]` into a new address space for
    /// `process` and build its initial frame.
    fn load(&self, process: &Process, args: &[&str]) -> Option<IntrFrame> {
        let Some(program) = args.first() else {
            warn!("tid {}: empty command line", process.tid());
            return None;
        };
        let Some(image) = self.loader.load(program, self.pool()) else {
            warn!("load: {}: open failed", program);
            return None;
        };
        let LoadedImage {
            mut pagedir,
            entry,
            stack_top,
        } = image;

        let sp = match stack::build(&mut pagedir, stack_top, args) {
            Ok(sp) => sp,
            Err(e) => {
                warn!("load: {}: {}", program, e);
                self.mmu.destroy(pagedir);
                return None;
            }
        };

        self.mmu.activate(Some(&pagedir));
        *process.pagedir() = Some(pagedir);
        Some(IntrFrame::user(entry, sp))
    }

    /// Wait for `child` to exit and return its status.
    ///
    /// Returns -1 at once if `child` is not an unreaped child of `parent`,
    /// which includes a second wait on the same child.
    pub fn process_wait(&self, parent: &Process, child: Tid) -> i32 {
        let record = parent
            .children
            .lock()
            .iter()
            .find(|record| record.pid() == Some(child))
            .cloned();
        let Some(record) = record else {
            debug!("{}: wait({}): not a child", parent.name(), child);
            return EXIT_KILLED;
        };

        if !record.is_finished() {
            record.wait_exited();
        }

        parent
            .children
            .lock()
            .retain(|other| !Arc::ptr_eq(other, &record));
        record.exit_status()
    }

    /// Tear down `process`. Runs once per process; later calls are no-ops.
    pub fn process_exit(&self, process: &Process) {
        if process.exited.swap(true, Ordering::AcqRel) {
            return;
        }

        let status = process.exit_status();
        if process.is_loaded() {
            let line = format!("{}: exit({})\n", process.name(), status);
            self.console().put_bytes(line.as_bytes());
        }

        let closed = self.files().lock().close_all(process.tid());

        let orphans = {
            let mut children = process.children.lock();
            for child in children.iter() {
                child.orphan();
            }
            let count = children.len();
            children.clear();
            count
        };

        info!(
            "{} (tid {}) exited with {}, closed {} files, left {} children",
            process.name(),
            process.tid(),
            status,
            closed,
            orphans
        );

        if let Some(record) = process.record() {
            record.finish();
        }

        let pagedir = process.pagedir().take();
        if let Some(pagedir) = pagedir {
            // Switch away before the directory goes.
            self.mmu.activate(None);
            self.mmu.destroy(pagedir);
        }
    }

    /// Kill `process` with status -1.
    pub fn terminate(&self, process: &Process) -> Flow {
        process.set_exit_status(EXIT_KILLED);
        Flow::Exit
    }
}
