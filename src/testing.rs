//! Host collaborators for unit tests
//!
//! Kernel threads are std threads, the filesystem lives in memory and
//! "user programs" are Rust closures that reach the kernel by writing
//! syscall words onto their own user stack and trapping.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::KernelConfig;
use crate::drivers::Console;
use crate::exception::{vectors, Flow, IntrFrame};
use crate::fs::{File, FileSystem, IoError};
use crate::kernel::{Kernel, Platform};
use crate::mm::{Mmu, PageDir, PagePool, UserAddr, PAGE_SIZE, PHYS_BASE};
use crate::process::{LoadedImage, Loader, Process, ThreadEntry, Threads, Tid, UserEntry};
use crate::sync::{Semaphore, SpinSemaphore};
use crate::syscall::numbers::{SYS_EXEC, SYS_EXIT, SYS_WAIT};

/// Where test programs' read-only code page is mapped.
pub const CODE_BASE: u32 = 0x0804_8000;
/// Where `UserCtx::data_pages` maps extra writable pages.
pub const DATA_BASE: u32 = 0x1000_0000;

/// Bytes at the bottom of the stack page handed out by `UserCtx::alloc`.
const SCRATCH: u32 = 2048;

/// Console that keeps everything printed to it.
#[derive(Default)]
pub struct CaptureConsole {
    bytes: Mutex<Vec<u8>>,
}

impl CaptureConsole {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock().unwrap()).into_owned()
    }
}

impl Console for CaptureConsole {
    fn put_bytes(&self, bytes: &[u8]) {
        self.bytes.lock().unwrap().extend_from_slice(bytes);
    }
}

/// Kernel threads on std threads.
pub struct StdThreads {
    next: AtomicI32,
    fail: AtomicBool,
    semaphores: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for StdThreads {
    fn default() -> Self {
        Self {
            next: AtomicI32::new(2),
            fail: AtomicBool::new(false),
            semaphores: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl StdThreads {
    /// Make the next `spawn` fail.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Number of semaphores handed out.
    pub fn semaphores(&self) -> usize {
        self.semaphores.load(Ordering::SeqCst)
    }

    /// Join every thread spawned so far, including ones spawned meanwhile.
    pub fn join_all(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles.lock().unwrap());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                handle.join().unwrap();
            }
        }
    }
}

impl Threads for StdThreads {
    fn spawn(&self, name: &str, _priority: u8, entry: ThreadEntry) -> Option<Tid> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return None;
        }
        let tid = Tid(self.next.fetch_add(1, Ordering::SeqCst));
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || entry(tid))
            .ok()?;
        self.handles.lock().unwrap().push(handle);
        Some(tid)
    }

    fn semaphore(&self, value: u32) -> Box<dyn Semaphore> {
        self.semaphores.fetch_add(1, Ordering::SeqCst);
        Box::new(SpinSemaphore::new(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuEvent {
    /// `true` for a user directory, `false` for the kernel-only one.
    Activate(bool),
    Destroy,
}

/// MMU that records what it was asked to do.
#[derive(Default)]
pub struct RecordingMmu {
    events: Mutex<Vec<MmuEvent>>,
}

impl RecordingMmu {
    pub fn events(&self) -> Vec<MmuEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Mmu for RecordingMmu {
    fn activate(&self, dir: Option<&PageDir>) {
        self.events
            .lock()
            .unwrap()
            .push(MmuEvent::Activate(dir.is_some()));
    }

    fn destroy(&self, dir: PageDir) {
        self.events.lock().unwrap().push(MmuEvent::Destroy);
        drop(dir);
    }
}

#[derive(Default)]
struct FsInner {
    files: Mutex<BTreeMap<String, Arc<Mutex<Vec<u8>>>>>,
    inside: AtomicUsize,
    max_inside: AtomicUsize,
    open: AtomicUsize,
}

/// Marks one call in progress inside the filesystem.
struct InsideFs<'a>(&'a FsInner);

impl<'a> InsideFs<'a> {
    fn enter(fs: &'a FsInner) -> Self {
        let now = fs.inside.fetch_add(1, Ordering::SeqCst) + 1;
        fs.max_inside.fetch_max(now, Ordering::SeqCst);
        // Give a racing caller the chance to show up.
        thread::yield_now();
        Self(fs)
    }
}

impl Drop for InsideFs<'_> {
    fn drop(&mut self) {
        self.0.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory filesystem with fixed-size files, counting how many calls are
/// ever inside it at once.
#[derive(Clone, Default)]
pub struct MemFs {
    inner: Arc<FsInner>,
}

impl MemFs {
    /// Add a file without going through the filesystem interface.
    pub fn insert(&self, name: &str, data: &[u8]) {
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(name.into(), Arc::new(Mutex::new(data.to_vec())));
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Most calls ever in progress at the same time.
    pub fn max_overlap(&self) -> usize {
        self.inner.max_inside.load(Ordering::SeqCst)
    }
}

impl FileSystem for MemFs {
    fn create(&mut self, name: &str, size: u32) -> bool {
        let _inside = InsideFs::enter(&self.inner);
        let mut files = self.inner.files.lock().unwrap();
        if files.contains_key(name) {
            return false;
        }
        files.insert(name.into(), Arc::new(Mutex::new(vec![0; size as usize])));
        true
    }

    fn open(&mut self, name: &str) -> Option<Box<dyn File>> {
        let _inside = InsideFs::enter(&self.inner);
        let data = Arc::clone(self.inner.files.lock().unwrap().get(name)?);
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(MemFile {
            data,
            pos: 0,
            fs: Arc::clone(&self.inner),
        }))
    }
}

struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
    fs: Arc<FsInner>,
}

impl File for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let _inside = InsideFs::enter(&self.fs);
        let data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(self.pos));
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        let _inside = InsideFs::enter(&self.fs);
        let mut data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(self.pos));
        data[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
        self.pos += n;
        Ok(n)
    }

    fn length(&self) -> u32 {
        let _inside = InsideFs::enter(&self.fs);
        self.data.lock().unwrap().len() as u32
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.fs.open.fetch_sub(1, Ordering::SeqCst);
    }
}

type Program = Arc<dyn Fn(&UserCtx) + Send + Sync>;

/// Loader and user-mode entry for closure programs.
#[derive(Default)]
pub struct Programs {
    programs: Mutex<HashMap<String, Program>>,
    panics: Mutex<Vec<String>>,
}

impl Loader for Programs {
    fn load(&self, program: &str, pool: &Arc<PagePool>) -> Option<LoadedImage> {
        if !self.programs.lock().unwrap().contains_key(program) {
            return None;
        }
        let mut pagedir = PageDir::new();
        pagedir
            .map(UserAddr::new(CODE_BASE), pool.alloc_page()?, false)
            .ok()?;
        let stack_top = pagedir.map_stack(pool).ok()?;
        Some(LoadedImage {
            pagedir,
            entry: UserAddr::new(CODE_BASE),
            stack_top,
        })
    }
}

impl UserEntry for Programs {
    fn enter(&self, kernel: &Arc<Kernel>, process: &Arc<Process>, frame: IntrFrame) {
        let program = self.programs.lock().unwrap().get(process.name()).cloned();
        let Some(program) = program else {
            return;
        };
        let ctx = UserCtx {
            kernel: Arc::clone(kernel),
            process: Arc::clone(process),
            initial: frame,
            scratch: Cell::new(PHYS_BASE - PAGE_SIZE as u32),
            next_data: Cell::new(DATA_BASE),
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| program(&ctx))) {
            let message = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_default();
            self.panics
                .lock()
                .unwrap()
                .push(format!("{}: {}", process.name(), message));
        }
    }
}

/// What a closure program can do from "user mode".
pub struct UserCtx {
    kernel: Arc<Kernel>,
    process: Arc<Process>,
    initial: IntrFrame,
    scratch: Cell<u32>,
    next_data: Cell<u32>,
}

impl UserCtx {
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// `argv` as found on the initial stack.
    pub fn args(&self) -> Vec<String> {
        let sp = self.initial.esp;
        let argc = self.word(sp + 4);
        let argv = self.word(sp + 8);
        (0..argc)
            .map(|i| {
                let mut ptr = self.word(argv + 4 * i);
                let mut bytes = Vec::new();
                loop {
                    let b = self.peek(ptr, 1)[0];
                    if b == 0 {
                        break;
                    }
                    bytes.push(b);
                    ptr += 1;
                }
                String::from_utf8(bytes).unwrap()
            })
            .collect()
    }

    /// Reserve `len` zeroed bytes at the bottom of the stack page.
    pub fn alloc(&self, len: usize) -> u32 {
        let at = self.scratch.get();
        let end = at + ((len as u32 + 3) & !3);
        assert!(end <= PHYS_BASE - PAGE_SIZE as u32 + SCRATCH, "scratch full");
        self.scratch.set(end);
        at
    }

    pub fn bytes(&self, data: &[u8]) -> u32 {
        let at = self.alloc(data.len());
        self.poke(at, data);
        at
    }

    pub fn cstr(&self, s: &str) -> u32 {
        let at = self.alloc(s.len() + 1);
        self.poke(at, s.as_bytes());
        at
    }

    /// Map `count` fresh writable pages and return the first one's address.
    pub fn data_pages(&self, count: usize) -> u32 {
        let start = self.next_data.get();
        let mut pagedir = self.process.pagedir();
        let pagedir = pagedir.as_mut().unwrap();
        for i in 0..count as u32 {
            let page = self.kernel.pool().alloc_page().unwrap();
            pagedir
                .map(UserAddr::new(start + i * PAGE_SIZE as u32), page, true)
                .unwrap();
        }
        self.next_data.set(start + count as u32 * PAGE_SIZE as u32);
        start
    }

    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        let pagedir = self.process.pagedir();
        pagedir
            .as_ref()
            .unwrap()
            .read(UserAddr::new(addr), &mut out)
            .unwrap();
        out
    }

    pub fn poke(&self, addr: u32, data: &[u8]) {
        let mut pagedir = self.process.pagedir();
        pagedir
            .as_mut()
            .unwrap()
            .write(UserAddr::new(addr), data)
            .unwrap();
    }

    fn word(&self, addr: u32) -> u32 {
        let bytes = self.peek(addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Issue a system call. `Ok(eax)` if the process resumes.
    pub fn syscall(&self, words: &[u32]) -> Result<u32, Flow> {
        let esp = (self.initial.esp - 64) & !3;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.poke(esp, &bytes);
        match self.raw_trap(vectors::SYSCALL, esp, 0) {
            (Flow::Resume, frame) => Ok(frame.eax),
            (flow, _) => Err(flow),
        }
    }

    /// Trap into the kernel with `esp` pointing wherever the caller likes.
    pub fn raw_syscall(&self, esp: u32) -> Flow {
        self.raw_trap(vectors::SYSCALL, esp, 0).0
    }

    /// Raise `vector` as if the CPU had.
    pub fn trap(&self, vector: u8, fault_addr: u32) -> Flow {
        self.raw_trap(vector, self.initial.esp, fault_addr).0
    }

    fn raw_trap(&self, vector: u8, esp: u32, fault_addr: u32) -> (Flow, IntrFrame) {
        let mut frame = IntrFrame {
            esp,
            ..self.initial
        };
        let flow = self
            .kernel
            .handle_trap(&self.process, vector, &mut frame, fault_addr);
        (flow, frame)
    }

    pub fn exit(&self, status: i32) -> Flow {
        self.syscall(&[SYS_EXIT, status as u32])
            .err()
            .unwrap_or(Flow::Resume)
    }

    pub fn exec(&self, cmdline: &str) -> i32 {
        let ptr = self.cstr(cmdline);
        self.syscall(&[SYS_EXEC, ptr]).map_or(-1, |tid| tid as i32)
    }

    pub fn wait(&self, tid: i32) -> i32 {
        self.syscall(&[SYS_WAIT, tid as u32])
            .map_or(-1, |status| status as i32)
    }
}

/// A kernel wired to host collaborators, with a boot thread to act as the
/// parent of everything it starts.
pub struct Harness {
    pub kernel: Arc<Kernel>,
    pub console: Arc<CaptureConsole>,
    pub fs: MemFs,
    pub mmu: Arc<RecordingMmu>,
    pub threads: Arc<StdThreads>,
    pub programs: Arc<Programs>,
    pub init: Arc<Process>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let console = Arc::new(CaptureConsole::default());
        let fs = MemFs::default();
        let mmu = Arc::new(RecordingMmu::default());
        let threads = Arc::new(StdThreads::default());
        let programs = Arc::new(Programs::default());

        let kernel = Kernel::new(
            config,
            Platform {
                threads: threads.clone(),
                loader: programs.clone(),
                user: programs.clone(),
                mmu: mmu.clone(),
                console: console.clone(),
                filesys: Box::new(fs.clone()),
            },
        );

        Self {
            kernel,
            console,
            fs,
            mmu,
            threads,
            programs,
            init: Arc::new(Process::kernel(Tid(1), "main")),
        }
    }

    /// Register a program under `name`.
    pub fn program(&self, name: &str, body: impl Fn(&UserCtx) + Send + Sync + 'static) {
        self.programs
            .programs
            .lock()
            .unwrap()
            .insert(name.into(), Arc::new(body));
    }

    pub fn exec(&self, cmdline: &str) -> Tid {
        self.kernel.process_execute(&self.init, cmdline)
    }

    /// Wait for a child of the boot thread, failing the test if any program
    /// panicked.
    pub fn wait(&self, tid: Tid) -> i32 {
        let status = self.kernel.process_wait(&self.init, tid);
        let panics = self.programs.panics.lock().unwrap();
        assert!(panics.is_empty(), "program panicked: {:?}", *panics);
        status
    }
}
