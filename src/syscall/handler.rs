//! System Call Handler
//!
//! Decodes a trapped `int 0x30` and runs the matching handler.
//!
//! # Calling Convention
//! The call number is the 32-bit word at the user `esp`, arguments are the
//! words above it. Results go back in `eax`.
//!
//! # Security Considerations
//! - Only the calls in `numbers` are implemented; anything else is fatal
//! - Every argument word and every buffer is validated before use
//! - A validation failure terminates the caller with status -1

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;

use log::{debug, warn};

use crate::exception::{Flow, IntrFrame};
use crate::fs::Fd;
use crate::kernel::Kernel;
use crate::mm::{PageDir, UserAddr, PAGE_SIZE};
use crate::process::{Process, Tid};

use super::validate::{self, Fault};

/// System call numbers
pub mod numbers {
    pub const SYS_HALT: u32 = 0;
    pub const SYS_EXIT: u32 = 1;
    pub const SYS_EXEC: u32 = 2;
    pub const SYS_WAIT: u32 = 3;
    pub const SYS_CREATE: u32 = 4;
    pub const SYS_OPEN: u32 = 6;
    pub const SYS_FILESIZE: u32 = 7;
    pub const SYS_READ: u32 = 8;
    pub const SYS_WRITE: u32 = 9;
    pub const SYS_CLOSE: u32 = 12;
}

/// An implemented system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt,
    Exit,
    Exec,
    Wait,
    Create,
    Open,
    Filesize,
    Read,
    Write,
    Close,
}

impl Syscall {
    pub fn from_u32(nr: u32) -> Option<Self> {
        use numbers::*;
        Some(match nr {
            SYS_HALT => Self::Halt,
            SYS_EXIT => Self::Exit,
            SYS_EXEC => Self::Exec,
            SYS_WAIT => Self::Wait,
            SYS_CREATE => Self::Create,
            SYS_OPEN => Self::Open,
            SYS_FILESIZE => Self::Filesize,
            SYS_READ => Self::Read,
            SYS_WRITE => Self::Write,
            SYS_CLOSE => Self::Close,
            _ => return None,
        })
    }
}

/// Reasons a system call kills its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// A user pointer failed validation.
    Fault(Fault),
    /// Invalid system call number
    UnknownCall(u32),
    /// The caller has no user address space.
    NoAddressSpace,
}

impl From<Fault> for SyscallError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => write!(f, "bad user pointer: {}", fault),
            Self::UnknownCall(nr) => write!(f, "system call {} is unimplemented", nr),
            Self::NoAddressSpace => write!(f, "no user address space"),
        }
    }
}

type SysResult<T> = Result<T, SyscallError>;

/// Run `f` against the process's page directory.
fn with_pagedir<T>(
    process: &Process,
    f: impl FnOnce(&mut PageDir) -> Result<T, Fault>,
) -> SysResult<T> {
    let mut pagedir = process.pagedir();
    let pagedir = pagedir.as_mut().ok_or(SyscallError::NoAddressSpace)?;
    Ok(f(pagedir)?)
}

/// The `index`th word on the trapped stack (0 is the call number).
fn arg(process: &Process, esp: UserAddr, index: u32) -> SysResult<u32> {
    let addr = esp.word(index).ok_or(Fault::Overflow)?;
    with_pagedir(process, |pd| validate::read_u32(pd, addr))
}

/// A NUL-terminated user string. The terminator must fall within one page;
/// anything longer is a fault.
fn user_str(process: &Process, ptr: u32) -> SysResult<String> {
    let bytes = with_pagedir(process, |pd| {
        validate::read_cstr(pd, UserAddr::new(ptr), PAGE_SIZE)
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

impl Kernel {
    /// Handle a system call trapped from `process`.
    pub fn dispatch(self: &Arc<Self>, process: &Arc<Process>, frame: &mut IntrFrame) -> Flow {
        let esp = frame.sp();
        process.set_user_sp(esp);

        match self.syscall(process, frame, esp) {
            Ok(flow) => flow,
            Err(e) => {
                warn!("{}: {}", process.name(), e);
                self.terminate(process)
            }
        }
    }

    fn syscall(
        self: &Arc<Self>,
        process: &Arc<Process>,
        frame: &mut IntrFrame,
        esp: UserAddr,
    ) -> SysResult<Flow> {
        let nr = arg(process, esp, 0)?;
        let call = Syscall::from_u32(nr).ok_or(SyscallError::UnknownCall(nr))?;
        debug!("{}: {:?}", process.name(), call);

        let a = |index| arg(process, esp, index);
        let result = match call {
            Syscall::Halt => return Ok(Flow::PowerOff),
            Syscall::Exit => {
                process.set_exit_status(a(1)? as i32);
                return Ok(Flow::Exit);
            }
            Syscall::Exec => self.sys_exec(process, a(1)?)?,
            Syscall::Wait => self.process_wait(process, Tid(a(1)? as i32)),
            Syscall::Create => self.sys_create(process, a(1)?, a(2)? as i32)? as i32,
            Syscall::Open => self.sys_open(process, a(1)?)?,
            Syscall::Filesize => self.sys_filesize(process, a(1)? as i32),
            Syscall::Read => self.sys_read(process, a(1)? as i32, a(2)?, a(3)?)?,
            Syscall::Write => self.sys_write(process, a(1)? as i32, a(2)?, a(3)?)?,
            Syscall::Close => {
                self.sys_close(process, a(1)? as i32);
                return Ok(Flow::Resume);
            }
        };

        frame.set_return(result);
        Ok(Flow::Resume)
    }

    /// Start a child process. The filesystem lock is held while the child
    /// loads.
    fn sys_exec(self: &Arc<Self>, process: &Process, cmdline: u32) -> SysResult<i32> {
        let cmdline = user_str(process, cmdline)?;
        let _fs = self.files().lock();
        Ok(self.process_execute(process, &cmdline).0)
    }

    fn sys_create(&self, process: &Process, name: u32, size: i32) -> SysResult<bool> {
        let name = user_str(process, name)?;
        let Ok(size) = u32::try_from(size) else {
            debug!("{}: create({:?}): negative size {}", process.name(), name, size);
            return Ok(false);
        };
        Ok(self.files().lock().create(&name, size))
    }

    fn sys_open(&self, process: &Process, name: u32) -> SysResult<i32> {
        let name = user_str(process, name)?;
        let fd = self.files().lock().open(process.tid(), &name);
        Ok(fd.map_or(-1, Fd::as_i32))
    }

    fn sys_filesize(&self, process: &Process, fd: i32) -> i32 {
        self.files()
            .lock()
            .filesize(process.tid(), Fd::new(fd))
            .map_or(-1, |len| len as i32)
    }

    /// Read up to `size` bytes from `fd` into the user buffer at `buf`.
    ///
    /// Data moves through a one-page bounce buffer, all under one
    /// acquisition of the filesystem lock.
    fn sys_read(&self, process: &Process, fd: i32, buf: u32, size: u32) -> SysResult<i32> {
        let size = size as usize;
        let out = with_pagedir(process, |pd| validate::validate_user_write(pd, buf, size))?;

        // No keyboard driver.
        if Fd::new(fd) == Fd::STDIN {
            return Ok(-1);
        }

        let mut files = self.files().lock();
        let Some(file) = files.file(process.tid(), Fd::new(fd)) else {
            return Ok(-1);
        };

        let mut bounce = vec![0u8; size.min(PAGE_SIZE)];
        let mut done = 0;
        while done < size {
            let want = (size - done).min(PAGE_SIZE);
            let got = match file.read(&mut bounce[..want]) {
                Ok(got) => got,
                Err(e) if done == 0 => {
                    debug!("{}: read({}): {}", process.name(), fd, e);
                    return Ok(-1);
                }
                Err(_) => break,
            };
            with_pagedir(process, |pd| out.copy_out(pd, done, &bounce[..got]))?;
            done += got;
            if got < want {
                break;
            }
        }
        Ok(done as i32)
    }

    /// Write `size` bytes from the user buffer at `buf` to `fd`.
    fn sys_write(&self, process: &Process, fd: i32, buf: u32, size: u32) -> SysResult<i32> {
        let size = size as usize;
        let input = with_pagedir(process, |pd| validate::validate_user_read(pd, buf, size))?;

        let mut files = self.files().lock();
        let mut bounce = vec![0u8; size.min(PAGE_SIZE)];

        if Fd::new(fd) == Fd::STDOUT {
            let mut done = 0;
            while done < size {
                let n = (size - done).min(PAGE_SIZE);
                with_pagedir(process, |pd| input.copy_in(pd, done, &mut bounce[..n]))?;
                self.console().put_bytes(&bounce[..n]);
                done += n;
            }
            return Ok(size as i32);
        }

        let Some(file) = files.file(process.tid(), Fd::new(fd)) else {
            return Ok(-1);
        };

        let mut done = 0;
        while done < size {
            let n = (size - done).min(PAGE_SIZE);
            with_pagedir(process, |pd| input.copy_in(pd, done, &mut bounce[..n]))?;
            let wrote = match file.write(&bounce[..n]) {
                Ok(wrote) => wrote,
                Err(e) if done == 0 => {
                    debug!("{}: write({}): {}", process.name(), fd, e);
                    return Ok(-1);
                }
                Err(_) => break,
            };
            done += wrote;
            if wrote < n {
                break;
            }
        }
        Ok(done as i32)
    }

    fn sys_close(&self, process: &Process, fd: i32) {
        if !self.files().lock().close(process.tid(), Fd::new(fd)) {
            debug!("{}: close({}): not open", process.name(), fd);
        }
    }
}
