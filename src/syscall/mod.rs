//! System Call Interface
//!
//! The boundary user programs cross with `int 0x30`.
//!
//! # Security Model
//! - Whitelist approach: only explicitly implemented syscalls are allowed
//! - All parameters are validated against the caller's page directory
//! - Invalid inputs kill the caller, never the kernel
//!
//! # Current Syscalls
//! - 0: halt()
//! - 1: exit(status)
//! - 2: exec(cmdline), 3: wait(pid)
//! - 4: create(name, size), 6: open(name), 7: filesize(fd)
//! - 8: read(fd, buf, n), 9: write(fd, buf, n), 12: close(fd)

mod handler;
pub mod validate;

pub use handler::{numbers, Syscall, SyscallError};
pub use validate::{Fault, UserBuffer, UserBufferMut};
