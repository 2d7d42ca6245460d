//! userprog - user process layer for a teaching x86 kernel
//!
//! Creates user processes from command lines, builds their initial
//! `argc/argv` stacks, lets parents wait for children, and carries system
//! calls across the user/kernel boundary.
//!
//! # Layout
//! - `kernel`: the context object owning every collaborator
//! - `process`: lifecycle records, stack images, exec/wait/exit
//! - `syscall`: dispatch, handlers and user-pointer validation
//! - `fs`: the filesystem lock and per-process descriptor tables
//! - `mm`: user addresses, page pool, user page directories
//! - `exception`: trapped frame and trap routing
//!
//! # Security Features
//! - Every user pointer is validated before the kernel reads or writes it
//! - Invalid user input terminates the offending process, never the kernel
//! - All filesystem access is serialized behind one lock
//!
//! The thread scheduler, the MMU, the ELF loader, the filesystem and the
//! console are collaborators supplied by the platform through traits.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod exception;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;

#[cfg(test)]
mod testing;

pub use config::KernelConfig;
pub use exception::{Flow, IntrFrame};
pub use kernel::{Kernel, Platform};
pub use process::{Process, Tid};
