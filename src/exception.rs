//! x86 Trap Handling
//!
//! Defines the trapped register frame and routes traps raised by user code
//! into the kernel.
//!
//! # Trap Sources
//! - `int 0x30`: system calls
//! - Vector 14: page faults
//! - Vectors 0-31: other CPU exceptions
//!
//! # Security Considerations
//! - Any fault raised by user code terminates that process with -1
//! - The kernel never resumes a process after a fault

use alloc::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};

use crate::kernel::Kernel;
use crate::mm::UserAddr;
use crate::process::Process;

/// User code segment selector (GDT index 3, RPL 3).
pub const SEL_UCSEG: u16 = 0x1B;
/// User data segment selector (GDT index 4, RPL 3).
pub const SEL_UDSEG: u16 = 0x23;

/// Interrupt vectors the process layer cares about.
pub mod vectors {
    pub const PAGE_FAULT: u8 = 14;
    /// First vector not reserved for CPU exceptions.
    pub const FIRST_IRQ: u8 = 0x20;
    pub const SYSCALL: u8 = 0x30;
}

bitflags! {
    /// EFLAGS bits set in a fresh user frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        /// Reserved bit 1, must be set.
        const MBS = 1 << 1;
        /// Interrupts enabled.
        const IF = 1 << 9;
    }
}

/// Register state saved when user code enters the kernel
///
/// Only the registers the kernel reads or writes, in no particular order.
/// The trap entry stub copies them out of the hardware frame and back
/// again on return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrFrame {
    /// Return value register.
    pub eax: u32,
    /// User instruction pointer.
    pub eip: u32,
    pub cs: u16,
    pub eflags: u32,
    /// User stack pointer at trap time.
    pub esp: u32,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
}

impl IntrFrame {
    /// Initial frame for a process about to enter user mode at `entry` with
    /// stack pointer `sp`.
    pub fn user(entry: UserAddr, sp: UserAddr) -> Self {
        Self {
            eax: 0,
            eip: entry.as_u32(),
            cs: SEL_UCSEG,
            eflags: (EFlags::IF | EFlags::MBS).bits(),
            esp: sp.as_u32(),
            ss: SEL_UDSEG,
            ds: SEL_UDSEG,
            es: SEL_UDSEG,
        }
    }

    /// Store a syscall result in `eax`.
    #[inline]
    pub fn set_return(&mut self, value: i32) {
        self.eax = value as u32;
    }

    #[inline]
    pub fn sp(&self) -> UserAddr {
        UserAddr::new(self.esp)
    }
}

/// What the trap glue does after the kernel has handled a trap.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Return to user mode with the (possibly updated) frame.
    Resume,
    /// The process is done; end its thread.
    Exit,
    /// Power the machine off.
    PowerOff,
}

impl Kernel {
    /// Entry point for every trap taken while `process` was in user mode.
    ///
    /// `fault_addr` is the faulting linear address (CR2) for page faults
    /// and ignored otherwise.
    pub fn handle_trap(
        self: &Arc<Self>,
        process: &Arc<Process>,
        vector: u8,
        frame: &mut IntrFrame,
        fault_addr: u32,
    ) -> Flow {
        match vector {
            vectors::SYSCALL => self.dispatch(process, frame),
            vectors::PAGE_FAULT => {
                warn!(
                    "{}: page fault at {:#010x} (eip {:#010x}, last syscall esp {})",
                    process.name(),
                    fault_addr,
                    frame.eip,
                    process.user_sp()
                );
                self.terminate(process)
            }
            v if v < vectors::FIRST_IRQ => {
                warn!(
                    "{}: exception {} at eip {:#010x}",
                    process.name(),
                    v,
                    frame.eip
                );
                self.terminate(process)
            }
            v => {
                debug!("vector {:#x} is not a user trap", v);
                Flow::Resume
            }
        }
    }
}
