//! Device-facing interfaces
//!
//! The process layer only needs a console; the device behind it is
//! provided by the platform.

pub mod console;

pub use console::{Console, ConsoleLogger, ConsoleWriter};
