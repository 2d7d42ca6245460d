//! Counting semaphore
//!
//! Used as a one-shot signal between a parent and child process: the
//! parent `down`s, the child `up`s once. The scheduler supplies the
//! implementation through [`Threads::semaphore`], so a waiter sleeps in the
//! scheduler and the thread that will signal it gets the CPU.
//!
//! [`Threads::semaphore`]: crate::process::Threads::semaphore

/// A counting semaphore owned by the scheduler.
pub trait Semaphore: Send + Sync {
    /// Block until the count is positive, then decrement it.
    fn down(&self);

    /// Increment the count, waking one waiter.
    fn up(&self);
}

#[cfg(test)]
pub use host::SpinSemaphore;
