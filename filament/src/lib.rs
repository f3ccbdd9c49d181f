// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperative user-space multitasking runtime.
//!
//! `filament` multiplexes many lightweight tasks, each with its own call
//! stack, onto the OS threads that create them. Scheduling is strictly
//! cooperative: a task runs until it reaches a suspension point — an I/O
//! wait, a sleep, a condition wait, an explicit [`yield_now`], a
//! [`compute`] offload, or its exit — and owns its OS thread in between.
//!
//! Each OS thread that spawns tasks gets its own scheduler; tasks stay on
//! the scheduler that created them for life. The only way a task ever
//! touches another OS thread is the [`compute`] pool, which borrows
//! CPU-bound tasks, runs them to their next suspension on a worker thread
//! and hands them back.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let echo = filament::spawn(|| {
//!     filament::sleep(Duration::from_millis(10)).unwrap();
//!     "done"
//! })
//! .unwrap();
//!
//! filament::spawn(move || {
//!     assert_eq!(echo.join().unwrap(), "done");
//! })
//! .unwrap();
//!
//! filament::run().unwrap();
//! ```

pub mod compute;
pub mod counters;
mod error;
mod poller;
mod scheduler;
pub mod sync;
mod task;
mod time;

pub use error::Error;
pub use poller::{Interest, Readiness};
pub use task::{Builder, JoinHandle, TaskId};

use std::any::Any;
use std::os::fd::RawFd;
use std::time::Duration;

/// Initialises the calling OS thread's scheduler with the given per-task
/// stack size (0 selects the 4 MiB default). Idempotent per thread; the
/// first [`spawn`] initialises implicitly with defaults.
///
/// # Errors
///
/// [`Error::Poller`] or [`Error::OutOfMemory`] if scheduler resources
/// cannot be created, [`Error::NotInRuntime`] on a compute-pool thread.
pub fn init(stack_size: usize) -> Result<(), Error> {
    scheduler::init(stack_size)
}

/// Runs the calling thread's scheduler until it owns no tasks at all,
/// then frees it. Every spawned task counts until it has exited *and*
/// been claimed (joined, or detached — dropping its [`JoinHandle`]
/// detaches): an exited task whose handle is still live, or a task
/// blocked on a condition nobody signals, keeps `run` blocked
/// indefinitely, exactly as joiners wait indefinitely.
///
/// # Errors
///
/// [`Error::NotInRuntime`] if the thread has no scheduler or `run` is
/// called from inside a task.
pub fn run() -> Result<(), Error> {
    scheduler::run()
}

/// Spawns a task running `f` on the calling thread's scheduler. Equivalent
/// to [`Builder::new().spawn(f)`](Builder::spawn).
///
/// # Errors
///
/// See [`Builder::spawn`].
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>, Error>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().spawn(f)
}

/// Moves the running task to the back of the ready FIFO and lets the
/// scheduler run others.
///
/// # Errors
///
/// [`Error::NotInRuntime`] outside a task.
pub fn yield_now() -> Result<(), Error> {
    scheduler::yield_now()
}

/// Suspends the running task for at least `duration`. A zero duration
/// degenerates to [`yield_now`].
///
/// # Errors
///
/// [`Error::NotInRuntime`] outside a task.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    scheduler::sleep_usecs(time::duration_to_usecs(duration))
}

/// Suspends the running task until `fd` is ready in the direction of
/// `interest`, `timeout` elapses, or the peer hangs up. `None` (or a zero
/// timeout) waits indefinitely.
///
/// At most one task may wait per direction per descriptor at any instant;
/// a second same-direction waiter is undefined.
///
/// # Errors
///
/// [`Error::FdLimit`] for descriptors outside the waitable range,
/// [`Error::Poller`] if the registration fails, [`Error::NotInRuntime`]
/// outside a task.
pub fn wait_for(
    fd: RawFd,
    interest: Interest,
    timeout: Option<Duration>,
) -> Result<Readiness, Error> {
    scheduler::wait_for(fd, interest, timeout)
}

/// [`wait_for`] with [`Interest::Read`].
///
/// # Errors
///
/// See [`wait_for`].
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> Result<Readiness, Error> {
    scheduler::wait_for(fd, Interest::Read, timeout)
}

/// [`wait_for`] with [`Interest::Write`].
///
/// # Errors
///
/// See [`wait_for`].
pub fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> Result<Readiness, Error> {
    scheduler::wait_for(fd, Interest::Write, timeout)
}

/// Ends the running task immediately with `value` as its exit value.
///
/// Returning from the task's closure is the idiomatic exit; this is for
/// deep call stacks that want out early. `value` must have the task's
/// declared return type or the joiner sees [`Error::Panicked`]. Locals
/// still live on the task's stack are **not** dropped.
///
/// # Panics
///
/// Panics when called outside a task (including compute sections).
pub fn exit<T: 'static>(value: T) -> ! {
    scheduler::exit_with(Box::new(value) as Box<dyn Any>)
}
