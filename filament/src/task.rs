// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task objects and their lifecycle handles.

use crate::counters;
use crate::error::Error;
use crate::scheduler;
use filament_context::{Context, Stack};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type-erased entry closure; the boxed return value is handed to a joiner.
pub(crate) type EntryFn = Box<dyn FnOnce() -> Box<dyn Any> + 'static>;

/// What a finished task left behind: its exit value, or the payload of the
/// panic that killed it.
pub(crate) type Outcome = Result<Box<dyn Any>, Box<dyn Any + Send>>;

/// An opaque ID that uniquely identifies a task.
///
/// IDs are assigned monotonically across all schedulers in the process and
/// are never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle tag of a task.
///
/// Each state corresponds to exactly one container holding the task: the
/// ready FIFO, a sleep-tree node, an fd-waiter slot, a condvar queue, the
/// compute pool's pending queue, or a pool worker. A waiter with a timeout
/// is additionally present in the sleep tree; that is the only sanctioned
/// double membership.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    /// Spawned, no stack yet; in the ready FIFO.
    New,
    /// Runnable; in the ready FIFO (or currently running).
    Ready,
    /// Waiting for read readiness on `fd_wait`.
    WaitRead,
    /// Waiting for write readiness on `fd_wait`.
    WaitWrite,
    /// Queued in the sleep tree.
    Sleeping,
    /// Blocked on a condition variable or a join.
    Locked,
    /// Marked for offload; about to move to the compute pool.
    ComputePending,
    /// Running on a pool worker's OS thread.
    Compute,
    /// A sleep or wait deadline elapsed; observable after resume.
    Expired,
    /// The peer hung up the waited-on descriptor; observable after resume.
    FdEof,
    /// Finished; holding its exit value until a join or detach claims it.
    Exited,
}

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) state: State,
    pub(crate) detached: bool,
    pub(crate) ctx: Context,
    pub(crate) stack: Option<Stack>,
    pub(crate) entry: Option<EntryFn>,
    pub(crate) outcome: Option<Outcome>,
    /// Task blocked in a join on us, made ready when we exit.
    pub(crate) joiner: Option<TaskId>,
    /// Exit value handed over by the task we joined.
    pub(crate) join_result: Option<Outcome>,
    pub(crate) fd_wait: Option<RawFd>,
    /// Absolute wake time in µs while queued in the sleep tree.
    pub(crate) deadline: Option<u64>,
    pub(crate) birth: u64,
    pub(crate) last_resumed: u64,
    /// Number of resumes; zeroed by an explicit yield.
    pub(crate) ops: u64,
    pub(crate) name: Option<String>,
}

impl Task {
    pub(crate) fn new(entry: EntryFn, name: Option<String>, now: u64) -> Box<Self> {
        counters::task_created();
        Box::new(Self {
            id: TaskId::next(),
            state: State::New,
            detached: false,
            ctx: Context::new(),
            stack: None,
            entry: Some(entry),
            outcome: None,
            joiner: None,
            join_result: None,
            fd_wait: None,
            deadline: None,
            birth: now,
            last_resumed: 0,
            ops: 0,
            name,
        })
    }

    /// Maps the stack and synthesizes the first-entry context. Called by
    /// the scheduler on first resume, not at spawn.
    pub(crate) fn alloc_stack(&mut self, size: usize) -> Result<(), Error> {
        let stack = Stack::new(size).map_err(|_| Error::OutOfMemory)?;
        // Safety: the stack is freshly mapped and owned by this task.
        unsafe {
            filament_context::prepare(&mut self.ctx, stack.top(), scheduler::task_entry);
        }
        self.stack = Some(stack);
        Ok(())
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        counters::task_dropped();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("detached", &self.detached)
            .field("name", &self.name)
            .field("ops", &self.ops)
            .field("birth", &self.birth)
            .field("last_resumed", &self.last_resumed)
            .field("has_stack", &self.stack.is_some())
            .finish_non_exhaustive()
    }
}

/// Configures and spawns tasks.
///
/// ```no_run
/// let handle = filament::Builder::new()
///     .name("listener")
///     .spawn(|| 42)
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Builder<'a> {
    name: Option<&'a str>,
}

impl<'a> Builder<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self { name: None }
    }

    /// Names the task for debug output. By default tasks are unnamed.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Spawns a task running `f` on the calling thread's scheduler,
    /// initialising the scheduler with defaults if this thread has none
    /// yet. The task's stack is not allocated until its first resume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] or [`Error::Poller`] if the implicit
    /// scheduler initialisation fails, and [`Error::NotInRuntime`] when
    /// called from inside a compute section.
    pub fn spawn<F, T>(self, f: F) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let entry: EntryFn = Box::new(move || Box::new(f()) as Box<dyn Any>);
        let id = scheduler::spawn(entry, self.name.map(str::to_owned))?;
        Ok(JoinHandle {
            id,
            _marker: PhantomData,
        })
    }
}

/// An owned handle to await a task's exit value.
///
/// While the handle is live and unjoined, the task's exit value is held
/// for it: an exited task parks and keeps its scheduler's [`crate::run`]
/// from returning until the value is claimed. Dropping the handle
/// detaches the task — it keeps running and is freed on exit.
#[derive(Debug)]
pub struct JoinHandle<T> {
    id: TaskId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks the calling task until the target exits and yields its
    /// return value. Callable only from another task on the same
    /// scheduler.
    ///
    /// # Errors
    ///
    /// [`Error::NotInRuntime`] outside a task, [`Error::Panicked`] if the
    /// target panicked or exited with a foreign-typed value,
    /// [`Error::Detached`] if the target was detached.
    pub fn join(self) -> Result<T, Error> {
        let id = self.id;
        mem::forget(self);
        match scheduler::join(id) {
            Ok(Ok(any)) => any.downcast::<T>().map(|b| *b).map_err(|_| Error::Panicked),
            Ok(Err(_payload)) => Err(Error::Panicked),
            Err(err) => {
                // The handle is spent, so nobody can claim the task later.
                scheduler::detach(id);
                Err(err)
            }
        }
    }

    /// Marks the task to be freed immediately on exit instead of parking
    /// for a join. Equivalent to dropping the handle.
    pub fn detach(self) {
        drop(self);
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        scheduler::detach(self.id);
    }
}
