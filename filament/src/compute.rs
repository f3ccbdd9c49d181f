// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Offload of CPU-bound sections to a process-wide worker pool.
//!
//! A task brackets a CPU-bound region with [`begin`] and [`end`] (or the
//! scoped [`run`]). Between the two it executes on a long-lived pool
//! worker's OS thread, still on its own private stack, while its home
//! scheduler keeps servicing I/O and timers. Completion travels back
//! through the scheduler's shared queue plus one self-pipe byte; the task
//! always resumes on the scheduler that spawned it.
//!
//! Inside a compute section the scheduler primitives (sleep, waits,
//! condition variables, spawn) are unavailable and report
//! [`Error::NotInRuntime`].

use crate::error::Error;
use crate::scheduler::{self, SchedulerShared};
use crate::task::{State, Task};
use filament_context::Context;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError};

/// A parked task in transit between a scheduler and the pool.
pub(crate) struct Parcel(pub(crate) Box<Task>);

// Safety: the task inside is suspended and handed off whole; exactly one
// thread observes it at any instant, with the pool mutex as the
// happens-before edge.
unsafe impl Send for Parcel {}

pub(crate) struct Job {
    pub(crate) task: Parcel,
    pub(crate) home: Arc<SchedulerShared>,
}

struct Pool {
    pending: VecDeque<Job>,
    free: usize,
    spawned: usize,
}

struct PoolShared {
    pool: Mutex<Pool>,
    work: Condvar,
}

static POOL: LazyLock<PoolShared> = LazyLock::new(|| PoolShared {
    pool: Mutex::new(Pool {
        pending: VecDeque::new(),
        free: 0,
        spawned: 0,
    }),
    work: Condvar::new(),
});

struct WorkerCtx {
    host: Context,
    task: *mut Task,
}

thread_local! {
    static WORKER: Cell<*mut WorkerCtx> = const { Cell::new(ptr::null_mut()) };
}

/// Whether the calling OS thread is a pool worker.
pub(crate) fn on_worker() -> bool {
    !WORKER.get().is_null()
}

/// Queues an offloaded task and makes sure a worker will pick it up,
/// growing the pool when every worker is busy.
pub(crate) fn submit(job: Job) {
    let mut pool = POOL.pool.lock().unwrap_or_else(PoisonError::into_inner);
    pool.pending.push_back(job);
    if pool.free > 0 {
        POOL.work.notify_one();
        return;
    }
    let index = pool.spawned;
    match std::thread::Builder::new()
        .name(format!("filament-compute-{index}"))
        .spawn(worker_main)
    {
        Ok(_) => pool.spawned += 1,
        // The job stays queued; a later submit retries the spawn.
        Err(err) => tracing::error!("failed to spawn compute worker: {err}"),
    }
}

fn worker_main() {
    let mut ctx = WorkerCtx {
        host: Context::new(),
        task: ptr::null_mut(),
    };
    tracing::debug!("compute worker up");
    loop {
        let job = {
            let mut pool = POOL.pool.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = pool.pending.pop_front() {
                    break job;
                }
                pool.free += 1;
                pool = POOL.work.wait(pool).unwrap_or_else(PoisonError::into_inner);
                pool.free -= 1;
            }
        };
        run_job(&mut ctx, job);
    }
}

fn run_job(ctx: &mut WorkerCtx, job: Job) {
    let Parcel(mut task) = job.task;
    task.state = State::Compute;
    tracing::trace!(task = %task.id, "compute: running");
    ctx.task = &raw mut *task;
    WORKER.set(ptr::from_mut(ctx));
    // Safety: the task's context was saved when it yielded on its home
    // scheduler; the pool mutex ordered that save before this restore.
    unsafe { filament_context::switch(&raw mut ctx.host, &raw const task.ctx) };
    WORKER.set(ptr::null_mut());
    ctx.task = ptr::null_mut();
    tracing::trace!(task = %task.id, "compute: done");
    job.home.complete(Parcel(task));
}

/// Marks the start of a CPU-bound section.
///
/// The current task yields, its scheduler moves it to the pool, and a
/// worker resumes it on another OS thread. Returns once the worker is
/// running the task.
///
/// # Errors
///
/// [`Error::NotInRuntime`] when called outside a task or inside an
/// already-open compute section.
pub fn begin() -> Result<(), Error> {
    scheduler::compute_begin()
}

/// Marks the end of a CPU-bound section.
///
/// Suspends the task on the worker and returns once its home scheduler has
/// resumed it.
///
/// # Errors
///
/// [`Error::NotInRuntime`] when the calling thread is not a pool worker.
pub fn end() -> Result<(), Error> {
    let worker = WORKER.get();
    if worker.is_null() {
        return Err(Error::NotInRuntime);
    }
    // Safety: worker points at the live context of this pool thread and
    // task at the task it is currently running.
    unsafe {
        let task = (*worker).task;
        filament_context::switch(&raw mut (*task).ctx, &raw const (*worker).host);
    }
    Ok(())
}

/// Runs `f` inside a compute section.
///
/// Panics from `f` are caught on the worker and re-thrown only after the
/// task is back on its home scheduler, where the task bootstrap can handle
/// them.
///
/// # Errors
///
/// Propagates [`begin`]'s errors; `f` does not run if the offload fails.
pub fn run<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
    begin()?;
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    end()?;
    match result {
        Ok(value) => Ok(value),
        Err(payload) => panic::resume_unwind(payload),
    }
}
