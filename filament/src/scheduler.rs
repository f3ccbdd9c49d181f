// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-OS-thread cooperative scheduler.
//!
//! One scheduler is bound to one OS thread through thread-local storage
//! and drives every task spawned on that thread: it drains the ready FIFO,
//! expires the sleep tree, polls for I/O readiness and collects tasks
//! returning from the compute pool. Control moves between the scheduler's
//! host context and a task's private stack exclusively through
//! [`filament_context::switch`]; a task runs until it reaches one of the
//! suspension points (`yield_now`, `sleep`, `wait_for`, `Cond::wait`,
//! `compute::begin`/`end`, or exit) and owns the OS thread in between.
//!
//! The scheduler's data structures are touched by exactly one OS thread.
//! The only cross-thread paths are the completion queue and self-pipe in
//! [`SchedulerShared`], which pool workers use to return offloaded tasks.

use crate::compute::{self, Job, Parcel};
use crate::error::Error;
use crate::poller::{Event, EventSet, Interest, Poller, Readiness, self_pipe};
use crate::task::{EntryFn, Outcome, State, Task, TaskId};
use crate::time::{self, SleepQueue};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Stack size handed to tasks when `init` is given zero.
const DEFAULT_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Poll timeout when no deadline bounds the wait.
const DEFAULT_TIMEOUT_US: u64 = 3_000_000;

/// Highest descriptor accepted by the waiter table.
const MAX_FD: RawFd = 65_535 * 2;

thread_local! {
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };
}

fn tls_scheduler() -> Option<NonNull<Scheduler>> {
    NonNull::new(SCHEDULER.get())
}

/// The slice of scheduler state shared with pool workers: the queue of
/// tasks done computing and the write end of the self-pipe that wakes the
/// scheduler's poller.
pub(crate) struct SchedulerShared {
    completed: Mutex<VecDeque<Parcel>>,
    notify_wr: OwnedFd,
}

impl SchedulerShared {
    /// Hands a finished compute task back and rings the owning scheduler.
    /// Called from pool worker threads.
    pub(crate) fn complete(&self, parcel: Parcel) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(parcel);
        // One byte per completion. A full pipe is fine: the reader drains
        // the completion queue regardless of the byte count.
        let buf = [1u8];
        // Safety: the fd stays open for the lifetime of this struct.
        unsafe { libc::write(self.notify_wr.as_raw_fd(), buf.as_ptr().cast(), 1) };
    }
}

pub(crate) struct Scheduler {
    stack_size: usize,
    default_timeout: u64,
    birth: u64,
    poller: Poller,
    host_ctx: filament_context::Context,
    current: Option<TaskId>,
    /// Every task owned by this scheduler, including parked zombies.
    /// Offloaded tasks are moved out for the duration of the compute run.
    tasks: HashMap<TaskId, Box<Task>>,
    /// Runnable FIFO; doubles as the queue of newly spawned tasks.
    ready: VecDeque<TaskId>,
    sleeping: SleepQueue,
    /// At most one waiter per direction per descriptor.
    fd_waiters: HashMap<RawFd, [Option<TaskId>; 2]>,
    /// Tasks currently in the compute pool; keeps the loop alive while
    /// they are away.
    compute_outstanding: Vec<TaskId>,
    /// Joins and detaches that arrived while their target was offloaded;
    /// applied when the target returns.
    deferred_joins: HashMap<TaskId, TaskId>,
    deferred_detach: Vec<TaskId>,
    shared: Arc<SchedulerShared>,
    notify_rd: OwnedFd,
    /// Scratch buffer reused across polls.
    events: Vec<Event>,
}

impl Scheduler {
    fn new(stack_size: usize) -> Result<Self, Error> {
        let poller = Poller::new()?;
        let (notify_rd, notify_wr) = self_pipe()?;
        poller.arm_persistent(notify_rd.as_raw_fd())?;
        Ok(Self {
            stack_size: if stack_size == 0 {
                DEFAULT_STACK_SIZE
            } else {
                stack_size
            },
            default_timeout: DEFAULT_TIMEOUT_US,
            birth: time::now_usecs(),
            poller,
            host_ctx: filament_context::Context::new(),
            current: None,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            sleeping: SleepQueue::new(),
            fd_waiters: HashMap::new(),
            compute_outstanding: Vec::new(),
            deferred_joins: HashMap::new(),
            deferred_detach: Vec::new(),
            shared: Arc::new(SchedulerShared {
                completed: Mutex::new(VecDeque::new()),
                notify_wr,
            }),
            notify_rd,
            events: Vec::new(),
        })
    }

    /// The loop exits only when the total task count reaches zero: the
    /// task map covers every task this scheduler owns — runnable,
    /// sleeping, waiting, parked `Locked`, or exited but not yet claimed
    /// by a join or detach — and the outstanding list covers tasks away
    /// in the compute pool. A task nobody will ever wake or claim keeps
    /// the loop alive indefinitely; joiners wait indefinitely. The
    /// sleeper and waiter checks are implied by the map being empty and
    /// only spell out the remaining containers.
    fn is_done(&self) -> bool {
        self.tasks.is_empty()
            && self.compute_outstanding.is_empty()
            && self.sleeping.is_empty()
            && self.fd_waiters.is_empty()
    }

    fn poll_timeout(&self, now: u64) -> u64 {
        if !self.ready.is_empty() {
            return 0;
        }
        match self.sleeping.next_deadline() {
            Some(deadline) => deadline.saturating_sub(now).min(self.default_timeout),
            None => self.default_timeout,
        }
    }

    /// Clears one direction's waiter slot and keeps the poller
    /// registration consistent with the surviving direction, if any.
    fn clear_fd_waiter(&mut self, fd: RawFd, interest: Interest) {
        let Some(slots) = self.fd_waiters.get_mut(&fd) else {
            return;
        };
        slots[interest.index()] = None;
        let remaining = remaining_set(slots);
        if remaining.is_empty() {
            self.fd_waiters.remove(&fd);
            let _ = self.poller.disarm(fd);
        } else if self.poller.arm(fd, remaining).is_err() {
            // The surviving waiter would hang forever; its own error path
            // cannot run, so at least drop the dead registration.
            tracing::error!(fd, "failed to re-arm surviving waiter");
        }
    }

    fn take_fd_waiter(&mut self, fd: RawFd, interest: Interest) -> Option<TaskId> {
        let slots = self.fd_waiters.get_mut(&fd)?;
        let id = slots[interest.index()].take()?;
        let remaining = remaining_set(slots);
        if remaining.is_empty() {
            self.fd_waiters.remove(&fd);
        } else {
            // The oneshot fire disabled the whole registration on epoll;
            // put the other direction back.
            let _ = self.poller.arm(fd, remaining);
        }
        Some(id)
    }
}

fn remaining_set(slots: &[Option<TaskId>; 2]) -> EventSet {
    let mut set = EventSet::empty();
    if slots[Interest::Read.index()].is_some() {
        set |= EventSet::READABLE;
    }
    if slots[Interest::Write.index()].is_some() {
        set |= EventSet::WRITABLE;
    }
    set
}

/// Initialises the calling OS thread's scheduler. Idempotent per thread;
/// `stack_size` zero selects the 4 MiB default.
///
/// # Errors
///
/// [`Error::Poller`] or [`Error::OutOfMemory`] if the poller or self-pipe
/// cannot be created, [`Error::NotInRuntime`] on a pool worker thread.
pub(crate) fn init(stack_size: usize) -> Result<(), Error> {
    if compute::on_worker() {
        return Err(Error::NotInRuntime);
    }
    if !SCHEDULER.get().is_null() {
        return Ok(());
    }
    let sched = Box::new(Scheduler::new(stack_size)?);
    SCHEDULER.set(Box::into_raw(sched));
    tracing::debug!("scheduler initialised");
    Ok(())
}

/// Runs the calling thread's scheduler until it owns no tasks at all,
/// then frees it. Exited tasks whose handle is still live, and tasks
/// blocked on a condition nobody signals, count and keep `run` blocked.
///
/// # Errors
///
/// [`Error::NotInRuntime`] if the thread has no scheduler or `run` is
/// called from inside a task.
pub(crate) fn run() -> Result<(), Error> {
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?;
    let sched = sched.as_ptr();
    // Safety: the TLS pointer refers to the live, thread-owned scheduler.
    unsafe {
        if (*sched).current.is_some() {
            return Err(Error::NotInRuntime);
        }
        run_loop(sched);
        SCHEDULER.set(ptr::null_mut());
        // The loop only exits with an empty task map, so teardown frees
        // scheduler resources and nothing else.
        let sched = Box::from_raw(sched);
        tracing::debug!(
            uptime_us = time::now_usecs().saturating_sub(sched.birth),
            "scheduler torn down"
        );
        drop(sched);
    }
    Ok(())
}

/// One iteration: drain ready tasks (new ones get their stack here),
/// expire sleepers, then poll and dispatch readiness, EOFs and compute
/// completions.
unsafe fn run_loop(sched: *mut Scheduler) {
    // Safety: sched is the live scheduler of this thread; every helper
    // called here re-derives its accesses from the raw pointer and no
    // reference is held across a context switch.
    unsafe {
        loop {
            if (*sched).is_done() {
                break;
            }

            while let Some(id) = (*sched).ready.pop_front() {
                resume(sched, id);
            }

            let now = time::now_usecs();
            for id in (*sched).sleeping.expire_up_to(now) {
                wake_expired(sched, id);
            }

            let timeout = (*sched).poll_timeout(time::now_usecs());
            let mut events = mem::take(&mut (*sched).events);
            if let Err(err) = (*sched).poller.poll(&mut events, timeout) {
                tracing::error!("poll failed: {err}");
            }
            for event in events.drain(..) {
                dispatch_event(sched, event);
            }
            (*sched).events = events;
        }
        tracing::debug!("scheduler drained");
    }
}

/// Switches from the host context into `id`, allocating its stack on first
/// entry. Returns when the task suspends or exits.
unsafe fn resume(sched: *mut Scheduler, id: TaskId) {
    // Safety: caller contract as in run_loop.
    unsafe {
        let Some(task) = (*sched).tasks.get_mut(&id) else {
            return;
        };
        let task: *mut Task = &raw mut **task;

        if (*task).state == State::New {
            if let Err(err) = (*task).alloc_stack((*sched).stack_size) {
                tracing::error!(task = %id, "stack allocation failed: {err}");
                (*task).outcome = Some(Err(Box::new(err)));
                (*task).state = State::Exited;
                reap(sched, id);
                return;
            }
            (*task).state = State::Ready;
        }
        if (*task).state == State::Exited {
            reap(sched, id);
            return;
        }

        (*task).last_resumed = time::now_usecs();
        (*task).ops += 1;
        (*sched).current = Some(id);
        tracing::trace!(task = %id, state = ?(*task).state, "resume");
        filament_context::switch(&raw mut (*sched).host_ctx, &raw const (*task).ctx);
        (*sched).current = None;

        match (*sched).tasks.get(&id).map(|t| t.state) {
            Some(State::Exited) => reap(sched, id),
            Some(State::ComputePending) => offload(sched, id),
            _ => {}
        }
    }
}

/// Runs a task's exit protocol: hand the exit value to a waiting joiner,
/// free a detached task, or park the rest until a join or detach claims
/// them.
unsafe fn reap(sched: *mut Scheduler, id: TaskId) {
    // Safety: caller contract as in run_loop.
    unsafe {
        let Some(task) = (*sched).tasks.get_mut(&id) else {
            return;
        };
        if let Some(joiner_id) = task.joiner.take() {
            let outcome = task.outcome.take();
            drop((*sched).tasks.remove(&id));
            if let Some(joiner) = (*sched).tasks.get_mut(&joiner_id) {
                joiner.join_result = outcome;
                joiner.state = State::Ready;
                (*sched).ready.push_back(joiner_id);
            }
            tracing::trace!(task = %id, joiner = %joiner_id, "exit: result handed to joiner");
        } else if task.detached {
            drop((*sched).tasks.remove(&id));
            tracing::trace!(task = %id, "exit: detached, freed");
        } else {
            tracing::trace!(task = %id, "exit: parked awaiting join");
        }
    }
}

/// Moves a `ComputePending` task out of the scheduler and into the pool.
unsafe fn offload(sched: *mut Scheduler, id: TaskId) {
    // Safety: caller contract as in run_loop.
    unsafe {
        let Some(task) = (*sched).tasks.remove(&id) else {
            return;
        };
        (*sched).compute_outstanding.push(id);
        tracing::trace!(task = %id, "offloading to compute pool");
        compute::submit(Job {
            task: Parcel(task),
            home: (*sched).shared.clone(),
        });
    }
}

/// Resumes a task whose sleep-tree deadline elapsed. An I/O waiter whose
/// timer won the race has its registration torn down before it observes
/// `Expired`.
unsafe fn wake_expired(sched: *mut Scheduler, id: TaskId) {
    // Safety: caller contract as in run_loop.
    unsafe {
        let Some(task) = (*sched).tasks.get_mut(&id) else {
            return;
        };
        task.deadline = None;
        match task.state {
            State::Sleeping => task.state = State::Expired,
            State::WaitRead | State::WaitWrite => {
                let interest = if task.state == State::WaitRead {
                    Interest::Read
                } else {
                    Interest::Write
                };
                let fd = task.fd_wait.take();
                task.state = State::Expired;
                if let Some(fd) = fd {
                    (*sched).clear_fd_waiter(fd, interest);
                }
            }
            _ => return,
        }
        resume(sched, id);
    }
}

/// Routes one poller event: self-pipe traffic drains compute completions,
/// anything else wakes the indexed waiter(s) for the descriptor.
unsafe fn dispatch_event(sched: *mut Scheduler, event: Event) {
    // Safety: caller contract as in run_loop.
    unsafe {
        if event.fd == (*sched).notify_rd.as_raw_fd() {
            drain_completions(sched);
            return;
        }
        for interest in [Interest::Read, Interest::Write] {
            let fired = match interest {
                Interest::Read => event
                    .set
                    .intersects(EventSet::READABLE | EventSet::HANGUP),
                Interest::Write => event
                    .set
                    .intersects(EventSet::WRITABLE | EventSet::HANGUP),
            };
            if !fired {
                continue;
            }
            let Some(id) = (*sched).take_fd_waiter(event.fd, interest) else {
                continue;
            };
            let Some(task) = (*sched).tasks.get_mut(&id) else {
                continue;
            };
            // Readiness wins over a deadline that elapsed during the poll;
            // the timer entry is simply discarded.
            if let Some(deadline) = task.deadline.take() {
                (*sched).sleeping.remove(deadline, id);
            }
            // A hangup with data (or writability) still pending resumes as
            // ready; the EOF surfaces on a later wait.
            let direction_ready = match interest {
                Interest::Read => event.set.contains(EventSet::READABLE),
                Interest::Write => event.set.contains(EventSet::WRITABLE),
            };
            task.state = if direction_ready {
                State::Ready
            } else {
                State::FdEof
            };
            resume(sched, id);
        }
    }
}

/// Empties the self-pipe, then resumes every task the pool handed back.
unsafe fn drain_completions(sched: *mut Scheduler) {
    // Safety: caller contract as in run_loop.
    unsafe {
        let fd = (*sched).notify_rd.as_raw_fd();
        let mut buf = [0u8; 64];
        loop {
            // Safety: reading into a local buffer from our own pipe.
            let n = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
            if n < buf.len() as isize {
                break;
            }
        }
        loop {
            let parcel = (&(*sched).shared)
                .completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(Parcel(mut task)) = parcel else {
                break;
            };
            let id = task.id;
            task.state = State::Ready;
            if let Some(joiner) = (*sched).deferred_joins.remove(&id) {
                task.joiner = Some(joiner);
            }
            if let Some(pos) = (*sched).deferred_detach.iter().position(|&t| t == id) {
                (*sched).deferred_detach.swap_remove(pos);
                task.detached = true;
            }
            (*sched).compute_outstanding.retain(|&t| t != id);
            (*sched).tasks.insert(id, task);
            tracing::trace!(task = %id, "compute: back home");
            resume(sched, id);
        }
    }
}

/// The currently running task of the scheduler, as a raw pointer so no
/// borrow lives across a context switch.
unsafe fn current_task(sched: *mut Scheduler) -> Option<*mut Task> {
    // Safety: caller contract as in run_loop.
    unsafe {
        let id = (*sched).current?;
        (*sched)
            .tasks
            .get_mut(&id)
            .map(|task| -> *mut Task { &raw mut **task })
    }
}

/// Suspends the running task: saves its context and continues the host.
unsafe fn switch_to_host(sched: *mut Scheduler, task: *mut Task) {
    // Safety: the host context was saved by the resume that entered this
    // task; both live for the duration of the switch.
    unsafe {
        filament_context::switch(&raw mut (*task).ctx, &raw const (*sched).host_ctx);
    }
}

/// Bookkeeping-only task creation; the stack arrives at first resume.
pub(crate) fn spawn(entry: EntryFn, name: Option<String>) -> Result<TaskId, Error> {
    init(0)?;
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?.as_ptr();
    // Safety: thread-owned scheduler, no switch in scope.
    unsafe {
        let task = Task::new(entry, name, time::now_usecs());
        let id = task.id;
        tracing::trace!(task = %id, name = ?task.name, "spawn");
        (*sched).tasks.insert(id, task);
        (*sched).ready.push_back(id);
        Ok(id)
    }
}

/// Re-queues the running task at the back of the ready FIFO and yields.
/// Zeroes the task's `ops` counter, so a long-running task can use this to
/// demote itself.
pub(crate) fn yield_now() -> Result<(), Error> {
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?.as_ptr();
    // Safety: thread-owned scheduler; raw pointers only across the switch.
    unsafe {
        let task = current_task(sched).ok_or(Error::NotInRuntime)?;
        (*task).state = State::Ready;
        (*task).ops = 0;
        (*sched).ready.push_back((*task).id);
        switch_to_host(sched, task);
    }
    Ok(())
}

/// Parks the running task in the sleep tree for `usecs`. Zero degenerates
/// to a yield.
pub(crate) fn sleep_usecs(usecs: u64) -> Result<(), Error> {
    if usecs == 0 {
        return yield_now();
    }
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?.as_ptr();
    // Safety: thread-owned scheduler; raw pointers only across the switch.
    unsafe {
        let task = current_task(sched).ok_or(Error::NotInRuntime)?;
        let deadline = time::now_usecs().saturating_add(usecs);
        (*sched).sleeping.insert(deadline, (*task).id);
        (*task).deadline = Some(deadline);
        (*task).state = State::Sleeping;
        switch_to_host(sched, task);
        // Woken with the Expired tag; runnable again from here.
        (*task).state = State::Ready;
    }
    Ok(())
}

/// Parks the running task until `fd` is ready in `interest`'s direction,
/// the timeout elapses, or the peer hangs up. Exactly one of the three
/// outcomes holds on return.
///
/// At most one task may wait per direction per descriptor; a second waiter
/// in the same direction is undefined and only debug-asserted.
pub(crate) fn wait_for(
    fd: RawFd,
    interest: Interest,
    timeout: Option<Duration>,
) -> Result<Readiness, Error> {
    if !(0..MAX_FD).contains(&fd) {
        return Err(Error::FdLimit(fd));
    }
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?.as_ptr();
    // Safety: thread-owned scheduler; raw pointers only across the switch.
    unsafe {
        let task = current_task(sched).ok_or(Error::NotInRuntime)?;
        let id = (*task).id;

        let slots = (*sched).fd_waiters.entry(fd).or_insert([None, None]);
        debug_assert!(
            slots[interest.index()].is_none(),
            "two tasks waiting on fd {fd} in the same direction"
        );
        slots[interest.index()] = Some(id);
        let set = remaining_set(slots);
        if let Err(err) = (*sched).poller.arm(fd, set) {
            (*sched).clear_fd_waiter(fd, interest);
            return Err(Error::Poller(err));
        }

        (*task).fd_wait = Some(fd);
        (*task).state = match interest {
            Interest::Read => State::WaitRead,
            Interest::Write => State::WaitWrite,
        };
        let timeout_us = timeout.map_or(0, time::duration_to_usecs);
        if timeout_us > 0 {
            let deadline = time::now_usecs().saturating_add(timeout_us);
            (*sched).sleeping.insert(deadline, id);
            (*task).deadline = Some(deadline);
        }

        switch_to_host(sched, task);

        let outcome = match (*task).state {
            State::Expired => Readiness::TimedOut,
            State::FdEof => Readiness::Eof,
            _ => Readiness::Ready,
        };
        (*task).state = State::Ready;
        (*task).fd_wait = None;
        Ok(outcome)
    }
}

/// Blocks the running task until `target` exits, returning the exit
/// outcome.
pub(crate) fn join(target: TaskId) -> Result<Outcome, Error> {
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?.as_ptr();
    // Safety: thread-owned scheduler; raw pointers only across the switch.
    unsafe {
        let me = current_task(sched).ok_or(Error::NotInRuntime)?;
        let my_id = (*me).id;
        debug_assert_ne!(my_id, target, "task joining itself");

        match (*sched).tasks.get_mut(&target) {
            Some(task) if task.state == State::Exited => {
                // Already done; claim the value without blocking.
                let outcome = task.outcome.take();
                drop((*sched).tasks.remove(&target));
                return outcome.ok_or(Error::Detached);
            }
            Some(task) => {
                debug_assert!(task.joiner.is_none(), "task joined twice");
                task.joiner = Some(my_id);
            }
            None if (*sched).compute_outstanding.contains(&target) => {
                // Away in the pool; the join is applied when it returns.
                (*sched).deferred_joins.insert(target, my_id);
            }
            None => return Err(Error::Detached),
        }

        (*me).state = State::Locked;
        switch_to_host(sched, me);
        (*me).join_result.take().ok_or(Error::Detached)
    }
}

/// Flags `target` to be freed on exit; frees it right away if it already
/// exited. Runs both for an explicit detach and when a handle is dropped
/// unjoined.
pub(crate) fn detach(target: TaskId) {
    let Some(sched) = tls_scheduler() else {
        return;
    };
    let sched = sched.as_ptr();
    // Safety: thread-owned scheduler, no switch in scope.
    unsafe {
        match (*sched).tasks.get_mut(&target) {
            Some(task) if task.state == State::Exited => {
                drop((*sched).tasks.remove(&target));
            }
            Some(task) => task.detached = true,
            None if (*sched).compute_outstanding.contains(&target) => {
                (*sched).deferred_detach.push(target);
            }
            None => {}
        }
    }
}

/// Queues the running task on `queue` and blocks it.
pub(crate) fn cond_wait(queue: &RefCell<VecDeque<TaskId>>) -> Result<(), Error> {
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?.as_ptr();
    // Safety: thread-owned scheduler; raw pointers only across the switch.
    unsafe {
        let task = current_task(sched).ok_or(Error::NotInRuntime)?;
        queue.borrow_mut().push_back((*task).id);
        (*task).state = State::Locked;
        switch_to_host(sched, task);
    }
    Ok(())
}

/// Makes up to `limit` tasks from `queue` ready, in FIFO order. Returns
/// the number woken.
pub(crate) fn cond_wake(queue: &RefCell<VecDeque<TaskId>>, limit: usize) -> usize {
    let Some(sched) = tls_scheduler() else {
        return 0;
    };
    let sched = sched.as_ptr();
    // Safety: thread-owned scheduler, no switch in scope.
    unsafe {
        let mut woken = 0;
        while woken < limit {
            let Some(id) = queue.borrow_mut().pop_front() else {
                break;
            };
            if let Some(task) = (*sched).tasks.get_mut(&id) {
                task.state = State::Ready;
                (*sched).ready.push_back(id);
                woken += 1;
            }
        }
        woken
    }
}

/// Marks the running task for offload and yields; the scheduler moves it
/// to the pool. Returns (on a pool worker's thread) once a worker resumed
/// the task.
pub(crate) fn compute_begin() -> Result<(), Error> {
    let sched = tls_scheduler().ok_or(Error::NotInRuntime)?.as_ptr();
    // Safety: thread-owned scheduler; raw pointers only across the switch.
    unsafe {
        let task = current_task(sched).ok_or(Error::NotInRuntime)?;
        (*task).state = State::ComputePending;
        switch_to_host(sched, task);
    }
    Ok(())
}

/// Ends the running task with `outcome`; never returns to the caller.
pub(crate) fn exit_with(value: Box<dyn Any>) -> ! {
    let sched = tls_scheduler()
        .expect("exit called outside the runtime")
        .as_ptr();
    // Safety: thread-owned scheduler; raw pointers only across the switch.
    unsafe {
        let task = current_task(sched).expect("exit called outside a task");
        finish(sched, task, Ok(value))
    }
}

unsafe fn finish(sched: *mut Scheduler, task: *mut Task, outcome: Outcome) -> ! {
    // Safety: caller contract as in run_loop.
    unsafe {
        (*task).outcome = Some(outcome);
        (*task).state = State::Exited;
        tracing::trace!(task = %(*task).id, ops = (*task).ops, "exit");
        // Resuming an exited task is a host-side bug; stay parked if it
        // ever happens.
        loop {
            switch_to_host(sched, task);
        }
    }
}

/// First-entry bootstrap running at the base of every task stack: take the
/// entry closure, run it under `catch_unwind`, perform the final exit
/// switch. Never returns.
pub(crate) extern "C" fn task_entry() -> ! {
    let sched = tls_scheduler()
        .expect("task entered without a scheduler")
        .as_ptr();
    // Safety: we are running on the task's stack; the scheduler set
    // `current` before switching here.
    unsafe {
        let task = current_task(sched).expect("task entered without being current");
        let entry = (*task).entry.take().expect("task entered twice");
        let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
        if outcome.is_err() {
            tracing::error!(task = %(*task).id, "task panicked");
        }
        finish(sched, task, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_run_frees() {
        std::thread::spawn(|| {
            init(0).unwrap();
            init(64 * 1024).unwrap();
            assert!(tls_scheduler().is_some());
            run().unwrap();
            assert!(tls_scheduler().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn run_without_scheduler_errors() {
        std::thread::spawn(|| {
            assert!(matches!(run(), Err(Error::NotInRuntime)));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn fd_limit_is_enforced() {
        std::thread::spawn(|| {
            init(0).unwrap();
            let err = wait_for(MAX_FD + 1, Interest::Read, None).unwrap_err();
            assert!(matches!(err, Error::FdLimit(_)));
            run().unwrap();
        })
        .join()
        .unwrap();
    }
}
