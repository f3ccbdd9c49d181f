// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Event, EventSet, MAX_EVENTS};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug)]
pub(crate) struct Poller {
    epfd: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            // Safety: fd was just opened and is unowned.
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            buf: Vec::with_capacity(MAX_EVENTS),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // Safety: ev lives across the call; epfd and fd are valid.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers `fd` edge-triggered oneshot for the union of interests in
    /// `set`. A spent oneshot registration is reused via `EPOLL_CTL_MOD`.
    pub(crate) fn arm(&self, fd: RawFd, set: EventSet) -> io::Result<()> {
        let mut events = libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32;
        if set.contains(EventSet::READABLE) {
            events |= libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32;
        }
        if set.contains(EventSet::WRITABLE) {
            events |= libc::EPOLLOUT as u32;
        }
        match self.ctl(libc::EPOLL_CTL_ADD, fd, events) {
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, events)
            }
            other => other,
        }
    }

    /// Persistent level-triggered read registration, used for the
    /// self-pipe.
    pub(crate) fn arm_persistent(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)
    }

    pub(crate) fn disarm(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    /// Waits up to `timeout_us` (rounded up to milliseconds) and appends
    /// harvested readiness to `events`. An interrupted wait reports no
    /// events rather than an error.
    pub(crate) fn poll(&mut self, events: &mut Vec<Event>, timeout_us: u64) -> io::Result<()> {
        let timeout_ms = timeout_us.div_ceil(1000).min(i32::MAX as u64) as i32;

        self.buf.clear();
        // Safety: buf has capacity for MAX_EVENTS entries.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        // Safety: the kernel initialised the first n entries.
        unsafe { self.buf.set_len(n as usize) };

        for raw in &self.buf {
            let raw = *raw;
            let mut set = EventSet::empty();
            if raw.events & libc::EPOLLIN as u32 != 0 {
                set |= EventSet::READABLE;
            }
            if raw.events & libc::EPOLLOUT as u32 != 0 {
                set |= EventSet::WRITABLE;
            }
            if raw.events & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
                set |= EventSet::HANGUP;
            }
            if raw.events & libc::EPOLLERR as u32 != 0 {
                // Wake both directions; the task's next syscall surfaces
                // the error.
                set |= EventSet::READABLE | EventSet::WRITABLE;
            }
            events.push(Event {
                fd: raw.u64 as RawFd,
                set,
            });
        }
        Ok(())
    }
}
