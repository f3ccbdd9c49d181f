// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Event, EventSet, MAX_EVENTS};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

#[derive(Debug)]
pub(crate) struct Poller {
    kq: OwnedFd,
    buf: Vec<libc::kevent>,
}

fn zeroed_kevent() -> libc::kevent {
    // Safety: kevent is a plain C struct for which zeroes are valid.
    unsafe { std::mem::zeroed() }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscall.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: fd was just opened.
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        Ok(Self {
            // Safety: fd was just opened and is unowned.
            kq: unsafe { OwnedFd::from_raw_fd(fd) },
            buf: Vec::with_capacity(MAX_EVENTS),
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
        let mut change = zeroed_kevent();
        change.ident = fd as libc::uintptr_t;
        change.filter = filter;
        change.flags = flags;
        // Safety: the changelist points at one initialised entry.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers oneshot filters for the interests in `set`; the two
    /// directions are independent on kqueue.
    pub(crate) fn arm(&self, fd: RawFd, set: EventSet) -> io::Result<()> {
        if set.contains(EventSet::READABLE) {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ONESHOT)?;
        }
        if set.contains(EventSet::WRITABLE) {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ONESHOT)?;
        }
        Ok(())
    }

    /// Persistent edge-triggered read registration, used for the
    /// self-pipe.
    pub(crate) fn arm_persistent(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR)
    }

    pub(crate) fn disarm(&self, fd: RawFd) -> io::Result<()> {
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            match self.change(fd, filter, libc::EV_DELETE) {
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {}
                Err(err) => return Err(err),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Waits up to `timeout_us` and appends harvested readiness to
    /// `events`. An interrupted wait reports no events rather than an
    /// error.
    pub(crate) fn poll(&mut self, events: &mut Vec<Event>, timeout_us: u64) -> io::Result<()> {
        let timeout = libc::timespec {
            tv_sec: (timeout_us / 1_000_000) as libc::time_t,
            tv_nsec: ((timeout_us % 1_000_000) * 1000) as libc::c_long,
        };

        self.buf.clear();
        // Safety: buf has capacity for MAX_EVENTS entries.
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                &timeout,
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
            let mut set = EventSet::empty();
            match raw.filter {
                f if f == libc::EVFILT_READ => set |= EventSet::READABLE,
                f if f == libc::EVFILT_WRITE => set |= EventSet::WRITABLE,
                _ => continue,
            }
            if raw.flags & libc::EV_EOF != 0 {
                set |= EventSet::HANGUP;
            }
            events.push(Event {
                fd: raw.ident as RawFd,
                set,
            });
        }
        Ok(())
    }
}
