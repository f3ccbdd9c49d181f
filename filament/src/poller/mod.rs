// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness multiplexing behind a uniform arm/disarm/poll interface.
//!
//! Waiter registrations are edge-triggered oneshot; the self-pipe read end
//! uses a persistent registration. The scheduler owns the mapping from
//! descriptors back to tasks, the poller only reports `(fd, readiness)`
//! pairs.

use bitflags::bitflags;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub(crate) use epoll::Poller;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
    ))] {
        mod kqueue;
        pub(crate) use kqueue::Poller;
    } else {
        compile_error!("Unsupported target platform");
    }
}

/// Largest number of readiness events harvested by a single poll.
pub(crate) const MAX_EVENTS: usize = 1024;

/// Readiness direction a task can wait for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    /// Slot index in the per-fd waiter table.
    pub(crate) fn index(self) -> usize {
        match self {
            Interest::Read => 0,
            Interest::Write => 1,
        }
    }
}

/// Outcome of a descriptor wait, exactly one of which holds at resume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    /// The descriptor became ready in the requested direction.
    Ready,
    /// The timeout elapsed before readiness; the registration was dropped.
    TimedOut,
    /// The peer hung up; no data will arrive.
    Eof,
}

bitflags! {
    /// Readiness reported for one descriptor by a single poll.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct EventSet: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const HANGUP = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Event {
    pub(crate) fd: RawFd,
    pub(crate) set: EventSet,
}

/// Creates the non-blocking close-on-exec pipe used to wake a scheduler
/// from other OS threads.
pub(crate) fn self_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];

    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // Safety: fds points at two writable ints.
            let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        } else {
            // Safety: fds points at two writable ints.
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                // Safety: fd was just opened by pipe().
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
            }
        }
    }

    // Safety: both descriptors were just opened and are unowned.
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((rd, wr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_readiness_and_hangup() {
        let mut poller = Poller::new().unwrap();
        let (rd, wr) = self_pipe().unwrap();
        let mut events = Vec::new();

        poller.arm(rd.as_raw_fd(), EventSet::READABLE).unwrap();
        poller.poll(&mut events, 0).unwrap();
        assert!(events.is_empty());

        // Safety: wr is a valid pipe write end.
        let n = unsafe { libc::write(wr.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        assert_eq!(n, 1);
        poller.poll(&mut events, 100_000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, rd.as_raw_fd());
        assert!(events[0].set.contains(EventSet::READABLE));

        // Oneshot: the byte is still unread but the registration is spent.
        events.clear();
        poller.poll(&mut events, 0).unwrap();
        assert!(events.is_empty());

        // Re-arm and observe the hangup once the write end closes.
        poller.arm(rd.as_raw_fd(), EventSet::READABLE).unwrap();
        drop(wr);
        events.clear();
        poller.poll(&mut events, 100_000).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].set.contains(EventSet::HANGUP) || events[0].set.contains(EventSet::READABLE));
    }
}
