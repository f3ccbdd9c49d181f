// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// Errors reported by runtime operations.
#[derive(Debug)]
pub enum Error {
    /// A stack or task allocation failed.
    OutOfMemory,
    /// The OS rejected a poller registration, deregistration or wait.
    Poller(io::Error),
    /// The descriptor lies outside the range the waiter table covers.
    FdLimit(RawFd),
    /// The calling OS thread has no scheduler, or the operation requires a
    /// running task and none is current (this includes calls made from
    /// inside a compute section, which runs off-scheduler).
    NotInRuntime,
    /// The join target panicked, or exited with a value of an unexpected
    /// type.
    Panicked,
    /// The join target was detached or its exit value was already claimed.
    Detached,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => f.write_str("memory allocation failed"),
            Error::Poller(err) => write!(f, "poller operation failed: {err}"),
            Error::FdLimit(fd) => write!(f, "fd {fd} is outside the waitable range"),
            Error::NotInRuntime => f.write_str("no scheduler or current task on this thread"),
            Error::Panicked => f.write_str("task panicked"),
            Error::Detached => f.write_str("task was detached or already claimed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Poller(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOMEM) {
            Error::OutOfMemory
        } else {
            Error::Poller(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enomem_maps_to_out_of_memory() {
        let err = Error::from(io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(err, Error::OutOfMemory));
        let err = Error::from(io::Error::from_raw_os_error(libc::EBADF));
        assert!(matches!(err, Error::Poller(_)));
    }
}
