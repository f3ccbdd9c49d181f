// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guard-paged task stacks.

use std::io::Error;
use std::num::NonZeroUsize;
use std::ptr;

/// Minimum size of a stack, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 4096;

#[cfg(not(unix))]
compile_error!("Unsupported target platform");

/// A heap-mapped stack with one inaccessible guard page at its low end.
///
/// The mapping is reserved `PROT_NONE` first and unprotected above the
/// guard page, so an overflowing task faults instead of scribbling over
/// neighboring allocations.
#[derive(Debug)]
pub struct Stack {
    top: NonZeroUsize,
    mmap_len: usize,
}

impl Stack {
    /// Maps a new stack with at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the address space reservation or the
    /// protection change fails.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // Guard page plus round up to a page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping, no aliasing concerns.
        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Construct first so a failing mprotect still unmaps on drop.
            let out = Self {
                top: NonZeroUsize::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
            };

            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Highest address of the stack, aligned to a page boundary.
    #[must_use]
    pub fn top(&self) -> usize {
        self.top.get()
    }

    /// Lowest address of the mapping, including the guard page.
    #[must_use]
    pub fn bottom(&self) -> usize {
        self.top.get() - self.mmap_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let mmap = self.top.get() - self.mmap_len;
        // Safety: we own the mapping and nothing runs on it anymore.
        let ret = unsafe { libc::munmap(mmap as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

fn page_size() -> usize {
    // Safety: trivially safe sysconf query.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).expect("negative page size");
    assert!(pagesize.is_power_of_two());
    pagesize
}
