// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stack switching support for the `filament` runtime.
//!
//! This crate provides the two low-level building blocks every stackful
//! task needs: a [`Context`] holding the callee-saved register set of a
//! suspended computation together with the [`switch`] routine that trades
//! the running CPU state for a saved one, and a guard-paged [`Stack`] for
//! the task to run on.
//!
//! The switch protocol is deliberately symmetric: `switch(save, restore)`
//! captures the caller into `save` and continues from `restore`, whether
//! `restore` was captured by an earlier switch or synthesized by
//! [`prepare`] to enter a fresh stack. No memory barrier is issued beyond
//! what the architecture implies; callers that move a `Context` across OS
//! threads must provide their own happens-before edge (the runtime's
//! compute pool hands contexts off under a mutex).

mod arch;
pub mod stack;

pub use arch::{Context, STACK_ALIGNMENT, prepare, switch};
pub use stack::{MIN_STACK_SIZE, Stack};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::ptr;

    thread_local! {
        static HOST: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
        static GUEST: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
        static STEPS: Cell<u64> = const { Cell::new(0) };
    }

    extern "C" fn bouncer() -> ! {
        loop {
            STEPS.with(|s| s.set(s.get() + 1));
            let host = HOST.with(Cell::get);
            let guest = GUEST.with(Cell::get);
            // Safety: both contexts are kept alive by the driving test.
            unsafe { switch(guest, host) };
        }
    }

    #[test]
    fn round_trip() {
        let stack = Stack::new(64 * 1024).unwrap();
        let mut host = Context::new();
        let mut guest = Context::new();
        // Safety: the stack outlives the guest context.
        unsafe { prepare(&mut guest, stack.top(), bouncer) };
        HOST.with(|c| c.set(&raw mut host));
        GUEST.with(|c| c.set(&raw mut guest));

        // Each switch must come back to the instruction after the call with
        // the locals of this frame intact.
        for expected in 1..=5u64 {
            // Safety: guest was prepared above and suspends back into host.
            unsafe { switch(&raw mut host, &raw const guest) };
            assert_eq!(STEPS.with(Cell::get), expected);
        }
    }

    #[test]
    fn stack_bounds() {
        let stack = Stack::new(32 * 1024).unwrap();
        assert!(stack.top() > stack.bottom());
        assert!(stack.top() - stack.bottom() >= 32 * 1024);
        assert_eq!(stack.top() % STACK_ALIGNMENT, 0);
    }
}
