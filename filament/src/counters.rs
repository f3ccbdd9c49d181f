// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide task allocation counters.
//!
//! Every task allocation and free is counted so leak checks and debug
//! output can compare the two at scheduler teardown.

use std::sync::atomic::{AtomicU64, Ordering};

static CREATED: AtomicU64 = AtomicU64::new(0);
static DROPPED: AtomicU64 = AtomicU64::new(0);

pub(crate) fn task_created() {
    CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn task_dropped() {
    DROPPED.fetch_add(1, Ordering::Relaxed);
}

/// Total tasks allocated since process start.
#[must_use]
pub fn tasks_created() -> u64 {
    CREATED.load(Ordering::Relaxed)
}

/// Total tasks freed since process start.
#[must_use]
pub fn tasks_dropped() -> u64 {
    DROPPED.load(Ordering::Relaxed)
}

/// Number of task allocations currently live across all schedulers.
#[must_use]
pub fn live_tasks() -> u64 {
    tasks_created().saturating_sub(tasks_dropped())
}
