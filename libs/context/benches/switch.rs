// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use filament_context::{Context, Stack, prepare, switch};
use std::cell::Cell;
use std::ptr;

thread_local! {
    static HOST: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
    static GUEST: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
}

extern "C" fn partner() -> ! {
    loop {
        let host = HOST.with(Cell::get);
        let guest = GUEST.with(Cell::get);
        unsafe { switch(guest, host) };
    }
}

fn switch_round_trip(c: &mut Criterion) {
    let stack = Stack::new(64 * 1024).unwrap();
    let mut host = Context::new();
    let mut guest = Context::new();
    unsafe { prepare(&mut guest, stack.top(), partner) };
    HOST.with(|cell| cell.set(&raw mut host));
    GUEST.with(|cell| cell.set(&raw mut guest));

    c.bench_function("switch_round_trip", |b| {
        b.iter(|| unsafe { switch(&raw mut host, &raw const guest) })
    });

    drop(stack);
}

criterion_group!(benches, switch_round_trip);
criterion_main!(benches);
