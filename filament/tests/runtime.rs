// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving a whole scheduler per test thread.

use filament::sync::Cond;
use filament::{Error, Readiness, compute};
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    (fds[0], fds[1])
}

fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[test]
fn sleep_wakes_in_deadline_order() {
    init_tracing();
    let order = Rc::new(RefCell::new(Vec::new()));
    let started = Instant::now();
    for (tag, ms) in [(1u8, 30u64), (2, 10), (3, 20)] {
        let order = order.clone();
        filament::spawn(move || {
            filament::sleep(Duration::from_millis(ms)).unwrap();
            order.borrow_mut().push(tag);
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert_eq!(*order.borrow(), vec![2, 3, 1]);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn sleep_lasts_at_least_requested() {
    init_tracing();
    let elapsed = Rc::new(RefCell::new(None));
    {
        let elapsed = elapsed.clone();
        filament::spawn(move || {
            let started = Instant::now();
            filament::sleep(Duration::from_millis(20)).unwrap();
            *elapsed.borrow_mut() = Some(started.elapsed());
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert!(elapsed.borrow().unwrap() >= Duration::from_millis(20));
}

#[test]
fn io_readiness_beats_timeout() {
    init_tracing();
    let (rd, wr) = pipe();
    let outcome = Rc::new(RefCell::new(None));
    {
        let outcome = outcome.clone();
        filament::spawn(move || {
            let started = Instant::now();
            let readiness = filament::wait_readable(rd, Some(Duration::from_millis(50))).unwrap();
            *outcome.borrow_mut() = Some((readiness, started.elapsed()));
        })
        .unwrap();
    }
    filament::spawn(move || {
        filament::sleep(Duration::from_millis(10)).unwrap();
        let n = unsafe { libc::write(wr, [7u8].as_ptr().cast(), 1) };
        assert_eq!(n, 1);
    })
    .unwrap();
    filament::run().unwrap();

    let (readiness, elapsed) = outcome.borrow().unwrap();
    assert_eq!(readiness, Readiness::Ready);
    assert!(elapsed >= Duration::from_millis(10));
    close(rd);
    close(wr);
}

#[test]
fn timeout_beats_late_write_without_double_wake() {
    init_tracing();
    let (rd, wr) = pipe();
    let wakes = Rc::new(RefCell::new(Vec::new()));
    let started = Instant::now();
    {
        let wakes = wakes.clone();
        filament::spawn(move || {
            let readiness = filament::wait_readable(rd, Some(Duration::from_millis(50))).unwrap();
            wakes.borrow_mut().push(readiness);
        })
        .unwrap();
    }
    filament::spawn(move || {
        filament::sleep(Duration::from_millis(100)).unwrap();
        // The waiter timed out and was disarmed; this byte wakes nobody.
        let n = unsafe { libc::write(wr, [7u8].as_ptr().cast(), 1) };
        assert_eq!(n, 1);
    })
    .unwrap();
    filament::run().unwrap();

    assert_eq!(*wakes.borrow(), vec![Readiness::TimedOut]);
    assert!(started.elapsed() >= Duration::from_millis(100));
    close(rd);
    close(wr);
}

#[test]
fn closed_peer_reports_eof() {
    init_tracing();
    let (rd, wr) = pipe();
    close(wr);
    let outcome = Rc::new(RefCell::new(None));
    {
        let outcome = outcome.clone();
        filament::spawn(move || {
            *outcome.borrow_mut() = Some(filament::wait_readable(rd, None).unwrap());
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert_eq!(*outcome.borrow(), Some(Readiness::Eof));
    close(rd);
}

#[test]
fn condvar_wakes_in_fifo_order() {
    init_tracing();
    let cv = Cond::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in ["a", "b", "c"] {
        let cv = cv.clone();
        let order = order.clone();
        filament::spawn(move || {
            cv.wait().unwrap();
            order.borrow_mut().push(tag);
        })
        .unwrap();
    }
    {
        let cv = cv.clone();
        let order = order.clone();
        filament::spawn(move || {
            assert!(cv.signal());
            filament::yield_now().unwrap();
            assert!(cv.signal());
            filament::yield_now().unwrap();
            // Two signals woke the first two waiters; the third is still
            // blocked at this point.
            assert_eq!(*order.borrow(), vec!["a", "b"]);
            // Release it so the scheduler can drain.
            assert!(cv.signal());
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn condvar_broadcast_wakes_everyone_in_order() {
    init_tracing();
    let cv = Cond::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in [1u8, 2, 3] {
        let cv = cv.clone();
        let order = order.clone();
        filament::spawn(move || {
            cv.wait().unwrap();
            order.borrow_mut().push(tag);
        })
        .unwrap();
    }
    {
        let cv = cv.clone();
        filament::spawn(move || {
            assert_eq!(cv.broadcast(), 3);
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[test]
fn join_returns_child_value() {
    init_tracing();
    let result = Rc::new(RefCell::new(None));
    {
        let result = result.clone();
        filament::spawn(move || {
            let child = filament::spawn(|| 40 + 2).unwrap();
            *result.borrow_mut() = Some(child.join().unwrap());
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert_eq!(*result.borrow(), Some(42));
}

#[test]
fn join_after_child_already_exited() {
    init_tracing();
    let result = Rc::new(RefCell::new(None));
    {
        let result = result.clone();
        filament::spawn(move || {
            let child = filament::spawn(|| "v").unwrap();
            // Let the child run to completion before joining.
            filament::yield_now().unwrap();
            filament::yield_now().unwrap();
            *result.borrow_mut() = Some(child.join().unwrap());
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert_eq!(*result.borrow(), Some("v"));
}

#[test]
fn join_reports_panicked_child() {
    init_tracing();
    let saw = Rc::new(Cell::new(false));
    {
        let saw = saw.clone();
        filament::spawn(move || {
            let child = filament::spawn(|| -> u32 { panic!("boom") }).unwrap();
            saw.set(matches!(child.join(), Err(Error::Panicked)));
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert!(saw.get());
}

#[test]
fn explicit_exit_value_reaches_joiner() {
    init_tracing();
    let result = Rc::new(RefCell::new(None));
    {
        let result = result.clone();
        filament::spawn(move || {
            let child = filament::spawn(|| -> u32 { filament::exit(7u32) }).unwrap();
            *result.borrow_mut() = Some(child.join().unwrap());
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert_eq!(*result.borrow(), Some(7));
}

#[test]
fn detached_tasks_free_on_exit() {
    init_tracing();
    let flag = Rc::new(Cell::new(false));
    {
        let flag = flag.clone();
        filament::spawn(move || flag.set(true)).unwrap().detach();
    }
    filament::run().unwrap();
    assert!(flag.get());
    // The closure environment was consumed and dropped with the task.
    assert_eq!(Rc::strong_count(&flag), 1);
}

#[test]
fn compute_returns_to_origin_scheduler() {
    init_tracing();
    let seen = Rc::new(RefCell::new(None));
    let slept = Rc::new(RefCell::new(None));
    {
        let seen = seen.clone();
        filament::spawn(move || {
            let home = std::thread::current().id();
            let worker = compute::run(|| {
                let started = Instant::now();
                while started.elapsed() < Duration::from_millis(50) {
                    std::hint::spin_loop();
                }
                std::thread::current().id()
            })
            .unwrap();
            *seen.borrow_mut() = Some((home, worker, std::thread::current().id()));
        })
        .unwrap();
    }
    {
        let slept = slept.clone();
        filament::spawn(move || {
            let started = Instant::now();
            filament::sleep(Duration::from_millis(10)).unwrap();
            *slept.borrow_mut() = Some(started.elapsed());
        })
        .unwrap();
    }
    filament::run().unwrap();

    let (home, worker, after) = seen.borrow().expect("compute task never finished");
    assert_eq!(home, after, "task resumed on a foreign scheduler");
    assert_ne!(home, worker, "compute section never left the scheduler");
    let slept = slept.borrow().expect("sleeper never finished");
    assert!(
        slept >= Duration::from_millis(10) && slept < Duration::from_millis(45),
        "sleeper starved during offload: {slept:?}"
    );
}

#[test]
fn compute_panics_surface_at_home() {
    init_tracing();
    let saw = Rc::new(Cell::new(false));
    {
        let saw = saw.clone();
        filament::spawn(move || {
            let child = filament::spawn(|| {
                compute::run(|| panic!("hot loop went cold")).unwrap();
            })
            .unwrap();
            saw.set(matches!(child.join(), Err(Error::Panicked)));
        })
        .unwrap();
    }
    filament::run().unwrap();
    assert!(saw.get());
}

#[test]
fn schedulers_are_per_thread() {
    init_tracing();
    let handles: Vec<_> = (0..2u64)
        .map(|i| {
            std::thread::spawn(move || {
                let out = Rc::new(Cell::new(0u64));
                let seen = out.clone();
                filament::spawn(move || {
                    filament::sleep(Duration::from_millis(5)).unwrap();
                    seen.set(i * 10 + 1);
                })
                .unwrap();
                filament::run().unwrap();
                out.get()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec![1, 11]);
}

#[test]
fn parked_exit_value_keeps_scheduler_running() {
    init_tracing();
    let (tx, rx) = std::sync::mpsc::channel();
    // The scheduler thread is abandoned on purpose: the live handle keeps
    // the exited task's value claimable, the task keeps the total count
    // above zero, and run() must not tear down underneath it.
    std::thread::spawn(move || {
        let _handle = filament::spawn(|| 9u32).unwrap();
        filament::run().unwrap();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn forever_locked_task_keeps_scheduler_running() {
    init_tracing();
    let (tx, rx) = std::sync::mpsc::channel();
    // Same shape as above: a waiter nobody signals stays queued on the
    // condition and counts, so run() must keep blocking rather than free
    // its stack.
    std::thread::spawn(move || {
        let cv = Cond::new();
        filament::spawn(move || cv.wait().unwrap()).unwrap();
        filament::run().unwrap();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn primitives_outside_the_runtime_report_errors() {
    std::thread::spawn(|| {
        assert!(matches!(filament::yield_now(), Err(Error::NotInRuntime)));
        assert!(matches!(
            filament::sleep(Duration::from_millis(1)),
            Err(Error::NotInRuntime)
        ));
        assert!(matches!(compute::end(), Err(Error::NotInRuntime)));
    })
    .join()
    .unwrap();
}
