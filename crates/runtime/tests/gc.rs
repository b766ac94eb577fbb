//! Collector behaviour: liveness across cycles, reclamation, write
//! barriers, and stop-the-world coordination with parked threads.

use std::sync::atomic::{AtomicBool, Ordering};

use lyra_runtime::{Result, State};
use serial_test::serial;

#[test]
#[serial]
fn survivors_keep_their_content() {
    let mut s = State::new();

    for i in 0..1000 {
        s.push_number(f64::from(i)).unwrap();
    }
    s.vector(1000).unwrap(); // [v]

    s.map(0).unwrap(); // [v, m]
    for i in 0..200 {
        s.push_number(f64::from(i)).unwrap();
        s.push_number(f64::from(i) * 3.0).unwrap();
        s.map_insert(-3).unwrap(); // [v, m, m']
        s.swap(-2, -1);
        s.pop(1); // [v, m']
    }

    // Two full cycles: the first whitens, the second would free anything
    // wrongly unmarked.
    s.gc();
    s.gc();

    for i in (0..1000).step_by(97) {
        s.push_integer(i).unwrap();
        s.vector_index(-3).unwrap();
        assert_eq!(s.to_number(-1), f64::from(i));
        s.pop(1);
    }
    s.push_number(55.0).unwrap();
    assert!(s.map_get(-2).unwrap());
    assert_eq!(s.to_number(-1), 165.0);
    s.pop(3);
}

#[test]
#[serial]
fn unreachable_objects_are_reclaimed() {
    let mut s = State::new();
    s.gc();
    s.gc();
    let baseline = s.heap_size();

    for i in 0..1000 {
        s.push_number(f64::from(i)).unwrap();
        s.vector(1).unwrap();
        s.pop(1);
    }
    let peak = s.heap_size();
    assert!(peak > baseline + 1000, "expected garbage on the heap");

    s.gc();
    s.gc();
    assert!(
        s.heap_size() <= baseline + 4,
        "garbage survived: baseline {baseline}, now {}",
        s.heap_size()
    );
}

#[test]
#[serial]
fn mutated_local_cell_payload_survives() {
    let mut s = State::new();

    s.map(0).unwrap();
    s.ref_local(-1).unwrap(); // [m0, cell]
    s.swap(-2, -1);
    s.pop(1); // [cell]

    // Point the cell at a map that is reachable through it alone.
    s.push_string("k").unwrap();
    s.push_number(5.0).unwrap();
    s.map(1).unwrap(); // [cell, m]
    s.set_ref(-2).unwrap(); // [cell]

    s.gc();
    s.gc();

    s.unref(-1).unwrap(); // [cell, m]
    s.push_string("k").unwrap();
    assert!(s.map_get(-2).unwrap());
    assert_eq!(s.to_number(-1), 5.0);
    s.pop(3);
}

#[test]
#[serial]
fn values_on_other_threads_stacks_are_roots() {
    static READY: AtomicBool = AtomicBool::new(false);
    static RELEASE: AtomicBool = AtomicBool::new(false);
    static INTACT: AtomicBool = AtomicBool::new(false);

    fn hold_vector(s: &mut State, _narg: i32) -> Result<bool> {
        s.push_number(123.0)?;
        s.vector(1)?; // rooted only on this thread's stack

        // Park disposable so the main thread can sweep around us.
        s.thread_indisposable();
        READY.store(true, Ordering::SeqCst);
        while !RELEASE.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        s.thread_disposable();

        s.push_integer(0)?;
        s.vector_index(-2)?;
        INTACT.store(s.to_number(-1) == 123.0, Ordering::SeqCst);
        Ok(false)
    }

    READY.store(false, Ordering::SeqCst);
    RELEASE.store(false, Ordering::SeqCst);
    INTACT.store(false, Ordering::SeqCst);

    let mut s = State::new();
    s.push_function(hold_vector).unwrap();
    s.fork(0).unwrap();
    assert!(s.to_boolean(-1));
    s.pop(1);

    while !READY.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    s.gc();
    s.gc();
    RELEASE.store(true, Ordering::SeqCst);
    while s.num_threads() > 1 {
        std::thread::yield_now();
    }
    assert!(INTACT.load(Ordering::SeqCst));
}

#[test]
#[serial]
fn heap_grows_and_throttle_recovers() {
    // After a collection the throttle allows headroom: growing past it
    // again must not wedge the runtime.
    let mut s = State::new();
    for round in 0..5 {
        for i in 0..500 {
            s.push_number(f64::from(i * round)).unwrap();
            s.vector(1).unwrap();
            s.pop(1);
        }
        s.gc();
    }
    s.gc();
    assert!(s.heap_size() < 5000);
}
