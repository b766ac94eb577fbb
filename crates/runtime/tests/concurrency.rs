//! Forked threads, transactions and cross-thread ownership rules.

use std::sync::atomic::{AtomicBool, Ordering};

use lyra_runtime::{Result, State, Value, ValueKind};
use serial_test::serial;

fn wait_for_threads(s: &State) {
    while s.num_threads() > 1 {
        std::thread::yield_now();
    }
}

/// Swap function for the counter transactions: `{:x n}` -> `{:x n+1}`.
fn inc_x(s: &mut State, _narg: i32) -> Result<bool> {
    s.check_type(-1, ValueKind::Map)?;
    s.push_string("x")?;
    if !s.map_get(-2)? {
        return Err(s.fatal("missing counter key"));
    }
    let n = s.to_number(-1);
    s.pop(1);
    s.push_string("x")?;
    s.push_number(n + 1.0)?;
    s.map_insert(-3)?;
    Ok(true)
}

/// Thread body: run 100 increment transactions against the global cell
/// passed as the single argument.
fn worker(s: &mut State, _narg: i32) -> Result<bool> {
    for _ in 0..100 {
        s.copy(-1)?; // the cell
        s.push_function(inc_x)?;
        s.transaction(0)?;
        s.pop(1); // transaction result
    }
    Ok(false)
}

#[test]
#[serial]
fn transaction_contention_counts_exactly() {
    let mut s = State::new();

    // g = global {:x 0}
    s.push_string("x").unwrap();
    s.push_number(0.0).unwrap();
    s.map(1).unwrap();
    s.ref_global(-1).unwrap(); // [m, g]

    let mut spawned = 0;
    for _ in 0..10 {
        s.push_function(worker).unwrap();
        s.copy(-2).unwrap(); // the cell
        s.fork(1).unwrap();
        if s.to_boolean(-1) {
            spawned += 1;
        }
        s.pop(1);
    }
    assert_eq!(spawned, 10);
    wait_for_threads(&s);

    s.unref(-1).unwrap(); // [m, g, final]
    s.push_string("x").unwrap();
    assert!(s.map_get(-2).unwrap());
    assert_eq!(s.to_number(-1), f64::from(spawned * 100));
    s.pop(4);
}

#[test]
#[serial]
fn transactions_serialise_on_one_thread_too() {
    let mut s = State::new();
    s.push_string("x").unwrap();
    s.push_number(0.0).unwrap();
    s.map(1).unwrap();
    s.ref_global(-1).unwrap(); // [m, g]

    for _ in 0..5 {
        s.copy(-1).unwrap();
        s.push_function(inc_x).unwrap();
        s.transaction(0).unwrap();
        s.pop(1);
    }

    s.unref(-1).unwrap();
    s.push_string("x").unwrap();
    assert!(s.map_get(-2).unwrap());
    assert_eq!(s.to_number(-1), 5.0);
    s.pop(4);
}

#[test]
#[serial]
fn transaction_replaces_inputs_with_result() {
    let mut s = State::new();
    let base = s.stack_len();

    s.push_string("x").unwrap();
    s.push_number(0.0).unwrap();
    s.map(1).unwrap();
    s.ref_global(-1).unwrap(); // [m, g]
    s.copy(-1).unwrap(); // [m, g, g]
    s.push_function(inc_x).unwrap();
    s.push_number(99.0).unwrap(); // an extra argument inc_x ignores

    // inc_x must accept the extra argument to stay arity-agnostic here.
    fn inc_x_extra(s: &mut State, _narg: i32) -> Result<bool> {
        // (current, extra) on the stack; drop the extra.
        s.pop(1);
        inc_x(s, 1)
    }
    s.put(-2, Value::Native(inc_x_extra));

    s.transaction(1).unwrap();
    // [m, g, result]
    assert_eq!(s.stack_len(), base + 3);
    assert_eq!(s.type_(-1), ValueKind::Map);
    s.pop(3);
}

#[test]
#[serial]
fn locals_fault_across_threads() {
    static FAULTED: AtomicBool = AtomicBool::new(false);

    fn try_touch(s: &mut State, _narg: i32) -> Result<bool> {
        // The Local cell arrives as our argument but belongs to the
        // spawning thread.
        match s.unref(-1) {
            Err(e) if e.message().contains("owner thread") => {
                FAULTED.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(false)
    }

    FAULTED.store(false, Ordering::SeqCst);
    let mut s = State::new();
    s.push_number(1.0).unwrap();
    s.ref_local(-1).unwrap(); // [1, cell]

    s.push_function(try_touch).unwrap();
    s.copy(-2).unwrap();
    s.fork(1).unwrap();
    assert!(s.to_boolean(-1));
    s.pop(1);
    wait_for_threads(&s);
    assert!(FAULTED.load(Ordering::SeqCst));
    s.pop(2);
}

#[test]
#[serial]
fn fork_pool_exhaustion_reports_false() {
    // Saturate the pool with sleepers, then watch one more fork fail.
    fn sleeper(s: &mut State, _narg: i32) -> Result<bool> {
        s.thread_indisposable();
        std::thread::sleep(std::time::Duration::from_millis(50));
        s.thread_disposable();
        Ok(false)
    }

    let mut s = State::new();
    let mut ok = 0;
    let mut failed = 0;
    for _ in 0..lyra_runtime::MAX_THREADS + 8 {
        s.push_function(sleeper).unwrap();
        s.fork(0).unwrap();
        if s.to_boolean(-1) {
            ok += 1;
        } else {
            failed += 1;
        }
        s.pop(1);
    }
    assert!(ok <= lyra_runtime::MAX_THREADS - 1);
    assert!(failed > 0);
    wait_for_threads(&s);
}
