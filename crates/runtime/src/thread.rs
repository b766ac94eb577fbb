//! Forked threads sharing the heap.
//!
//! `fork` claims an idle slot from the fixed pool, snapshots the calling
//! thread's stack (the callee and its arguments included), shares the
//! globals cell, and launches a detached OS thread whose body is a
//! single `call`. The pool lock is held across the claim so the
//! collector cannot open a stop-the-world window while a half-
//! initialised slot exists; the caller marks itself indisposable while
//! waiting on that lock so an in-flight collection never deadlocks on
//! it.
//!
//! There is no cancellation: a forked thread either completes its call
//! or errors, marks its slot finished and exits. Coordination between
//! threads happens only through Global cells.

use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::state::{Interrupt, State, GLOBAL_INDEX, MAX_THREADS, RET_SENTINEL};

impl State {
    /// Fork `stack[-(nargs+1)]` as a new thread with `nargs` arguments.
    /// Pops the callable and arguments and pushes a Boolean: false when
    /// the pool is exhausted or the spawn failed.
    pub fn fork(&mut self, nargs: i32) -> Result<()> {
        let width = nargs + 1; // callable + args

        // Park while waiting for the pool: a sweep in progress holds
        // this lock and must not wait for us.
        self.thread_indisposable();
        let main = self.main_arc();
        let pool = main.pool_lock.lock();
        self.thread_disposable();

        let Some(slot) = claim_slot(&main) else {
            drop(pool);
            self.pop(width);
            return self.push_boolean(false);
        };

        // Snapshot our state into the slot; the child finds the callable
        // and arguments at the top of the copied stack.
        let tid = main.next_tid();
        {
            // Safety: the slot was idle and is not yet running; we hold
            // the pool lock, so no collector window can observe it
            // half-written.
            let child = unsafe { &mut *main.threads[slot].ctx.get() };
            let ctx = self.ctx_mut();
            child.tid = tid;
            child.stack.clear();
            child.stack.extend_from_slice(&ctx.stack);
            child.frames.clear();
            child.frames.extend_from_slice(&ctx.frames);
            child.pc = RET_SENTINEL;
            child.narg = nargs;
            child.prot = None;
            child.interrupt = Interrupt::empty();
            child.recovery = None;
            child.cache = ctx.cache.clone();
            child.builder = None;
            child.gray.clear();
            child.gray_overflow = false;
            child.debug_mask = ctx.debug_mask;
            child.debug_cb = ctx.debug_cb;
            // The globals cell is shared, not copied.
            child.stack[GLOBAL_INDEX as usize] = self.get(GLOBAL_INDEX);
        }
        main.thread_started();

        let child_state = State::from_slot(self.main_arc(), slot);
        let spawned = std::thread::Builder::new()
            .name(format!("lyra-{tid}"))
            .spawn(move || thread_boot(child_state));
        drop(pool);

        match spawned {
            Ok(handle) => {
                drop(handle); // detached
                tracing::debug!(tid, "forked thread");
                self.pop(width);
                self.push_boolean(true)
            }
            Err(e) => {
                // Roll the slot back so it can be claimed again.
                main.threads[slot].finished.store(true, Ordering::SeqCst);
                main.thread_stopped();
                tracing::debug!(error = %e, "thread spawn failed");
                self.pop(width);
                self.push_boolean(false)
            }
        }
    }
}

fn claim_slot(main: &crate::state::MainState) -> Option<usize> {
    (1..MAX_THREADS).find(|&i| {
        main.threads[i]
            .finished
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    })
}

/// Body of a forked thread: run the call, then retire the slot.
fn thread_boot(mut s: State) {
    let narg = {
        // Safety: this thread exclusively owns its context now.
        let ctx = unsafe { &mut *s.ctx_ptr() };
        ctx.narg
    };

    // Errors have already printed their backtrace; a failed thread just
    // retires silently.
    if let Err(e) = s.call(narg, 1) {
        tracing::debug!(error = %e.message(), "forked thread errored");
    }

    let ctx = unsafe { &mut *s.ctx_ptr() };
    ctx.stack.clear();
    tracing::debug!(tid = ctx.tid, "thread finished");
    s.thread_indisposable();

    // After `finished` is set the slot may be reclaimed by a new fork,
    // so the context must not be touched past this point.
    let main = s.main_arc();
    let _pool = main.pool_lock.lock();
    main.threads[s.slot()].finished.store(true, Ordering::SeqCst);
    main.thread_stopped();
}
