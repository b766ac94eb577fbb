//! Mutable reference cells: thread-owned locals and shared globals.
//!
//! A Local cell is a single mutable slot owned by the thread that
//! created it; the owner tid is checked on every access and a mismatch
//! is a fatal error, which is what makes unsynchronised reads and
//! writes sound. A Global cell is an atomic pointer to a persistent map
//! (null meaning nil) that is only ever replaced through compare-and-
//! swap; transactions retry the swap function until the CAS lands, and
//! are linearisable at the successful swap.
//!
//! Both kinds participate in the collector's deferred write barrier:
//! after a mutation the cell is pushed into the mutating thread's gray
//! buffer (deduplicated by a header flag) so the collector revisits its
//! payload at the next sync point.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::Result;
use crate::gc::{Gc, GcBox, GcRef, HeapObject, ObjKind, GRAY_SIZE};
use crate::map::Map;
use crate::state::{State, ThreadCtx};
use crate::value::{Value, ValueKind};

const OWNER_MSG: &str = "Locals can only be mutated and accessed by owner thread!";

/// Thread-owned mutable slot.
pub struct LocalCell {
    pub tid: u32,
    v: UnsafeCell<Value>,
}

impl HeapObject for LocalCell {
    const KIND: ObjKind = ObjKind::Local;
}

impl LocalCell {
    /// Read the slot without an ownership check.
    ///
    /// # Safety
    /// Caller must be the owner thread, or the owner must be parked
    /// inside the stop-the-world window.
    pub(crate) unsafe fn read_raw(&self) -> Value {
        // Safety: forwarded to the caller.
        unsafe { *self.v.get() }
    }
}

/// Shared cell holding an atomic map pointer; null means nil.
pub struct GlobalCell {
    value: AtomicPtr<GcBox<Map>>,
}

impl HeapObject for GlobalCell {
    const KIND: ObjKind = ObjKind::Global;
}

impl GlobalCell {
    pub(crate) fn load_map(&self) -> Option<Gc<Map>> {
        let p = self.value.load(Ordering::SeqCst);
        if p.is_null() {
            None
        } else {
            // Safety: a non-null pointer in a live global cell always
            // addresses a live map (the cell roots it).
            Some(unsafe { Gc::from_header(p.cast()) })
        }
    }
}

/// Record a mutated cell in the thread's barrier buffer. A full buffer
/// degrades to a flag that forces the collector to revisit every cell at
/// the next sync instead.
pub(crate) fn gray_mutable(ctx: &mut ThreadCtx, h: GcRef) {
    // Safety: h is the header of a live cell.
    let hdr = unsafe { &*h };
    debug_assert!(matches!(hdr.kind(), ObjKind::Local | ObjKind::Global));
    if ctx.gray.len() >= GRAY_SIZE {
        ctx.gray_overflow = true;
        return;
    }
    if hdr.test_and_set_usr_gray() {
        return;
    }
    ctx.gray.push(h);
}

/// Create a Local cell owned by the current thread.
pub fn ref_local(s: &mut State, val: Value) -> Value {
    let tid = s.tid();
    Value::Local(s.alloc(LocalCell {
        tid,
        v: UnsafeCell::new(val),
    }))
}

pub fn unref_local(s: &mut State, loc: Gc<LocalCell>) -> Result<Value> {
    if loc.tid != s.tid() {
        return Err(s.fatal(OWNER_MSG));
    }
    // Safety: ownership just checked.
    Ok(unsafe { loc.read_raw() })
}

pub fn set_local(s: &mut State, loc: Gc<LocalCell>, val: Value) -> Result<()> {
    if loc.tid != s.tid() {
        return Err(s.fatal(OWNER_MSG));
    }
    // Safety: only the owner thread writes, and the collector only reads
    // while the owner is parked.
    unsafe {
        *loc.v.get() = val;
    }
    let h = loc.erased();
    gray_mutable(s.ctx_mut(), h);
    Ok(())
}

/// Create a Global cell. The initial value must be a map or nil.
pub fn ref_global(s: &mut State, val: Value) -> Result<Value> {
    let ptr = match val {
        Value::Nil => std::ptr::null_mut(),
        Value::Map(m) => m.as_box_ptr(),
        _ => return Err(s.fatal("Expected hashmap or nil!")),
    };
    Ok(Value::Global(s.alloc(GlobalCell {
        value: AtomicPtr::new(ptr),
    })))
}

pub fn unref_global(glob: Gc<GlobalCell>) -> Value {
    match glob.load_map() {
        Some(m) => Value::Map(m),
        None => Value::Nil,
    }
}

impl State {
    /// Run a CAS transaction over a Global cell.
    ///
    /// Expects `[global, swap-fn, extras...]` on the stack with `narg`
    /// extras. Loads the current value, calls `swap-fn(current,
    /// extras...)`, and swaps the result in; on CAS failure the loop
    /// retries with the freshly observed value. On success the inputs
    /// are replaced by the new value and the cell is recorded in the
    /// write barrier.
    pub fn transaction(&mut self, narg: i32) -> Result<()> {
        self.check_type(-narg - 2, ValueKind::Global)?;
        let Value::Global(glob) = self.get(-narg - 2) else {
            unreachable!()
        };

        let mut tries = 0u32;
        loop {
            if tries > 0 {
                self.pop(1);
            }
            tries += 1;

            let observed = glob.value.load(Ordering::SeqCst);
            let current = if observed.is_null() {
                Value::Nil
            } else {
                // Safety: the cell roots its current map.
                Value::Map(unsafe { Gc::from_header(observed.cast()) })
            };

            // f(current, extras...) with everything rooted on the stack.
            self.copy(-narg - 1)?;
            self.push_value(current)?;
            self.copy_range(-narg - 2, narg)?;
            self.call(narg + 1, 1)?;

            let next = match self.get(-1) {
                Value::Nil => std::ptr::null_mut(),
                Value::Map(m) => m.as_box_ptr(),
                _ => return Err(self.fatal("Expected hashmap or nil!")),
            };

            if glob
                .value
                .compare_exchange(observed, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
            tracing::trace!(tries, "transaction retry");
        }

        let h = glob.erased();
        gray_mutable(self.ctx_mut(), h);

        // Collapse [global, f, extras..., result] down to [result].
        let result = self.get(-1);
        let base = self.stack_len() - narg as usize - 3;
        self.truncate(base);
        self.push_value(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_eq;

    #[test]
    fn local_roundtrip() {
        let mut s = State::new();
        let cell = ref_local(&mut s, Value::Number(1.0));
        let Value::Local(loc) = cell else { panic!() };
        assert!(value_eq(
            &unref_local(&mut s, loc).unwrap(),
            &Value::Number(1.0)
        ));
        set_local(&mut s, loc, Value::Number(2.0)).unwrap();
        assert!(value_eq(
            &unref_local(&mut s, loc).unwrap(),
            &Value::Number(2.0)
        ));
    }

    #[test]
    fn global_holds_map_or_nil() {
        let mut s = State::new();
        let g = ref_global(&mut s, Value::Nil).unwrap();
        let Value::Global(glob) = g else { panic!() };
        assert!(matches!(unref_global(glob), Value::Nil));
        assert!(ref_global(&mut s, Value::Number(1.0)).is_err());
    }

    #[test]
    fn barrier_deduplicates() {
        let mut s = State::new();
        let cell = ref_local(&mut s, Value::Nil);
        let Value::Local(loc) = cell else { panic!() };
        let before = s.ctx_mut().gray.len();
        set_local(&mut s, loc, Value::Number(1.0)).unwrap();
        set_local(&mut s, loc, Value::Number(2.0)).unwrap();
        set_local(&mut s, loc, Value::Number(3.0)).unwrap();
        assert_eq!(s.ctx_mut().gray.len(), before + 1);
    }
}
