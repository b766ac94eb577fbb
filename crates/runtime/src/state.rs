//! The main state and per-thread execution contexts.
//!
//! One process-wide [`MainState`] owns the heap, the global interrupt
//! word, the C-lambda table, the swappable I/O streams and a fixed pool
//! of thread slots. Each OS thread executing Lyra code holds a [`State`]
//! handle: an `Arc` of the main state plus its slot, giving it exclusive
//! access to that slot's [`ThreadCtx`] (value stack, frame stack, string
//! cache, write-barrier buffer, interrupt mask, recovery point).
//!
//! The slot contexts sit behind `UnsafeCell` on purpose: the owning
//! thread mutates its context freely without synchronisation, and the
//! collector reads *other* threads' contexts only inside the
//! stop-the-world window, when every owner is either finished or parked
//! disposable. That protocol is the entire safety argument for the
//! unsafe accessors below.

use std::cell::UnsafeCell;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::cell;
use crate::error::{Error, Result};
use crate::gc::{Gc, GcRef, Heap, HeapObject};
use crate::intern::{self, StringCache};
use crate::map;
use crate::value::{hash_value, DebugFn, Value};
use crate::vm::{Closure, Proto};

/// Value stack depth per thread.
pub const STACK_SIZE: usize = 512;
/// Call frame depth per thread.
pub const MAX_CALLS: usize = 128;
/// Thread pool capacity, main thread included.
pub const MAX_THREADS: usize = 128;

/// Reserved stack slots at the base of every thread's stack.
pub const NIL_INDEX: i32 = 0;
pub const GLOBAL_INDEX: i32 = 1;
pub const REGISTRY_INDEX: i32 = 2;
pub(crate) const INDEX_TOP: usize = 3;

/// Return-address sentinel marking the entry frame of a host call.
pub(crate) const RET_SENTINEL: usize = usize::MAX;

bitflags! {
    /// Cooperative interrupt bits, checked at instruction boundaries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt: u32 {
        /// Run a collector slice.
        const GC = 0x1;
        /// The collector wants a stop-the-world window.
        const COLLECT = 0x2;
        /// Invoke the debug hook.
        const BREAK = 0x4;
    }
}

/// One call frame: the caller's closure, the callee's base slot and the
/// return program counter.
#[derive(Clone, Copy)]
pub(crate) struct Frame {
    pub func: Gc<Closure>,
    pub stack_top: usize,
    pub ret_addr: usize,
}

/// Everything a single thread owns.
pub(crate) struct ThreadCtx {
    pub tid: u32,
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub pc: usize,
    pub narg: i32,
    pub prot: Option<Gc<Proto>>,
    pub interrupt: Interrupt,
    /// Saved (stack_top, frame_top) restored at the host call boundary
    /// when an error unwinds.
    pub recovery: Option<(usize, usize)>,
    pub cache: StringCache,
    pub builder: Option<Vec<u8>>,
    pub gray: Vec<GcRef>,
    pub gray_overflow: bool,
    pub debug_mask: u32,
    pub debug_cb: Option<DebugFn>,
}

impl ThreadCtx {
    fn new() -> Self {
        Self {
            tid: 0,
            stack: Vec::with_capacity(STACK_SIZE),
            frames: Vec::with_capacity(MAX_CALLS),
            pc: RET_SENTINEL,
            narg: 0,
            prot: None,
            interrupt: Interrupt::empty(),
            recovery: None,
            cache: StringCache::new(),
            builder: None,
            gray: Vec::with_capacity(crate::gc::GRAY_SIZE),
            gray_overflow: false,
            debug_mask: 0,
            debug_cb: None,
        }
    }
}

/// A pooled thread slot.
pub(crate) struct ThreadSlot {
    /// True while the slot is idle and claimable.
    pub finished: AtomicBool,
    /// True while the owner is parked in a blocking section and the
    /// collector may treat it as stopped.
    pub indisposable: AtomicBool,
    pub ctx: UnsafeCell<ThreadCtx>,
}

// Safety: the context is only touched by its owning thread, except for
// collector reads inside the stop-the-world window when the owner is
// finished or parked disposable.
unsafe impl Sync for ThreadSlot {}

/// Swappable standard streams, shared by every thread of the state.
pub(crate) struct Streams {
    pub stdin: Mutex<Box<dyn BufRead + Send>>,
    pub stdout: Mutex<Box<dyn Write + Send>>,
    pub stderr: Mutex<Box<dyn Write + Send>>,
}

/// Process-wide shared state: the heap and everything threads share.
pub(crate) struct MainState {
    pub heap: Heap,
    interrupt: AtomicU32,
    pub threads: Box<[ThreadSlot]>,
    /// Serialises slot allocation and the collector's stop-the-world
    /// window.
    pub pool_lock: Mutex<()>,
    thread_count: AtomicUsize,
    tid_count: AtomicU32,
    pub c_lambdas: RwLock<Vec<Value>>,
    ref_counter: AtomicUsize,
    pub streams: Streams,
}

impl MainState {
    fn new() -> Self {
        let threads: Vec<ThreadSlot> = (0..MAX_THREADS)
            .map(|_| ThreadSlot {
                finished: AtomicBool::new(true),
                indisposable: AtomicBool::new(false),
                ctx: UnsafeCell::new(ThreadCtx::new()),
            })
            .collect();
        Self {
            heap: Heap::new(),
            interrupt: AtomicU32::new(0),
            threads: threads.into_boxed_slice(),
            pool_lock: Mutex::new(()),
            thread_count: AtomicUsize::new(1),
            tid_count: AtomicU32::new(1),
            c_lambdas: RwLock::new(Vec::new()),
            ref_counter: AtomicUsize::new(1),
            streams: Streams {
                stdin: Mutex::new(Box::new(std::io::BufReader::new(std::io::stdin()))),
                stdout: Mutex::new(Box::new(std::io::stdout())),
                stderr: Mutex::new(Box::new(std::io::stderr())),
            },
        }
    }

    pub(crate) fn interrupt(&self) -> Interrupt {
        Interrupt::from_bits_truncate(self.interrupt.load(Ordering::SeqCst))
    }

    pub(crate) fn set_interrupt(&self, i: Interrupt) {
        self.interrupt.fetch_or(i.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_interrupt(&self, i: Interrupt) {
        self.interrupt.fetch_and(!i.bits(), Ordering::SeqCst);
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::SeqCst)
    }

    pub(crate) fn thread_started(&self) {
        self.thread_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn thread_stopped(&self) {
        self.thread_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn next_tid(&self) -> u32 {
        self.tid_count.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_ref_handle(&self) -> usize {
        self.ref_counter.fetch_add(1, Ordering::SeqCst)
    }
}

/// Per-thread handle to the runtime; the whole host API hangs off this.
pub struct State {
    pub(crate) main: Arc<MainState>,
    slot: usize,
    ctx: *mut ThreadCtx,
}

// Safety: the handle is moved into the thread that owns its slot; the
// context pointer stays valid for the lifetime of the Arc'd main state.
unsafe impl Send for State {}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Create a fresh runtime: heap, thread pool and the three reserved
    /// stack slots (nil sentinel, globals cell, registry map).
    pub fn new() -> Self {
        let main = Arc::new(MainState::new());
        main.threads[0].finished.store(false, Ordering::SeqCst);
        let ctx = main.threads[0].ctx.get();
        let mut s = State { main, slot: 0, ctx };
        s.bootstrap();
        s
    }

    pub(crate) fn from_slot(main: Arc<MainState>, slot: usize) -> Self {
        let ctx = main.threads[slot].ctx.get();
        State { main, slot, ctx }
    }

    /// Version of the runtime.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn bootstrap(&mut self) {
        self.ctx_mut().stack.push(Value::Nil); // NIL_INDEX

        // The globals map lives in a Local cell that also contains
        // itself under "_G".
        let g_key = self.intern(b"_G");
        let empty = map::create_empty(self);
        let cellv = cell::ref_local(self, Value::Nil);
        let (Value::Map(m), Value::Local(loc)) = (empty, cellv) else {
            unreachable!()
        };
        let globals = map::insert(self, m, g_key, hash_value(&g_key), cellv);
        let stored = cell::set_local(self, loc, globals);
        debug_assert!(stored.is_ok());
        self.ctx_mut().stack.push(cellv); // GLOBAL_INDEX

        let registry = map::create_empty(self);
        self.ctx_mut().stack.push(registry); // REGISTRY_INDEX
        debug_assert_eq!(self.stack_len(), INDEX_TOP);
    }

    pub(crate) fn main(&self) -> &MainState {
        &self.main
    }

    pub(crate) fn main_arc(&self) -> Arc<MainState> {
        Arc::clone(&self.main)
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn ctx_ptr(&self) -> *mut ThreadCtx {
        self.ctx
    }

    #[inline]
    pub(crate) fn ctx(&self) -> &ThreadCtx {
        // Safety: only the owning thread creates shared references, and
        // the collector never reads while the owner is running.
        unsafe { &*self.ctx }
    }

    #[inline]
    pub(crate) fn ctx_mut(&mut self) -> &mut ThreadCtx {
        // Safety: as above, with exclusive access through &mut self.
        unsafe { &mut *self.ctx }
    }

    pub(crate) fn tid(&self) -> u32 {
        self.ctx().tid
    }

    /// Allocate a heap object, asserting the GC interrupt for this
    /// thread so a collector slice runs at the next suspension point.
    pub(crate) fn alloc<T: HeapObject>(&mut self, data: T) -> Gc<T> {
        self.ctx_mut().interrupt |= Interrupt::GC;
        self.main.heap.alloc(data)
    }

    /// Intern a byte string through the per-thread cache.
    pub fn intern(&mut self, bytes: &[u8]) -> Value {
        let hash = crate::value::murmur(bytes, 0);
        if let Some(hit) = self.ctx().cache.lookup(hash, bytes) {
            return Value::Str(hit);
        }
        let s = self.alloc(intern::new_str(bytes.to_vec().into_boxed_slice()));
        self.ctx_mut().cache.insert(s);
        Value::Str(s)
    }

    // ----- stack primitives ---------------------------------------------

    /// Resolve a stack index: negative counts from the top, non-negative
    /// is absolute.
    pub(crate) fn slot_index(&self, idx: i32) -> usize {
        if idx < 0 {
            let len = self.ctx().stack.len();
            debug_assert!((-idx) as usize <= len);
            len - (-idx) as usize
        } else {
            idx as usize
        }
    }

    pub fn stack_len(&self) -> usize {
        self.ctx().stack.len()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.ctx_mut().stack.truncate(len);
    }

    /// Read a stack value.
    pub fn get(&self, idx: i32) -> Value {
        self.ctx().stack[self.slot_index(idx)]
    }

    pub fn put(&mut self, idx: i32, v: Value) {
        let i = self.slot_index(idx);
        self.ctx_mut().stack[i] = v;
    }

    /// Push a value; errors on stack overflow.
    pub fn push_value(&mut self, v: Value) -> Result<()> {
        if self.stack_len() >= STACK_SIZE {
            return Err(self.fatal("Stack overflow!"));
        }
        self.ctx_mut().stack.push(v);
        Ok(())
    }

    /// Discard the top `n` values.
    pub fn pop(&mut self, n: i32) {
        let len = self.stack_len();
        debug_assert!(n >= 0 && n as usize <= len);
        self.truncate(len.saturating_sub(n.max(0) as usize));
    }

    /// Index of the top value.
    pub fn top(&self) -> i32 {
        self.stack_len() as i32 - 1
    }

    /// Push a copy of the value at `idx`.
    pub fn copy(&mut self, idx: i32) -> Result<()> {
        self.push_value(self.get(idx))
    }

    /// Push copies of `num` values starting at `idx`.
    pub fn copy_range(&mut self, idx: i32, num: i32) -> Result<()> {
        let start = self.slot_index(idx);
        for i in 0..num.max(0) as usize {
            let v = self.ctx().stack[start + i];
            self.push_value(v)?;
        }
        Ok(())
    }

    /// Exchange two stack slots.
    pub fn swap(&mut self, a: i32, b: i32) {
        let (ia, ib) = (self.slot_index(a), self.slot_index(b));
        self.ctx_mut().stack.swap(ia, ib);
    }

    // ----- errors -------------------------------------------------------

    /// Raise a fatal runtime error: print the message and a backtrace to
    /// the error stream, then hand back the error for propagation.
    pub fn fatal(&mut self, msg: impl Into<String>) -> Error {
        let message = msg.into();
        {
            let mut err = self.main.streams.stderr.lock();
            let ctx = self.ctx();
            let _ = writeln!(err, "\n{message}\n");
            let _ = writeln!(err, "Thread: {:x}", ctx.tid);
            let nframes = ctx.frames.len();
            for i in (0..nframes).rev() {
                let (prot, pc) = if i + 1 == nframes {
                    match ctx.prot {
                        Some(p) => (p, ctx.pc),
                        None => (ctx.frames[i].func.proto, ctx.frames[i].ret_addr),
                    }
                } else {
                    (ctx.frames[i].func.proto, ctx.frames[i + 1].ret_addr)
                };
                let line = prot.lineinfo.get(pc).map_or(-1, |l| i64::from(*l));
                let _ = writeln!(err, "{i} <{} : {}>", prot.name, line);
            }
            let _ = writeln!(err);
            let _ = err.flush();
        }
        Error::new(message)
    }

    /// Install (or drop) the error recovery point at the current stack
    /// and frame tops. While installed, an error unwinding through
    /// [`call`](State::call) restores both before surfacing.
    pub fn set_error_recovery(&mut self, on: bool) {
        let tops = (self.stack_len(), self.ctx().frames.len());
        self.ctx_mut().recovery = on.then_some(tops);
    }

    // ----- cooperation --------------------------------------------------

    /// Mark this thread as safe to exclude from the stop-the-world
    /// window (entering a blocking call).
    pub fn thread_indisposable(&self) {
        self.main.threads[self.slot]
            .indisposable
            .store(true, Ordering::SeqCst);
    }

    /// Leave the blocking section, waiting out any collection in
    /// progress.
    pub fn thread_disposable(&self) {
        let slot = &self.main.threads[self.slot];
        if slot.indisposable.load(Ordering::SeqCst) {
            while self.main.interrupt().contains(Interrupt::COLLECT) {
                std::thread::yield_now();
            }
            slot.indisposable.store(false, Ordering::SeqCst);
        }
    }

    /// Run a full garbage collection cycle.
    pub fn gc(&mut self) {
        crate::gc::full_gc(self);
    }

    /// Number of objects currently on the heap (diagnostic).
    pub fn heap_size(&self) -> usize {
        self.main.heap.num_objects()
    }

    /// Number of live threads, the caller included.
    pub fn num_threads(&self) -> usize {
        self.main.thread_count()
    }

    /// Number of logical CPU cores.
    pub fn num_cores(&self) -> usize {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// Install the debug hook and raise the break interrupt.
    pub fn set_debug(&mut self, mask: u32, cb: Option<DebugFn>) {
        let ctx = self.ctx_mut();
        ctx.debug_mask = mask;
        ctx.debug_cb = cb;
        ctx.interrupt |= Interrupt::BREAK;
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if self.slot == 0 {
            // The main state waits for every forked thread before the
            // heap tears down with the last Arc.
            self.ctx_mut().stack.clear();
            self.thread_indisposable();
            while self.main.thread_count() > 1 {
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_slots_present() {
        let s = State::new();
        assert_eq!(s.stack_len(), INDEX_TOP);
        assert!(matches!(s.get(NIL_INDEX), Value::Nil));
        assert!(matches!(s.get(GLOBAL_INDEX), Value::Local(_)));
        assert!(matches!(s.get(REGISTRY_INDEX), Value::Map(_)));
    }

    #[test]
    fn stack_net_difference() {
        let mut s = State::new();
        let base = s.top();
        for i in 0..10 {
            s.push_value(Value::Number(f64::from(i))).unwrap();
        }
        assert_eq!(s.top(), base + 10);
        s.pop(4);
        assert_eq!(s.top(), base + 6);
        s.pop(6);
        assert_eq!(s.top(), base);
    }

    #[test]
    fn stack_overflow_is_an_error() {
        let mut s = State::new();
        let mut pushed = 0;
        let err = loop {
            match s.push_value(Value::Nil) {
                Ok(()) => pushed += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(pushed, STACK_SIZE - INDEX_TOP);
        assert!(err.message().contains("overflow"));
    }

    #[test]
    fn swap_and_copy() {
        let mut s = State::new();
        s.push_value(Value::Number(1.0)).unwrap();
        s.push_value(Value::Number(2.0)).unwrap();
        s.swap(-1, -2);
        assert!(matches!(s.get(-1), Value::Number(n) if n == 1.0));
        s.copy(-2).unwrap();
        assert!(matches!(s.get(-1), Value::Number(n) if n == 2.0));
    }

    #[test]
    fn interning_returns_same_object_while_cached() {
        let mut s = State::new();
        let a = s.intern(b"hello world");
        let b = s.intern(b"hello world");
        let (Value::Str(x), Value::Str(y)) = (a, b) else {
            panic!()
        };
        assert!(Gc::ptr_eq(x, y));
    }
}
