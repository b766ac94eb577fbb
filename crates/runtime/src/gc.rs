//! Tri-colour incremental garbage collector.
//!
//! Every heap object is a [`GcBox`]: a [`Header`] followed by the payload.
//! Allocation links the object into a process-wide intrusive list and
//! colours it Black, so objects born during a mark phase can never be
//! swept by it. Mutator threads run bounded mark slices at bytecode
//! instruction boundaries whenever the live count exceeds the throttle;
//! the sweep itself is stop-the-world: it waits until every other thread
//! is either finished or parked disposable, drains the per-thread write
//! barrier buffers, finishes marking and frees everything still White.
//!
//! Collections therefore only ever happen at explicit suspension points
//! (instruction boundaries, [`State::gc`](crate::State::gc)). Code that
//! holds values in Rust locals across a re-entry into the interpreter
//! must keep them rooted on the value stack first — the collector scans
//! value stacks, string caches, gray buffers and the C-lambda table, not
//! native frames.
//!
//! Write barriers are deferred: mutating a reference cell pushes the cell
//! into the mutating thread's own unsynchronised gray buffer, which the
//! collector drains once all threads are parked. A cell owned by another
//! thread that is reached during an incremental slice is likewise
//! deferred instead of read, so cell payloads are only ever inspected by
//! their owner or inside the stop-the-world window.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cell;
use crate::cell::{GlobalCell, LocalCell};
use crate::intern::Str;
use crate::map::{Map, MapNode};
use crate::seq::Seq;
use crate::state::{Interrupt, State, ThreadCtx};
use crate::value::{NativeData, Value};
use crate::vector::{VecNode, Vector};
use crate::vm::{Closure, Proto};

/// Capacity of the shared gray stack and of each thread's barrier buffer.
pub(crate) const GRAY_SIZE: usize = 512;

/// Allow ~25% memory overhead per thread between collections.
const OVERHEAD_DIVISOR: usize = 4;

/// Objects blackened per incremental mark slice.
const MARK_SLICE: usize = 64;

/// Header user flag: the cell already sits in a barrier buffer.
pub(crate) const USR_GRAY: u8 = 0x1;

/// Type-erased heap object reference.
pub(crate) type GcRef = *mut Header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Color {
    White = 0,
    Gray = 1,
    Black = 2,
}

/// Concrete heap type of an object, for tracing and freeing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ObjKind {
    Str,
    Proto,
    Closure,
    Vector,
    VecNode,
    Map,
    MapNode,
    Seq,
    Local,
    Global,
    Data,
}

/// Types that live on the collected heap.
pub(crate) trait HeapObject {
    const KIND: ObjKind;
}

/// Per-object metadata, first field of every [`GcBox`].
#[repr(C)]
pub(crate) struct Header {
    next: AtomicPtr<Header>,
    kind: ObjKind,
    color: AtomicU8,
    usr: AtomicU8,
}

impl Header {
    fn new(kind: ObjKind) -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            kind,
            color: AtomicU8::new(Color::Black as u8),
            usr: AtomicU8::new(0),
        }
    }

    pub(crate) fn kind(&self) -> ObjKind {
        self.kind
    }

    fn color(&self) -> Color {
        match self.color.load(Ordering::Relaxed) {
            0 => Color::White,
            1 => Color::Gray,
            _ => Color::Black,
        }
    }

    fn set_color(&self, c: Color) {
        self.color.store(c as u8, Ordering::Relaxed);
    }

    pub(crate) fn test_and_set_usr_gray(&self) -> bool {
        self.usr.fetch_or(USR_GRAY, Ordering::Relaxed) & USR_GRAY != 0
    }

    fn clear_usr_gray(&self) {
        self.usr.fetch_and(!USR_GRAY, Ordering::Relaxed);
    }
}

/// A heap object: header followed by payload. `repr(C)` so a `*mut
/// Header` and a `*mut GcBox<T>` to the same object coincide.
#[repr(C)]
pub(crate) struct GcBox<T> {
    pub(crate) header: Header,
    pub(crate) data: T,
}

/// Typed pointer to a collected heap object.
///
/// `Gc` is `Copy` and carries no ownership; the referent stays alive for
/// as long as it is reachable from a GC root. Dereferencing is safe under
/// the runtime's reachability discipline: every `Gc` handed out by the
/// API was read from a rooted location, and the non-moving collector
/// never invalidates pointers to live objects.
pub struct Gc<T> {
    ptr: NonNull<GcBox<T>>,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Gc<T> {}

// Safety: heap objects are either immutable after construction or guard
// their interior mutation themselves (Local cells by tid ownership,
// Global cells by atomic swap), and reclamation only happens inside the
// stop-the-world window when no mutator can hold an unrooted reference.
unsafe impl<T> Send for Gc<T> {}
unsafe impl<T> Sync for Gc<T> {}

impl<T> std::ops::Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: see the type-level invariant above.
        unsafe { &self.ptr.as_ref().data }
    }
}

impl<T> Gc<T> {
    /// Address of the object, for identity comparison and hashing.
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn ptr_eq(a: Self, b: Self) -> bool {
        a.ptr == b.ptr
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the header is the first field of the live GcBox.
        unsafe { &self.ptr.as_ref().header }
    }

    pub(crate) fn erased(self) -> *mut Header {
        self.ptr.as_ptr().cast()
    }

    pub(crate) fn as_box_ptr(self) -> *mut GcBox<T> {
        self.ptr.as_ptr()
    }

    /// Rebuild a typed pointer from an erased header.
    ///
    /// # Safety
    /// `h` must point at a live `GcBox<T>` whose header kind matches `T`.
    pub(crate) unsafe fn from_header(h: *mut Header) -> Self {
        debug_assert!(!h.is_null());
        Self {
            // Safety: caller guarantees h addresses a GcBox<T>.
            ptr: unsafe { NonNull::new_unchecked(h.cast()) },
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gc(0x{:x})", self.addr())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Mark,
    Sweep,
}

/// Shared collector state, guarded by the collector mutex. Mutators take
/// it with `try_lock` for incremental slices so at most one thread makes
/// collection progress at a time.
pub(crate) struct Collector {
    phase: Phase,
    gray: Vec<*mut Header>,
}

// Safety: the raw pointers inside are only dereferenced by the lock
// holder, and the objects they denote are kept alive by the mark
// invariants.
unsafe impl Send for Collector {}

/// The shared heap: intrusive object list plus collector state.
pub(crate) struct Heap {
    head: AtomicPtr<Header>,
    list_lock: Mutex<()>,
    num_objects: AtomicUsize,
    throttle: AtomicUsize,
    collector: Mutex<Collector>,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            list_lock: Mutex::new(()),
            num_objects: AtomicUsize::new(0),
            throttle: AtomicUsize::new(0),
            collector: Mutex::new(Collector {
                phase: Phase::Sweep,
                gray: Vec::with_capacity(GRAY_SIZE),
            }),
        }
    }

    pub(crate) fn num_objects(&self) -> usize {
        self.num_objects.load(Ordering::Relaxed)
    }

    /// Allocate a heap object, inserted Black into the object list.
    pub(crate) fn alloc<T: HeapObject>(&self, data: T) -> Gc<T> {
        let boxed = Box::new(GcBox {
            header: Header::new(T::KIND),
            data,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        let h: *mut Header = ptr.as_ptr().cast();

        let _list = self.list_lock.lock();
        // Safety: h is the freshly allocated, unpublished object.
        unsafe {
            (*h).next.store(self.head.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.head.store(h, Ordering::Release);
        self.num_objects.fetch_add(1, Ordering::Relaxed);

        Gc {
            ptr,
            _marker: PhantomData,
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Final teardown: every surviving object is freed unconditionally.
        let mut obj = self.head.load(Ordering::Relaxed);
        while !obj.is_null() {
            // Safety: the list is exclusively ours during drop.
            unsafe {
                let next = (*obj).next.load(Ordering::Relaxed);
                free_object(obj);
                obj = next;
            }
        }
    }
}

/// Erased header of a value's heap referent, if it has one.
fn value_header(v: &Value) -> Option<*mut Header> {
    match v {
        Value::Str(o) => Some(o.erased()),
        Value::Closure(o) => Some(o.erased()),
        Value::Vector(o) => Some(o.erased()),
        Value::Map(o) => Some(o.erased()),
        Value::Seq(o) => Some(o.erased()),
        Value::Local(o) => Some(o.erased()),
        Value::Global(o) => Some(o.erased()),
        Value::Data(o) => Some(o.erased()),
        _ => None,
    }
}

fn add_to_gray(c: &mut Collector, h: *mut Header) {
    // Safety: h comes from a live value or object field.
    let hdr = unsafe { &*h };
    if hdr.color() != Color::White {
        return;
    }
    hdr.set_color(Color::Gray);
    c.gray.push(h);
}

fn gray_value(c: &mut Collector, v: &Value) {
    if let Some(h) = value_header(v) {
        add_to_gray(c, h);
    }
}

/// Blacken one object and enqueue everything it references.
///
/// `stw` is true inside the stop-the-world window, where every thread is
/// parked and cross-thread Local cells may be read directly; during
/// incremental slices they are deferred into the marking thread's
/// barrier buffer instead.
unsafe fn trace_object(c: &mut Collector, ctx: &mut ThreadCtx, h: *mut Header, stw: bool) {
    let hdr = unsafe { &*h };
    match hdr.kind() {
        ObjKind::Str => {}
        ObjKind::Proto => {
            let p: Gc<Proto> = unsafe { Gc::from_header(h) };
            for child in p.protos.iter() {
                add_to_gray(c, child.erased());
            }
        }
        ObjKind::Closure => {
            let f: Gc<Closure> = unsafe { Gc::from_header(h) };
            add_to_gray(c, f.proto.erased());
            for v in f.constants.iter() {
                gray_value(c, v);
            }
            for v in f.upvalues.iter() {
                gray_value(c, v);
            }
        }
        ObjKind::Vector => {
            let v: Gc<Vector> = unsafe { Gc::from_header(h) };
            add_to_gray(c, v.root.erased());
            add_to_gray(c, v.tail.erased());
        }
        ObjKind::VecNode => {
            let n: Gc<VecNode> = unsafe { Gc::from_header(h) };
            match &*n {
                VecNode::Branch(children) => {
                    for child in children.iter() {
                        add_to_gray(c, child.erased());
                    }
                }
                VecNode::Leaf(values) => {
                    for v in values.iter() {
                        gray_value(c, v);
                    }
                }
            }
        }
        ObjKind::Map => {
            let m: Gc<Map> = unsafe { Gc::from_header(h) };
            if let Some(root) = m.root {
                add_to_gray(c, root.erased());
            }
        }
        ObjKind::MapNode => {
            let n: Gc<MapNode> = unsafe { Gc::from_header(h) };
            match &*n {
                MapNode::Leaf { key, val, .. } => {
                    gray_value(c, key);
                    gray_value(c, val);
                }
                MapNode::Collision { leaves, .. } => {
                    for leaf in leaves.iter() {
                        add_to_gray(c, leaf.erased());
                    }
                }
                MapNode::Idx { nodes, .. } | MapNode::Full { nodes, .. } => {
                    for node in nodes.iter() {
                        add_to_gray(c, node.erased());
                    }
                }
            }
        }
        ObjKind::Seq => {
            let q: Gc<Seq> = unsafe { Gc::from_header(h) };
            match &*q {
                Seq::Cell { first, rest } => {
                    gray_value(c, first);
                    gray_value(c, rest);
                }
                Seq::Range { .. } => {}
                Seq::Iter { obj, .. } => gray_value(c, obj),
                Seq::Lazy { f, d } => {
                    gray_value(c, f);
                    gray_value(c, d);
                }
                Seq::Tree { links } => {
                    for link in links.iter() {
                        add_to_gray(c, link.node.erased());
                    }
                }
            }
        }
        ObjKind::Local => {
            let l: Gc<LocalCell> = unsafe { Gc::from_header(h) };
            if stw || l.tid == ctx.tid {
                // Safety: owner thread, or the owner is parked.
                let v = unsafe { l.read_raw() };
                gray_value(c, &v);
            } else {
                cell::gray_mutable(ctx, h);
            }
        }
        ObjKind::Global => {
            let g: Gc<GlobalCell> = unsafe { Gc::from_header(h) };
            if let Some(map) = g.load_map() {
                add_to_gray(c, map.erased());
            }
        }
        ObjKind::Data => {
            let d: Gc<NativeData> = unsafe { Gc::from_header(h) };
            if let Some(trace) = d.class.trace {
                trace(d.data.as_ref(), &mut |v| gray_value(c, &v));
            }
        }
    }
}

/// Run one bounded mark slice; flips to the sweep phase once the gray
/// stack drains.
fn mark_step(c: &mut Collector, ctx: &mut ThreadCtx, stw: bool) {
    for _ in 0..MARK_SLICE {
        let Some(h) = c.gray.pop() else {
            c.phase = Phase::Sweep;
            return;
        };
        // Safety: gray stack entries are live by the mark invariant.
        let hdr = unsafe { &*h };
        if hdr.color() == Color::Black {
            continue;
        }
        hdr.set_color(Color::Black);
        unsafe { trace_object(c, ctx, h, stw) };
    }
}

/// Gray every root owned by one thread: its value stack and its string
/// cache ring.
fn collect_stack(c: &mut Collector, ctx: &ThreadCtx) {
    for v in &ctx.stack {
        gray_value(c, v);
    }
    ctx.cache.for_each(|s| add_to_gray(c, s.erased()));
}

/// Drain one thread's write-barrier buffer: gray the current payload of
/// every recorded cell. Must only run inside the stop-the-world window.
unsafe fn drain_gray(c: &mut Collector, ctx: &mut ThreadCtx) {
    for h in ctx.gray.drain(..) {
        let hdr = unsafe { &*h };
        match hdr.kind() {
            ObjKind::Local => {
                let l: Gc<LocalCell> = unsafe { Gc::from_header(h) };
                // Safety: the owner is parked.
                let v = unsafe { l.read_raw() };
                gray_value(c, &v);
            }
            ObjKind::Global => {
                let g: Gc<GlobalCell> = unsafe { Gc::from_header(h) };
                if let Some(map) = g.load_map() {
                    add_to_gray(c, map.erased());
                }
            }
            _ => debug_assert!(false, "non-cell in barrier buffer"),
        }
        hdr.clear_usr_gray();
    }
}

/// Free one unlinked object, running the native-data finalizer first.
///
/// # Safety
/// The object must be unreachable and removed from the list.
unsafe fn free_object(h: *mut Header) {
    // Safety: reconstructing the Box this object was allocated from.
    unsafe {
        match (*h).kind() {
            ObjKind::Str => drop(Box::from_raw(h as *mut GcBox<Str>)),
            ObjKind::Proto => drop(Box::from_raw(h as *mut GcBox<Proto>)),
            ObjKind::Closure => drop(Box::from_raw(h as *mut GcBox<Closure>)),
            ObjKind::Vector => drop(Box::from_raw(h as *mut GcBox<Vector>)),
            ObjKind::VecNode => drop(Box::from_raw(h as *mut GcBox<VecNode>)),
            ObjKind::Map => drop(Box::from_raw(h as *mut GcBox<Map>)),
            ObjKind::MapNode => drop(Box::from_raw(h as *mut GcBox<MapNode>)),
            ObjKind::Seq => drop(Box::from_raw(h as *mut GcBox<Seq>)),
            ObjKind::Local => drop(Box::from_raw(h as *mut GcBox<LocalCell>)),
            ObjKind::Global => drop(Box::from_raw(h as *mut GcBox<GlobalCell>)),
            ObjKind::Data => {
                let b = Box::from_raw(h as *mut GcBox<NativeData>);
                if let Some(finalize) = b.data.class.finalize {
                    finalize(b.data.data.as_ref());
                }
                drop(b);
            }
        }
    }
}

/// Finish marking with every thread parked, then free all White objects
/// and recompute the throttle. Caller holds the collector mutex, the
/// thread-pool lock, and has asserted the collect interrupt.
unsafe fn collect(c: &mut Collector, s: &State) {
    let main = s.main();

    // Roots and deferred barriers of every thread slot, idle ones
    // included (their caches may still pin interned strings).
    let mut overflow = false;
    for slot in main.threads.iter() {
        // Safety: every other thread is finished or parked disposable.
        let other = unsafe { &mut *slot.ctx.get() };
        collect_stack(c, other);
        unsafe { drain_gray(c, other) };
        overflow |= std::mem::take(&mut other.gray_overflow);
    }
    for v in main.c_lambdas.read().iter() {
        gray_value(c, v);
    }
    if overflow {
        // A barrier buffer overflowed since the last sync: conservatively
        // revisit every reference cell in the heap.
        let mut obj = main.heap.head.load(Ordering::Acquire);
        while !obj.is_null() {
            let hdr = unsafe { &*obj };
            if matches!(hdr.kind(), ObjKind::Local | ObjKind::Global) {
                hdr.set_color(Color::White);
                add_to_gray(c, obj);
            }
            obj = hdr.next.load(Ordering::Relaxed);
        }
    }

    c.phase = Phase::Mark;
    // Safety: the slot borrows above have ended; this is the only live
    // reference into our own context.
    let ctx = unsafe { &mut *s.ctx_ptr() };
    while c.phase == Phase::Mark {
        mark_step(c, ctx, true);
    }

    // Sweep the intrusive list: unlink and free White, whiten survivors.
    let mut freed = 0usize;
    let mut alive = 0usize;
    let _list = main.heap.list_lock.lock();
    let mut prev: *mut Header = std::ptr::null_mut();
    let mut obj = main.heap.head.load(Ordering::Relaxed);
    while !obj.is_null() {
        let hdr = unsafe { &*obj };
        let next = hdr.next.load(Ordering::Relaxed);
        if hdr.color() == Color::White {
            if prev.is_null() {
                main.heap.head.store(next, Ordering::Release);
            } else {
                unsafe { (*prev).next.store(next, Ordering::Relaxed) };
            }
            unsafe { free_object(obj) };
            freed += 1;
        } else {
            hdr.set_color(Color::White);
            alive += 1;
            prev = obj;
        }
        obj = next;
    }

    let threads = main.thread_count();
    main.heap
        .throttle
        .store(alive + (alive / OVERHEAD_DIVISOR) * threads, Ordering::Relaxed);
    main.heap.num_objects.fetch_sub(freed, Ordering::Relaxed);

    tracing::debug!(freed, alive, threads, "collection cycle");
}

/// Stop-the-world sweep. Caller holds the collector mutex.
fn sweep(c: &mut Collector, s: &mut State) {
    let main = s.main_arc();
    debug_assert_eq!(c.phase, Phase::Sweep);

    let _pool = main.pool_lock.lock();
    main.set_interrupt(Interrupt::COLLECT);

    // Count ourselves as parked so the wait below is over the others.
    main.threads[s.slot()].indisposable.store(true, Ordering::SeqCst);
    for slot in main.threads.iter() {
        while !slot.finished.load(Ordering::SeqCst) && !slot.indisposable.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    }

    // Safety: the world is stopped.
    unsafe { collect(c, s) };

    // Reseed the gray stack with the live threads' roots so the next
    // mark phase starts from a consistent snapshot.
    for slot in main.threads.iter() {
        if !slot.finished.load(Ordering::SeqCst) {
            // Safety: still inside the stop-the-world window.
            let other = unsafe { &*slot.ctx.get() };
            collect_stack(c, other);
        }
    }

    main.threads[s.slot()].indisposable.store(false, Ordering::SeqCst);
    main.clear_interrupt(Interrupt::COLLECT);
    c.phase = Phase::Mark;
}

/// Mutator entry point, run at instruction boundaries when the GC
/// interrupt is pending: make bounded progress if the heap outgrew the
/// throttle and the collector mutex is free.
pub(crate) fn trace_step(s: &mut State) {
    let main = s.main_arc();
    if main.heap.num_objects() <= main.heap.throttle.load(Ordering::Relaxed) {
        return;
    }
    let Some(mut c) = main.heap.collector.try_lock() else {
        return;
    };
    match c.phase {
        Phase::Mark => {
            let ctx = unsafe { &mut *s.ctx_ptr() };
            mark_step(&mut c, ctx, false);
        }
        Phase::Sweep => sweep(&mut c, s),
    }
}

/// Run a full collection: finish any in-flight mark phase, then sweep.
pub(crate) fn full_gc(s: &mut State) {
    let main = s.main_arc();
    s.thread_indisposable();
    let mut c = main.heap.collector.lock();
    s.thread_disposable();

    if c.phase == Phase::Mark {
        let ctx = unsafe { &mut *s.ctx_ptr() };
        while c.phase == Phase::Mark {
            mark_step(&mut c, ctx, false);
        }
    }
    sweep(&mut c, s);
}
