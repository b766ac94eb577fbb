//! The host value-stack API.
//!
//! An embedding host drives the VM exclusively through these methods:
//! push and read typed values, build vectors/maps/lists from stack
//! slices, call closures and natives, and manage long-lived references
//! through the registry. Indices follow the usual convention: negative
//! counts from the top (`-1` is the top value), non-negative is an
//! absolute slot.
//!
//! Anything that can allocate asserts the calling thread's GC interrupt,
//! so a collector slice runs at the next suspension point. Helpers that
//! may re-enter the interpreter (lazy sequences) keep every intermediate
//! value on the stack — Rust locals are invisible to the collector.

use std::ffi::c_void;
use std::io::{BufRead, Read, Write};

use parking_lot::MutexGuard;

use crate::bytecode;
use crate::cell;
use crate::error::Result;
use crate::gc::Gc;
use crate::map;
use crate::seq;
use crate::state::{State, REGISTRY_INDEX};
use crate::value::{hash_value, stringify, DataClass, NativeData, NativeFn, Value, ValueKind};
use crate::vector;
use crate::vm;

impl State {
    // ----- typed pushes -------------------------------------------------

    pub fn push_nil(&mut self) -> Result<()> {
        self.push_value(Value::Nil)
    }

    pub fn push_boolean(&mut self, b: bool) -> Result<()> {
        self.push_value(Value::Boolean(b))
    }

    pub fn push_number(&mut self, n: f64) -> Result<()> {
        self.push_value(Value::Number(n))
    }

    pub fn push_integer(&mut self, i: i32) -> Result<()> {
        self.push_number(f64::from(i))
    }

    pub fn push_function(&mut self, f: NativeFn) -> Result<()> {
        self.push_value(Value::Native(f))
    }

    pub fn push_pointer(&mut self, p: *mut c_void) -> Result<()> {
        self.push_value(Value::Pointer(p))
    }

    /// Push a (possibly non-UTF-8) byte string, interned through this
    /// thread's cache.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let v = self.intern(bytes);
        self.push_value(v)
    }

    pub fn push_string(&mut self, s: &str) -> Result<()> {
        self.push_bytes(s.as_bytes())
    }

    /// Allocate a host-defined native data object and push it.
    pub fn new_data(
        &mut self,
        class: &'static DataClass,
        data: Box<dyn std::any::Any + Send + Sync>,
    ) -> Result<()> {
        let d = self.alloc(NativeData { class, data });
        self.push_value(Value::Data(d))
    }

    // ----- typed reads --------------------------------------------------

    pub fn to_number(&self, idx: i32) -> f64 {
        match self.get(idx) {
            Value::Number(n) => n,
            _ => 0.0,
        }
    }

    pub fn to_integer(&self, idx: i32) -> i32 {
        self.to_number(idx) as i32
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        matches!(self.get(idx), Value::Boolean(true))
    }

    pub fn to_pointer(&self, idx: i32) -> *mut c_void {
        match self.get(idx) {
            Value::Pointer(p) => p,
            _ => std::ptr::null_mut(),
        }
    }

    pub fn to_function(&self, idx: i32) -> Option<NativeFn> {
        match self.get(idx) {
            Value::Native(f) => Some(f),
            _ => None,
        }
    }

    /// Bytes of the string at `idx`, or None for non-strings.
    ///
    /// The borrow is tied to `&self`: while it lives no `&mut self`
    /// operation (pop, collection) can run, which keeps the pointer
    /// valid.
    pub fn to_bytes(&self, idx: i32) -> Option<&[u8]> {
        match self.get(idx) {
            // Safety: the string is rooted by the stack slot for at
            // least as long as this shared borrow of the state.
            Value::Str(st) => Some(unsafe { &(*st.as_box_ptr()).data.bytes }),
            _ => None,
        }
    }

    pub fn to_str(&self, idx: i32) -> Option<&str> {
        std::str::from_utf8(self.to_bytes(idx)?).ok()
    }

    pub fn to_data(&self, idx: i32) -> Option<Gc<NativeData>> {
        match self.get(idx) {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Public type tag of the value at `idx`.
    pub fn type_(&self, idx: i32) -> ValueKind {
        self.get(idx).kind()
    }

    pub fn type_name(&self, idx: i32) -> &'static str {
        self.get(idx).type_name()
    }

    /// Human-readable rendering of the value at `idx`.
    pub fn stringify(&self, idx: i32) -> String {
        stringify(&self.get(idx))
    }

    // ----- checks -------------------------------------------------------

    pub fn check_type(&mut self, idx: i32, kind: ValueKind) -> Result<()> {
        let actual = self.type_(idx);
        if actual == kind {
            Ok(())
        } else {
            Err(self.fatal(format!(
                "Bad argument: Expected {}, but got {}.",
                kind.name(),
                actual.name()
            )))
        }
    }

    /// Exact argument-count check for native functions.
    pub fn check_num_arguments(&mut self, num: i32) -> Result<()> {
        let narg = self.ctx().narg;
        if narg == num {
            Ok(())
        } else {
            Err(self.fatal(format!(
                "Bad number of arguments to function. Expected {num} but got {narg}."
            )))
        }
    }

    /// Check the argument count and types. A negative `num` means "at
    /// least |num| arguments"; `ValueKind::Nil` entries accept anything.
    pub fn check_arguments(&mut self, num: i32, kinds: &[ValueKind]) -> Result<()> {
        let narg = self.ctx().narg;
        let fixed = if num < 0 {
            let min = -num;
            if min > narg {
                return Err(self.fatal(format!(
                    "To few arguments passed to function. Expected at least {min} but got {narg}."
                )));
            }
            min
        } else {
            self.check_num_arguments(num)?;
            num
        };
        for (j, want) in kinds.iter().take(fixed as usize).enumerate() {
            if *want == ValueKind::Nil {
                continue;
            }
            let idx = -narg + j as i32;
            let actual = self.type_(idx);
            if actual != *want {
                return Err(self.fatal(format!(
                    "Expected argument {j} to be of type '{}', but it is of type '{}'.",
                    want.name(),
                    actual.name()
                )));
            }
        }
        Ok(())
    }

    // ----- builders -----------------------------------------------------

    /// Replace the top `num` values with a vector of them.
    pub fn vector(&mut self, num: i32) -> Result<()> {
        let mut vec = vector::create_empty(self);
        for i in 0..num {
            let Value::Vector(v) = vec else { unreachable!() };
            let item = self.get(-(num - i));
            vec = vector::push(self, v, item)?;
        }
        self.pop(num);
        self.push_value(vec)
    }

    /// Replace the top `num` key/value pairs with a map.
    pub fn map(&mut self, num: i32) -> Result<()> {
        let mut m = map::create_empty(self);
        let mut i = num * 2;
        while i > 0 {
            let Value::Map(mm) = m else { unreachable!() };
            let k = self.get(-i);
            let v = self.get(-i + 1);
            m = map::insert(self, mm, k, hash_value(&k), v);
            i -= 2;
        }
        self.pop(num * 2);
        self.push_value(m)
    }

    /// Replace the top `num` values with a list (cell chain) of them.
    pub fn list(&mut self, num: i32) -> Result<()> {
        let start = self.stack_len() - num.max(0) as usize;
        let items: Vec<Value> = self.ctx().stack[start..].to_vec();
        let l = seq::cell_create_array(self, &items);
        self.pop(num);
        self.push_value(l)
    }

    #[cfg(test)]
    pub(crate) fn vector_from(&mut self, vals: &[Value]) -> Result<()> {
        for v in vals {
            self.push_value(*v)?;
        }
        self.vector(vals.len() as i32)
    }

    // ----- vectors ------------------------------------------------------

    pub fn vector_length(&mut self, idx: i32) -> Result<i32> {
        self.check_type(idx, ValueKind::Vector)?;
        let Value::Vector(v) = self.get(idx) else {
            unreachable!()
        };
        Ok(vector::length(v) as i32)
    }

    /// `[.., i]` becomes `[.., v[i]]` for the vector at `idx`.
    pub fn vector_index(&mut self, idx: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Vector)?;
        let Value::Vector(v) = self.get(idx) else {
            unreachable!()
        };
        let i = self.check_number(-1)? as i64;
        let item = vector::index(self, v, i)?;
        self.put(-1, item);
        Ok(())
    }

    /// `[.., i, x]` becomes `[.., set(v, i, x)]` for the vector at `idx`.
    pub fn vector_set(&mut self, idx: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Vector)?;
        let Value::Vector(v) = self.get(idx) else {
            unreachable!()
        };
        let i = self.check_number(-2)? as i64;
        let x = self.get(-1);
        let out = vector::set(self, v, i, x)?;
        self.put(-2, out);
        self.pop(1);
        Ok(())
    }

    /// Append the top `num` values to the vector at `idx`, pushing the
    /// result.
    pub fn vector_push(&mut self, idx: i32, num: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Vector)?;
        let mut vec = self.get(idx);
        for i in 0..num {
            let Value::Vector(v) = vec else { unreachable!() };
            let item = self.get(-(num - i));
            vec = vector::push(self, v, item)?;
        }
        self.pop(num);
        self.push_value(vec)
    }

    /// Pop `n` elements (the count read from the stack at `num`) off the
    /// vector at `idx`, pushing the result.
    pub fn vector_pop(&mut self, idx: i32, num: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Vector)?;
        let n = self.check_number(num)? as i64;
        let mut vec = self.get(idx);
        for _ in 0..n {
            let Value::Vector(v) = vec else { unreachable!() };
            vec = vector::pop(self, v)?;
        }
        self.push_value(vec)
    }

    /// `[a, b]` becomes `[a ++ b]`.
    pub fn vector_cat(&mut self) -> Result<()> {
        self.check_type(-2, ValueKind::Vector)?;
        self.check_type(-1, ValueKind::Vector)?;
        let (Value::Vector(a), Value::Vector(b)) = (self.get(-2), self.get(-1)) else {
            unreachable!()
        };
        let out = vector::cat(self, a, b)?;
        self.put(-2, out);
        self.pop(1);
        Ok(())
    }

    // ----- maps ---------------------------------------------------------

    pub fn map_length(&mut self, idx: i32) -> Result<i32> {
        self.check_type(idx, ValueKind::Map)?;
        let Value::Map(m) = self.get(idx) else {
            unreachable!()
        };
        Ok(map::length(m) as i32)
    }

    /// Look up the key at the top in the map at `idx`. On a hit the key
    /// is replaced by the value and `true` is returned; on a miss the
    /// key is popped and `false` is returned.
    pub fn map_get(&mut self, idx: i32) -> Result<bool> {
        self.check_type(idx, ValueKind::Map)?;
        let Value::Map(m) = self.get(idx) else {
            unreachable!()
        };
        let key = self.get(-1);
        let v = map::get(m, &key, hash_value(&key));
        if matches!(v, Value::Invalid) {
            self.pop(1);
            Ok(false)
        } else {
            self.put(-1, v);
            Ok(true)
        }
    }

    /// `[.., k, v]` becomes `[.., insert(m, k, v)]` for the map at `idx`.
    pub fn map_insert(&mut self, idx: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Map)?;
        let Value::Map(m) = self.get(idx) else {
            unreachable!()
        };
        let k = self.get(-2);
        let v = self.get(-1);
        let out = map::insert(self, m, k, hash_value(&k), v);
        self.put(-2, out);
        self.pop(1);
        Ok(())
    }

    /// `[.., k]` becomes `[.., remove(m, k)]` for the map at `idx`.
    pub fn map_remove(&mut self, idx: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Map)?;
        let Value::Map(m) = self.get(idx) else {
            unreachable!()
        };
        let k = self.get(-1);
        let out = map::remove(self, m, &k, hash_value(&k));
        self.put(-1, out);
        Ok(())
    }

    /// Pop the key at the top; report whether the map at `idx` has it.
    pub fn map_has(&mut self, idx: i32) -> Result<bool> {
        self.check_type(idx, ValueKind::Map)?;
        let Value::Map(m) = self.get(idx) else {
            unreachable!()
        };
        let k = self.get(-1);
        self.pop(1);
        Ok(map::has(m, &k, hash_value(&k)))
    }

    /// `[a, b]` becomes `[merge(a, b)]`.
    pub fn map_cat(&mut self) -> Result<()> {
        self.check_type(-2, ValueKind::Map)?;
        self.check_type(-1, ValueKind::Map)?;
        let (Value::Map(a), Value::Map(b)) = (self.get(-2), self.get(-1)) else {
            unreachable!()
        };
        let out = map::cat(self, a, b)?;
        self.put(-2, out);
        self.pop(1);
        Ok(())
    }

    // ----- sequences ----------------------------------------------------

    /// Coerce the value at `idx` into a sequence and push it. Vectors,
    /// maps, strings and existing sequences walk their elements; a
    /// number n produces the inclusive range `0..=n` (`n..=0` reversed);
    /// a callable produces a lazy sequence.
    pub fn seq(&mut self, idx: i32, reverse: bool) -> Result<()> {
        match self.get(idx) {
            Value::Nil => self.push_nil(),
            Value::Vector(v) => {
                let q = seq::it_create_vector(self, v, reverse);
                self.push_value(q)
            }
            Value::Map(m) => {
                let q = seq::tree_create_map(self, m);
                self.push_value(q)
            }
            Value::Str(st) => {
                let q = seq::it_create_string(self, st, reverse);
                self.push_value(q)
            }
            Value::Seq(_) => {
                if reverse {
                    self.seq_reverse(idx)
                } else {
                    self.copy(idx)
                }
            }
            Value::Number(n) => {
                let q = if reverse {
                    seq::range_create(self, n as i64, 0)
                } else {
                    seq::range_create(self, 0, n as i64)
                };
                self.push_value(q)
            }
            f @ (Value::Closure(_) | Value::Native(_)) if !reverse => {
                let q = seq::lazy_create(self, f)?;
                self.push_value(q)
            }
            other => Err(self.fatal(format!(
                "Can't sequence object of type: {}",
                other.type_name()
            ))),
        }
    }

    /// Push the first element of the sequence at `idx`.
    pub fn first(&mut self, idx: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Seq)?;
        let Value::Seq(q) = self.get(idx) else {
            unreachable!()
        };
        let v = seq::first(self, q)?;
        self.push_value(v)
    }

    /// Push the rest of the sequence at `idx` (a sequence or nil).
    pub fn rest(&mut self, idx: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Seq)?;
        let Value::Seq(q) = self.get(idx) else {
            unreachable!()
        };
        let v = seq::rest(self, q)?;
        self.push_value(v)
    }

    /// `[.., head, tail]` becomes `[.., cell(head, tail)]`.
    pub fn cons(&mut self) -> Result<()> {
        let head = self.get(-2);
        let tail = self.get(-1);
        let c = seq::cell_create(self, head, tail);
        self.put(-2, c);
        self.pop(1);
        Ok(())
    }

    /// Push the reverse of the sequence (or nil) at `idx`.
    ///
    /// Walks cell by cell with every intermediate on the value stack, so
    /// lazy tails can re-enter the interpreter safely.
    pub fn seq_reverse(&mut self, idx: i32) -> Result<()> {
        self.push_nil()?;
        self.copy(idx - 1)?;
        while self.type_(-1) == ValueKind::Seq {
            self.first(-1)?;
            self.copy(-3)?;
            self.cons()?;
            self.swap(-3, -1);
            self.pop(1);
            self.rest(-1)?;
            self.swap(-2, -1);
            self.pop(1);
        }
        self.pop(1);
        Ok(())
    }

    /// `[a, b]` becomes `[a ++ b]` for two sequences (or nils).
    pub fn cat_seq(&mut self) -> Result<()> {
        self.seq_reverse(-2)?; // [a, b, rev_a]
        self.swap(-2, -1); // [a, rev_a, b]
        while self.type_(-1) == ValueKind::Seq {
            self.first(-1)?; // [.., acc, w, f]
            self.copy(-3)?; // [.., acc, w, f, acc]
            self.cons()?; // [.., acc, w, cell]
            self.swap(-3, -1); // [.., cell, w, acc]
            self.pop(1); // [.., cell, w]
            self.rest(-1)?; // [.., cell, w, r]
            self.swap(-2, -1); // [.., cell, r, w]
            self.pop(1); // [.., cell, r]
        }
        self.pop(1); // [a, acc]
        self.seq_reverse(-1)?; // [a, acc, result]
        let result = self.get(-1);
        self.put(-3, result);
        self.pop(2);
        Ok(())
    }

    /// Push every element of the sequence at `idx`; returns the count.
    pub fn unpack_seq(&mut self, idx: i32) -> Result<i32> {
        let mut n = 0;
        self.copy(idx)?;
        while self.type_(-1) == ValueKind::Seq {
            self.first(-1)?; // [.., w, f]
            self.swap(-2, -1); // [.., f, w]
            self.rest(-1)?; // [.., f, w, r]
            let r = self.get(-1);
            self.put(-2, r); // [.., f, r, r]
            self.pop(1); // [.., f, r]
            n += 1;
        }
        self.pop(1);
        Ok(n)
    }

    /// Push the inclusive numeric range from the number at `idx` to the
    /// number at the top.
    pub fn range(&mut self, idx: i32) -> Result<()> {
        let from = self.check_number(idx)? as i64;
        let to = self.check_number(-1)? as i64;
        let q = seq::range_create(self, from, to);
        self.push_value(q)
    }

    // ----- string builder -----------------------------------------------

    /// Start building a string on this thread.
    pub fn string_begin(&mut self) {
        self.ctx_mut().builder = Some(Vec::new());
    }

    pub fn string_cat(&mut self, s: &str) -> Result<()> {
        self.string_cat_bytes(s.as_bytes())
    }

    pub fn string_cat_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.ctx().builder.is_none() {
            return Err(self.fatal("No string under construction"));
        }
        if let Some(b) = self.ctx_mut().builder.as_mut() {
            b.extend_from_slice(bytes);
        }
        Ok(())
    }

    pub fn string_ch(&mut self, ch: u8) -> Result<()> {
        self.string_cat_bytes(&[ch])
    }

    /// Finish the pending string and push it.
    pub fn string_push(&mut self) -> Result<()> {
        match self.ctx_mut().builder.take() {
            Some(bytes) => {
                let s = self.alloc(crate::intern::new_str(bytes.into_boxed_slice()));
                self.push_value(Value::Str(s))
            }
            None => Err(self.fatal("No string under construction")),
        }
    }

    // ----- globals ------------------------------------------------------

    /// Push the global `name`; returns false (pushing nothing) when it
    /// is undefined.
    pub fn get_global(&mut self, name: &str) -> Result<bool> {
        let key = self.intern(name.as_bytes());
        match self.globals_get(&key)? {
            Value::Invalid => Ok(false),
            v => {
                self.push_value(v)?;
                Ok(true)
            }
        }
    }

    /// Pop the top value and bind it as the global `name`.
    pub fn set_global(&mut self, name: &str) -> Result<()> {
        let key = self.intern(name.as_bytes());
        let val = self.get(-1);
        self.globals_set(key, val)?;
        self.pop(1);
        Ok(())
    }

    // ----- reference cells ----------------------------------------------

    /// Push a new Local cell holding the value at `idx`.
    pub fn ref_local(&mut self, idx: i32) -> Result<()> {
        let v = self.get(idx);
        let c = cell::ref_local(self, v);
        self.push_value(c)
    }

    /// Push a new Global cell holding the map (or nil) at `idx`.
    pub fn ref_global(&mut self, idx: i32) -> Result<()> {
        let v = self.get(idx);
        let c = cell::ref_global(self, v)?;
        self.push_value(c)
    }

    /// Push the current value of the reference cell at `idx`.
    pub fn unref(&mut self, idx: i32) -> Result<()> {
        match self.get(idx) {
            Value::Local(loc) => {
                let v = cell::unref_local(self, loc)?;
                self.push_value(v)
            }
            Value::Global(glob) => self.push_value(cell::unref_global(glob)),
            other => Err(self.fatal(format!(
                "Bad argument: Expected mutable reference, but got {}.",
                other.type_name()
            ))),
        }
    }

    /// Pop the top value into the Local cell at `idx`.
    pub fn set_ref(&mut self, idx: i32) -> Result<()> {
        self.check_type(idx, ValueKind::Local)?;
        let Value::Local(loc) = self.get(idx) else {
            unreachable!()
        };
        let v = self.get(-1);
        cell::set_local(self, loc, v)?;
        self.pop(1);
        Ok(())
    }

    // ----- registry -----------------------------------------------------

    fn check_main_state(&mut self) -> Result<()> {
        if self.tid() == 0 {
            Ok(())
        } else {
            Err(self.fatal("Can only do this from the main-state!"))
        }
    }

    /// Pin the value at `idx` in the registry so it survives collection
    /// without a stack slot. Returns an opaque handle for
    /// [`unreg_reference`](State::unreg_reference).
    pub fn reg_reference(&mut self, idx: i32) -> Result<usize> {
        self.check_main_state()?;
        let handle = self.main.next_ref_handle();
        let key = Value::Pointer(handle as *mut c_void);
        let Value::Map(reg) = self.get(REGISTRY_INDEX) else {
            return Err(self.fatal("Corrupt registry slot"));
        };
        let v = self.get(idx);
        let updated = map::insert(self, reg, key, hash_value(&key), v);
        self.put(REGISTRY_INDEX, updated);
        Ok(handle)
    }

    /// Release a registry reference.
    pub fn unreg_reference(&mut self, handle: usize) -> Result<()> {
        self.check_main_state()?;
        let key = Value::Pointer(handle as *mut c_void);
        let Value::Map(reg) = self.get(REGISTRY_INDEX) else {
            return Err(self.fatal("Corrupt registry slot"));
        };
        let updated = map::remove(self, reg, &key, hash_value(&key));
        self.put(REGISTRY_INDEX, updated);
        Ok(())
    }

    // ----- C-lambdas ----------------------------------------------------

    /// Register a process-wide native function (or, with `None`, pop the
    /// callable at the top into the table). Returns the slot the `Lcl`
    /// instruction loads.
    pub fn clambda(&mut self, f: Option<NativeFn>) -> Result<usize> {
        self.check_main_state()?;
        let v = match f {
            Some(f) => Value::Native(f),
            None => {
                let v = self.get(-1);
                self.pop(1);
                v
            }
        };
        let mut table = self.main.c_lambdas.write();
        let id = table.len();
        table.push(v);
        Ok(id)
    }

    // ----- images -------------------------------------------------------

    /// Load a compiled image from a byte stream, pushing the resulting
    /// top-level variadic closure.
    pub fn load(&mut self, r: impl Read) -> Result<()> {
        let data = bytecode::read_image(r)
            .map_err(|e| crate::error::Error::new(format!("Could not load image: {e}")))?;
        tracing::debug!(name = %data.name, "loaded image");
        let proto = vm::alloc_proto(self, data)?;
        vm::lambda(self, proto, -1)
    }

    // ----- streams ------------------------------------------------------

    pub fn stdout(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.main.streams.stdout.lock()
    }

    pub fn stderr(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.main.streams.stderr.lock()
    }

    pub fn stdin(&self) -> MutexGuard<'_, Box<dyn BufRead + Send>> {
        self.main.streams.stdin.lock()
    }

    pub fn set_stdout(&self, w: Box<dyn Write + Send>) {
        *self.main.streams.stdout.lock() = w;
    }

    pub fn set_stderr(&self, w: Box<dyn Write + Send>) {
        *self.main.streams.stderr.lock() = w;
    }

    pub fn set_stdin(&self, r: Box<dyn BufRead + Send>) {
        *self.main.streams.stdin.lock() = r;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_eq;

    #[test]
    fn builders_consume_stack() {
        let mut s = State::new();
        let base = s.stack_len();

        s.push_number(1.0).unwrap();
        s.push_number(2.0).unwrap();
        s.push_number(3.0).unwrap();
        s.vector(3).unwrap();
        assert_eq!(s.stack_len(), base + 1);
        assert_eq!(s.vector_length(-1).unwrap(), 3);

        s.push_string("x").unwrap();
        s.push_number(1.0).unwrap();
        s.map(1).unwrap();
        assert_eq!(s.map_length(-1).unwrap(), 1);

        s.push_number(9.0).unwrap();
        s.list(1).unwrap();
        assert_eq!(s.type_(-1), ValueKind::Seq);
        s.pop(3);
    }

    #[test]
    fn vector_api_roundtrip() {
        let mut s = State::new();
        s.push_number(10.0).unwrap();
        s.push_number(20.0).unwrap();
        s.vector(2).unwrap(); // [v]
        s.push_integer(1).unwrap();
        s.vector_index(-2).unwrap(); // [v, 20]
        assert_eq!(s.to_number(-1), 20.0);
        s.pop(1);

        s.push_integer(0).unwrap();
        s.push_number(99.0).unwrap();
        s.vector_set(-3).unwrap(); // [v, v2]
        s.push_integer(0).unwrap();
        s.vector_index(-2).unwrap();
        assert_eq!(s.to_number(-1), 99.0);
        s.pop(3);
    }

    #[test]
    fn map_api_roundtrip() {
        let mut s = State::new();
        s.map(0).unwrap(); // [m]
        s.push_string("k").unwrap();
        s.push_number(5.0).unwrap();
        s.map_insert(-3).unwrap(); // [m2]
        s.push_string("k").unwrap();
        assert!(s.map_get(-2).unwrap());
        assert_eq!(s.to_number(-1), 5.0);
        s.pop(1);

        s.push_string("missing").unwrap();
        assert!(!s.map_get(-2).unwrap());

        s.push_string("k").unwrap();
        assert!(s.map_has(-2).unwrap());
        s.push_string("k").unwrap();
        s.map_remove(-2).unwrap(); // [m3]
        assert_eq!(s.map_length(-1).unwrap(), 0);
        s.pop(1);
    }

    #[test]
    fn seq_coercion_and_reverse() {
        let mut s = State::new();
        s.push_number(3.0).unwrap();
        s.seq(-1, false).unwrap(); // [3, (0 1 2 3)]
        let mut items = Vec::new();
        while s.type_(-1) == ValueKind::Seq {
            s.first(-1).unwrap();
            items.push(s.to_number(-1));
            s.pop(1);
            s.rest(-1).unwrap();
            s.swap(-2, -1);
            s.pop(1);
        }
        assert_eq!(items, vec![0.0, 1.0, 2.0, 3.0]);
        s.pop(2);

        s.push_number(1.0).unwrap();
        s.push_number(2.0).unwrap();
        s.push_number(3.0).unwrap();
        s.list(3).unwrap();
        s.seq_reverse(-1).unwrap();
        s.first(-1).unwrap();
        assert_eq!(s.to_number(-1), 3.0);
        s.pop(3);
    }

    #[test]
    fn cat_seq_concatenates() {
        let mut s = State::new();
        s.push_number(1.0).unwrap();
        s.push_number(2.0).unwrap();
        s.list(2).unwrap();
        s.push_number(3.0).unwrap();
        s.push_number(4.0).unwrap();
        s.list(2).unwrap();
        s.cat_seq().unwrap();

        let n = s.unpack_seq(-1).unwrap();
        assert_eq!(n, 4);
        assert_eq!(s.to_number(-1), 4.0);
        assert_eq!(s.to_number(-4), 1.0);
        s.pop(5);
    }

    #[test]
    fn unpack_counts_elements() {
        let mut s = State::new();
        for i in 0..5 {
            s.push_number(f64::from(i)).unwrap();
        }
        s.list(5).unwrap();
        let n = s.unpack_seq(-1).unwrap();
        assert_eq!(n, 5);
        assert_eq!(s.to_number(-5), 0.0);
        assert_eq!(s.to_number(-1), 4.0);
        s.pop(6);
    }

    #[test]
    fn globals_roundtrip() {
        let mut s = State::new();
        s.push_number(42.0).unwrap();
        s.set_global("answer").unwrap();
        assert!(s.get_global("answer").unwrap());
        assert_eq!(s.to_number(-1), 42.0);
        s.pop(1);
        assert!(!s.get_global("nope").unwrap());
    }

    #[test]
    fn registry_pins_values() {
        let mut s = State::new();
        s.push_number(7.0).unwrap();
        let h = s.reg_reference(-1).unwrap();
        s.pop(1);
        s.gc();
        // Still reachable through the registry map.
        let Value::Map(reg) = s.get(REGISTRY_INDEX) else {
            panic!()
        };
        assert_eq!(map::length(reg), 1);
        s.unreg_reference(h).unwrap();
        let Value::Map(reg) = s.get(REGISTRY_INDEX) else {
            panic!()
        };
        assert_eq!(map::length(reg), 0);
    }

    #[test]
    fn string_builder() {
        let mut s = State::new();
        s.string_begin();
        s.string_cat("hello").unwrap();
        s.string_ch(b' ').unwrap();
        s.string_cat("world").unwrap();
        s.string_push().unwrap();
        assert_eq!(s.to_str(-1), Some("hello world"));
        s.pop(1);
        assert!(s.string_push().is_err());
    }

    #[test]
    fn local_ref_counter_scenario() {
        // A Local cell incremented three times reads 3.
        let mut s = State::new();
        s.push_number(0.0).unwrap();
        s.ref_local(-1).unwrap(); // [0, cell]
        for _ in 0..3 {
            s.unref(-1).unwrap(); // [0, cell, n]
            let n = s.to_number(-1);
            s.pop(1);
            s.push_number(n + 1.0).unwrap();
            s.set_ref(-2).unwrap();
        }
        s.unref(-1).unwrap();
        assert_eq!(s.to_number(-1), 3.0);
        s.pop(3);
    }

    #[test]
    fn stringify_values() {
        let mut s = State::new();
        s.push_string("abc").unwrap();
        assert_eq!(s.stringify(-1), "abc");
        s.push_number(4.0).unwrap();
        assert_eq!(s.stringify(-1), "4");
        s.push_boolean(false).unwrap();
        assert_eq!(s.stringify(-1), "false");
        s.pop(3);

        let eq = value_eq(&Value::Nil, &Value::Nil);
        assert!(eq);
    }
}
