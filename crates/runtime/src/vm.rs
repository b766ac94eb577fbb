//! The bytecode interpreter: prototypes, closures, call frames and the
//! dispatch loop.
//!
//! A [`Proto`] is the immutable compiled template of a function; a
//! [`Closure`] pairs a prototype with materialised constants and the
//! upvalues snapshotted when the `Lambda` instruction ran. Frames record
//! the caller's closure, the callee's base slot and the return program
//! counter; the entry frame of a host call carries a sentinel return
//! address that terminates the loop, which is also what lets `TailCall`
//! replace the current frame and fall straight into ordinary call
//! dispatch without growing the frame stack.
//!
//! At the top of every instruction the thread ORs its local interrupt
//! mask with the global one: `COLLECT` parks the thread for a
//! stop-the-world window, `GC` runs a collector slice, `BREAK` invokes
//! the debug hook.

use crate::bytecode::{Const, Instruction, Opcode, ProtoData, Upvalue};
use crate::cell;
use crate::error::{Error, Result};
use crate::gc::{Gc, HeapObject, ObjKind};
use crate::map;
use crate::seq;
use crate::state::{Frame, Interrupt, State, GLOBAL_INDEX, MAX_CALLS, RET_SENTINEL};
use crate::value::{hash_value, stringify, value_eq, DebugInfo, Value, ValueKind};
use crate::vector;

/// Immutable compiled function template.
pub struct Proto {
    pub(crate) insts: Box<[Instruction]>,
    pub(crate) constants: Box<[Const]>,
    pub(crate) upvalues: Box<[Upvalue]>,
    pub(crate) protos: Box<[Gc<Proto>]>,
    pub(crate) name: String,
    pub(crate) lineinfo: Box<[u32]>,
}

impl HeapObject for Proto {
    const KIND: ObjKind = ObjKind::Proto;
}

/// Runtime function value: a prototype plus captured state. `narg < 0`
/// marks a variadic closure whose arguments are packed into one vector.
pub struct Closure {
    pub(crate) narg: i32,
    pub(crate) proto: Gc<Proto>,
    pub(crate) constants: Box<[Value]>,
    pub(crate) upvalues: Box<[Value]>,
}

impl HeapObject for Closure {
    const KIND: ObjKind = ObjKind::Closure;
}

fn verify_error(detail: impl std::fmt::Display) -> Error {
    Error::new(format!("Could not load image: {detail}"))
}

/// Move a parsed prototype tree onto the heap, children first, while
/// verifying every operand against the enclosing prototype's tables.
pub(crate) fn alloc_proto(s: &mut State, data: ProtoData) -> Result<Gc<Proto>> {
    let mut protos = Vec::with_capacity(data.protos.len());
    for child in data.protos {
        protos.push(alloc_proto(s, child)?);
    }

    let num_inst = data.insts.len();
    for (pc, inst) in data.insts.iter().enumerate() {
        let a = inst.a as usize;
        match inst.op {
            Opcode::Push | Opcode::GetGlobal | Opcode::SetGlobal => {
                if a >= data.constants.len() {
                    return Err(verify_error(format!("constant {a} out of range at {pc}")));
                }
            }
            Opcode::Lup => {
                if a >= data.upvalues.len() {
                    return Err(verify_error(format!("upvalue {a} out of range at {pc}")));
                }
            }
            Opcode::Lambda => {
                if a >= protos.len() {
                    return Err(verify_error(format!("prototype {a} out of range at {pc}")));
                }
            }
            Opcode::Jmp | Opcode::Test | Opcode::For => {
                if inst.b < 0 || inst.b as usize > num_inst {
                    return Err(verify_error(format!("jump target {} out of range at {pc}", inst.b)));
                }
            }
            _ => {}
        }
    }

    Ok(s.alloc(Proto {
        insts: data.insts.into_boxed_slice(),
        constants: data.constants.into_boxed_slice(),
        upvalues: data.upvalues.into_boxed_slice(),
        protos: protos.into_boxed_slice(),
        name: data.name,
        lineinfo: data.lineinfo.into_boxed_slice(),
    }))
}

/// Create a closure from a prototype and push it: constants are
/// materialised (strings interned through this thread's cache) and each
/// upvalue descriptor is resolved against the frame stack.
pub(crate) fn lambda(s: &mut State, prot: Gc<Proto>, narg: i32) -> Result<()> {
    let mut constants = Vec::with_capacity(prot.constants.len());
    for c in prot.constants.iter() {
        constants.push(match c {
            Const::Nil => Value::Nil,
            Const::False => Value::Boolean(false),
            Const::True => Value::Boolean(true),
            Const::Number(n) => Value::Number(*n),
            Const::Str(bytes) => s.intern(bytes),
        });
    }

    let mut upvalues = Vec::with_capacity(prot.upvalues.len());
    for up in prot.upvalues.iter() {
        let v = {
            let ctx = s.ctx();
            ctx.frames
                .len()
                .checked_sub(up.level as usize)
                .and_then(|fi| ctx.frames.get(fi))
                .and_then(|frame| ctx.stack.get(frame.stack_top + up.slot as usize + 1))
                .copied()
        };
        match v {
            Some(v) => upvalues.push(v),
            None => return Err(s.fatal("Malformed upvalue reference")),
        }
    }

    let func = s.alloc(Closure {
        narg,
        proto: prot,
        constants: constants.into_boxed_slice(),
        upvalues: upvalues.into_boxed_slice(),
    });
    s.push_value(Value::Closure(func))
}

impl State {
    pub(crate) fn check_number(&mut self, idx: i32) -> Result<f64> {
        match self.get(idx) {
            Value::Number(n) => Ok(n),
            other => Err(self.fatal(format!(
                "Bad argument: Expected number, but got {}.",
                other.type_name()
            ))),
        }
    }

    /// Binary numeric operation over the top two stack values.
    fn arith(&mut self, op: Opcode) -> Result<()> {
        let b = self.check_number(-1)?;
        let a = self.check_number(-2)?;
        let r = match op {
            Opcode::Add => a + b,
            Opcode::Sub => a - b,
            Opcode::Mul => a * b,
            Opcode::Div | Opcode::Mod => {
                if b == 0.0 {
                    return Err(self.fatal("Division by zero!"));
                }
                if op == Opcode::Div {
                    a / b
                } else {
                    f64::from(a as i32 % b as i32)
                }
            }
            Opcode::Pow => a.powf(b),
            _ => unreachable!("non-arithmetic opcode"),
        };
        self.put(-2, Value::Number(r));
        self.pop(1);
        Ok(())
    }

    fn compare(&mut self, op: Opcode) -> Result<()> {
        let b = self.check_number(-1)?;
        let a = self.check_number(-2)?;
        let r = match op {
            Opcode::Less => a < b,
            Opcode::LessEqual => a <= b,
            _ => unreachable!("non-comparison opcode"),
        };
        self.put(-2, Value::Boolean(r));
        self.pop(1);
        Ok(())
    }

    /// The interpreter. The entry frame must already be pushed; the loop
    /// runs until that frame returns through its sentinel address.
    pub(crate) fn vm_loop(&mut self, mut func: Gc<Closure>) -> Result<()> {
        let mut prot = func.proto;
        self.ctx_mut().prot = Some(prot);
        self.ctx_mut().pc = 0;

        loop {
            let pc = self.ctx().pc;
            if pc >= prot.insts.len() {
                return Ok(());
            }

            let pending = self.ctx().interrupt | self.main.interrupt();
            if !pending.is_empty() {
                if pending.contains(Interrupt::COLLECT) {
                    self.thread_indisposable();
                    self.thread_disposable();
                }
                if pending.contains(Interrupt::GC) {
                    self.ctx_mut().interrupt.remove(Interrupt::GC);
                    crate::gc::trace_step(self);
                }
                if pending.contains(Interrupt::BREAK) {
                    self.ctx_mut().interrupt.remove(Interrupt::BREAK);
                    if let Some(cb) = self.ctx().debug_cb {
                        let info = DebugInfo {
                            file: prot.name.clone(),
                            line: prot.lineinfo.get(pc).map_or(-1, |l| i64::from(*l)),
                        };
                        cb(self, &info);
                    }
                }
            }

            let inst = prot.insts[pc];
            self.ctx_mut().pc = pc + 1;

            match inst.op {
                Opcode::Push => {
                    let v = func.constants[inst.a as usize];
                    self.push_value(v)?;
                }
                Opcode::Pop => self.pop(i32::from(inst.a)),
                Opcode::Load => {
                    let v = {
                        let ctx = self.ctx();
                        ctx.frames
                            .last()
                            .and_then(|fr| ctx.stack.get(fr.stack_top + inst.a as usize))
                            .copied()
                    };
                    match v {
                        Some(v) => self.push_value(v)?,
                        None => return Err(self.fatal("Load outside the current frame")),
                    }
                }
                Opcode::Lup => {
                    let v = func.upvalues[inst.a as usize];
                    self.push_value(v)?;
                }
                Opcode::Lcl => {
                    let v = self
                        .main
                        .c_lambdas
                        .read()
                        .get(inst.b.max(0) as usize)
                        .copied();
                    match v {
                        Some(v) => self.push_value(v)?,
                        None => return Err(self.fatal("Unknown C-lambda reference")),
                    }
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod
                | Opcode::Pow => self.arith(inst.op)?,
                Opcode::Unm => {
                    let n = self.check_number(-1)?;
                    self.put(-1, Value::Number(-n));
                }

                Opcode::Eq => {
                    let r = value_eq(&self.get(-2), &self.get(-1));
                    self.put(-2, Value::Boolean(r));
                    self.pop(1);
                }
                Opcode::Less | Opcode::LessEqual => self.compare(inst.op)?,

                Opcode::Not => {
                    let v = match self.get(-1) {
                        Value::Boolean(b) => Value::Boolean(!b),
                        Value::Nil => Value::Boolean(true),
                        _ => Value::Boolean(false),
                    };
                    self.put(-1, v);
                }
                Opcode::And => {
                    let a = self.get(-2);
                    let b = self.get(-1);
                    let r = if a.is_truthy() && b.is_truthy() {
                        b
                    } else {
                        Value::Boolean(false)
                    };
                    self.put(-2, r);
                    self.pop(1);
                }
                Opcode::Or => {
                    let a = self.get(-2);
                    let b = self.get(-1);
                    let r = if a.is_truthy() {
                        a
                    } else if b.is_truthy() {
                        b
                    } else {
                        Value::Boolean(false)
                    };
                    self.put(-2, r);
                    self.pop(1);
                }

                Opcode::Test => {
                    if self.get(-1).is_truthy() {
                        self.ctx_mut().pc = inst.b as usize;
                    }
                    self.pop(1);
                }
                Opcode::For => {
                    if matches!(self.get(-2), Value::Nil) {
                        self.swap(-2, -1);
                        self.pop(1);
                        self.ctx_mut().pc = inst.b as usize;
                    } else {
                        self.pop(1);
                        self.check_type(-1, ValueKind::Seq)?;
                        let Value::Seq(q) = self.get(-1) else {
                            unreachable!()
                        };
                        let r = seq::rest(self, q)?;
                        self.push_value(r)?;
                        self.swap(-2, -1);
                        let Value::Seq(q) = self.get(-1) else {
                            unreachable!()
                        };
                        let f = seq::first(self, q)?;
                        self.push_value(f)?;
                        self.swap(-2, -1);
                        self.pop(1);
                    }
                }
                Opcode::Jmp => {
                    self.ctx_mut().pc = inst.b as usize;
                }

                Opcode::Return => {
                    let Some(&fr) = self.ctx().frames.last() else {
                        return Err(self.fatal("Return without a frame"));
                    };
                    let ret = self.get(-1);
                    self.ctx_mut().frames.pop();
                    self.put(fr.stack_top as i32, ret);
                    self.truncate(fr.stack_top + 1);
                    self.ctx_mut().pc = fr.ret_addr;
                    func = fr.func;
                    prot = func.proto;
                    self.ctx_mut().prot = Some(prot);
                }
                Opcode::Shift => {
                    let v = self.get(-1);
                    self.put(-(i32::from(inst.a) + 1), v);
                    self.pop(i32::from(inst.a));
                }

                Opcode::Call | Opcode::TailCall => {
                    let nargs = i32::from(inst.a);
                    let mut ret_addr = self.ctx().pc;

                    if inst.op == Opcode::TailCall {
                        // Replace the current frame, then dispatch an
                        // ordinary call returning to our caller.
                        let Some(&fr) = self.ctx().frames.last() else {
                            return Err(self.fatal("Tail call without a frame"));
                        };
                        self.ctx_mut().frames.pop();
                        ret_addr = fr.ret_addr;
                        func = fr.func;
                        prot = func.proto;
                        self.ctx_mut().prot = Some(prot);

                        let width = nargs as usize + 1;
                        let src = self.stack_len() - width;
                        let ctx = self.ctx_mut();
                        ctx.stack.copy_within(src..src + width, fr.stack_top);
                        ctx.stack.truncate(fr.stack_top + width);
                    }

                    let base = self.stack_len() - nargs as usize - 1;
                    match self.get(base as i32) {
                        Value::Closure(callee) => {
                            if self.ctx().frames.len() >= MAX_CALLS {
                                return Err(self.fatal("Frame overflow!"));
                            }
                            self.ctx_mut().frames.push(Frame {
                                func,
                                stack_top: base,
                                ret_addr,
                            });
                            if callee.narg < 0 {
                                self.vector(nargs)?;
                            } else if callee.narg != nargs {
                                return Err(self.fatal(format!(
                                    "Bad number of arguments to function! Expected {}, but got {}.",
                                    callee.narg, nargs
                                )));
                            }
                            func = callee;
                            prot = callee.proto;
                            self.ctx_mut().prot = Some(prot);
                            self.ctx_mut().pc = 0;
                        }
                        Value::Native(nf) => {
                            let saved = self.ctx().narg;
                            self.ctx_mut().narg = nargs;
                            let has_result = nf(self, nargs)?;
                            let result = if has_result { self.get(-1) } else { Value::Nil };
                            self.put(base as i32, result);
                            self.truncate(base + 1);
                            self.ctx_mut().narg = saved;
                            self.ctx_mut().pc = ret_addr;
                        }
                        Value::Vector(vec) => {
                            if nargs == 1 {
                                let i = self.check_number(-1)? as i64;
                                let item = vector::index(self, vec, i)?;
                                self.pop(2);
                                self.push_value(item)?;
                            } else {
                                for _ in 0..nargs {
                                    let i = self.check_number(-nargs)? as i64;
                                    let item = vector::index(self, vec, i)?;
                                    self.push_value(item)?;
                                }
                                self.vector(nargs)?;
                                let v = self.get(-1);
                                self.put(base as i32, v);
                                self.truncate(base + 1);
                            }
                            self.ctx_mut().pc = ret_addr;
                        }
                        Value::Map(m) => {
                            if nargs == 1 {
                                let key = self.get(-1);
                                let v = map::get(m, &key, hash_value(&key));
                                if matches!(v, Value::Invalid) {
                                    return Err(self.fatal(format!(
                                        "No value with key: {}",
                                        stringify(&key)
                                    )));
                                }
                                self.pop(2);
                                self.push_value(v)?;
                            } else {
                                for k in 0..nargs {
                                    let key = self.get(-nargs - k);
                                    let v = map::get(m, &key, hash_value(&key));
                                    if matches!(v, Value::Invalid) {
                                        return Err(self.fatal(format!(
                                            "No value with key: {}",
                                            stringify(&key)
                                        )));
                                    }
                                    self.push_value(key)?;
                                    self.push_value(v)?;
                                }
                                self.map(nargs)?;
                                let v = self.get(-1);
                                self.put(base as i32, v);
                                self.truncate(base + 1);
                            }
                            self.ctx_mut().pc = ret_addr;
                        }
                        Value::Str(st) => {
                            let len = st.bytes.len() as i64;
                            if nargs == 1 {
                                let i = self.check_number(-1)? as i64;
                                if i < 0 || i >= len {
                                    return Err(self.fatal("Out of range!"));
                                }
                                let byte = st.bytes[i as usize];
                                self.pop(2);
                                let v = self.intern(&[byte]);
                                self.push_value(v)?;
                            } else {
                                let mut bytes = Vec::with_capacity(nargs as usize);
                                for k in 0..nargs {
                                    let i = self.check_number(-nargs + k)? as i64;
                                    if i < 0 || i >= len {
                                        return Err(self.fatal("Out of range!"));
                                    }
                                    bytes.push(st.bytes[i as usize]);
                                }
                                let v = self.intern(&bytes);
                                self.put(base as i32, v);
                                self.truncate(base + 1);
                            }
                            self.ctx_mut().pc = ret_addr;
                        }
                        Value::Data(d) if d.class.call.is_some() => {
                            let Some(call_cb) = d.class.call else {
                                unreachable!()
                            };
                            let saved = self.ctx().narg;
                            self.ctx_mut().narg = nargs;
                            let has_result = call_cb(self, d, nargs)?;
                            let result = if has_result { self.get(-1) } else { Value::Nil };
                            self.put(base as i32, result);
                            self.truncate(base + 1);
                            self.ctx_mut().narg = saved;
                            self.ctx_mut().pc = ret_addr;
                        }
                        Value::Seq(q) if nargs == 1 && matches!(self.get(-1), Value::Str(_)) => {
                            let Value::Str(sel) = self.get(-1) else {
                                unreachable!()
                            };
                            let r = match sel.as_bytes() {
                                b"first" => seq::first(self, q)?,
                                b"rest" => seq::rest(self, q)?,
                                _ => {
                                    return Err(self.fatal("Can't apply 'sequence'."));
                                }
                            };
                            self.pop(2);
                            self.push_value(r)?;
                            self.ctx_mut().pc = ret_addr;
                        }
                        other => {
                            return Err(
                                self.fatal(format!("Can't apply '{}'.", other.type_name()))
                            );
                        }
                    }
                }

                Opcode::Lambda => {
                    let child = prot.protos[inst.a as usize];
                    lambda(self, child, i32::from(inst.b))?;
                }

                Opcode::GetGlobal => {
                    let key = func.constants[inst.a as usize];
                    if !matches!(key, Value::Str(_)) {
                        return Err(self.fatal("Global key must be a string!"));
                    }
                    let v = self.globals_get(&key)?;
                    match v {
                        Value::Invalid => {
                            return Err(self.fatal(format!(
                                "Undefined global variable: {}",
                                stringify(&key)
                            )));
                        }
                        v => self.push_value(v)?,
                    }
                }
                Opcode::SetGlobal => {
                    let key = func.constants[inst.a as usize];
                    if !matches!(key, Value::Str(_)) {
                        return Err(self.fatal("Global key must be a string!"));
                    }
                    let val = self.get(-1);
                    self.globals_set(key, val)?;
                    // The assigned value stays on the stack.
                }
            }
        }
    }

    /// Current globals map.
    pub(crate) fn globals_map(&mut self) -> Result<Gc<crate::map::Map>> {
        let Value::Local(loc) = self.get(GLOBAL_INDEX) else {
            return Err(self.fatal("Corrupt globals slot"));
        };
        match cell::unref_local(self, loc)? {
            Value::Map(m) => Ok(m),
            _ => Err(self.fatal("Corrupt globals slot")),
        }
    }

    pub(crate) fn globals_get(&mut self, key: &Value) -> Result<Value> {
        let m = self.globals_map()?;
        Ok(map::get(m, key, hash_value(key)))
    }

    pub(crate) fn globals_set(&mut self, key: Value, val: Value) -> Result<()> {
        let m = self.globals_map()?;
        let updated = map::insert(self, m, key, hash_value(&key), val);
        let Value::Local(loc) = self.get(GLOBAL_INDEX) else {
            return Err(self.fatal("Corrupt globals slot"));
        };
        cell::set_local(self, loc, updated)
    }

    /// Invoke the callable at `stack[-(narg+1)]` with `narg` arguments.
    /// With `nret == 1` the inputs are replaced by the single result;
    /// with `nret == 0` everything is consumed.
    ///
    /// On error, the recovery point (if one is installed) restores the
    /// saved stack and frame tops before the error surfaces.
    pub fn call(&mut self, narg: i32, nret: i32) -> Result<()> {
        let res = self.call_inner(narg, nret);
        if res.is_err() {
            if let Some((stack_top, frame_top)) = self.ctx().recovery {
                let ctx = self.ctx_mut();
                ctx.stack.truncate(stack_top);
                ctx.frames.truncate(frame_top);
            }
        }
        res
    }

    fn call_inner(&mut self, narg: i32, nret: i32) -> Result<()> {
        debug_assert!(narg >= 0 && (nret == 0 || nret == 1));
        let base = self.stack_len() - narg as usize - 1;

        let saved_pc = self.ctx().pc;
        let saved_prot = self.ctx().prot;
        let saved_narg = self.ctx().narg;

        match self.get(base as i32) {
            Value::Closure(callee) => {
                if self.ctx().frames.len() >= MAX_CALLS {
                    return Err(self.fatal("Frame overflow!"));
                }
                self.ctx_mut().frames.push(Frame {
                    func: callee,
                    stack_top: base,
                    ret_addr: RET_SENTINEL,
                });
                let mut inner_narg = narg;
                if callee.narg < 0 {
                    self.vector(narg)?;
                    inner_narg = 1;
                } else if callee.narg != narg {
                    return Err(self.fatal(format!(
                        "Bad number of arguments to function! Expected {}, but got {}.",
                        callee.narg, narg
                    )));
                }
                self.ctx_mut().narg = inner_narg;
                self.vm_loop(callee)?;
                if nret == 0 {
                    self.pop(1);
                }
            }
            Value::Native(nf) => {
                self.ctx_mut().narg = narg;
                let has_result = nf(self, narg)?;
                if nret > 0 && has_result {
                    let r = self.get(-1);
                    self.put(base as i32, r);
                    self.truncate(base + 1);
                } else {
                    self.truncate(base);
                    if nret > 0 {
                        self.push_value(Value::Nil)?;
                    }
                }
            }
            other => {
                return Err(self.fatal(format!("Can't apply '{}'.", other.type_name())));
            }
        }

        let ctx = self.ctx_mut();
        ctx.pc = saved_pc;
        ctx.prot = saved_prot;
        ctx.narg = saved_narg;
        Ok(())
    }
}
