//! Sequences: a first/rest capability over several shapes of data.
//!
//! A sequence value is one heap object with five variants: an explicit
//! cons `Cell`, an arithmetic `Range`, an `Iter` cursor over a vector or
//! string, a `Lazy` node holding a step function and the last produced
//! value, and a `Tree` walker over a hash map. `first` never allocates
//! for cells and ranges; `rest` always returns a fresh sequence (or nil
//! at the end) so sequences themselves stay immutable.
//!
//! Taking `rest` of a lazy node re-enters the interpreter to apply the
//! step function, which means a collection can happen underneath it —
//! callers that walk lazy sequences must keep intermediates on the value
//! stack (see [`State::seq_reverse`](crate::State::seq_reverse)).

use crate::error::Result;
use crate::gc::{Gc, HeapObject, ObjKind};
use crate::intern::Str;
use crate::map::{Map, MapNode};
use crate::state::State;
use crate::value::Value;
use crate::vector::{self, Vector};

/// Expected depth bound of a map tree walk (one level per 5 hash bits).
const TREE_MAX_DEPTH: usize = 7;

/// One step of a tree walker's path: a node and the child index the walk
/// descended through.
#[derive(Clone, Copy)]
pub struct TreeLink {
    pub node: Gc<MapNode>,
    pub idx: usize,
}

pub enum Seq {
    Cell { first: Value, rest: Value },
    Range { cnt: i64, end: i64, step: i64 },
    Iter { idx: i64, step: i64, obj: Value },
    Lazy { f: Value, d: Value },
    Tree { links: Box<[TreeLink]> },
}

impl HeapObject for Seq {
    const KIND: ObjKind = ObjKind::Seq;
}

fn alloc_seq(s: &mut State, q: Seq) -> Value {
    Value::Seq(s.alloc(q))
}

/// Cons a head onto a tail.
pub fn cell_create(s: &mut State, first: Value, rest: Value) -> Value {
    alloc_seq(s, Seq::Cell { first, rest })
}

/// Build a cell chain from a slice, preserving order.
pub fn cell_create_array(s: &mut State, values: &[Value]) -> Value {
    let mut rest = Value::Nil;
    for v in values.iter().rev() {
        rest = cell_create(s, *v, rest);
    }
    rest
}

/// Finite arithmetic progression from `from` towards `to`, inclusive.
pub fn range_create(s: &mut State, from: i64, to: i64) -> Value {
    let step = if to - from > 0 { 1 } else { -1 };
    alloc_seq(
        s,
        Seq::Range {
            cnt: from,
            end: to + step,
            step,
        },
    )
}

pub fn it_create_vector(s: &mut State, vec: Gc<Vector>, reverse: bool) -> Value {
    if vec.cnt == 0 {
        return Value::Nil;
    }
    let (idx, step) = if reverse {
        (vec.cnt as i64 - 1, -1)
    } else {
        (0, 1)
    };
    alloc_seq(
        s,
        Seq::Iter {
            idx,
            step,
            obj: Value::Vector(vec),
        },
    )
}

pub fn it_create_string(s: &mut State, st: Gc<Str>, reverse: bool) -> Value {
    if st.bytes.is_empty() {
        return Value::Nil;
    }
    let (idx, step) = if reverse {
        (st.bytes.len() as i64 - 1, -1)
    } else {
        (0, 1)
    };
    alloc_seq(
        s,
        Seq::Iter {
            idx,
            step,
            obj: Value::Str(st),
        },
    )
}

/// Lazy sequence over a step function. The function is applied once
/// immediately: a nil result makes the whole sequence nil, anything else
/// becomes the first element.
pub fn lazy_create(s: &mut State, f: Value) -> Result<Value> {
    lazy_step(s, f, Value::Nil)
}

fn lazy_step(s: &mut State, f: Value, d: Value) -> Result<Value> {
    s.push_value(f)?;
    s.push_value(d)?;
    s.call(1, 1)?;
    let next = s.get(-1);
    s.pop(1);
    if let Value::Nil = next {
        return Ok(Value::Nil);
    }
    Ok(alloc_seq(s, Seq::Lazy { f, d: next }))
}

/// Walker over a map: descend leftmost to the first leaf.
pub fn tree_create_map(s: &mut State, m: Gc<Map>) -> Value {
    let Some(mut node) = m.root else {
        return Value::Nil;
    };
    if m.cnt == 0 {
        return Value::Nil;
    }
    let mut links = Vec::with_capacity(TREE_MAX_DEPTH);
    loop {
        links.push(TreeLink { node, idx: 0 });
        let children = node.children();
        if children.is_empty() {
            break;
        }
        node = children[0];
    }
    alloc_seq(
        s,
        Seq::Tree {
            links: links.into_boxed_slice(),
        },
    )
}

pub fn first(s: &mut State, q: Gc<Seq>) -> Result<Value> {
    match &*q {
        Seq::Cell { first, .. } => Ok(*first),
        Seq::Range { cnt, .. } => Ok(Value::Number(*cnt as f64)),
        Seq::Lazy { d, .. } => Ok(*d),
        Seq::Iter { idx, obj, .. } => match obj {
            Value::Vector(v) => vector::index(s, *v, *idx),
            Value::Str(st) => {
                let byte = st.bytes[*idx as usize];
                Ok(s.intern(&[byte]))
            }
            _ => Err(s.fatal("Corrupt iterator sequence")),
        },
        Seq::Tree { links } => {
            let leaf = links[links.len() - 1].node;
            match &*leaf {
                MapNode::Leaf { key, val, .. } => Ok(cell_create(s, *key, *val)),
                _ => Err(s.fatal("Corrupt tree sequence")),
            }
        }
    }
}

pub fn rest(s: &mut State, q: Gc<Seq>) -> Result<Value> {
    match &*q {
        Seq::Cell { rest, .. } => Ok(*rest),
        Seq::Range { cnt, end, step } => {
            if cnt + step == *end {
                Ok(Value::Nil)
            } else {
                Ok(alloc_seq(
                    s,
                    Seq::Range {
                        cnt: cnt + step,
                        end: *end,
                        step: *step,
                    },
                ))
            }
        }
        Seq::Lazy { f, d } => lazy_step(s, *f, *d),
        Seq::Iter { idx, step, obj } => {
            let next = idx + step;
            let len = match obj {
                Value::Vector(v) => v.cnt as i64,
                Value::Str(st) => st.bytes.len() as i64,
                _ => return Err(s.fatal("Corrupt iterator sequence")),
            };
            if next < 0 || next >= len {
                return Ok(Value::Nil);
            }
            Ok(alloc_seq(
                s,
                Seq::Iter {
                    idx: next,
                    step: *step,
                    obj: *obj,
                },
            ))
        }
        Seq::Tree { links } => {
            // In-order successor: drop the leaf, then advance the
            // deepest ancestor that still has unvisited children and
            // descend leftmost to the next leaf.
            let mut path = links.to_vec();
            path.pop();
            loop {
                let Some(top) = path.last_mut() else {
                    return Ok(Value::Nil);
                };
                top.idx += 1;
                let children = top.node.children();
                if top.idx < children.len() {
                    let mut node = children[top.idx];
                    loop {
                        path.push(TreeLink { node, idx: 0 });
                        let kids = node.children();
                        if kids.is_empty() {
                            break;
                        }
                        node = kids[0];
                    }
                    return Ok(alloc_seq(
                        s,
                        Seq::Tree {
                            links: path.into_boxed_slice(),
                        },
                    ));
                }
                path.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;
    use crate::value::{hash_value, value_eq};

    fn as_seq(v: Value) -> Gc<Seq> {
        match v {
            Value::Seq(q) => q,
            other => panic!("expected sequence, got {}", other.type_name()),
        }
    }

    fn drain(s: &mut State, mut v: Value) -> Vec<Value> {
        let mut out = Vec::new();
        while let Value::Seq(q) = v {
            out.push(first(s, q).unwrap());
            v = rest(s, q).unwrap();
        }
        out
    }

    #[test]
    fn cell_chain_order() {
        let mut s = State::new();
        let vals = [Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)];
        let list = cell_create_array(&mut s, &vals);
        let items = drain(&mut s, list);
        assert_eq!(items.len(), 3);
        for (a, b) in items.iter().zip(vals.iter()) {
            assert!(value_eq(a, b));
        }
    }

    #[test]
    fn range_is_inclusive_both_ways() {
        let mut s = State::new();
        let up = range_create(&mut s, 0, 3);
        let items = drain(&mut s, up);
        assert_eq!(items.len(), 4);
        assert!(value_eq(&items[0], &Value::Number(0.0)));
        assert!(value_eq(&items[3], &Value::Number(3.0)));

        let down = range_create(&mut s, 3, 0);
        let items = drain(&mut s, down);
        assert_eq!(items.len(), 4);
        assert!(value_eq(&items[0], &Value::Number(3.0)));
        assert!(value_eq(&items[3], &Value::Number(0.0)));
    }

    #[test]
    fn vector_iteration_forward_and_reverse() {
        let mut s = State::new();
        s.vector_from(&[Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
            .unwrap();
        let Value::Vector(v) = s.get(-1) else {
            panic!()
        };
        let fwd = it_create_vector(&mut s, v, false);
        let items = drain(&mut s, fwd);
        assert_eq!(items.len(), 3);
        assert!(value_eq(&items[0], &Value::Number(1.0)));

        let rev = it_create_vector(&mut s, v, true);
        let items = drain(&mut s, rev);
        assert!(value_eq(&items[0], &Value::Number(3.0)));
        assert!(value_eq(&items[2], &Value::Number(1.0)));
    }

    #[test]
    fn string_iteration_yields_single_bytes() {
        let mut s = State::new();
        let Value::Str(st) = s.intern(b"abc") else {
            panic!()
        };
        let seq = it_create_string(&mut s, st, false);
        let items = drain(&mut s, seq);
        assert_eq!(items.len(), 3);
        let Value::Str(b) = items[1] else { panic!() };
        assert_eq!(b.as_bytes(), b"b");

        let empty_str = match s.intern(b"") {
            Value::Str(e) => e,
            _ => panic!(),
        };
        let empty = it_create_string(&mut s, empty_str, false);
        assert!(matches!(empty, Value::Nil));
    }

    #[test]
    fn tree_walks_every_entry_once() {
        let mut s = State::new();
        let Value::Map(mut m) = map::create_empty(&mut s) else {
            panic!()
        };
        let n = 100;
        for i in 0..n {
            let k = Value::Number(i as f64);
            let v = Value::Number(i as f64 * 10.0);
            let Value::Map(next) = map::insert(&mut s, m, k, hash_value(&k), v) else {
                panic!()
            };
            m = next;
        }
        let mut seen = vec![false; n];
        let mut cur = tree_create_map(&mut s, m);
        while let Value::Seq(q) = cur {
            let kv = as_seq(first(&mut s, q).unwrap());
            let Value::Number(k) = first(&mut s, kv).unwrap() else {
                panic!()
            };
            let Value::Number(v) = rest(&mut s, kv).unwrap() else {
                panic!()
            };
            assert_eq!(v, k * 10.0);
            assert!(!seen[k as usize], "entry visited twice");
            seen[k as usize] = true;
            cur = rest(&mut s, q).unwrap();
        }
        assert!(seen.iter().all(|&b| b));
    }

    #[test]
    fn empty_map_sequences_to_nil() {
        let mut s = State::new();
        let Value::Map(m) = map::create_empty(&mut s) else {
            panic!()
        };
        assert!(matches!(tree_create_map(&mut s, m), Value::Nil));
    }
}
