//! Persistent hash map (hash array mapped trie).
//!
//! Nodes come in four shapes: a `Leaf` holds one entry; a `Collision`
//! holds leaves whose keys share a full 32-bit hash; an `Idx` node is a
//! sparse 32-way branch addressed by a bitmap and popcount; a `Full`
//! node is the dense form an `Idx` promotes to when its bitmap
//! saturates. Five bits of the key hash are consumed per trie level.
//! All operations are non-mutating and return a new root that shares
//! every untouched subtree; lookups return `Value::Invalid` for absent
//! keys so nil values stay representable.
//!
//! The empty map has no root node at all. Insertion reports whether a
//! leaf was truly added so the map count is only bumped for new keys.

use crate::error::Result;
use crate::gc::{Gc, HeapObject, ObjKind};
use crate::seq;
use crate::state::State;
use crate::value::{hash_value, value_eq, Value};

const BITS: u32 = 5;
const MASK: u32 = 0x1f;

fn bitpos(hash: u32, shift: u32) -> u32 {
    1 << ((hash >> shift) & MASK)
}

/// One node of the trie.
pub enum MapNode {
    Leaf {
        hash: u32,
        key: Value,
        val: Value,
    },
    Collision {
        hash: u32,
        leaves: Box<[Gc<MapNode>]>,
    },
    Idx {
        bitmap: u32,
        shift: u32,
        nodes: Box<[Gc<MapNode>]>,
    },
    Full {
        shift: u32,
        nodes: Box<[Gc<MapNode>]>,
    },
}

impl HeapObject for MapNode {
    const KIND: ObjKind = ObjKind::MapNode;
}

impl MapNode {
    /// Hash representative of this subtree (the first leaf's hash); used
    /// to place an existing branch when a split introduces a new level.
    fn get_hash(&self) -> u32 {
        match self {
            MapNode::Leaf { hash, .. } | MapNode::Collision { hash, .. } => *hash,
            MapNode::Idx { nodes, .. } | MapNode::Full { nodes, .. } => nodes[0].get_hash(),
        }
    }

    /// Children of a branch node; leaves have none.
    pub(crate) fn children(&self) -> &[Gc<MapNode>] {
        match self {
            MapNode::Leaf { .. } => &[],
            MapNode::Collision { leaves, .. } => leaves,
            MapNode::Idx { nodes, .. } | MapNode::Full { nodes, .. } => nodes,
        }
    }
}

/// Persistent map handle.
pub struct Map {
    pub cnt: usize,
    pub root: Option<Gc<MapNode>>,
}

impl HeapObject for Map {
    const KIND: ObjKind = ObjKind::Map;
}

pub fn length(m: Gc<Map>) -> usize {
    m.cnt
}

fn alloc_map(s: &mut State, cnt: usize, root: Option<Gc<MapNode>>) -> Value {
    Value::Map(s.alloc(Map { cnt, root }))
}

pub fn create_empty(s: &mut State) -> Value {
    alloc_map(s, 0, None)
}

fn leaf(s: &mut State, hash: u32, key: Value, val: Value) -> Gc<MapNode> {
    s.alloc(MapNode::Leaf { hash, key, val })
}

fn idx_node(s: &mut State, bitmap: u32, shift: u32, nodes: Box<[Gc<MapNode>]>) -> Gc<MapNode> {
    if bitmap == u32::MAX {
        s.alloc(MapNode::Full { shift, nodes })
    } else {
        s.alloc(MapNode::Idx {
            bitmap,
            shift,
            nodes,
        })
    }
}

/// Wrap an existing branch in a fresh one-slot Idx node, then insert the
/// new entry into it. Used when a leaf (or collision) splits because a
/// different hash arrived at its position.
fn split_branch(
    s: &mut State,
    shift: u32,
    branch: Gc<MapNode>,
    hash: u32,
    key: Value,
    val: Value,
    added: &mut bool,
) -> Gc<MapNode> {
    let bitmap = bitpos(branch.get_hash(), shift);
    let wrapped = idx_node(s, bitmap, shift, Box::new([branch]));
    node_set(s, wrapped, shift, hash, key, val, added)
}

fn node_set(
    s: &mut State,
    n: Gc<MapNode>,
    shift: u32,
    hash: u32,
    key: Value,
    val: Value,
    added: &mut bool,
) -> Gc<MapNode> {
    match &*n {
        MapNode::Leaf {
            hash: lhash,
            key: lkey,
            val: lval,
        } => {
            if hash == *lhash {
                if value_eq(&key, lkey) {
                    if value_eq(&val, lval) {
                        return n;
                    }
                    return leaf(s, hash, key, val);
                }
                // Same hash, different key: escalate to a collision node.
                let new_leaf = leaf(s, hash, key, val);
                *added = true;
                return s.alloc(MapNode::Collision {
                    hash,
                    leaves: Box::new([n, new_leaf]),
                });
            }
            split_branch(s, shift, n, hash, key, val, added)
        }
        MapNode::Collision {
            hash: chash,
            leaves,
        } => {
            if hash != *chash {
                return split_branch(s, shift, n, hash, key, val, added);
            }
            if let Some(idx) = collision_find(leaves, hash, &key) {
                if let MapNode::Leaf { val: lval, .. } = &*leaves[idx] {
                    if value_eq(&val, lval) {
                        return n;
                    }
                }
                let mut new_leaves = leaves.to_vec();
                new_leaves[idx] = leaf(s, hash, key, val);
                return s.alloc(MapNode::Collision {
                    hash,
                    leaves: new_leaves.into_boxed_slice(),
                });
            }
            let mut new_leaves = leaves.to_vec();
            new_leaves.push(leaf(s, hash, key, val));
            *added = true;
            s.alloc(MapNode::Collision {
                hash,
                leaves: new_leaves.into_boxed_slice(),
            })
        }
        MapNode::Idx { bitmap, nodes, .. } => {
            let bit = bitpos(hash, shift);
            let idx = (bitmap & (bit - 1)).count_ones() as usize;
            if bitmap & bit != 0 {
                let child = node_set(s, nodes[idx], shift + BITS, hash, key, val, added);
                if Gc::ptr_eq(child, nodes[idx]) {
                    return n;
                }
                let mut new_nodes = nodes.to_vec();
                new_nodes[idx] = child;
                return idx_node(s, *bitmap, shift, new_nodes.into_boxed_slice());
            }
            let new_leaf = leaf(s, hash, key, val);
            *added = true;
            let mut new_nodes = nodes.to_vec();
            new_nodes.insert(idx, new_leaf);
            idx_node(s, bitmap | bit, shift, new_nodes.into_boxed_slice())
        }
        MapNode::Full { nodes, .. } => {
            let idx = ((hash >> shift) & MASK) as usize;
            let child = node_set(s, nodes[idx], shift + BITS, hash, key, val, added);
            if Gc::ptr_eq(child, nodes[idx]) {
                return n;
            }
            let mut new_nodes = nodes.to_vec();
            new_nodes[idx] = child;
            s.alloc(MapNode::Full {
                shift,
                nodes: new_nodes.into_boxed_slice(),
            })
        }
    }
}

fn node_without(
    s: &mut State,
    n: Gc<MapNode>,
    hash: u32,
    key: &Value,
) -> Option<Gc<MapNode>> {
    match &*n {
        MapNode::Leaf {
            hash: lhash,
            key: lkey,
            ..
        } => {
            if hash == *lhash && value_eq(key, lkey) {
                None
            } else {
                Some(n)
            }
        }
        MapNode::Collision { hash: chash, leaves } => {
            let Some(idx) = collision_find(leaves, hash, key) else {
                return Some(n);
            };
            if leaves.len() == 2 {
                // Collapse to the surviving leaf.
                return Some(leaves[1 - idx]);
            }
            let mut new_leaves = leaves.to_vec();
            new_leaves.remove(idx);
            Some(s.alloc(MapNode::Collision {
                hash: *chash,
                leaves: new_leaves.into_boxed_slice(),
            }))
        }
        MapNode::Idx {
            bitmap,
            shift,
            nodes,
        } => {
            let bit = bitpos(hash, *shift);
            if bitmap & bit == 0 {
                return Some(n);
            }
            let idx = (bitmap & (bit - 1)).count_ones() as usize;
            match node_without(s, nodes[idx], hash, key) {
                Some(child) if Gc::ptr_eq(child, nodes[idx]) => Some(n),
                Some(child) => {
                    let mut new_nodes = nodes.to_vec();
                    new_nodes[idx] = child;
                    Some(idx_node(
                        s,
                        *bitmap,
                        *shift,
                        new_nodes.into_boxed_slice(),
                    ))
                }
                None => {
                    if *bitmap == bit {
                        return None;
                    }
                    let mut new_nodes = nodes.to_vec();
                    new_nodes.remove(idx);
                    Some(idx_node(
                        s,
                        bitmap & !bit,
                        *shift,
                        new_nodes.into_boxed_slice(),
                    ))
                }
            }
        }
        MapNode::Full { shift, nodes } => {
            let idx = ((hash >> shift) & MASK) as usize;
            match node_without(s, nodes[idx], hash, key) {
                Some(child) if Gc::ptr_eq(child, nodes[idx]) => Some(n),
                Some(child) => {
                    let mut new_nodes = nodes.to_vec();
                    new_nodes[idx] = child;
                    Some(s.alloc(MapNode::Full {
                        shift: *shift,
                        nodes: new_nodes.into_boxed_slice(),
                    }))
                }
                None => {
                    // Demote back to a sparse node with the slot cleared.
                    let mut new_nodes = nodes.to_vec();
                    new_nodes.remove(idx);
                    Some(idx_node(
                        s,
                        !bitpos(hash, *shift),
                        *shift,
                        new_nodes.into_boxed_slice(),
                    ))
                }
            }
        }
    }
}

fn node_find(n: Gc<MapNode>, hash: u32, key: &Value) -> Option<Gc<MapNode>> {
    match &*n {
        MapNode::Leaf {
            hash: lhash,
            key: lkey,
            ..
        } => (hash == *lhash && value_eq(key, lkey)).then_some(n),
        MapNode::Collision { leaves, .. } => {
            collision_find(leaves, hash, key).map(|i| leaves[i])
        }
        MapNode::Idx {
            bitmap,
            shift,
            nodes,
        } => {
            let bit = bitpos(hash, *shift);
            if bitmap & bit == 0 {
                return None;
            }
            let idx = (bitmap & (bit - 1)).count_ones() as usize;
            node_find(nodes[idx], hash, key)
        }
        MapNode::Full { shift, nodes } => {
            node_find(nodes[((hash >> shift) & MASK) as usize], hash, key)
        }
    }
}

fn collision_find(leaves: &[Gc<MapNode>], hash: u32, key: &Value) -> Option<usize> {
    leaves
        .iter()
        .position(|l| node_find(*l, hash, key).is_some())
}

/// Look up a key; `Value::Invalid` means absent.
pub fn get(m: Gc<Map>, key: &Value, hash: u32) -> Value {
    let Some(root) = m.root else {
        return Value::Invalid;
    };
    match node_find(root, hash, key) {
        Some(n) => match &*n {
            MapNode::Leaf { val, .. } => *val,
            _ => Value::Invalid,
        },
        None => Value::Invalid,
    }
}

pub fn insert(s: &mut State, m: Gc<Map>, key: Value, hash: u32, val: Value) -> Value {
    let mut added = false;
    let new_root = match m.root {
        Some(root) => node_set(s, root, 0, hash, key, val, &mut added),
        None => {
            added = true;
            leaf(s, hash, key, val)
        }
    };
    if let Some(root) = m.root {
        if Gc::ptr_eq(new_root, root) {
            return Value::Map(m);
        }
    }
    alloc_map(s, m.cnt + usize::from(added), Some(new_root))
}

pub fn remove(s: &mut State, m: Gc<Map>, key: &Value, hash: u32) -> Value {
    let Some(root) = m.root else {
        return Value::Map(m);
    };
    match node_without(s, root, hash, key) {
        Some(new_root) if Gc::ptr_eq(new_root, root) => Value::Map(m),
        Some(new_root) => alloc_map(s, m.cnt - 1, Some(new_root)),
        None => create_empty(s),
    }
}

pub fn has(m: Gc<Map>, key: &Value, hash: u32) -> bool {
    !matches!(get(m, key, hash), Value::Invalid)
}

/// Merge `b` into `a` by walking `b` as a tree sequence.
pub fn cat(s: &mut State, a: Gc<Map>, b: Gc<Map>) -> Result<Value> {
    let mut out = Value::Map(a);
    let mut cur = seq::tree_create_map(s, b);
    while let Value::Seq(q) = cur {
        let entry = seq::first(s, q)?;
        let Value::Seq(kv) = entry else {
            return Err(s.fatal("Malformed map sequence entry"));
        };
        let key = seq::first(s, kv)?;
        let val = seq::rest(s, kv)?;
        let Value::Map(acc) = out else {
            unreachable!()
        };
        out = insert(s, acc, key, hash_value(&key), val);
        cur = seq::rest(s, q)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_map(v: Value) -> Gc<Map> {
        match v {
            Value::Map(g) => g,
            other => panic!("expected map, got {}", other.type_name()),
        }
    }

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    #[test]
    fn insert_get_remove_laws() {
        let mut s = State::new();
        let m = as_map(create_empty(&mut s));

        let k = num(10.0);
        let h = hash_value(&k);
        let m1 = as_map(insert(&mut s, m, k, h, num(1.0)));
        assert_eq!(length(m1), 1);
        assert!(value_eq(&get(m1, &k, h), &num(1.0)));

        // Re-inserting the same pair returns the same map.
        let m2 = as_map(insert(&mut s, m1, k, h, num(1.0)));
        assert!(Gc::ptr_eq(m1, m2));

        // Overwrite does not change the count.
        let m3 = as_map(insert(&mut s, m1, k, h, num(2.0)));
        assert_eq!(length(m3), 1);
        assert!(value_eq(&get(m3, &k, h), &num(2.0)));

        let m4 = as_map(remove(&mut s, m3, &k, h));
        assert_eq!(length(m4), 0);
        assert!(!has(m4, &k, h));
        // Removing an absent key returns the same map.
        let m5 = as_map(remove(&mut s, m4, &k, h));
        assert_eq!(length(m5), 0);
    }

    #[test]
    fn collision_escalation_and_collapse() {
        let mut s = State::new();
        let m = as_map(create_empty(&mut s));

        // Force full-hash collisions by driving the node layer with a
        // constant hash for distinct keys.
        let hash = 0xdead_beef;
        let keys: Vec<Value> = (0..5).map(|i| num(i as f64)).collect();
        let mut cur = m;
        for (i, k) in keys.iter().enumerate() {
            cur = as_map(insert(&mut s, cur, *k, hash, num(100.0 + i as f64)));
        }
        assert_eq!(length(cur), 5);
        for (i, k) in keys.iter().enumerate() {
            assert!(value_eq(&get(cur, k, hash), &num(100.0 + i as f64)));
        }

        // A different hash still lands beside the collision node.
        let other = num(99.0);
        let cur = as_map(insert(&mut s, cur, other, 0x0000_0001, num(7.0)));
        assert!(value_eq(&get(cur, &other, 0x0000_0001), &num(7.0)));
        assert!(value_eq(&get(cur, &keys[3], hash), &num(103.0)));

        // Remove down to one colliding key: the collision node collapses.
        let mut shrunk = cur;
        for k in &keys[..4] {
            shrunk = as_map(remove(&mut s, shrunk, k, hash));
        }
        assert_eq!(length(shrunk), 2);
        assert!(value_eq(&get(shrunk, &keys[4], hash), &num(104.0)));
    }

    #[test]
    fn full_node_promotion_and_demotion() {
        let mut s = State::new();
        let m = as_map(create_empty(&mut s));

        // 32 distinct bottom-5-bit hashes saturate the root bitmap.
        let mut cur = m;
        for i in 0..64u32 {
            let k = num(i as f64);
            cur = as_map(insert(&mut s, cur, k, i, num(i as f64 * 2.0)));
        }
        assert_eq!(length(cur), 64);
        for i in 0..64u32 {
            let k = num(i as f64);
            assert!(value_eq(&get(cur, &k, i), &num(i as f64 * 2.0)));
        }

        // Removing entries walks back through the demotion path.
        for i in 0..64u32 {
            let k = num(i as f64);
            cur = as_map(remove(&mut s, cur, &k, i));
        }
        assert_eq!(length(cur), 0);
    }

    #[test]
    fn ten_thousand_keys_rebuild() {
        let mut s = State::new();
        let mut cur = as_map(create_empty(&mut s));
        let keys: Vec<Value> = (0..10_000).map(|i| num(i as f64)).collect();
        for (i, k) in keys.iter().enumerate() {
            cur = as_map(insert(&mut s, cur, *k, hash_value(k), num(i as f64)));
            assert_eq!(length(cur), i + 1);
        }
        // Intermediate maps preserved every earlier key.
        for probe in [0usize, 17, 4999, 9999] {
            let k = &keys[probe];
            assert!(value_eq(&get(cur, k, hash_value(k)), &num(probe as f64)));
        }
        for (i, k) in keys.iter().enumerate().rev() {
            cur = as_map(remove(&mut s, cur, k, hash_value(k)));
            assert_eq!(length(cur), i);
        }
        assert_eq!(length(cur), 0);
    }

    #[test]
    fn string_keys_compare_by_content() {
        let mut s = State::new();
        let m = as_map(create_empty(&mut s));
        let k1 = s.intern(b"counter");
        let h = hash_value(&k1);
        let m1 = as_map(insert(&mut s, m, k1, h, num(3.0)));

        // A content-equal string built separately still finds the entry.
        let k2 = s.intern(b"counter");
        assert!(value_eq(&get(m1, &k2, hash_value(&k2)), &num(3.0)));
    }

    #[test]
    fn cat_merges_right_into_left() {
        let mut s = State::new();
        let mut a = as_map(create_empty(&mut s));
        let mut b = as_map(create_empty(&mut s));
        for i in 0..10 {
            let k = num(i as f64);
            a = as_map(insert(&mut s, a, k, hash_value(&k), num(1.0)));
        }
        for i in 5..15 {
            let k = num(i as f64);
            b = as_map(insert(&mut s, b, k, hash_value(&k), num(2.0)));
        }
        let merged = as_map(cat(&mut s, a, b).unwrap());
        assert_eq!(length(merged), 15);
        let k = num(7.0);
        assert!(value_eq(&get(merged, &k, hash_value(&k)), &num(2.0)));
        let k = num(2.0);
        assert!(value_eq(&get(merged, &k, hash_value(&k)), &num(1.0)));
    }
}
