//! Position skip list: the index structure for visible list elements.
//!
//! Maps list indices to element ids (and back) in O(log n) expected
//! steps. Every node stores, per level, forward and backward links
//! together with the number of level-0 steps each link skips, so an
//! index can be recovered by summing distances along a predecessor
//! chain instead of walking the whole list.
//!
//! Public operations take `&self` and return a logically new instance,
//! so earlier snapshots are never observably mutated; the engine's own
//! hot path uses the crate-internal in-place variants on its private
//! copy of the state.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;

/// Levels are capped so a pathological random source cannot grow
/// towers without bound.
const MAX_LEVEL: usize = 16;

const DEFAULT_SEED: u64 = 0x5ee5_c0de_d00d_1e5e;

#[derive(Debug, Error, PartialEq)]
pub enum SkipListError {
    #[error("duplicate key {0}")]
    DuplicateKey(String),
    #[error("unknown key {0}")]
    UnknownKey(String),
    #[error("index {0} out of bounds")]
    IndexOutOfBounds(usize),
}

#[derive(Debug, Clone)]
struct Node<K, V> {
    value: V,
    /// Number of levels this node participates in (≥ 1).
    level: usize,
    /// Per level: preceding node (`None` = head sentinel).
    prev: Vec<Option<K>>,
    /// Per level: following node (`None` = tail).
    next: Vec<Option<K>>,
    /// Per level: level-0 steps back to `prev` (≥ 1).
    prev_count: Vec<usize>,
    /// Per level: level-0 steps forward to `next`; 0 when `next` is
    /// the tail.
    next_count: Vec<usize>,
}

/// An indexable skip list keyed by `K`, storing one `V` per key.
#[derive(Debug, Clone)]
pub struct SkipList<K, V> {
    nodes: HashMap<K, Node<K, V>>,
    head_next: Vec<Option<K>>,
    head_count: Vec<usize>,
    len: usize,
    rng: SmallRng,
}

impl<K, V> Default for SkipList<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SkipList<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug,
    V: Clone,
{
    pub fn new() -> SkipList<K, V> {
        Self::with_rng(SmallRng::seed_from_u64(DEFAULT_SEED))
    }

    /// Build a list with an injected level source. Tests use a seeded
    /// generator so tower shapes are reproducible.
    pub fn with_rng(rng: SmallRng) -> SkipList<K, V> {
        SkipList {
            nodes: HashMap::new(),
            head_next: Vec::new(),
            head_count: Vec::new(),
            len: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    // ── Persistent operations ─────────────────────────────────────────────

    /// Insert `key` immediately after `pred` (at the front when `pred`
    /// is `None`), returning the new list.
    pub fn insert_after(&self, pred: Option<&K>, key: K, value: V) -> Result<SkipList<K, V>, SkipListError> {
        let mut next = self.clone();
        next.insert_after_mut(pred, key, value)?;
        Ok(next)
    }

    /// Insert `key` so it ends up at `index`, returning the new list.
    pub fn insert_index(&self, index: usize, key: K, value: V) -> Result<SkipList<K, V>, SkipListError> {
        let mut next = self.clone();
        next.insert_index_mut(index, key, value)?;
        Ok(next)
    }

    pub fn remove_key(&self, key: &K) -> Result<SkipList<K, V>, SkipListError> {
        let mut next = self.clone();
        next.remove_key_mut(key)?;
        Ok(next)
    }

    pub fn remove_index(&self, index: usize) -> Result<SkipList<K, V>, SkipListError> {
        let mut next = self.clone();
        next.remove_index_mut(index)?;
        Ok(next)
    }

    pub fn set_value(&self, key: &K, value: V) -> Result<SkipList<K, V>, SkipListError> {
        let mut next = self.clone();
        next.set_value_mut(key, value)?;
        Ok(next)
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// The index of `key`, or `None` if absent.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        self.nodes.get(key)?;
        let mut pos = 0usize;
        let mut cur = key.clone();
        loop {
            let node = &self.nodes[&cur];
            let top = node.level - 1;
            pos += node.prev_count[top];
            match &node.prev[top] {
                None => break,
                Some(prev) => cur = prev.clone(),
            }
        }
        Some(pos - 1)
    }

    /// The key at `index`. Negative indices count from the tail;
    /// out-of-bounds yields `None`.
    pub fn key_of(&self, index: isize) -> Option<&K> {
        let index = if index < 0 {
            let from_end = (-index) as usize;
            if from_end > self.len {
                return None;
            }
            self.len - from_end
        } else {
            index as usize
        };
        if index >= self.len {
            return None;
        }
        self.key_at(index)
    }

    pub fn get_value(&self, key: &K) -> Option<&V> {
        self.nodes.get(key).map(|node| &node.value)
    }

    /// Iterate keys in list order.
    pub fn iter_keys(&self) -> impl Iterator<Item = &K> {
        self.iter_entries().map(|(key, _)| key)
    }

    /// Iterate values in list order.
    pub fn iter_values(&self) -> impl Iterator<Item = &V> {
        self.iter_entries().map(|(_, value)| value)
    }

    /// Iterate `(key, value)` pairs in list order. Single-pass,
    /// advance-or-end.
    pub fn iter_entries(&self) -> Entries<'_, K, V> {
        Entries {
            list: self,
            cursor: self.head_next.first().cloned().flatten(),
        }
    }

    // ── In-place operations (engine hot path) ─────────────────────────────

    pub(crate) fn insert_after_mut(&mut self, pred: Option<&K>, key: K, value: V) -> Result<(), SkipListError> {
        let index = match pred {
            None => 0,
            Some(p) => self
                .index_of(p)
                .ok_or_else(|| SkipListError::UnknownKey(format!("{p:?}")))?
                + 1,
        };
        self.insert_index_mut(index, key, value)
    }

    pub(crate) fn insert_index_mut(&mut self, index: usize, key: K, value: V) -> Result<(), SkipListError> {
        if self.nodes.contains_key(&key) {
            return Err(SkipListError::DuplicateKey(format!("{key:?}")));
        }
        if index > self.len {
            return Err(SkipListError::IndexOutOfBounds(index));
        }

        let level = random_level(&mut self.rng);
        while self.head_next.len() < level {
            self.head_next.push(None);
            self.head_count.push(0);
        }

        // 1-based positions; the head sits at 0 and the new node will
        // land at `index + 1`.
        let new_pos = index + 1;
        let preds = self.predecessors(index);

        let mut node = Node {
            value,
            level,
            prev: vec![None; level],
            next: vec![None; level],
            prev_count: vec![0; level],
            next_count: vec![0; level],
        };

        for (l, (pred_key, pred_pos)) in preds.iter().enumerate() {
            let (succ_key, pred_count) = self.links_of(pred_key, l);
            if l < level {
                node.prev[l] = pred_key.clone();
                node.prev_count[l] = new_pos - pred_pos;
                node.next[l] = succ_key.clone();
                if let Some(succ) = &succ_key {
                    // The old successor shifts one step right.
                    let distance = pred_pos + pred_count + 1 - new_pos;
                    node.next_count[l] = distance;
                    let succ_node = self.nodes.get_mut(succ).expect("linked node exists");
                    succ_node.prev[l] = Some(key.clone());
                    succ_node.prev_count[l] = distance;
                }
                self.set_forward(pred_key, l, Some(key.clone()), new_pos - pred_pos);
            } else if let Some(succ) = succ_key {
                // A taller link spans the insertion point; both sides
                // of it grow by one step.
                self.set_forward(pred_key, l, Some(succ.clone()), pred_count + 1);
                let succ_node = self.nodes.get_mut(&succ).expect("linked node exists");
                succ_node.prev_count[l] += 1;
            }
        }

        self.nodes.insert(key, node);
        self.len += 1;
        Ok(())
    }

    pub(crate) fn remove_key_mut(&mut self, key: &K) -> Result<(), SkipListError> {
        let index = self
            .index_of(key)
            .ok_or_else(|| SkipListError::UnknownKey(format!("{key:?}")))?;
        self.remove_index_mut(index)
    }

    pub(crate) fn remove_index_mut(&mut self, index: usize) -> Result<(), SkipListError> {
        if index >= self.len {
            return Err(SkipListError::IndexOutOfBounds(index));
        }
        let key = self.key_at(index).expect("index checked").clone();

        // Predecessors strictly before the removed position, for the
        // taller links that skip over it.
        let preds = self.predecessors(index);
        let node = self.nodes.remove(&key).expect("key located by index");

        for l in 0..self.head_next.len() {
            if l < node.level {
                match &node.next[l] {
                    Some(succ) => {
                        let distance = node.prev_count[l] + node.next_count[l] - 1;
                        self.set_forward(&node.prev[l], l, Some(succ.clone()), distance);
                        let succ_node = self.nodes.get_mut(succ).expect("linked node exists");
                        succ_node.prev[l] = node.prev[l].clone();
                        succ_node.prev_count[l] = distance;
                    }
                    None => self.set_forward(&node.prev[l], l, None, 0),
                }
            } else {
                let (pred_key, _) = &preds[l];
                let (succ_key, count) = self.links_of(pred_key, l);
                if let Some(succ) = succ_key {
                    self.set_forward(pred_key, l, Some(succ.clone()), count - 1);
                    let succ_node = self.nodes.get_mut(&succ).expect("linked node exists");
                    succ_node.prev_count[l] -= 1;
                }
            }
        }

        self.len -= 1;
        Ok(())
    }

    pub(crate) fn set_value_mut(&mut self, key: &K, value: V) -> Result<(), SkipListError> {
        let node = self
            .nodes
            .get_mut(key)
            .ok_or_else(|| SkipListError::UnknownKey(format!("{key:?}")))?;
        node.value = value;
        Ok(())
    }

    // ── Internal walks ────────────────────────────────────────────────────

    /// For every level, the last node at that level whose 1-based
    /// position is ≤ `target_pos`, together with that position (head =
    /// `(None, 0)`).
    fn predecessors(&self, target_pos: usize) -> Vec<(Option<K>, usize)> {
        let levels = self.head_next.len();
        let mut result = vec![(None, 0); levels];
        let mut cur: Option<K> = None;
        let mut pos = 0usize;
        for l in (0..levels).rev() {
            loop {
                let (next, count) = self.links_of(&cur, l);
                match next {
                    Some(next_key) if pos + count <= target_pos => {
                        pos += count;
                        cur = Some(next_key);
                    }
                    _ => break,
                }
            }
            result[l] = (cur.clone(), pos);
        }
        result
    }

    fn key_at(&self, index: usize) -> Option<&K> {
        if index >= self.len {
            return None;
        }
        let target = index + 1;
        let mut cur: Option<&K> = None;
        let mut pos = 0usize;
        for l in (0..self.head_next.len()).rev() {
            loop {
                let (next, count) = match cur {
                    None => (self.head_next[l].as_ref(), self.head_count[l]),
                    Some(key) => {
                        let node = &self.nodes[key];
                        (node.next[l].as_ref(), node.next_count[l])
                    }
                };
                match next {
                    Some(next_key) if pos + count <= target => {
                        pos += count;
                        cur = Some(next_key);
                    }
                    _ => break,
                }
            }
        }
        debug_assert_eq!(pos, target);
        cur
    }

    /// Forward link of `from` (head when `None`) at `level`.
    fn links_of(&self, from: &Option<K>, level: usize) -> (Option<K>, usize) {
        match from {
            None => (self.head_next[level].clone(), self.head_count[level]),
            Some(key) => {
                let node = &self.nodes[key];
                (node.next[level].clone(), node.next_count[level])
            }
        }
    }

    fn set_forward(&mut self, from: &Option<K>, level: usize, next: Option<K>, count: usize) {
        match from {
            None => {
                self.head_next[level] = next;
                self.head_count[level] = count;
            }
            Some(key) => {
                let node = self.nodes.get_mut(key).expect("linked node exists");
                node.next[level] = next;
                node.next_count[level] = count;
            }
        }
    }
}

/// Geometric level draw: one 32-bit word, two bits per level, so level
/// k is drawn with probability (3/4)·(1/4)^(k−1), capped at 16.
fn random_level(rng: &mut SmallRng) -> usize {
    let word = rng.next_u32();
    let level = 1 + (word.leading_zeros() as usize) / 2;
    level.min(MAX_LEVEL)
}

/// List-order entry iterator. Finite, single-pass, non-restartable.
pub struct Entries<'a, K, V> {
    list: &'a SkipList<K, V>,
    cursor: Option<K>,
}

impl<'a, K, V> Iterator for Entries<'a, K, V>
where
    K: Clone + Eq + Hash + fmt::Debug,
    V: Clone,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<(&'a K, &'a V)> {
        let key = self.cursor.take()?;
        let (entry, node) = self.list.nodes.get_key_value(&key)?;
        self.cursor = node.next[0].clone();
        Some((entry, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(items: &[&str]) -> SkipList<String, usize> {
        let mut list = SkipList::new();
        for (i, item) in items.iter().enumerate() {
            list.insert_index_mut(i, item.to_string(), i).unwrap();
        }
        list
    }

    fn keys(list: &SkipList<String, usize>) -> Vec<String> {
        list.iter_keys().cloned().collect()
    }

    #[test]
    fn empty_list() {
        let list: SkipList<String, usize> = SkipList::new();
        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert_eq!(list.key_of(0), None);
        assert_eq!(list.index_of(&"a".to_string()), None);
    }

    #[test]
    fn append_preserves_order() {
        let list = list_of(&["a", "b", "c", "d"]);
        assert_eq!(keys(&list), vec!["a", "b", "c", "d"]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn insert_at_front_and_middle() {
        let mut list = list_of(&["b", "d"]);
        list.insert_index_mut(0, "a".into(), 10).unwrap();
        list.insert_index_mut(2, "c".into(), 11).unwrap();
        assert_eq!(keys(&list), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn index_of_agrees_with_key_of() {
        let list = list_of(&["a", "b", "c", "d", "e", "f", "g"]);
        for i in 0..list.len() {
            let key = list.key_of(i as isize).unwrap().clone();
            assert_eq!(list.index_of(&key), Some(i), "round trip at {i}");
        }
    }

    #[test]
    fn negative_key_of_counts_from_tail() {
        let list = list_of(&["a", "b", "c"]);
        assert_eq!(list.key_of(-1).unwrap(), "c");
        assert_eq!(list.key_of(-3).unwrap(), "a");
        assert_eq!(list.key_of(-4), None);
        assert_eq!(list.key_of(3), None);
    }

    #[test]
    fn insert_after_named_predecessor() {
        let mut list = list_of(&["a", "c"]);
        list.insert_after_mut(Some(&"a".to_string()), "b".into(), 9).unwrap();
        list.insert_after_mut(None, "start".into(), 8).unwrap();
        assert_eq!(keys(&list), vec!["start", "a", "b", "c"]);
    }

    #[test]
    fn insert_after_unknown_pred_fails() {
        let mut list = list_of(&["a"]);
        let err = list
            .insert_after_mut(Some(&"ghost".to_string()), "b".into(), 0)
            .unwrap_err();
        assert!(matches!(err, SkipListError::UnknownKey(_)));
    }

    #[test]
    fn duplicate_key_fails() {
        let mut list = list_of(&["a"]);
        let err = list.insert_index_mut(1, "a".into(), 0).unwrap_err();
        assert!(matches!(err, SkipListError::DuplicateKey(_)));
    }

    #[test]
    fn out_of_bounds_insert_fails() {
        let mut list = list_of(&["a"]);
        let err = list.insert_index_mut(5, "b".into(), 0).unwrap_err();
        assert_eq!(err, SkipListError::IndexOutOfBounds(5));
    }

    #[test]
    fn remove_by_key_and_index() {
        let mut list = list_of(&["a", "b", "c", "d"]);
        list.remove_key_mut(&"b".to_string()).unwrap();
        assert_eq!(keys(&list), vec!["a", "c", "d"]);
        list.remove_index_mut(0).unwrap();
        assert_eq!(keys(&list), vec!["c", "d"]);
        list.remove_index_mut(1).unwrap();
        assert_eq!(keys(&list), vec!["c"]);
        assert_eq!(list.index_of(&"b".to_string()), None);
    }

    #[test]
    fn indices_stay_consistent_after_removals() {
        let mut list = list_of(&["a", "b", "c", "d", "e", "f", "g", "h"]);
        list.remove_index_mut(3).unwrap(); // d
        list.remove_index_mut(0).unwrap(); // a
        let expected = ["b", "c", "e", "f", "g", "h"];
        for (i, key) in expected.iter().enumerate() {
            assert_eq!(list.index_of(&key.to_string()), Some(i));
            assert_eq!(list.key_of(i as isize).unwrap(), key);
        }
    }

    #[test]
    fn values_are_stored_and_updated() {
        let mut list = list_of(&["a", "b"]);
        assert_eq!(list.get_value(&"b".to_string()), Some(&1));
        list.set_value_mut(&"b".to_string(), 42).unwrap();
        assert_eq!(list.get_value(&"b".to_string()), Some(&42));
        assert!(list.set_value_mut(&"zz".to_string(), 0).is_err());
    }

    #[test]
    fn persistent_operations_leave_the_original_untouched() {
        let base = list_of(&["a", "b"]);
        let grown = base.insert_index(2, "c".into(), 2).unwrap();
        let shrunk = base.remove_index(0).unwrap();
        assert_eq!(keys(&base), vec!["a", "b"]);
        assert_eq!(keys(&grown), vec!["a", "b", "c"]);
        assert_eq!(keys(&shrunk), vec!["b"]);
    }

    #[test]
    fn iterators_walk_in_list_order() {
        let list = list_of(&["x", "y", "z"]);
        let values: Vec<usize> = list.iter_values().copied().collect();
        assert_eq!(values, vec![0, 1, 2]);
        let entries: Vec<(String, usize)> = list
            .iter_entries()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        assert_eq!(entries[0], ("x".to_string(), 0));
        assert_eq!(entries[2], ("z".to_string(), 2));
    }

    #[test]
    fn injected_rng_makes_towers_reproducible() {
        let mut a: SkipList<String, usize> = SkipList::with_rng(SmallRng::seed_from_u64(7));
        let mut b: SkipList<String, usize> = SkipList::with_rng(SmallRng::seed_from_u64(7));
        for i in 0..64 {
            a.insert_index_mut(i, format!("k{i}"), i).unwrap();
            b.insert_index_mut(i, format!("k{i}"), i).unwrap();
        }
        assert_eq!(a.head_next.len(), b.head_next.len());
        assert_eq!(keys(&a), keys(&b));
    }

    #[test]
    fn survives_many_front_inserts() {
        let mut list: SkipList<String, usize> = SkipList::new();
        for i in 0..200 {
            list.insert_index_mut(0, format!("k{i}"), i).unwrap();
        }
        assert_eq!(list.len(), 200);
        // Most recent insert is at the front.
        assert_eq!(list.key_of(0).unwrap(), "k199");
        assert_eq!(list.key_of(199).unwrap(), "k0");
        assert_eq!(list.index_of(&"k100".to_string()), Some(99));
    }

    #[test]
    fn level_draw_is_geometric_and_capped() {
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..10_000 {
            let level = random_level(&mut rng);
            assert!((1..=MAX_LEVEL).contains(&level));
        }
    }
}
