//! By-object-id store: field registers, inbound edges, list ordering.
//!
//! Each composite object is an [`ObjectRecord`]: its creation type,
//! a multi-value register per key, and the set of `link` ops pointing
//! at it. List and text objects additionally carry the insertion tree
//! (`following` / `parents`), the largest element counter seen, and
//! the position skip list over currently-visible elements.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::actor_states::{ActorStates, OpMeta};
use crate::change::{DataType, ElemId, Key, ObjectId, Op};
use crate::error::BackendError;
use crate::patch::Conflict;
use crate::skiplist::SkipList;

// ── Object types ──────────────────────────────────────────────────────────

/// The shape of a composite object, fixed by its creation op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjType {
    Map,
    Table,
    List,
    Text,
}

impl ObjType {
    /// Lists and texts are ordered sequences; maps and tables are
    /// keyed collections.
    pub fn is_sequence(&self) -> bool {
        matches!(self, ObjType::List | ObjType::Text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjType::Map => "map",
            ObjType::Table => "table",
            ObjType::List => "list",
            ObjType::Text => "text",
        }
    }
}

// ── Multi-value register ──────────────────────────────────────────────────

/// The set of concurrent assignment ops currently standing at one
/// `(obj, key)`, kept in winner-first order (actor id descending).
#[derive(Debug, Clone, Default)]
pub struct FieldOps {
    ops: Vec<OpMeta>,
}

impl FieldOps {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The winning op: greatest actor id among the concurrent set.
    pub fn winner(&self) -> Option<&OpMeta> {
        self.ops.first()
    }

    /// Every op after the winner, i.e. the losing concurrent writes.
    pub fn losers(&self) -> &[OpMeta] {
        if self.ops.is_empty() {
            &[]
        } else {
            &self.ops[1..]
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpMeta> {
        self.ops.iter()
    }

    /// Fold `incoming` into the register: ops the incoming change has
    /// observed are overwritten (and returned, so the caller can fix
    /// up inbound edges); genuinely concurrent ops stay. A `del` only
    /// removes: it is never stored itself.
    pub fn incorporate(&mut self, incoming: OpMeta, states: &ActorStates) -> Vec<OpMeta> {
        let mut concurrent = Vec::new();
        let mut overwritten = Vec::new();
        for existing in self.ops.drain(..) {
            if states.are_concurrent(&existing, &incoming) {
                concurrent.push(existing);
            } else {
                overwritten.push(existing);
            }
        }
        if !matches!(incoming.op, Op::Delete { .. }) {
            concurrent.push(incoming);
        }
        concurrent.sort_by(|a, b| b.actor.cmp(&a.actor).then_with(|| b.seq.cmp(&a.seq)));
        self.ops = concurrent;
        overwritten
    }

    /// The losers rendered for a diff's `conflicts` list.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.losers()
            .iter()
            .filter_map(|meta| {
                let (value, datatype, link) = rendered(meta)?;
                Some(Conflict {
                    actor: meta.actor.clone(),
                    value: Some(value),
                    datatype,
                    link,
                })
            })
            .collect()
    }
}

/// Render an assignment op as (value, datatype, is-link) for diffs.
pub fn rendered(meta: &OpMeta) -> Option<(serde_json::Value, Option<DataType>, bool)> {
    match &meta.op {
        Op::Set {
            value, datatype, ..
        } => Some((value.to_json(), datatype.clone(), false)),
        Op::Link { value, .. } => Some((
            serde_json::Value::String(value.as_str().to_string()),
            None,
            true,
        )),
        _ => None,
    }
}

// ── Sequence data (lists and texts) ───────────────────────────────────────

/// The insertion tree and position index of a list or text object.
#[derive(Debug, Clone)]
pub struct SequenceData {
    /// Parent element id → elements inserted directly after it.
    /// Unsorted here; sibling order is imposed at traversal time.
    following: HashMap<ElemId, Vec<ElemId>>,
    /// Element id → the parent it was inserted after.
    parents: HashMap<ElemId, ElemId>,
    /// Largest element counter observed for this list.
    max_elem: u64,
    /// The visible list: exactly the element ids whose register is
    /// non-empty, in document order, with the rendered winner value.
    pub elem_ids: SkipList<ElemId, serde_json::Value>,
}

impl SequenceData {
    pub fn new() -> SequenceData {
        SequenceData {
            following: HashMap::new(),
            parents: HashMap::new(),
            max_elem: 0,
            elem_ids: SkipList::new(),
        }
    }

    pub fn max_elem(&self) -> u64 {
        self.max_elem
    }

    pub fn contains(&self, elem: &ElemId) -> bool {
        self.parents.contains_key(elem)
    }

    /// Record an insertion of `elem` after `parent`.
    pub fn insert(&mut self, parent: ElemId, elem: ElemId) -> Result<(), BackendError> {
        if self.parents.contains_key(&elem) {
            return Err(BackendError::DuplicateElem(elem.to_string()));
        }
        if parent != ElemId::Head && !self.parents.contains_key(&parent) {
            return Err(BackendError::UnknownPred(parent.to_string()));
        }
        self.max_elem = self.max_elem.max(elem.counter());
        self.following.entry(parent.clone()).or_default().push(elem.clone());
        self.parents.insert(elem, parent);
        Ok(())
    }

    fn parent_of(&self, elem: &ElemId) -> Option<&ElemId> {
        if *elem == ElemId::Head {
            return None;
        }
        self.parents.get(elem)
    }

    /// The elements inserted after `parent`, in visible order:
    /// higher counter first, ties broken by actor id descending.
    pub fn children(&self, parent: &ElemId) -> Vec<ElemId> {
        let mut children = self
            .following
            .get(parent)
            .cloned()
            .unwrap_or_default();
        children.sort_by(|a, b| b.lamport_cmp(a));
        children
    }

    /// The element after `elem` in document order: its first child,
    /// or the next sibling of the nearest ancestor that has one.
    pub fn get_next(&self, elem: &ElemId) -> Option<ElemId> {
        if let Some(first) = self.children(elem).first() {
            return Some(first.clone());
        }
        let mut cur = elem.clone();
        while let Some(parent) = self.parent_of(&cur).cloned() {
            let siblings = self.children(&parent);
            let idx = siblings.iter().position(|s| *s == cur)?;
            if idx + 1 < siblings.len() {
                return Some(siblings[idx + 1].clone());
            }
            cur = parent;
        }
        None
    }

    /// The element before `elem` in document order; `None` means the
    /// head, i.e. `elem` is (or would be) the first visible position.
    pub fn get_previous(&self, elem: &ElemId) -> Option<ElemId> {
        let parent = self.parent_of(elem)?.clone();
        let siblings = self.children(&parent);
        let idx = siblings.iter().position(|s| *s == *elem)?;
        if idx == 0 {
            return if parent == ElemId::Head {
                None
            } else {
                Some(parent)
            };
        }
        let mut prev = siblings[idx - 1].clone();
        loop {
            match self.children(&prev).last() {
                Some(last) => prev = last.clone(),
                None => break,
            }
        }
        Some(prev)
    }

    /// In-order traversal of every known element, visible or not.
    pub fn traverse(&self) -> Vec<ElemId> {
        let mut out = Vec::new();
        let mut cur = ElemId::Head;
        while let Some(next) = self.get_next(&cur) {
            out.push(next.clone());
            cur = next;
        }
        out
    }
}

impl Default for SequenceData {
    fn default() -> Self {
        Self::new()
    }
}

// ── Object records ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub obj_type: ObjType,
    /// Per key (map key, or element-id string for sequences), the
    /// standing register. `BTreeMap` so materialization walks keys in
    /// canonical order.
    pub fields: BTreeMap<Key, FieldOps>,
    /// The `link` ops currently or previously pointing at this
    /// object; pruned as links are overwritten.
    pub inbound: Vec<OpMeta>,
    /// Present iff `obj_type.is_sequence()`.
    pub seq: Option<SequenceData>,
}

impl ObjectRecord {
    pub fn new(obj_type: ObjType) -> ObjectRecord {
        ObjectRecord {
            obj_type,
            fields: BTreeMap::new(),
            inbound: Vec::new(),
            seq: obj_type.is_sequence().then(SequenceData::new),
        }
    }

    pub fn field(&self, key: &Key) -> Option<&FieldOps> {
        self.fields.get(key)
    }

    pub fn add_inbound(&mut self, meta: OpMeta) {
        if !self.inbound.contains(&meta) {
            self.inbound.push(meta);
        }
    }

    pub fn remove_inbound(&mut self, meta: &OpMeta) {
        self.inbound.retain(|existing| existing != meta);
    }

    pub fn sequence(&self) -> Option<&SequenceData> {
        self.seq.as_ref()
    }

    pub fn sequence_mut(&mut self) -> Option<&mut SequenceData> {
        self.seq.as_mut()
    }
}

// ── Store ─────────────────────────────────────────────────────────────────

/// The in-memory object table. The root map always exists.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    objects: HashMap<ObjectId, ObjectRecord>,
}

impl ObjectStore {
    pub fn new() -> ObjectStore {
        let mut objects = HashMap::new();
        objects.insert(ObjectId::Root, ObjectRecord::new(ObjType::Map));
        ObjectStore { objects }
    }

    pub fn contains(&self, obj: &ObjectId) -> bool {
        self.objects.contains_key(obj)
    }

    pub fn get(&self, obj: &ObjectId) -> Result<&ObjectRecord, BackendError> {
        self.objects
            .get(obj)
            .ok_or_else(|| BackendError::UnknownObject(obj.clone()))
    }

    pub fn get_mut(&mut self, obj: &ObjectId) -> Result<&mut ObjectRecord, BackendError> {
        self.objects
            .get_mut(obj)
            .ok_or_else(|| BackendError::UnknownObject(obj.clone()))
    }

    pub fn object_type(&self, obj: &ObjectId) -> Option<ObjType> {
        self.objects.get(obj).map(|record| record.obj_type)
    }

    /// Create the record for a `make*` op. Objects are created once
    /// and never deleted; recreating an id is an error.
    pub fn apply_make(&mut self, meta: &OpMeta) -> Result<(ObjectId, ObjType), BackendError> {
        let (obj, obj_type) = match &meta.op {
            Op::MakeMap { obj } => (obj, ObjType::Map),
            Op::MakeTable { obj } => (obj, ObjType::Table),
            Op::MakeList { obj } => (obj, ObjType::List),
            Op::MakeText { obj } => (obj, ObjType::Text),
            other => {
                return Err(BackendError::InvalidRequest(format!(
                    "not a creation op: {other}"
                )))
            }
        };
        if self.objects.contains_key(obj) {
            return Err(BackendError::DuplicateCreate(obj.clone()));
        }
        self.objects.insert(obj.clone(), ObjectRecord::new(obj_type));
        Ok((obj.clone(), obj_type))
    }

    /// Record an `ins` op. Insertion allocates a position in the
    /// ordering tree but emits no diff: the element stays invisible
    /// until a `set` or `link` lands on it.
    pub fn apply_insert(&mut self, meta: &OpMeta) -> Result<(), BackendError> {
        let (obj, key, elem) = match &meta.op {
            Op::Insert { obj, key, elem } => (obj, key, *elem),
            other => {
                return Err(BackendError::InvalidRequest(format!(
                    "not an insertion op: {other}"
                )))
            }
        };
        let parent = key.as_elem_id()?;
        let elem_id = ElemId::new(meta.actor.clone(), elem);
        let record = self.get_mut(obj)?;
        let seq = record.sequence_mut().ok_or_else(|| {
            BackendError::InvalidRequest(format!("insertion into non-sequence object {obj}"))
        })?;
        seq.insert(parent, elem_id)
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}
