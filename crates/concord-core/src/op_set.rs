//! The operation set: causal delivery, change application, diffs.
//!
//! Changes enter through a pending queue and apply only once every
//! dependency has been delivered; anything not yet ready stays queued
//! with no timeout. Applying a change routes each op to the object
//! store and folds the emitted diffs into one ordered sequence.

use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::actor_states::{ActorStates, ChangeEntry, OpMeta};
use crate::change::{Change, ChangeRequest, DataType, ElemId, Key, ObjectId, Op, RequestType};
use crate::clock::Clock;
use crate::error::BackendError;
use crate::object_store::{rendered, ObjType, ObjectStore, SequenceData};
use crate::patch::{Conflict, Diff, PathElem};
use crate::undo::UndoState;

#[derive(Debug, Clone)]
pub struct OpSet {
    states: ActorStates,
    store: ObjectStore,
    queue: VecDeque<Change>,
    clock: Clock,
    /// The dependency frontier: actors whose latest change no other
    /// applied change depends on. Becomes the `deps` of each patch.
    heads: Clock,
    undo: UndoState,
}

impl OpSet {
    pub fn new() -> OpSet {
        OpSet {
            states: ActorStates::new(),
            store: ObjectStore::new(),
            queue: VecDeque::new(),
            clock: Clock::empty(),
            heads: Clock::empty(),
            undo: UndoState::default(),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn heads(&self) -> &Clock {
        &self.heads
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn states(&self) -> &ActorStates {
        &self.states
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    // ── Causal queue ──────────────────────────────────────────────────────

    pub fn enqueue(&mut self, change: Change) -> Result<(), BackendError> {
        change.validate()?;
        self.queue.push_back(change);
        Ok(())
    }

    /// Repeatedly apply every queued change whose dependencies are
    /// satisfied; a full pass that applies nothing terminates the
    /// loop. Returns the applied changes and their ordered diffs.
    pub fn drain(&mut self) -> Result<(Vec<Rc<Change>>, Vec<Diff>), BackendError> {
        let mut applied = Vec::new();
        let mut diffs = Vec::new();
        loop {
            let mut progressed = false;
            let mut remaining = VecDeque::new();
            while let Some(change) = self.queue.pop_front() {
                if self.is_ready(&change) {
                    let (entry, mut change_diffs) = self.apply_change(change)?;
                    if let Some(entry) = entry {
                        applied.push(entry);
                    }
                    diffs.append(&mut change_diffs);
                    progressed = true;
                } else {
                    remaining.push_back(change);
                }
            }
            self.queue = remaining;
            if !progressed || self.queue.is_empty() {
                break;
            }
        }
        Ok((applied, diffs))
    }

    /// The maximum unseen `(actor, seq)` still blocking the queue.
    pub fn get_missing_deps(&self) -> Clock {
        let mut missing = Clock::empty();
        for change in &self.queue {
            let needed = change.deps.with(&change.actor, change.seq - 1);
            for (actor, seq) in needed.iter() {
                if seq > self.clock.get(actor) {
                    missing.set_max(actor, seq);
                }
            }
        }
        missing
    }

    fn is_ready(&self, change: &Change) -> bool {
        change
            .deps
            .with(&change.actor, change.seq - 1)
            .le(&self.clock)
    }

    // ── Change application ────────────────────────────────────────────────

    /// Apply one causally-ready change. A change already applied with
    /// identical content is a no-op with no diffs.
    fn apply_change(
        &mut self,
        change: Change,
    ) -> Result<(Option<Rc<Change>>, Vec<Diff>), BackendError> {
        change.validate()?;
        if self.states.is_applied(&change)? {
            return Ok((None, Vec::new()));
        }
        let entry = self.states.add_change(change);
        let change = entry.change.clone();

        let mut diffs = Vec::new();
        let mut created_here: HashSet<ObjectId> = HashSet::new();
        for op in &change.ops {
            let meta = OpMeta {
                actor: change.actor.clone(),
                seq: change.seq,
                op: op.clone(),
            };
            match op {
                Op::MakeMap { .. }
                | Op::MakeTable { .. }
                | Op::MakeList { .. }
                | Op::MakeText { .. } => {
                    let (obj, obj_type) = self.store.apply_make(&meta)?;
                    created_here.insert(obj.clone());
                    diffs.push(Diff::create(obj, obj_type));
                }
                Op::Insert { .. } => self.store.apply_insert(&meta)?,
                Op::Set { .. } | Op::Delete { .. } | Op::Link { .. } => {
                    let top_level = !created_here.contains(op.obj());
                    if let Some(diff) = self.apply_assign(meta, top_level)? {
                        diffs.push(diff);
                    }
                }
            }
        }

        self.clock.set_max(&change.actor, change.seq);
        self.update_heads(&entry);
        Ok((Some(change), diffs))
    }

    fn update_heads(&mut self, entry: &Rc<ChangeEntry>) {
        let covered: Vec<_> = self
            .heads
            .iter()
            .filter(|(actor, seq)| entry.all_deps.get(actor) >= *seq)
            .map(|(actor, _)| actor.clone())
            .collect();
        for actor in covered {
            self.heads.remove(&actor);
        }
        self.heads.set(&entry.change.actor, entry.change.seq);
    }

    // ── Register assignment (set / del / link) ────────────────────────────

    /// Fold an assignment op into the register at `(obj, key)` and
    /// emit the resulting diff, if the change is visible.
    fn apply_assign(
        &mut self,
        meta: OpMeta,
        top_level: bool,
    ) -> Result<Option<Diff>, BackendError> {
        if let Op::Set {
            datatype: Some(DataType::Unknown(tag)),
            ..
        } = &meta.op
        {
            return Err(BackendError::UnknownDatatype(tag.clone()));
        }

        let obj = meta.op.obj().clone();
        let key = match meta.op.key() {
            Some(key) => key.clone(),
            None => {
                return Err(BackendError::InvalidRequest(format!(
                    "assignment without a key: {}",
                    meta.op
                )))
            }
        };
        let obj_type = self.store.get(&obj)?.obj_type;

        // Inverse capture reads the register before it changes.
        if top_level && self.undo.capturing() {
            let inverse = self.inverse_ops(&obj, &key);
            self.undo.capture(inverse);
        }

        if let Op::Link { value: target, .. } = &meta.op {
            if !self.store.contains(target) {
                return Err(BackendError::UnknownObject(target.clone()));
            }
        }

        let elem = if obj_type.is_sequence() {
            let elem = key.as_elem_id()?;
            let known = self
                .store
                .get(&obj)?
                .sequence()
                .map(|seq| seq.contains(&elem))
                .unwrap_or(false);
            if !known {
                return Err(BackendError::InvalidRequest(format!(
                    "assignment to uninserted element {elem} in {obj}"
                )));
            }
            Some(elem)
        } else {
            None
        };

        // Fold into the register.
        let (overwritten, winner, conflicts) = {
            let record = self.store.get_mut(&obj)?;
            let field = record.fields.entry(key.clone()).or_default();
            let overwritten = field.incorporate(meta.clone(), &self.states);
            let winner = field.winner().and_then(rendered);
            let conflicts = if field.len() > 1 {
                field.conflicts()
            } else {
                Vec::new()
            };
            (overwritten, winner, conflicts)
        };

        // Inbound edges: overwritten links leave their target's set,
        // an incoming link joins its target's set.
        for old in &overwritten {
            if let Op::Link { value: target, .. } = &old.op {
                if let Ok(record) = self.store.get_mut(target) {
                    record.remove_inbound(old);
                }
            }
        }
        if let Op::Link { value: target, .. } = &meta.op {
            self.store.get_mut(target)?.add_inbound(meta.clone());
        }

        match elem {
            None => Ok(Some(match winner {
                Some((value, datatype, link)) => {
                    Diff::set_key(obj, obj_type, key, value, datatype, link)
                        .with_conflicts(conflicts)
                }
                None => Diff::remove_key(obj, obj_type, key),
            })),
            Some(elem) => {
                let record = self.store.get_mut(&obj)?;
                let seq = record.sequence_mut().ok_or_else(|| {
                    BackendError::InvalidRequest(format!("object {obj} is not a sequence"))
                })?;
                Ok(update_visible_element(
                    seq, &obj, obj_type, elem, winner, conflicts,
                )?)
            }
        }
    }

    /// The ops that would restore the current register at `(obj,
    /// key)`: its standing ops stripped to raw form, or a `del` when
    /// the register is empty.
    fn inverse_ops(&self, obj: &ObjectId, key: &Key) -> Vec<Op> {
        let current: Vec<Op> = self
            .store
            .get(obj)
            .ok()
            .and_then(|record| record.field(key))
            .map(|field| field.iter().map(|meta| meta.op.clone()).collect())
            .unwrap_or_default();
        if current.is_empty() {
            vec![Op::Delete {
                obj: obj.clone(),
                key: key.clone(),
            }]
        } else {
            current
        }
    }

    // ── Local change requests ─────────────────────────────────────────────

    pub fn apply_local_change(
        &mut self,
        request: ChangeRequest,
    ) -> Result<Vec<Diff>, BackendError> {
        if request.actor.as_str().is_empty() {
            return Err(BackendError::InvalidRequest(
                "actor must be a non-empty string".into(),
            ));
        }
        let expected = self.clock.get(&request.actor) + 1;
        if request.seq != expected {
            return Err(BackendError::InvalidRequest(format!(
                "local change for {} expected seq {expected}, got {}",
                request.actor, request.seq
            )));
        }
        match request.request_type {
            RequestType::Change => self.apply_local_ops(request),
            RequestType::Undo => self.apply_undo(request),
            RequestType::Redo => self.apply_redo(request),
        }
    }

    fn apply_local_ops(&mut self, request: ChangeRequest) -> Result<Vec<Diff>, BackendError> {
        let undoable = request.undoable;
        if undoable {
            self.undo.begin_capture();
        }
        let result = self.apply_request_ops(request, None);
        match result {
            Ok(diffs) => {
                if undoable {
                    self.undo.commit_capture();
                }
                Ok(diffs)
            }
            Err(err) => {
                if undoable {
                    self.undo.abort_capture();
                }
                Err(err)
            }
        }
    }

    fn apply_undo(&mut self, request: ChangeRequest) -> Result<Vec<Diff>, BackendError> {
        let ops = self
            .undo
            .peek_undo()
            .ok_or(BackendError::EmptyUndo)?
            .clone();

        // Synthesize the redo frame from the registers the undo is
        // about to revert, one entry per distinct target.
        let mut seen = HashSet::new();
        let mut redo_ops = Vec::new();
        for op in &ops {
            if let (obj, Some(key)) = (op.obj(), op.key()) {
                if seen.insert((obj.clone(), key.clone())) {
                    redo_ops.extend(self.inverse_ops(obj, key));
                }
            }
        }

        let diffs = self.apply_request_ops(request, Some(ops))?;
        self.undo.complete_undo(redo_ops);
        Ok(diffs)
    }

    fn apply_redo(&mut self, request: ChangeRequest) -> Result<Vec<Diff>, BackendError> {
        let ops = self
            .undo
            .peek_redo()
            .ok_or(BackendError::EmptyRedo)?
            .clone();
        let diffs = self.apply_request_ops(request, Some(ops))?;
        self.undo.complete_redo();
        Ok(diffs)
    }

    fn apply_request_ops(
        &mut self,
        request: ChangeRequest,
        ops: Option<Vec<Op>>,
    ) -> Result<Vec<Diff>, BackendError> {
        let change = Change {
            actor: request.actor.clone(),
            seq: request.seq,
            deps: request.deps.without(&request.actor),
            message: request.message,
            ops: ops.unwrap_or(request.ops),
        };
        if !self.is_ready(&change) {
            return Err(BackendError::InvalidRequest(format!(
                "local change {} depends on undelivered changes",
                change
            )));
        }
        let (_, diffs) = self.apply_change(change)?;
        Ok(diffs)
    }

    // ── Full materialization ──────────────────────────────────────────────

    /// Depth-first diffs reconstructing the whole document: every
    /// reachable object's `create` precedes the assignment that
    /// references it.
    pub fn materialize(&self) -> Vec<Diff> {
        let mut diffs = Vec::new();
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        self.walk(&ObjectId::Root, &mut path, &mut on_path, &mut diffs);
        diffs
    }

    fn walk(
        &self,
        obj: &ObjectId,
        path: &mut Vec<PathElem>,
        on_path: &mut HashSet<ObjectId>,
        diffs: &mut Vec<Diff>,
    ) {
        let Ok(record) = self.store.get(obj) else {
            return;
        };
        if !on_path.insert(obj.clone()) {
            return;
        }
        if *obj != ObjectId::Root {
            diffs.push(Diff::create(obj.clone(), record.obj_type).with_path(path.clone()));
        }

        if let Some(seq) = record.sequence() {
            let elems: Vec<ElemId> = seq.elem_ids.iter_keys().cloned().collect();
            for (index, elem) in elems.iter().enumerate() {
                let key = Key::from(elem);
                let Some(field) = record.field(&key) else {
                    continue;
                };
                let Some(winner) = field.winner() else {
                    continue;
                };
                for meta in field.iter() {
                    if let Op::Link { value: child, .. } = &meta.op {
                        path.push(PathElem::Index(index));
                        self.walk(child, path, on_path, diffs);
                        path.pop();
                    }
                }
                let Some((value, datatype, link)) = rendered(winner) else {
                    continue;
                };
                let mut diff = Diff::insert_elem(
                    obj.clone(),
                    record.obj_type,
                    index,
                    elem.clone(),
                    value,
                    datatype,
                    link,
                )
                .with_path(path.clone());
                if field.len() > 1 {
                    diff = diff.with_conflicts(field.conflicts());
                }
                diffs.push(diff);
            }
        } else {
            for (key, field) in &record.fields {
                let Some(winner) = field.winner() else {
                    continue;
                };
                for meta in field.iter() {
                    if let Op::Link { value: child, .. } = &meta.op {
                        path.push(PathElem::Key(key.0.clone()));
                        self.walk(child, path, on_path, diffs);
                        path.pop();
                    }
                }
                let Some((value, datatype, link)) = rendered(winner) else {
                    continue;
                };
                let mut diff = Diff::set_key(
                    obj.clone(),
                    record.obj_type,
                    key.clone(),
                    value,
                    datatype,
                    link,
                )
                .with_path(path.clone());
                if field.len() > 1 {
                    diff = diff.with_conflicts(field.conflicts());
                }
                diffs.push(diff);
            }
        }
        on_path.remove(obj);
    }

    /// One arbitrary root path to `obj`, or `None` if unreachable.
    pub fn get_path(&self, obj: &ObjectId) -> Option<Vec<PathElem>> {
        let mut path = VecDeque::new();
        let mut cur = obj.clone();
        let mut visited = HashSet::new();
        while cur != ObjectId::Root {
            if !visited.insert(cur.clone()) {
                return None;
            }
            let record = self.store.get(&cur).ok()?;
            let mut found = None;
            for link in &record.inbound {
                let parent_id = link.op.obj();
                let Ok(parent) = self.store.get(parent_id) else {
                    continue;
                };
                let Some(key) = link.op.key() else {
                    continue;
                };
                let Some(field) = parent.field(key) else {
                    continue;
                };
                if !field.iter().any(|meta| meta == link) {
                    continue;
                }
                if let Some(seq) = parent.sequence() {
                    let Ok(elem) = key.as_elem_id() else {
                        continue;
                    };
                    let Some(index) = seq.elem_ids.index_of(&elem) else {
                        continue;
                    };
                    found = Some((parent_id.clone(), PathElem::Index(index)));
                } else {
                    found = Some((parent_id.clone(), PathElem::Key(key.0.clone())));
                }
                break;
            }
            let (parent_id, step) = found?;
            path.push_front(step);
            cur = parent_id;
        }
        Some(path.into())
    }
}

impl Default for OpSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconcile a list element's visibility with its register, per the
/// state of the position skip list.
fn update_visible_element(
    seq: &mut SequenceData,
    obj: &ObjectId,
    obj_type: ObjType,
    elem: ElemId,
    winner: Option<(serde_json::Value, Option<DataType>, bool)>,
    conflicts: Vec<Conflict>,
) -> Result<Option<Diff>, BackendError> {
    let present = seq.elem_ids.contains_key(&elem);
    match (present, winner) {
        // Invisible and still empty: nothing to show.
        (false, None) => Ok(None),
        // Becoming visible: insert after the nearest preceding live
        // element.
        (false, Some((value, datatype, link))) => {
            let index = {
                let mut prev = seq.get_previous(&elem);
                loop {
                    match prev {
                        None => break 0,
                        Some(p) => match seq.elem_ids.index_of(&p) {
                            Some(i) => break i + 1,
                            None => prev = seq.get_previous(&p),
                        },
                    }
                }
            };
            seq.elem_ids
                .insert_index_mut(index, elem.clone(), value.clone())?;
            Ok(Some(
                Diff::insert_elem(obj.clone(), obj_type, index, elem, value, datatype, link)
                    .with_conflicts(conflicts),
            ))
        }
        // Visible and emptied: drop from the index.
        (true, None) => {
            let index = match seq.elem_ids.index_of(&elem) {
                Some(index) => index,
                None => return Ok(None),
            };
            seq.elem_ids.remove_key_mut(&elem)?;
            Ok(Some(Diff::remove_elem(obj.clone(), obj_type, index, elem)))
        }
        // Visible with a new winner: update in place.
        (true, Some((value, datatype, link))) => {
            let index = match seq.elem_ids.index_of(&elem) {
                Some(index) => index,
                None => return Ok(None),
            };
            seq.elem_ids.set_value_mut(&elem, value.clone())?;
            Ok(Some(
                Diff::set_elem(obj.clone(), obj_type, index, elem, value, datatype, link)
                    .with_conflicts(conflicts),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ActorId, ScalarValue};
    use crate::patch::DiffAction;

    fn actor(name: &str) -> ActorId {
        ActorId::from(name)
    }

    fn set_op(obj: ObjectId, key: &str, value: f64) -> Op {
        Op::Set {
            obj,
            key: Key::from(key),
            value: ScalarValue::Number(value),
            datatype: None,
        }
    }

    fn change(actor_name: &str, seq: u64, deps: &[(&str, u64)], ops: Vec<Op>) -> Change {
        Change {
            actor: actor(actor_name),
            seq,
            deps: deps
                .iter()
                .map(|(a, s)| (ActorId::from(*a), *s))
                .collect(),
            message: None,
            ops,
        }
    }

    fn apply(op_set: &mut OpSet, change: Change) -> Vec<Diff> {
        op_set.enqueue(change).unwrap();
        let (_, diffs) = op_set.drain().unwrap();
        diffs
    }

    #[test]
    fn set_on_root_emits_a_set_diff() {
        let mut op_set = OpSet::new();
        let diffs = apply(
            &mut op_set,
            change("a", 1, &[], vec![set_op(ObjectId::Root, "x", 1.0)]),
        );
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].action, DiffAction::Set);
        assert_eq!(diffs[0].key, Some(Key::from("x")));
        assert_eq!(diffs[0].value, Some(serde_json::json!(1.0)));
        assert_eq!(op_set.clock().get(&actor("a")), 1);
    }

    #[test]
    fn causally_premature_change_waits_in_queue() {
        let mut op_set = OpSet::new();
        let c2 = change("b", 1, &[("a", 1)], vec![set_op(ObjectId::Root, "y", 2.0)]);
        let diffs = apply(&mut op_set, c2);
        assert!(diffs.is_empty());
        assert_eq!(op_set.clock().get(&actor("b")), 0);
        assert_eq!(
            op_set.get_missing_deps(),
            Clock::empty().with(&actor("a"), 1)
        );

        let c1 = change("a", 1, &[], vec![set_op(ObjectId::Root, "x", 1.0)]);
        let diffs = apply(&mut op_set, c1);
        // Both apply now, c1's diff first.
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].key, Some(Key::from("x")));
        assert_eq!(diffs[1].key, Some(Key::from("y")));
        assert!(op_set.get_missing_deps().is_empty());
    }

    #[test]
    fn duplicate_change_applies_once_with_empty_diff() {
        let mut op_set = OpSet::new();
        let c = change("a", 1, &[], vec![set_op(ObjectId::Root, "x", 1.0)]);
        let first = apply(&mut op_set, c.clone());
        assert_eq!(first.len(), 1);
        let second = apply(&mut op_set, c);
        assert!(second.is_empty());
        assert_eq!(op_set.clock().get(&actor("a")), 1);
    }

    #[test]
    fn inconsistent_reuse_is_an_error() {
        let mut op_set = OpSet::new();
        apply(
            &mut op_set,
            change("a", 1, &[], vec![set_op(ObjectId::Root, "x", 1.0)]),
        );
        let mut imposter = change("a", 1, &[], vec![set_op(ObjectId::Root, "x", 999.0)]);
        imposter.message = None;
        op_set.enqueue(imposter).unwrap();
        assert_eq!(
            op_set.drain().unwrap_err(),
            BackendError::InconsistentReuse {
                actor: actor("a"),
                seq: 1
            }
        );
    }

    #[test]
    fn concurrent_sets_surface_conflicts_with_actor_desc_winner() {
        let mut op_set = OpSet::new();
        apply(
            &mut op_set,
            change("A", 1, &[], vec![set_op(ObjectId::Root, "x", 1.0)]),
        );
        let diffs = apply(
            &mut op_set,
            change("B", 1, &[], vec![set_op(ObjectId::Root, "x", 2.0)]),
        );
        assert_eq!(diffs[0].value, Some(serde_json::json!(2.0)));
        assert_eq!(diffs[0].conflicts.len(), 1);
        assert_eq!(diffs[0].conflicts[0].actor, actor("A"));
        assert_eq!(diffs[0].conflicts[0].value, Some(serde_json::json!(1.0)));
    }

    #[test]
    fn unknown_datatype_fails_apply() {
        let mut op_set = OpSet::new();
        let op = Op::Set {
            obj: ObjectId::Root,
            key: Key::from("x"),
            value: ScalarValue::Number(1.0),
            datatype: Some(DataType::Unknown("vector".into())),
        };
        op_set.enqueue(change("a", 1, &[], vec![op])).unwrap();
        assert_eq!(
            op_set.drain().unwrap_err(),
            BackendError::UnknownDatatype("vector".into())
        );
    }

    fn list_setup(op_set: &mut OpSet) -> ObjectId {
        let list = ObjectId::Id("list-1".into());
        apply(
            op_set,
            change(
                "a",
                1,
                &[],
                vec![
                    Op::MakeList { obj: list.clone() },
                    Op::Insert {
                        obj: list.clone(),
                        key: Key::from("_head"),
                        elem: 1,
                    },
                    set_op(list.clone(), "a:1", 10.0),
                    Op::Link {
                        obj: ObjectId::Root,
                        key: Key::from("items"),
                        value: list.clone(),
                    },
                ],
            ),
        );
        list
    }

    #[test]
    fn list_insert_becomes_visible_on_first_assignment() {
        let mut op_set = OpSet::new();
        let list = list_setup(&mut op_set);
        let record = op_set.store().get(&list).unwrap();
        let seq = record.sequence().unwrap();
        assert_eq!(seq.elem_ids.len(), 1);
        assert_eq!(
            seq.elem_ids.key_of(0),
            Some(&ElemId::new(actor("a"), 1))
        );
        assert_eq!(seq.max_elem(), 1);
    }

    #[test]
    fn list_delete_removes_from_index() {
        let mut op_set = OpSet::new();
        let list = list_setup(&mut op_set);
        let diffs = apply(
            &mut op_set,
            change(
                "a",
                2,
                &[],
                vec![Op::Delete {
                    obj: list.clone(),
                    key: Key::from("a:1"),
                }],
            ),
        );
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].action, DiffAction::Remove);
        assert_eq!(diffs[0].index, Some(0));
        let record = op_set.store().get(&list).unwrap();
        assert_eq!(record.sequence().unwrap().elem_ids.len(), 0);
    }

    #[test]
    fn ins_alone_emits_no_diff() {
        let mut op_set = OpSet::new();
        let list = ObjectId::Id("list-1".into());
        let diffs = apply(
            &mut op_set,
            change(
                "a",
                1,
                &[],
                vec![
                    Op::MakeList { obj: list.clone() },
                    Op::Insert {
                        obj: list,
                        key: Key::from("_head"),
                        elem: 1,
                    },
                ],
            ),
        );
        // Only the create diff; the inserted element is invisible.
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].action, DiffAction::Create);
    }

    #[test]
    fn materialize_walks_children_before_references() {
        let mut op_set = OpSet::new();
        let list = list_setup(&mut op_set);
        let diffs = op_set.materialize();
        let actions: Vec<DiffAction> = diffs.iter().map(|d| d.action).collect();
        assert_eq!(
            actions,
            vec![DiffAction::Create, DiffAction::Insert, DiffAction::Set]
        );
        assert_eq!(diffs[0].obj, list);
        assert_eq!(diffs[1].index, Some(0));
        assert_eq!(diffs[2].key, Some(Key::from("items")));
        assert!(diffs[2].link);
    }

    #[test]
    fn get_path_resolves_keys_and_indices() {
        let mut op_set = OpSet::new();
        let list = list_setup(&mut op_set);
        // A map stored inside the list element.
        let inner = ObjectId::Id("map-1".into());
        apply(
            &mut op_set,
            change(
                "a",
                2,
                &[],
                vec![
                    Op::MakeMap { obj: inner.clone() },
                    Op::Link {
                        obj: list.clone(),
                        key: Key::from("a:1"),
                        value: inner.clone(),
                    },
                ],
            ),
        );
        assert_eq!(
            op_set.get_path(&list),
            Some(vec![PathElem::Key("items".into())])
        );
        assert_eq!(
            op_set.get_path(&inner),
            Some(vec![PathElem::Key("items".into()), PathElem::Index(0)])
        );
        assert_eq!(op_set.get_path(&ObjectId::Root), Some(vec![]));
        assert_eq!(op_set.get_path(&ObjectId::Id("ghost".into())), None);
    }

    #[test]
    fn heads_track_the_dependency_frontier() {
        let mut op_set = OpSet::new();
        apply(
            &mut op_set,
            change("a", 1, &[], vec![set_op(ObjectId::Root, "x", 1.0)]),
        );
        apply(
            &mut op_set,
            change("b", 1, &[("a", 1)], vec![set_op(ObjectId::Root, "y", 2.0)]),
        );
        // b:1 observed a:1, so only b:1 remains a head.
        assert_eq!(op_set.heads(), &Clock::empty().with(&actor("b"), 1));
    }

    #[test]
    fn local_change_with_wrong_seq_is_rejected() {
        let mut op_set = OpSet::new();
        let request = ChangeRequest {
            request_type: RequestType::Change,
            actor: actor("a"),
            seq: 5,
            deps: Clock::empty(),
            message: None,
            ops: vec![set_op(ObjectId::Root, "x", 1.0)],
            undoable: true,
        };
        assert!(matches!(
            op_set.apply_local_change(request),
            Err(BackendError::InvalidRequest(_))
        ));
    }

    #[test]
    fn undo_reverts_and_redo_restores() {
        let mut op_set = OpSet::new();
        let request = |seq, rt, ops: Vec<Op>| ChangeRequest {
            request_type: rt,
            actor: actor("a"),
            seq,
            deps: Clock::empty(),
            message: None,
            ops,
            undoable: true,
        };
        op_set
            .apply_local_change(request(
                1,
                RequestType::Change,
                vec![set_op(ObjectId::Root, "x", 1.0)],
            ))
            .unwrap();
        assert!(op_set.can_undo());
        assert!(!op_set.can_redo());

        let diffs = op_set
            .apply_local_change(request(2, RequestType::Undo, vec![]))
            .unwrap();
        assert_eq!(diffs[0].action, DiffAction::Remove);
        assert!(!op_set.can_undo());
        assert!(op_set.can_redo());

        let diffs = op_set
            .apply_local_change(request(3, RequestType::Redo, vec![]))
            .unwrap();
        assert_eq!(diffs[0].action, DiffAction::Set);
        assert_eq!(diffs[0].value, Some(serde_json::json!(1.0)));
        assert!(op_set.can_undo());
        assert!(!op_set.can_redo());
    }

    #[test]
    fn undo_with_empty_stack_fails() {
        let mut op_set = OpSet::new();
        let request = ChangeRequest {
            request_type: RequestType::Undo,
            actor: actor("a"),
            seq: 1,
            deps: Clock::empty(),
            message: None,
            ops: vec![],
            undoable: false,
        };
        assert_eq!(
            op_set.apply_local_change(request),
            Err(BackendError::EmptyUndo)
        );
    }

    #[test]
    fn undo_restores_a_previous_value_not_just_deletes() {
        let mut op_set = OpSet::new();
        let request = |seq, rt, ops: Vec<Op>| ChangeRequest {
            request_type: rt,
            actor: actor("a"),
            seq,
            deps: Clock::empty(),
            message: None,
            ops,
            undoable: true,
        };
        op_set
            .apply_local_change(request(
                1,
                RequestType::Change,
                vec![set_op(ObjectId::Root, "x", 1.0)],
            ))
            .unwrap();
        op_set
            .apply_local_change(request(
                2,
                RequestType::Change,
                vec![set_op(ObjectId::Root, "x", 2.0)],
            ))
            .unwrap();
        let diffs = op_set
            .apply_local_change(request(3, RequestType::Undo, vec![]))
            .unwrap();
        assert_eq!(diffs[0].action, DiffAction::Set);
        assert_eq!(diffs[0].value, Some(serde_json::json!(1.0)));
    }
}
