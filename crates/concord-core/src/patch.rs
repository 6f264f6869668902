//! Patches: ordered diff sequences describing state transitions.
//!
//! The backend never hands a materialized document to the frontend;
//! it describes every transition as a [`Patch`] carrying [`Diff`]s,
//! either incrementally (the emissions of one apply) or as a full
//! materialization from the root.

use serde::{Deserialize, Serialize};

use crate::change::{ActorId, DataType, ElemId, Key, ObjectId};
use crate::clock::Clock;
use crate::object_store::ObjType;

// ── Diff ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Create,
    Set,
    Insert,
    Remove,
}

/// One step of a document transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub action: DiffAction,
    #[serde(rename = "type")]
    pub obj_type: ObjType,
    pub obj: ObjectId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<Key>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub elem_id: Option<ElemId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub datatype: Option<DataType>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub link: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<Vec<PathElem>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub conflicts: Vec<Conflict>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// One element of a root path: a map/table key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElem {
    Key(String),
    Index(usize),
}

/// A losing concurrent write, reported alongside the winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub actor: ActorId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub datatype: Option<DataType>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub link: bool,
}

impl Diff {
    fn bare(action: DiffAction, obj_type: ObjType, obj: ObjectId) -> Diff {
        Diff {
            action,
            obj_type,
            obj,
            key: None,
            index: None,
            elem_id: None,
            value: None,
            datatype: None,
            link: false,
            path: None,
            conflicts: Vec::new(),
        }
    }

    pub fn create(obj: ObjectId, obj_type: ObjType) -> Diff {
        Diff::bare(DiffAction::Create, obj_type, obj)
    }

    pub fn set_key(
        obj: ObjectId,
        obj_type: ObjType,
        key: Key,
        value: serde_json::Value,
        datatype: Option<DataType>,
        link: bool,
    ) -> Diff {
        let mut diff = Diff::bare(DiffAction::Set, obj_type, obj);
        diff.key = Some(key);
        diff.value = Some(value);
        diff.datatype = datatype;
        diff.link = link;
        diff
    }

    pub fn remove_key(obj: ObjectId, obj_type: ObjType, key: Key) -> Diff {
        let mut diff = Diff::bare(DiffAction::Remove, obj_type, obj);
        diff.key = Some(key);
        diff
    }

    pub fn insert_elem(
        obj: ObjectId,
        obj_type: ObjType,
        index: usize,
        elem_id: ElemId,
        value: serde_json::Value,
        datatype: Option<DataType>,
        link: bool,
    ) -> Diff {
        let mut diff = Diff::bare(DiffAction::Insert, obj_type, obj);
        diff.index = Some(index);
        diff.elem_id = Some(elem_id);
        diff.value = Some(value);
        diff.datatype = datatype;
        diff.link = link;
        diff
    }

    pub fn set_elem(
        obj: ObjectId,
        obj_type: ObjType,
        index: usize,
        elem_id: ElemId,
        value: serde_json::Value,
        datatype: Option<DataType>,
        link: bool,
    ) -> Diff {
        let mut diff = Diff::bare(DiffAction::Set, obj_type, obj);
        diff.index = Some(index);
        diff.elem_id = Some(elem_id);
        diff.value = Some(value);
        diff.datatype = datatype;
        diff.link = link;
        diff
    }

    pub fn remove_elem(obj: ObjectId, obj_type: ObjType, index: usize, elem_id: ElemId) -> Diff {
        let mut diff = Diff::bare(DiffAction::Remove, obj_type, obj);
        diff.index = Some(index);
        diff.elem_id = Some(elem_id);
        diff
    }

    pub fn with_conflicts(mut self, conflicts: Vec<Conflict>) -> Diff {
        self.conflicts = conflicts;
        self
    }

    pub fn with_path(mut self, path: Vec<PathElem>) -> Diff {
        self.path = Some(path);
        self
    }
}

// ── Patch ─────────────────────────────────────────────────────────────────

/// The unit the frontend consumes: the applied clock, the dependency
/// frontier, undo/redo availability, and the ordered diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub clock: Clock,
    pub deps: Clock,
    pub can_undo: bool,
    pub can_redo: bool,
    /// Set on patches produced by a local change request, so the
    /// frontend can match them against its pending queue.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actor: Option<ActorId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq: Option<u64>,
    pub diffs: Vec<Diff>,
}
