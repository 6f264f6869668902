//! Materialized document objects held by the frontend cache.
//!
//! Every composite object is stored flat, keyed by object id; values
//! reference child objects by id rather than by embedding, so one
//! updated object never forces its ancestors to be rebuilt. Each
//! object carries the bookkeeping the mutation session needs: its
//! object id, per-key/per-index conflicts, and (for sequences) the
//! element-id array and the largest element counter seen.

use std::collections::HashMap;

use indexmap::IndexMap;

use concord_core::{Conflict, DataType, ElemId, ObjType, ObjectId};

/// A field value: either a scalar with its optional datatype, or a
/// reference to another object in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    Scalar {
        value: serde_json::Value,
        datatype: Option<DataType>,
    },
    Ref(ObjectId),
}

impl DocValue {
    pub fn scalar(value: serde_json::Value) -> DocValue {
        DocValue::Scalar {
            value,
            datatype: None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&ObjectId> {
        match self {
            DocValue::Ref(id) => Some(id),
            DocValue::Scalar { .. } => None,
        }
    }

    /// Build from a diff's `(value, datatype, link)` triple.
    pub fn from_diff_parts(
        value: serde_json::Value,
        datatype: Option<DataType>,
        link: bool,
    ) -> DocValue {
        if link {
            match value {
                serde_json::Value::String(id) => DocValue::Ref(ObjectId::parse(&id)),
                other => DocValue::Scalar {
                    value: other,
                    datatype,
                },
            }
        } else {
            DocValue::Scalar { value, datatype }
        }
    }
}

/// One losing concurrent write, as kept by the frontend.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictValue {
    pub actor: concord_core::ActorId,
    pub value: DocValue,
}

pub fn conflict_values(conflicts: &[Conflict]) -> Vec<ConflictValue> {
    conflicts
        .iter()
        .map(|c| ConflictValue {
            actor: c.actor.clone(),
            value: DocValue::from_diff_parts(
                c.value.clone().unwrap_or(serde_json::Value::Null),
                c.datatype.clone(),
                c.link,
            ),
        })
        .collect()
}

// ── Objects ───────────────────────────────────────────────────────────────

/// A materialized map or table.
#[derive(Debug, Clone, PartialEq)]
pub struct MapObject {
    pub object_id: ObjectId,
    pub obj_type: ObjType,
    /// Insertion-ordered so repeated materializations list keys the
    /// way they arrived.
    pub entries: IndexMap<String, DocValue>,
    pub conflicts: HashMap<String, Vec<ConflictValue>>,
}

/// A materialized list or text.
#[derive(Debug, Clone, PartialEq)]
pub struct ListObject {
    pub object_id: ObjectId,
    pub obj_type: ObjType,
    pub elem_ids: Vec<ElemId>,
    pub items: Vec<DocValue>,
    /// Parallel to `items`.
    pub conflicts: Vec<Vec<ConflictValue>>,
    pub max_elem: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocObject {
    Map(MapObject),
    List(ListObject),
}

impl DocObject {
    pub fn empty(object_id: ObjectId, obj_type: ObjType) -> DocObject {
        if obj_type.is_sequence() {
            DocObject::List(ListObject {
                object_id,
                obj_type,
                elem_ids: Vec::new(),
                items: Vec::new(),
                conflicts: Vec::new(),
                max_elem: 0,
            })
        } else {
            DocObject::Map(MapObject {
                object_id,
                obj_type,
                entries: IndexMap::new(),
                conflicts: HashMap::new(),
            })
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        match self {
            DocObject::Map(map) => &map.object_id,
            DocObject::List(list) => &list.object_id,
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match self {
            DocObject::Map(map) => map.obj_type,
            DocObject::List(list) => list.obj_type,
        }
    }

    pub fn as_map(&self) -> Option<&MapObject> {
        match self {
            DocObject::Map(map) => Some(map),
            DocObject::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListObject> {
        match self {
            DocObject::List(list) => Some(list),
            DocObject::Map(_) => None,
        }
    }

    /// Every child object id currently referenced by this object.
    pub fn child_ids(&self) -> Vec<ObjectId> {
        match self {
            DocObject::Map(map) => map
                .entries
                .values()
                .filter_map(DocValue::as_ref_id)
                .cloned()
                .collect(),
            DocObject::List(list) => list
                .items
                .iter()
                .filter_map(DocValue::as_ref_id)
                .cloned()
                .collect(),
        }
    }
}
