//! Mutation sessions: the editable view behind `Document::change`.
//!
//! A session records every edit twice: as the wire [`Op`] that will
//! travel in the change request, and as the optimistic [`Diff`] the
//! document applies locally while the request is in flight. The
//! session works against its own copy of the cache, so edits within
//! one session observe each other and a failed session leaves the
//! document untouched.

use std::collections::HashMap;

use concord_core::{
    ActorId, DataType, Diff, ElemId, Key, ObjType, ObjectId, Op, ScalarValue,
};

use crate::cache::Cache;
use crate::error::FrontendError;
use crate::value::DocObject;

pub struct Session {
    actor: ActorId,
    cache: Cache,
    ops: Vec<Op>,
    diffs: Vec<Diff>,
}

impl Session {
    pub(crate) fn new(actor: ActorId, cache: Cache) -> Session {
        Session {
            actor,
            cache,
            ops: Vec::new(),
            diffs: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> (Vec<Op>, Vec<Diff>, Cache) {
        (self.ops, self.diffs, self.cache)
    }

    /// The session's live view, including edits made so far.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn record(&mut self, op: Op, diff: Option<Diff>) -> Result<(), FrontendError> {
        if let Some(diff) = diff {
            self.cache.apply_diffs(std::slice::from_ref(&diff))?;
            self.diffs.push(diff);
        }
        self.ops.push(op);
        Ok(())
    }

    fn object_type(&self, obj: &ObjectId) -> Result<ObjType, FrontendError> {
        self.cache
            .get(obj)
            .map(|object| object.obj_type())
            .ok_or_else(|| FrontendError::InvalidMutation(format!("unknown object {obj}")))
    }

    fn keyed_type(&self, obj: &ObjectId) -> Result<ObjType, FrontendError> {
        let obj_type = self.object_type(obj)?;
        if obj_type.is_sequence() {
            return Err(FrontendError::InvalidMutation(format!(
                "object {obj} is a {}, not a keyed object",
                obj_type.name()
            )));
        }
        Ok(obj_type)
    }

    fn sequence_type(&self, obj: &ObjectId) -> Result<ObjType, FrontendError> {
        let obj_type = self.object_type(obj)?;
        if !obj_type.is_sequence() {
            return Err(FrontendError::InvalidMutation(format!(
                "object {obj} is a {}, not a sequence",
                obj_type.name()
            )));
        }
        Ok(obj_type)
    }

    fn elem_at(&self, obj: &ObjectId, index: usize) -> Result<ElemId, FrontendError> {
        let Some(DocObject::List(list)) = self.cache.get(obj).map(|o| &**o) else {
            return Err(FrontendError::InvalidMutation(format!(
                "unknown sequence {obj}"
            )));
        };
        list.elem_ids.get(index).cloned().ok_or_else(|| {
            FrontendError::InvalidMutation(format!("index {index} out of bounds for {obj}"))
        })
    }

    // ── Object creation ───────────────────────────────────────────────────

    fn make(&mut self, obj_type: ObjType) -> Result<ObjectId, FrontendError> {
        let obj = ObjectId::Id(uuid::Uuid::new_v4().to_string());
        let op = match obj_type {
            ObjType::Map => Op::MakeMap { obj: obj.clone() },
            ObjType::Table => Op::MakeTable { obj: obj.clone() },
            ObjType::List => Op::MakeList { obj: obj.clone() },
            ObjType::Text => Op::MakeText { obj: obj.clone() },
        };
        self.record(op, Some(Diff::create(obj.clone(), obj_type)))?;
        Ok(obj)
    }

    pub fn make_map(&mut self) -> Result<ObjectId, FrontendError> {
        self.make(ObjType::Map)
    }

    pub fn make_table(&mut self) -> Result<ObjectId, FrontendError> {
        self.make(ObjType::Table)
    }

    pub fn make_list(&mut self) -> Result<ObjectId, FrontendError> {
        self.make(ObjType::List)
    }

    pub fn make_text(&mut self) -> Result<ObjectId, FrontendError> {
        self.make(ObjType::Text)
    }

    // ── Keyed objects (maps and tables) ───────────────────────────────────

    pub fn set(
        &mut self,
        obj: &ObjectId,
        key: &str,
        value: impl Into<ScalarValue>,
    ) -> Result<(), FrontendError> {
        self.set_with(obj, key, value.into(), None)
    }

    pub fn set_with(
        &mut self,
        obj: &ObjectId,
        key: &str,
        value: ScalarValue,
        datatype: Option<DataType>,
    ) -> Result<(), FrontendError> {
        if let Some(DataType::Unknown(tag)) = &datatype {
            return Err(FrontendError::InvalidMutation(format!(
                "unknown datatype {tag:?}"
            )));
        }
        let obj_type = self.keyed_type(obj)?;
        let diff = Diff::set_key(
            obj.clone(),
            obj_type,
            Key::from(key),
            value.to_json(),
            datatype.clone(),
            false,
        );
        self.record(
            Op::Set {
                obj: obj.clone(),
                key: Key::from(key),
                value,
                datatype,
            },
            Some(diff),
        )
    }

    pub fn link(
        &mut self,
        obj: &ObjectId,
        key: &str,
        child: &ObjectId,
    ) -> Result<(), FrontendError> {
        let obj_type = self.keyed_type(obj)?;
        if !self.cache.contains(child) {
            return Err(FrontendError::InvalidMutation(format!(
                "unknown object {child}"
            )));
        }
        let diff = Diff::set_key(
            obj.clone(),
            obj_type,
            Key::from(key),
            serde_json::Value::String(child.as_str().to_string()),
            None,
            true,
        );
        self.record(
            Op::Link {
                obj: obj.clone(),
                key: Key::from(key),
                value: child.clone(),
            },
            Some(diff),
        )
    }

    pub fn delete(&mut self, obj: &ObjectId, key: &str) -> Result<(), FrontendError> {
        let obj_type = self.keyed_type(obj)?;
        let present = self
            .cache
            .get(obj)
            .and_then(|object| object.as_map())
            .map(|map| map.entries.contains_key(key))
            .unwrap_or(false);
        if !present {
            return Err(FrontendError::InvalidMutation(format!(
                "no key {key:?} in {obj}"
            )));
        }
        let diff = Diff::remove_key(obj.clone(), obj_type, Key::from(key));
        self.record(
            Op::Delete {
                obj: obj.clone(),
                key: Key::from(key),
            },
            Some(diff),
        )
    }

    // ── Sequences (lists and texts) ───────────────────────────────────────

    /// Insert a scalar at `index`, returning the new element's id.
    pub fn insert_at(
        &mut self,
        obj: &ObjectId,
        index: usize,
        value: impl Into<ScalarValue>,
    ) -> Result<ElemId, FrontendError> {
        let value = value.into();
        let rendered = value.to_json();
        self.insert_value_at(obj, index, value, rendered)
    }

    /// Insert a link to `child` at `index`.
    pub fn insert_link_at(
        &mut self,
        obj: &ObjectId,
        index: usize,
        child: &ObjectId,
    ) -> Result<ElemId, FrontendError> {
        if !self.cache.contains(child) {
            return Err(FrontendError::InvalidMutation(format!(
                "unknown object {child}"
            )));
        }
        let obj_type = self.sequence_type(obj)?;
        let (pred, elem_id) = self.allocate_position(obj, index)?;
        let diff = Diff::insert_elem(
            obj.clone(),
            obj_type,
            index,
            elem_id.clone(),
            serde_json::Value::String(child.as_str().to_string()),
            None,
            true,
        );
        self.record(
            Op::Insert {
                obj: obj.clone(),
                key: Key::from(&pred),
                elem: elem_id.counter(),
            },
            None,
        )?;
        self.record(
            Op::Link {
                obj: obj.clone(),
                key: Key::from(&elem_id),
                value: child.clone(),
            },
            Some(diff),
        )?;
        Ok(elem_id)
    }

    fn insert_value_at(
        &mut self,
        obj: &ObjectId,
        index: usize,
        value: ScalarValue,
        rendered: serde_json::Value,
    ) -> Result<ElemId, FrontendError> {
        let obj_type = self.sequence_type(obj)?;
        let (pred, elem_id) = self.allocate_position(obj, index)?;
        let diff = Diff::insert_elem(
            obj.clone(),
            obj_type,
            index,
            elem_id.clone(),
            rendered,
            None,
            false,
        );
        self.record(
            Op::Insert {
                obj: obj.clone(),
                key: Key::from(&pred),
                elem: elem_id.counter(),
            },
            None,
        )?;
        self.record(
            Op::Set {
                obj: obj.clone(),
                key: Key::from(&elem_id),
                value,
                datatype: None,
            },
            Some(diff),
        )?;
        Ok(elem_id)
    }

    /// The insertion parent for a new element at `index`, and the
    /// element id it will get.
    fn allocate_position(
        &self,
        obj: &ObjectId,
        index: usize,
    ) -> Result<(ElemId, ElemId), FrontendError> {
        let Some(DocObject::List(list)) = self.cache.get(obj).map(|o| &**o) else {
            return Err(FrontendError::InvalidMutation(format!(
                "unknown sequence {obj}"
            )));
        };
        if index > list.elem_ids.len() {
            return Err(FrontendError::InvalidMutation(format!(
                "index {index} out of bounds for {obj}"
            )));
        }
        let pred = if index == 0 {
            ElemId::Head
        } else {
            list.elem_ids[index - 1].clone()
        };
        let elem_id = ElemId::new(self.actor.clone(), list.max_elem + 1);
        Ok((pred, elem_id))
    }

    pub fn set_at(
        &mut self,
        obj: &ObjectId,
        index: usize,
        value: impl Into<ScalarValue>,
    ) -> Result<(), FrontendError> {
        let obj_type = self.sequence_type(obj)?;
        let elem = self.elem_at(obj, index)?;
        let value = value.into();
        let diff = Diff::set_elem(
            obj.clone(),
            obj_type,
            index,
            elem.clone(),
            value.to_json(),
            None,
            false,
        );
        self.record(
            Op::Set {
                obj: obj.clone(),
                key: Key::from(&elem),
                value,
                datatype: None,
            },
            Some(diff),
        )
    }

    pub fn delete_at(&mut self, obj: &ObjectId, index: usize) -> Result<(), FrontendError> {
        let obj_type = self.sequence_type(obj)?;
        let elem = self.elem_at(obj, index)?;
        let diff = Diff::remove_elem(obj.clone(), obj_type, index, elem.clone());
        self.record(
            Op::Delete {
                obj: obj.clone(),
                key: Key::from(&elem),
            },
            Some(diff),
        )
    }

    /// Insert the characters of `text` starting at `index` of a text
    /// object, one element per char.
    pub fn splice_text(
        &mut self,
        obj: &ObjectId,
        index: usize,
        text: &str,
    ) -> Result<(), FrontendError> {
        for (offset, ch) in text.chars().enumerate() {
            self.insert_at(obj, index + offset, ch.to_string().as_str())?;
        }
        Ok(())
    }

    // ── Nested JSON convenience ───────────────────────────────────────────

    /// Write an arbitrary JSON value under `(obj, key)`, creating
    /// nested maps and lists as needed.
    pub fn put_json(
        &mut self,
        obj: &ObjectId,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), FrontendError> {
        match value {
            serde_json::Value::Object(entries) => {
                let child = self.make_map()?;
                for (k, v) in entries {
                    self.put_json(&child, k, v)?;
                }
                self.link(obj, key, &child)
            }
            serde_json::Value::Array(items) => {
                let child = self.make_list()?;
                for (i, v) in items.iter().enumerate() {
                    self.insert_json(&child, i, v)?;
                }
                self.link(obj, key, &child)
            }
            scalar => self.set_with(obj, key, json_scalar(scalar), None),
        }
    }

    /// Insert an arbitrary JSON value at `index` of a list.
    pub fn insert_json(
        &mut self,
        obj: &ObjectId,
        index: usize,
        value: &serde_json::Value,
    ) -> Result<(), FrontendError> {
        match value {
            serde_json::Value::Object(entries) => {
                let child = self.make_map()?;
                for (k, v) in entries {
                    self.put_json(&child, k, v)?;
                }
                self.insert_link_at(obj, index, &child)?;
                Ok(())
            }
            serde_json::Value::Array(items) => {
                let child = self.make_list()?;
                for (i, v) in items.iter().enumerate() {
                    self.insert_json(&child, i, v)?;
                }
                self.insert_link_at(obj, index, &child)?;
                Ok(())
            }
            scalar => {
                self.insert_at(obj, index, json_scalar(scalar))?;
                Ok(())
            }
        }
    }
}

fn json_scalar(value: &serde_json::Value) -> ScalarValue {
    match value {
        serde_json::Value::Null => ScalarValue::Null,
        serde_json::Value::Bool(b) => ScalarValue::Bool(*b),
        serde_json::Value::Number(n) => ScalarValue::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => ScalarValue::Str(s.clone()),
        _ => ScalarValue::Null,
    }
}

/// Keep only the latest `set`/`del`/`link` per `(obj, key)`;
/// insertions and creations always survive, in order.
pub(crate) fn dedup_assignments(ops: Vec<Op>) -> Vec<Op> {
    let mut last: HashMap<(ObjectId, Key), usize> = HashMap::new();
    for (i, op) in ops.iter().enumerate() {
        if op.is_assignment() {
            if let Some(key) = op.key() {
                last.insert((op.obj().clone(), key.clone()), i);
            }
        }
    }
    ops.into_iter()
        .enumerate()
        .filter(|(i, op)| {
            if !op.is_assignment() {
                return true;
            }
            match op.key() {
                Some(key) => last.get(&(op.obj().clone(), key.clone())) == Some(i),
                None => true,
            }
        })
        .map(|(_, op)| op)
        .collect()
}
