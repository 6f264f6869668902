//! The frontend cache: an immutable materialized object tree.
//!
//! Objects live in a flat map keyed by object id and are shared
//! between document snapshots through `Rc`; applying a patch only
//! rebuilds the objects it touches (`Rc::make_mut` copies on first
//! write), so unchanged objects keep their identity across
//! snapshots. A parallel inbound index maps every child to its one
//! live parent and rejects patches that would give it a second.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use concord_core::{Diff, DiffAction, ElemId, ObjType, ObjectId};

use crate::error::FrontendError;
use crate::value::{conflict_values, DocObject, DocValue};

#[derive(Debug, Clone)]
pub struct Cache {
    objects: HashMap<ObjectId, Rc<DocObject>>,
    /// child object id → parent object id.
    inbound: HashMap<ObjectId, ObjectId>,
}

impl Cache {
    pub fn new() -> Cache {
        let mut objects = HashMap::new();
        objects.insert(
            ObjectId::Root,
            Rc::new(DocObject::empty(ObjectId::Root, ObjType::Map)),
        );
        Cache {
            objects,
            inbound: HashMap::new(),
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<&Rc<DocObject>> {
        self.objects.get(id)
    }

    pub fn parent_of(&self, id: &ObjectId) -> Option<&ObjectId> {
        self.inbound.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    // ── Diff application ──────────────────────────────────────────────────

    pub fn apply_diffs(&mut self, diffs: &[Diff]) -> Result<(), FrontendError> {
        for diff in diffs {
            self.apply_diff(diff)?;
        }
        Ok(())
    }

    fn apply_diff(&mut self, diff: &Diff) -> Result<(), FrontendError> {
        match diff.action {
            DiffAction::Create => {
                self.objects.insert(
                    diff.obj.clone(),
                    Rc::new(DocObject::empty(diff.obj.clone(), diff.obj_type)),
                );
                Ok(())
            }
            DiffAction::Set | DiffAction::Insert => self.apply_assignment(diff),
            DiffAction::Remove => self.apply_removal(diff),
        }
    }

    fn apply_assignment(&mut self, diff: &Diff) -> Result<(), FrontendError> {
        let value = DocValue::from_diff_parts(
            diff.value.clone().unwrap_or(serde_json::Value::Null),
            diff.datatype.clone(),
            diff.link,
        );
        let conflicts = conflict_values(&diff.conflicts);

        // Inbound bookkeeping happens against the pre-update object.
        let displaced = self.displaced_child(diff);
        if let Some(old_child) = displaced {
            if self.inbound.get(&old_child) == Some(&diff.obj) {
                self.inbound.remove(&old_child);
            }
        }
        if let DocValue::Ref(child) = &value {
            match self.inbound.get(child) {
                Some(existing) if existing != &diff.obj => {
                    return Err(FrontendError::MultipleParents {
                        child: child.clone(),
                        existing: existing.clone(),
                    });
                }
                _ => {
                    self.inbound.insert(child.clone(), diff.obj.clone());
                }
            }
        }

        let object = self
            .objects
            .get_mut(&diff.obj)
            .ok_or_else(|| FrontendError::UnknownObject(diff.obj.clone()))?;
        match Rc::make_mut(object) {
            DocObject::Map(map) => {
                let key = match &diff.key {
                    Some(key) => key.as_str().to_string(),
                    None => return Ok(()),
                };
                map.entries.insert(key.clone(), value);
                if conflicts.is_empty() {
                    map.conflicts.remove(&key);
                } else {
                    map.conflicts.insert(key, conflicts);
                }
            }
            DocObject::List(list) => {
                let Some(index) = diff.index else {
                    return Ok(());
                };
                if diff.action == DiffAction::Insert {
                    let index = index.min(list.items.len());
                    let elem = diff
                        .elem_id
                        .clone()
                        .unwrap_or(ElemId::Head);
                    list.max_elem = list.max_elem.max(elem.counter());
                    list.elem_ids.insert(index, elem);
                    list.items.insert(index, value);
                    list.conflicts.insert(index, conflicts);
                } else if index < list.items.len() {
                    list.items[index] = value;
                    list.conflicts[index] = conflicts;
                }
            }
        }
        Ok(())
    }

    fn apply_removal(&mut self, diff: &Diff) -> Result<(), FrontendError> {
        let displaced = self.displaced_child(diff);
        if let Some(old_child) = displaced {
            if self.inbound.get(&old_child) == Some(&diff.obj) {
                self.inbound.remove(&old_child);
            }
        }
        let object = self
            .objects
            .get_mut(&diff.obj)
            .ok_or_else(|| FrontendError::UnknownObject(diff.obj.clone()))?;
        match Rc::make_mut(object) {
            DocObject::Map(map) => {
                if let Some(key) = &diff.key {
                    map.entries.shift_remove(key.as_str());
                    map.conflicts.remove(key.as_str());
                }
            }
            DocObject::List(list) => {
                if let Some(index) = diff.index {
                    if index < list.items.len() {
                        list.elem_ids.remove(index);
                        list.items.remove(index);
                        list.conflicts.remove(index);
                    }
                }
            }
        }
        Ok(())
    }

    /// The child object id a set/remove diff is about to displace
    /// from `(obj, key/index)`, if the current value there is a
    /// reference.
    fn displaced_child(&self, diff: &Diff) -> Option<ObjectId> {
        let object = self.objects.get(&diff.obj)?;
        let old = match (&**object, &diff.key, diff.index) {
            (DocObject::Map(map), Some(key), _) => map.entries.get(key.as_str()),
            (DocObject::List(list), _, Some(index)) if diff.action != DiffAction::Insert => {
                list.items.get(index)
            }
            _ => None,
        }?;
        old.as_ref_id().cloned()
    }

    // ── Materialization ───────────────────────────────────────────────────

    /// The JSON view rooted at `id`. Maps and tables canonicalize to
    /// JSON objects (key-sorted), lists to arrays, texts to strings.
    pub fn materialize(&self, id: &ObjectId) -> serde_json::Value {
        let mut on_path = HashSet::new();
        self.materialize_inner(id, &mut on_path)
    }

    fn materialize_inner(
        &self,
        id: &ObjectId,
        on_path: &mut HashSet<ObjectId>,
    ) -> serde_json::Value {
        let Some(object) = self.objects.get(id) else {
            return serde_json::Value::Null;
        };
        if !on_path.insert(id.clone()) {
            return serde_json::Value::Null;
        }
        let result = match &**object {
            DocObject::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in &map.entries {
                    out.insert(key.clone(), self.resolve(value, on_path));
                }
                serde_json::Value::Object(out)
            }
            DocObject::List(list) if list.obj_type == ObjType::Text => {
                let text: String = list
                    .items
                    .iter()
                    .filter_map(|item| match item {
                        DocValue::Scalar {
                            value: serde_json::Value::String(s),
                            ..
                        } => Some(s.as_str()),
                        _ => None,
                    })
                    .collect();
                serde_json::Value::String(text)
            }
            DocObject::List(list) => serde_json::Value::Array(
                list.items
                    .iter()
                    .map(|item| self.resolve(item, on_path))
                    .collect(),
            ),
        };
        on_path.remove(id);
        result
    }

    fn resolve(&self, value: &DocValue, on_path: &mut HashSet<ObjectId>) -> serde_json::Value {
        match value {
            DocValue::Scalar { value, .. } => value.clone(),
            DocValue::Ref(id) => self.materialize_inner(id, on_path),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ActorId, Key};
    use serde_json::json;

    fn set_root(key: &str, value: serde_json::Value) -> Diff {
        Diff::set_key(ObjectId::Root, ObjType::Map, Key::from(key), value, None, false)
    }

    #[test]
    fn fresh_cache_materializes_to_an_empty_object() {
        let cache = Cache::new();
        assert_eq!(cache.materialize(&ObjectId::Root), json!({}));
    }

    #[test]
    fn set_and_remove_root_keys() {
        let mut cache = Cache::new();
        cache.apply_diffs(&[set_root("x", json!(1.0))]).unwrap();
        assert_eq!(cache.materialize(&ObjectId::Root), json!({ "x": 1.0 }));

        cache
            .apply_diffs(&[Diff::remove_key(ObjectId::Root, ObjType::Map, Key::from("x"))])
            .unwrap();
        assert_eq!(cache.materialize(&ObjectId::Root), json!({}));
    }

    #[test]
    fn nested_objects_resolve_through_links() {
        let list = ObjectId::Id("list".into());
        let elem = ElemId::new(ActorId::from("a"), 1);
        let mut cache = Cache::new();
        cache
            .apply_diffs(&[
                Diff::create(list.clone(), ObjType::List),
                Diff::insert_elem(
                    list.clone(),
                    ObjType::List,
                    0,
                    elem,
                    json!("hello"),
                    None,
                    false,
                ),
                Diff::set_key(
                    ObjectId::Root,
                    ObjType::Map,
                    Key::from("items"),
                    json!(list.as_str()),
                    None,
                    true,
                ),
            ])
            .unwrap();
        assert_eq!(
            cache.materialize(&ObjectId::Root),
            json!({ "items": ["hello"] })
        );
        assert_eq!(cache.parent_of(&list), Some(&ObjectId::Root));
    }

    #[test]
    fn text_objects_materialize_to_strings() {
        let text = ObjectId::Id("text".into());
        let mut cache = Cache::new();
        let mut diffs = vec![Diff::create(text.clone(), ObjType::Text)];
        for (i, ch) in ["h", "i"].iter().enumerate() {
            diffs.push(Diff::insert_elem(
                text.clone(),
                ObjType::Text,
                i,
                ElemId::new(ActorId::from("a"), i as u64 + 1),
                json!(ch),
                None,
                false,
            ));
        }
        diffs.push(Diff::set_key(
            ObjectId::Root,
            ObjType::Map,
            Key::from("note"),
            json!(text.as_str()),
            None,
            true,
        ));
        cache.apply_diffs(&diffs).unwrap();
        assert_eq!(
            cache.materialize(&ObjectId::Root),
            json!({ "note": "hi" })
        );
    }

    #[test]
    fn second_parent_for_a_child_is_rejected() {
        let child = ObjectId::Id("child".into());
        let mut cache = Cache::new();
        cache
            .apply_diffs(&[
                Diff::create(child.clone(), ObjType::Map),
                Diff::set_key(
                    ObjectId::Root,
                    ObjType::Map,
                    Key::from("a"),
                    json!(child.as_str()),
                    None,
                    true,
                ),
            ])
            .unwrap();

        let list = ObjectId::Id("list".into());
        cache
            .apply_diffs(&[Diff::create(list.clone(), ObjType::List)])
            .unwrap();
        let err = cache
            .apply_diffs(&[Diff::insert_elem(
                list,
                ObjType::List,
                0,
                ElemId::new(ActorId::from("a"), 1),
                json!(child.as_str()),
                None,
                true,
            )])
            .unwrap_err();
        assert_eq!(
            err,
            FrontendError::MultipleParents {
                child,
                existing: ObjectId::Root
            }
        );
    }

    #[test]
    fn replacing_a_link_releases_the_old_child() {
        let child = ObjectId::Id("child".into());
        let mut cache = Cache::new();
        cache
            .apply_diffs(&[
                Diff::create(child.clone(), ObjType::Map),
                Diff::set_key(
                    ObjectId::Root,
                    ObjType::Map,
                    Key::from("a"),
                    json!(child.as_str()),
                    None,
                    true,
                ),
                // Overwrite the link with a scalar.
                set_root("a", json!(7.0)),
            ])
            .unwrap();
        assert_eq!(cache.parent_of(&child), None);
        // The child can be linked elsewhere now.
        cache
            .apply_diffs(&[Diff::set_key(
                ObjectId::Root,
                ObjType::Map,
                Key::from("b"),
                json!(child.as_str()),
                None,
                true,
            )])
            .unwrap();
        assert_eq!(cache.parent_of(&child), Some(&ObjectId::Root));
    }

    #[test]
    fn unchanged_objects_share_identity_across_snapshots() {
        let list = ObjectId::Id("list".into());
        let mut cache = Cache::new();
        cache
            .apply_diffs(&[
                Diff::create(list.clone(), ObjType::List),
                Diff::set_key(
                    ObjectId::Root,
                    ObjType::Map,
                    Key::from("items"),
                    json!(list.as_str()),
                    None,
                    true,
                ),
            ])
            .unwrap();

        let snapshot = cache.clone();
        cache.apply_diffs(&[set_root("x", json!(1.0))]).unwrap();

        // The untouched list is the same allocation in both.
        assert!(Rc::ptr_eq(
            snapshot.get(&list).unwrap(),
            cache.get(&list).unwrap()
        ));
        // The root was rebuilt, and the snapshot kept the old one.
        assert!(!Rc::ptr_eq(
            snapshot.get(&ObjectId::Root).unwrap(),
            cache.get(&ObjectId::Root).unwrap()
        ));
        assert_eq!(snapshot.materialize(&ObjectId::Root), json!({ "items": [] }));
    }

    #[test]
    fn conflicts_are_kept_per_key() {
        let mut cache = Cache::new();
        let diff = set_root("x", json!(2.0)).with_conflicts(vec![concord_core::Conflict {
            actor: ActorId::from("a"),
            value: Some(json!(1.0)),
            datatype: None,
            link: false,
        }]);
        cache.apply_diffs(&[diff]).unwrap();
        let root = cache.get(&ObjectId::Root).unwrap().as_map().unwrap();
        assert_eq!(root.conflicts["x"].len(), 1);

        // A later clean write clears them.
        cache.apply_diffs(&[set_root("x", json!(3.0))]).unwrap();
        let root = cache.get(&ObjectId::Root).unwrap().as_map().unwrap();
        assert!(root.conflicts.get("x").is_none());
    }
}
