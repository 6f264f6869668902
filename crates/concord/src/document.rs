//! The document: optimistic local edits reconciled against
//! authoritative backend patches.
//!
//! A document holds two cache snapshots: `base`, which only ever
//! advances by applying backend patches, and `view`, which is `base`
//! plus the optimistic diffs of every pending local request. With an
//! immediate backend wired in, requests round-trip synchronously and
//! the two never diverge; without one, requests queue until their
//! patches come back from wherever the backend runs.

use std::collections::VecDeque;

use concord_core::{
    ActorId, Backend, BackendError, Change, ChangeRequest, Clock, Diff, DiffAction, ObjectId,
    Patch, PathElem, RequestType,
};

use crate::cache::Cache;
use crate::error::FrontendError;
use crate::session::{dedup_assignments, Session};
use crate::value::DocObject;

#[derive(Debug, Clone)]
struct PendingRequest {
    request: ChangeRequest,
    /// The optimistic diffs recorded by the session, re-applied over
    /// every new base until the matching patch arrives.
    diffs: Vec<Diff>,
}

#[derive(Debug, Clone)]
pub struct Document {
    actor: ActorId,
    /// Seq of the latest request issued by this actor.
    seq: u64,
    /// Dependency clock for the next request, from the last patch.
    deps: Clock,
    can_undo: bool,
    can_redo: bool,
    base: Cache,
    view: Cache,
    requests: VecDeque<PendingRequest>,
    backend: Option<Backend>,
}

impl Document {
    /// A document whose change requests queue until patches are fed
    /// back through [`Document::apply_patch`].
    pub fn new(actor: impl Into<ActorId>) -> Document {
        Document {
            actor: actor.into(),
            seq: 0,
            deps: Clock::empty(),
            can_undo: false,
            can_redo: false,
            base: Cache::new(),
            view: Cache::new(),
            requests: VecDeque::new(),
            backend: None,
        }
    }

    /// A document with an in-process backend: every request applies
    /// authoritatively before `change` returns.
    pub fn with_backend(actor: impl Into<ActorId>) -> Document {
        let mut doc = Document::new(actor);
        doc.backend = Some(Backend::init());
        doc
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn can_undo(&self) -> bool {
        self.can_undo
    }

    pub fn can_redo(&self) -> bool {
        self.can_redo
    }

    pub fn backend(&self) -> Option<&Backend> {
        self.backend.as_ref()
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &ChangeRequest> {
        self.requests.iter().map(|pending| &pending.request)
    }

    /// The materialized JSON view of the whole document, pending
    /// edits included.
    pub fn value(&self) -> serde_json::Value {
        self.view.materialize(&ObjectId::Root)
    }

    /// The cached object with the given id, if present in the view.
    pub fn object(&self, id: &ObjectId) -> Option<&DocObject> {
        self.view.get(id).map(|rc| &**rc)
    }

    /// One root path to `obj`, resolved by the wired backend.
    pub fn get_path(&self, obj: &ObjectId) -> Option<Vec<PathElem>> {
        self.backend.as_ref()?.get_path(obj)
    }

    // ── Local changes ─────────────────────────────────────────────────────

    /// Run `mutate` against an editable view. Returns the updated
    /// document and the emitted change request, or `None` when the
    /// session recorded nothing.
    pub fn change<F>(
        &self,
        message: Option<&str>,
        mutate: F,
    ) -> Result<(Document, Option<ChangeRequest>), FrontendError>
    where
        F: FnOnce(&mut Session) -> Result<(), FrontendError>,
    {
        let mut session = Session::new(self.actor.clone(), self.view.clone());
        mutate(&mut session)?;
        let (ops, diffs, working) = session.finish();
        if ops.is_empty() {
            return Ok((self.clone(), None));
        }

        let request = ChangeRequest {
            request_type: RequestType::Change,
            actor: self.actor.clone(),
            seq: self.seq + 1,
            deps: self.deps.without(&self.actor),
            message: message.map(String::from),
            ops: dedup_assignments(ops),
            undoable: true,
        };

        let mut next = self.clone();
        next.seq += 1;
        match &self.backend {
            Some(backend) => {
                let (backend, patch) = backend.apply_local_change(request.clone())?;
                next.backend = Some(backend);
                next.apply_patch_to_base(&patch)?;
                next.rebuild_view()?;
            }
            None => {
                next.view = working;
                next.can_undo = true;
                next.can_redo = false;
                next.requests.push_back(PendingRequest {
                    request: request.clone(),
                    diffs,
                });
            }
        }
        Ok((next, Some(request)))
    }

    pub fn undo(
        &self,
        message: Option<&str>,
    ) -> Result<(Document, Option<ChangeRequest>), FrontendError> {
        if !self.can_undo {
            return Err(FrontendError::Backend(BackendError::EmptyUndo));
        }
        self.history_request(RequestType::Undo, message)
    }

    pub fn redo(
        &self,
        message: Option<&str>,
    ) -> Result<(Document, Option<ChangeRequest>), FrontendError> {
        if !self.can_redo {
            return Err(FrontendError::Backend(BackendError::EmptyRedo));
        }
        self.history_request(RequestType::Redo, message)
    }

    fn history_request(
        &self,
        request_type: RequestType,
        message: Option<&str>,
    ) -> Result<(Document, Option<ChangeRequest>), FrontendError> {
        let request = ChangeRequest {
            request_type,
            actor: self.actor.clone(),
            seq: self.seq + 1,
            deps: self.deps.without(&self.actor),
            message: message.map(String::from),
            ops: vec![],
            undoable: false,
        };
        let mut next = self.clone();
        next.seq += 1;
        match &self.backend {
            Some(backend) => {
                let (backend, patch) = backend.apply_local_change(request.clone())?;
                next.backend = Some(backend);
                next.apply_patch_to_base(&patch)?;
                next.rebuild_view()?;
            }
            None => {
                // No optimistic application: the ops live on the
                // backend's stacks, so the effect arrives with the
                // patch.
                match request_type {
                    RequestType::Undo => next.can_undo = false,
                    RequestType::Redo => next.can_redo = false,
                    RequestType::Change => {}
                }
                next.requests.push_back(PendingRequest {
                    request: request.clone(),
                    diffs: vec![],
                });
            }
        }
        Ok((next, Some(request)))
    }

    // ── Remote input ──────────────────────────────────────────────────────

    /// Feed remote changes to the wired backend and fold the
    /// resulting patch in.
    pub fn apply_changes(&self, changes: Vec<Change>) -> Result<Document, FrontendError> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| FrontendError::InvalidMutation("document has no backend".into()))?;
        let (backend, patch) = backend.apply_changes(changes)?;
        let mut next = self.clone();
        next.backend = Some(backend);
        next.apply_patch_to_base(&patch)?;
        next.rebuild_view()?;
        Ok(next)
    }

    /// Fold an authoritative patch into the document. If it matches
    /// the head pending request by `(actor, seq)`, that request is
    /// done; the remaining requests are transformed past the patch
    /// and replayed over the new base.
    pub fn apply_patch(&self, patch: &Patch) -> Result<Document, FrontendError> {
        let mut next = self.clone();
        let matched = match (&patch.actor, patch.seq) {
            (Some(actor), Some(seq)) if *actor == next.actor => match next.requests.front() {
                Some(head) if head.request.seq == seq => {
                    next.requests.pop_front();
                    true
                }
                _ => false,
            },
            _ => false,
        };
        next.apply_patch_to_base(patch)?;
        if matched {
            for pending in next.requests.iter_mut() {
                pending.diffs = transform_past(&pending.diffs, &patch.diffs);
            }
        }
        next.rebuild_view()?;
        Ok(next)
    }

    fn apply_patch_to_base(&mut self, patch: &Patch) -> Result<(), FrontendError> {
        self.base.apply_diffs(&patch.diffs)?;
        self.deps = patch.deps.clone();
        self.can_undo = patch.can_undo;
        self.can_redo = patch.can_redo;
        if patch.actor.as_ref() == Some(&self.actor) {
            if let Some(seq) = patch.seq {
                if seq > self.seq {
                    self.seq = seq;
                }
            }
        }
        Ok(())
    }

    fn rebuild_view(&mut self) -> Result<(), FrontendError> {
        self.view = self.base.clone();
        for pending in &self.requests {
            self.view.apply_diffs(&pending.diffs)?;
        }
        Ok(())
    }
}

/// Shift the list indices of pending optimistic diffs past the
/// incoming patch.
///
/// The transform is deliberately transient and approximate: it does
/// not reorder same-index concurrent inserts by element id, it can
/// misread a local set at an index a remote removal just vacated, and
/// it never synthesizes conflicts for concurrent assignments. The
/// authoritative outcome always comes from the backend replaying the
/// request itself.
fn transform_past(pending: &[Diff], incoming: &[Diff]) -> Vec<Diff> {
    pending
        .iter()
        .cloned()
        .map(|mut diff| {
            if let Some(start) = diff.index {
                let mut index = start;
                for inc in incoming {
                    if inc.obj != diff.obj {
                        continue;
                    }
                    match (inc.action, inc.index) {
                        (DiffAction::Insert, Some(i)) if i <= index => index += 1,
                        (DiffAction::Remove, Some(i)) if i < index => {
                            index = index.saturating_sub(1)
                        }
                        _ => {}
                    }
                }
                diff.index = Some(index);
            }
            diff
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{Key, ObjType};
    use serde_json::json;

    #[test]
    fn empty_session_returns_no_request() {
        let doc = Document::new("a");
        let (next, request) = doc.change(None, |_| Ok(())).unwrap();
        assert!(request.is_none());
        assert_eq!(next.value(), json!({}));
        assert_eq!(next.pending_requests().count(), 0);
    }

    #[test]
    fn wired_backend_applies_changes_synchronously() {
        let doc = Document::with_backend("a");
        let (doc, request) = doc
            .change(Some("init"), |s| {
                s.set(&ObjectId::Root, "x", 1.0)?;
                s.put_json(&ObjectId::Root, "todo", &json!(["milk"]))
            })
            .unwrap();
        let request = request.unwrap();
        assert_eq!(request.seq, 1);
        assert_eq!(doc.value(), json!({ "x": 1.0, "todo": ["milk"] }));
        assert_eq!(doc.pending_requests().count(), 0);
        assert!(doc.can_undo());
        // The backend saw exactly one change.
        let history = doc.backend().unwrap().get_all_changes();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message.as_deref(), Some("init"));
    }

    #[test]
    fn queued_document_applies_optimistically() {
        let doc = Document::new("a");
        let (doc, request) = doc
            .change(None, |s| s.set(&ObjectId::Root, "x", 1.0))
            .unwrap();
        assert!(request.is_some());
        assert_eq!(doc.value(), json!({ "x": 1.0 }));
        assert_eq!(doc.pending_requests().count(), 1);
    }

    #[test]
    fn matching_patch_settles_the_head_request() {
        let doc = Document::new("a");
        let (doc, request) = doc
            .change(None, |s| s.set(&ObjectId::Root, "x", 1.0))
            .unwrap();
        let request = request.unwrap();

        // Round-trip the request through a backend, as a server would.
        let backend = Backend::init();
        let (_, patch) = backend.apply_local_change(request).unwrap();

        let doc = doc.apply_patch(&patch).unwrap();
        assert_eq!(doc.pending_requests().count(), 0);
        assert_eq!(doc.value(), json!({ "x": 1.0 }));
    }

    #[test]
    fn unrelated_patch_replays_pending_requests_on_top() {
        let doc = Document::new("a");
        let (doc, _) = doc
            .change(None, |s| s.set(&ObjectId::Root, "x", 1.0))
            .unwrap();

        // A remote patch that does not match the pending request.
        let remote = Patch {
            clock: Clock::empty().with(&ActorId::from("b"), 1),
            deps: Clock::empty().with(&ActorId::from("b"), 1),
            can_undo: false,
            can_redo: false,
            actor: None,
            seq: None,
            diffs: vec![Diff::set_key(
                ObjectId::Root,
                ObjType::Map,
                Key::from("y"),
                json!(2.0),
                None,
                false,
            )],
        };
        let doc = doc.apply_patch(&remote).unwrap();
        // Both the remote value and the optimistic local value show.
        assert_eq!(doc.value(), json!({ "x": 1.0, "y": 2.0 }));
        assert_eq!(doc.pending_requests().count(), 1);
        assert_eq!(doc.deps, Clock::empty().with(&ActorId::from("b"), 1));
    }

    #[test]
    fn remote_insert_shifts_pending_list_indices() {
        let list = ObjectId::Id("list".into());
        // Authoritative base: a list with one element from actor b.
        let base_patch = Patch {
            clock: Clock::empty().with(&ActorId::from("b"), 1),
            deps: Clock::empty().with(&ActorId::from("b"), 1),
            can_undo: false,
            can_redo: false,
            actor: None,
            seq: None,
            diffs: vec![
                Diff::create(list.clone(), ObjType::List),
                Diff::insert_elem(
                    list.clone(),
                    ObjType::List,
                    0,
                    concord_core::ElemId::new(ActorId::from("b"), 1),
                    json!("first"),
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
            ],
        };
        let doc = Document::new("a").apply_patch(&base_patch).unwrap();

        // Pending local append at index 1.
        let (doc, request) = doc
            .change(None, |s| {
                s.insert_at(&list, 1, "mine")?;
                Ok(())
            })
            .unwrap();
        let request = request.unwrap();
        assert_eq!(doc.value(), json!({ "items": ["first", "mine"] }));

        // Our own request comes back with a remote insert at the
        // front folded into the same patch stream.
        let own_patch = Patch {
            clock: Clock::empty()
                .with(&ActorId::from("a"), 1)
                .with(&ActorId::from("b"), 2),
            deps: Clock::empty().with(&ActorId::from("a"), 1),
            can_undo: true,
            can_redo: false,
            actor: Some(ActorId::from("a")),
            seq: Some(request.seq),
            diffs: vec![Diff::insert_elem(
                list.clone(),
                ObjType::List,
                1,
                concord_core::ElemId::new(ActorId::from("a"), 2),
                json!("mine"),
                None,
                false,
            )],
        };
        let doc = doc.apply_patch(&own_patch).unwrap();
        assert_eq!(doc.value(), json!({ "items": ["first", "mine"] }));
        assert_eq!(doc.pending_requests().count(), 0);
    }

    #[test]
    fn undo_redo_round_trip_with_backend() {
        let doc = Document::with_backend("a");
        let (doc, _) = doc
            .change(None, |s| s.set(&ObjectId::Root, "x", 1.0))
            .unwrap();
        let (doc, _) = doc
            .change(None, |s| s.set(&ObjectId::Root, "x", 2.0))
            .unwrap();

        let (doc, _) = doc.undo(None).unwrap();
        assert_eq!(doc.value(), json!({ "x": 1.0 }));
        assert!(doc.can_redo());

        let (doc, _) = doc.redo(None).unwrap();
        assert_eq!(doc.value(), json!({ "x": 2.0 }));
        assert!(!doc.can_redo());
    }

    #[test]
    fn undo_without_history_fails() {
        let doc = Document::with_backend("a");
        assert_eq!(
            doc.undo(None).unwrap_err(),
            FrontendError::Backend(BackendError::EmptyUndo)
        );
    }

    #[test]
    fn transform_shifts_inserts_and_removes() {
        let list = ObjectId::Id("l".into());
        let pending = vec![Diff::set_elem(
            list.clone(),
            ObjType::List,
            2,
            concord_core::ElemId::new(ActorId::from("a"), 3),
            json!("v"),
            None,
            false,
        )];
        let incoming_insert = vec![Diff::insert_elem(
            list.clone(),
            ObjType::List,
            0,
            concord_core::ElemId::new(ActorId::from("b"), 9),
            json!("w"),
            None,
            false,
        )];
        assert_eq!(transform_past(&pending, &incoming_insert)[0].index, Some(3));

        let incoming_remove = vec![Diff::remove_elem(
            list,
            ObjType::List,
            0,
            concord_core::ElemId::new(ActorId::from("b"), 9),
        )];
        assert_eq!(transform_past(&pending, &incoming_remove)[0].index, Some(1));
    }
}
