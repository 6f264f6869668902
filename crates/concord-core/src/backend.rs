//! The engine surface exposed to embedders.
//!
//! A [`Backend`] is an opaque snapshot of the whole document history.
//! Mutating entry points take `&self` and hand back a fresh value
//! together with the [`Patch`] describing the transition; on error
//! the caller's snapshot is untouched, so a partial apply can never
//! be observed.

use crate::change::{ActorId, Change, ChangeRequest, ObjectId};
use crate::clock::Clock;
use crate::error::BackendError;
use crate::object_store::ObjType;
use crate::op_set::OpSet;
use crate::patch::{Patch, PathElem};

#[derive(Debug, Clone, Default)]
pub struct Backend {
    op_set: OpSet,
}

impl Backend {
    /// A fresh document: empty root map, empty history.
    pub fn init() -> Backend {
        Backend {
            op_set: OpSet::new(),
        }
    }

    pub fn clock(&self) -> &Clock {
        self.op_set.clock()
    }

    pub fn can_undo(&self) -> bool {
        self.op_set.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.op_set.can_redo()
    }

    /// Apply remote (or replayed) changes, in any order. Changes
    /// whose dependencies are missing stay queued and produce no
    /// diffs until the gap closes.
    pub fn apply_changes(&self, changes: Vec<Change>) -> Result<(Backend, Patch), BackendError> {
        let mut next = self.clone();
        for change in changes {
            next.op_set.enqueue(change)?;
        }
        let (_, diffs) = next.op_set.drain()?;
        let patch = next.make_patch(diffs, None, None);
        Ok((next, patch))
    }

    /// Apply one local request (change, undo, or redo). The returned
    /// patch echoes the request's `actor`/`seq` so the frontend can
    /// match it against its pending queue.
    pub fn apply_local_change(
        &self,
        request: ChangeRequest,
    ) -> Result<(Backend, Patch), BackendError> {
        let actor = request.actor.clone();
        let seq = request.seq;
        let mut next = self.clone();
        let diffs = next.op_set.apply_local_change(request)?;
        let patch = next.make_patch(diffs, Some(actor), Some(seq));
        Ok((next, patch))
    }

    /// A full-materialization patch: replaying its diffs over an
    /// empty document reconstructs the current state.
    pub fn get_patch(&self) -> Patch {
        let diffs = self.op_set.materialize();
        self.make_patch(diffs, None, None)
    }

    /// The changes present in `new` but not in `old`. `old` must be
    /// an ancestor snapshot of `new`.
    pub fn get_changes(old: &Backend, new: &Backend) -> Result<Vec<Change>, BackendError> {
        if !old.clock().le(new.clock()) {
            return Err(BackendError::DivergedClocks);
        }
        Ok(new.get_missing_changes(old.clock()))
    }

    /// Every stored change with seq beyond `have_clock`, ordered by
    /// actor then seq.
    pub fn get_missing_changes(&self, have_clock: &Clock) -> Vec<Change> {
        self.op_set.states().changes_after(have_clock)
    }

    pub fn get_changes_for_actor(&self, actor: &ActorId, after_seq: u64) -> Vec<Change> {
        self.op_set.states().changes_for_actor(actor, after_seq)
    }

    /// The whole applied history, ordered by actor then seq.
    pub fn get_all_changes(&self) -> Vec<Change> {
        self.get_missing_changes(&Clock::empty())
    }

    /// What the pending queue is still waiting for: the maximum
    /// unseen `(actor, seq)` per actor.
    pub fn get_missing_deps(&self) -> Clock {
        self.op_set.get_missing_deps()
    }

    /// Pull every change `remote` has that `self` lacks.
    pub fn merge(&self, remote: &Backend) -> Result<(Backend, Patch), BackendError> {
        let changes = remote.get_missing_changes(self.clock());
        self.apply_changes(changes)
    }

    /// The creation type of `obj`, if the object exists.
    pub fn get_object_type(&self, obj: &ObjectId) -> Option<ObjType> {
        self.op_set.store().object_type(obj)
    }

    /// One arbitrary root path to `obj`, or `None` if unreachable.
    pub fn get_path(&self, obj: &ObjectId) -> Option<Vec<PathElem>> {
        self.op_set.get_path(obj)
    }

    fn make_patch(&self, diffs: Vec<crate::patch::Diff>, actor: Option<ActorId>, seq: Option<u64>) -> Patch {
        Patch {
            clock: self.op_set.clock().clone(),
            deps: self.op_set.heads().clone(),
            can_undo: self.op_set.can_undo(),
            can_redo: self.op_set.can_redo(),
            actor,
            seq,
            diffs,
        }
    }
}
