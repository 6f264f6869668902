//! Error types for the backend engine.
//!
//! Every failure the engine can report is synchronous and leaves the
//! caller's state untouched: mutating entry points build a fresh state
//! value and only hand it back on success.

use thiserror::Error;

use crate::change::{ActorId, ObjectId};
use crate::skiplist::SkipListError;

#[derive(Debug, Error, PartialEq)]
pub enum BackendError {
    /// A change or request whose `actor`/`seq`/op shape is ill-typed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A `make*` operation for an object id that already exists.
    #[error("duplicate creation of object {0}")]
    DuplicateCreate(ObjectId),

    /// An operation targets an object id the store has never seen.
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    /// An `ins` operation reusing an element id.
    #[error("duplicate insertion of element {0}")]
    DuplicateElem(String),

    /// An `ins` operation whose parent element id is unknown.
    #[error("insertion after unknown element {0}")]
    UnknownPred(String),

    /// The same `(actor, seq)` delivered twice with different content.
    #[error("inconsistent reuse of change {actor}:{seq}")]
    InconsistentReuse { actor: ActorId, seq: u64 },

    /// `get_changes(old, new)` where `old` is not an ancestor of `new`.
    #[error("diverged clocks: old state is not an ancestor of new state")]
    DivergedClocks,

    /// `undo` with an empty undo stack.
    #[error("nothing to undo")]
    EmptyUndo,

    /// `redo` with an empty redo stack.
    #[error("nothing to redo")]
    EmptyRedo,

    /// An op carries a datatype tag this version does not define.
    #[error("unknown datatype {0:?}")]
    UnknownDatatype(String),

    /// An op carries an action tag this version does not define.
    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

impl From<SkipListError> for BackendError {
    fn from(err: SkipListError) -> BackendError {
        match err {
            SkipListError::DuplicateKey(key) => BackendError::DuplicateElem(key),
            SkipListError::UnknownKey(key) => BackendError::UnknownPred(key),
            SkipListError::IndexOutOfBounds(index) => {
                BackendError::InvalidRequest(format!("list index {index} out of bounds"))
            }
        }
    }
}
