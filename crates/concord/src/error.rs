//! Frontend error types.

use thiserror::Error;

use concord_core::{BackendError, ObjectId};

#[derive(Debug, Error, PartialEq)]
pub enum FrontendError {
    /// A patch tried to give a child object a second live parent; the
    /// inbound reference relation must stay a tree.
    #[error("object {child} already has parent {existing}")]
    MultipleParents {
        child: ObjectId,
        existing: ObjectId,
    },

    /// A diff referenced an object the cache has never seen.
    #[error("patch references unknown object {0}")]
    UnknownObject(ObjectId),

    /// A diff addressed a list position that does not exist.
    #[error("patch index {index} out of bounds for object {obj}")]
    BadIndex { obj: ObjectId, index: usize },

    /// A mutation addressed an object or position that is not in the
    /// current document view.
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
