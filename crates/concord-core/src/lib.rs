//! Backend engine for operation-based replicated JSON documents.
//!
//! Replicas exchange [`Change`]s: causally-stamped batches of
//! primitive ops over nested maps, tables, lists, and text. The
//! engine queues changes until their dependencies arrive, resolves
//! concurrent writes with actor-ordered multi-value registers, orders
//! list insertions through a Lamport-timestamped tree indexed by a
//! position skip list, and reports every state transition as a
//! [`Patch`] of diffs for a frontend to apply.
//!
//! Two replicas that have received the same set of changes converge
//! to structurally equal documents, regardless of delivery order.
//!
//! The engine is a pure state transformer: [`Backend`] entry points
//! take `&self` and return a fresh snapshot, so callers can hold and
//! compare any number of historic states.

pub mod actor_states;
pub mod backend;
pub mod change;
pub mod clock;
pub mod error;
pub mod object_store;
pub mod op_set;
pub mod patch;
pub mod skiplist;
pub mod undo;

pub use backend::Backend;
pub use change::{
    ActorId, Change, ChangeRequest, DataType, ElemId, Key, ObjectId, Op, RequestType,
    ScalarValue, HEAD_STR, ROOT_ID,
};
pub use clock::Clock;
pub use error::BackendError;
pub use object_store::ObjType;
pub use patch::{Conflict, Diff, DiffAction, Patch, PathElem};
pub use skiplist::{SkipList, SkipListError};
