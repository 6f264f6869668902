//! Conflict-free replicated JSON documents.
//!
//! A [`Document`] is a local replica of a JSON-shaped value (nested
//! maps, tables, lists, collaborative text). Edits happen inside
//! [`Document::change`] sessions, which emit change requests; the
//! backend engine (re-exported from `concord_core`) turns requests
//! and remote changes into patches, and the frontend cache applies
//! patches to the materialized tree. Replicas that exchange their
//! changes converge to the same value, in any delivery order.
//!
//! ```
//! use concord::Document;
//! use concord_core::ObjectId;
//!
//! let doc = Document::with_backend("alice");
//! let (doc, _request) = doc
//!     .change(Some("set title"), |s| {
//!         s.set(&ObjectId::Root, "title", "hello")
//!     })
//!     .unwrap();
//! assert_eq!(doc.value(), serde_json::json!({ "title": "hello" }));
//! ```

pub mod cache;
pub mod document;
pub mod error;
pub mod session;
pub mod value;

pub use cache::Cache;
pub use document::Document;
pub use error::FrontendError;
pub use session::Session;
pub use value::{ConflictValue, DocObject, DocValue, ListObject, MapObject};

pub use concord_core;

/// Structural equality of two documents' materialized values, after
/// canonicalization (map keys sorted, text flattened to strings).
pub fn equal(a: &Document, b: &Document) -> bool {
    a.value() == b.value()
}
