//! Wire types: actors, object/element identifiers, operations, changes.
//!
//! A [`Change`] is the unit of replication: a causally-stamped batch of
//! [`Op`]s produced by one mutation session on one actor. Changes
//! serialize to the JSON shapes exchanged between replicas; the engine
//! itself only ever sees the typed forms.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::BackendError;

// ── ActorId ───────────────────────────────────────────────────────────────

/// A replica identifier. Any non-empty string; lexicographic order on
/// actor ids is the deterministic tie-break for concurrent writes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> ActorId {
        ActorId(s.to_string())
    }
}

impl From<String> for ActorId {
    fn from(s: String) -> ActorId {
        ActorId(s)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── ObjectId ──────────────────────────────────────────────────────────────

/// The document root's well-known object id.
pub const ROOT_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Identifier of a composite object (map, table, list, or text).
///
/// The all-zeros UUID string denotes the root map; every other id is an
/// arbitrary string unique within the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Root,
    Id(String),
}

impl ObjectId {
    pub fn parse(s: &str) -> ObjectId {
        if s == ROOT_ID {
            ObjectId::Root
        } else {
            ObjectId::Id(s.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ObjectId::Root => ROOT_ID,
            ObjectId::Id(id) => id,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<ObjectId, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ObjectId::parse(&s))
    }
}

// ── ElemId ────────────────────────────────────────────────────────────────

/// The virtual predecessor of the first list element.
pub const HEAD_STR: &str = "_head";

/// Identifier of a list position: `"actor:counter"`, where `counter`
/// is assigned by the inserting actor. `_head` is the virtual
/// predecessor of the first element and never identifies a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElemId {
    Head,
    Id { actor: ActorId, counter: u64 },
}

impl ElemId {
    pub fn new(actor: ActorId, counter: u64) -> ElemId {
        ElemId::Id { actor, counter }
    }

    pub fn parse(s: &str) -> Result<ElemId, BackendError> {
        if s == HEAD_STR {
            return Ok(ElemId::Head);
        }
        // Actor ids may themselves contain ':'; the counter is
        // everything after the last one.
        let (actor, counter) = s
            .rsplit_once(':')
            .ok_or_else(|| BackendError::InvalidRequest(format!("malformed element id {s:?}")))?;
        let counter: u64 = counter
            .parse()
            .map_err(|_| BackendError::InvalidRequest(format!("malformed element id {s:?}")))?;
        if actor.is_empty() {
            return Err(BackendError::InvalidRequest(format!(
                "malformed element id {s:?}"
            )));
        }
        Ok(ElemId::Id {
            actor: ActorId::from(actor),
            counter,
        })
    }

    /// The insertion counter, with `_head` counting as 0.
    pub fn counter(&self) -> u64 {
        match self {
            ElemId::Head => 0,
            ElemId::Id { counter, .. } => *counter,
        }
    }

    /// Lamport comparison of sibling insertions: by counter, then by
    /// actor id. Sorting descending by this order yields the visible
    /// sibling order.
    pub fn lamport_cmp(&self, other: &ElemId) -> std::cmp::Ordering {
        match (self, other) {
            (ElemId::Head, ElemId::Head) => std::cmp::Ordering::Equal,
            (ElemId::Head, _) => std::cmp::Ordering::Less,
            (_, ElemId::Head) => std::cmp::Ordering::Greater,
            (
                ElemId::Id { actor: a1, counter: c1 },
                ElemId::Id { actor: a2, counter: c2 },
            ) => c1.cmp(c2).then_with(|| a1.cmp(a2)),
        }
    }
}

impl fmt::Display for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemId::Head => f.write_str(HEAD_STR),
            ElemId::Id { actor, counter } => write!(f, "{actor}:{counter}"),
        }
    }
}

impl Serialize for ElemId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ElemId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<ElemId, D::Error> {
        let s = String::deserialize(deserializer)?;
        ElemId::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ── Key ───────────────────────────────────────────────────────────────────

/// The `key` field of an assignment op: a map/table key, or the string
/// form of an element id when the target is a list or text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(pub String);

impl Key {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_elem_id(&self) -> Result<ElemId, BackendError> {
        ElemId::parse(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key(s.to_string())
    }
}

impl From<&ElemId> for Key {
    fn from(elem: &ElemId) -> Key {
        Key(elem.to_string())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Values ────────────────────────────────────────────────────────────────

/// Interpretation tag for a scalar value. Only `timestamp`
/// (milliseconds since the epoch) is defined; anything else must fail
/// at apply time rather than pass through silently, so unknown tags
/// are preserved verbatim for the error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Timestamp,
    Unknown(String),
}

impl DataType {
    pub fn as_str(&self) -> &str {
        match self {
            DataType::Timestamp => "timestamp",
            DataType::Unknown(tag) => tag,
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<DataType, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "timestamp" => DataType::Timestamp,
            _ => DataType::Unknown(tag),
        })
    }
}

/// A primitive value carried by a `set` op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl ScalarValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScalarValue::Null => serde_json::Value::Null,
            ScalarValue::Bool(b) => serde_json::Value::Bool(*b),
            ScalarValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScalarValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> ScalarValue {
        ScalarValue::Str(s.to_string())
    }
}

impl From<f64> for ScalarValue {
    fn from(n: f64) -> ScalarValue {
        ScalarValue::Number(n)
    }
}

impl From<i64> for ScalarValue {
    fn from(n: i64) -> ScalarValue {
        ScalarValue::Number(n as f64)
    }
}

impl From<bool> for ScalarValue {
    fn from(b: bool) -> ScalarValue {
        ScalarValue::Bool(b)
    }
}

// ── Op ────────────────────────────────────────────────────────────────────

/// One primitive edit.
///
/// Creation ops (`make*`) allocate an empty composite object; `ins`
/// allocates a list position (invisible until assigned); `set`, `link`
/// and `del` assign, reference, or clear the register at `(obj, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Op {
    #[serde(rename = "makeMap")]
    MakeMap { obj: ObjectId },
    #[serde(rename = "makeTable")]
    MakeTable { obj: ObjectId },
    #[serde(rename = "makeList")]
    MakeList { obj: ObjectId },
    #[serde(rename = "makeText")]
    MakeText { obj: ObjectId },
    #[serde(rename = "ins")]
    Insert { obj: ObjectId, key: Key, elem: u64 },
    #[serde(rename = "set")]
    Set {
        obj: ObjectId,
        key: Key,
        value: ScalarValue,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        datatype: Option<DataType>,
    },
    #[serde(rename = "del")]
    Delete { obj: ObjectId, key: Key },
    #[serde(rename = "link")]
    Link {
        obj: ObjectId,
        key: Key,
        value: ObjectId,
    },
}

impl Op {
    /// The object this op targets (for `make*`, the object it creates).
    pub fn obj(&self) -> &ObjectId {
        match self {
            Op::MakeMap { obj }
            | Op::MakeTable { obj }
            | Op::MakeList { obj }
            | Op::MakeText { obj }
            | Op::Insert { obj, .. }
            | Op::Set { obj, .. }
            | Op::Delete { obj, .. }
            | Op::Link { obj, .. } => obj,
        }
    }

    /// The key of an assignment or insertion op, if it has one.
    pub fn key(&self) -> Option<&Key> {
        match self {
            Op::Insert { key, .. }
            | Op::Set { key, .. }
            | Op::Delete { key, .. }
            | Op::Link { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn is_make(&self) -> bool {
        matches!(
            self,
            Op::MakeMap { .. } | Op::MakeTable { .. } | Op::MakeList { .. } | Op::MakeText { .. }
        )
    }

    pub fn is_assignment(&self) -> bool {
        matches!(self, Op::Set { .. } | Op::Delete { .. } | Op::Link { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::MakeMap { .. } => "makeMap",
            Op::MakeTable { .. } => "makeTable",
            Op::MakeList { .. } => "makeList",
            Op::MakeText { .. } => "makeText",
            Op::Insert { .. } => "ins",
            Op::Set { .. } => "set",
            Op::Delete { .. } => "del",
            Op::Link { .. } => "link",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Insert { obj, key, elem } => write!(f, "ins {obj}[{key}] elem={elem}"),
            Op::Set {
                obj, key, value, ..
            } => write!(f, "set {obj}[{key}] ← {}", value.to_json()),
            Op::Delete { obj, key } => write!(f, "del {obj}[{key}]"),
            Op::Link { obj, key, value } => write!(f, "link {obj}[{key}] → {value}"),
            make => write!(f, "{} {}", make.name(), make.obj()),
        }
    }
}

// ── Change ────────────────────────────────────────────────────────────────

/// A causally-stamped, indivisible unit of user intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub actor: ActorId,
    pub seq: u64,
    /// Max seq per actor this change observed, excluding the change's
    /// own actor (the self-dependency `seq - 1` is implicit).
    pub deps: Clock,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    pub ops: Vec<Op>,
}

impl Change {
    /// Shape validation before anything touches engine state.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.actor.as_str().is_empty() {
            return Err(BackendError::InvalidRequest(
                "actor must be a non-empty string".into(),
            ));
        }
        if self.seq == 0 {
            return Err(BackendError::InvalidRequest(
                "seq must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Decode a change from its wire JSON, reporting unknown op
    /// actions as [`BackendError::UnknownAction`] rather than a
    /// generic parse failure.
    pub fn from_json(value: serde_json::Value) -> Result<Change, BackendError> {
        if let Some(action) = unknown_action(&value) {
            return Err(BackendError::UnknownAction(action));
        }
        serde_json::from_value(value)
            .map_err(|err| BackendError::InvalidRequest(err.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("change serialization is infallible")
    }
}

const KNOWN_ACTIONS: [&str; 8] = [
    "makeMap", "makeTable", "makeList", "makeText", "ins", "set", "del", "link",
];

fn unknown_action(change: &serde_json::Value) -> Option<String> {
    let ops = change.get("ops")?.as_array()?;
    for op in ops {
        if let Some(action) = op.get("action").and_then(|a| a.as_str()) {
            if !KNOWN_ACTIONS.contains(&action) {
                return Some(action.to_string());
            }
        }
    }
    None
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "change {}:{} ({} ops)", self.actor, self.seq, self.ops.len())
    }
}

// ── Local change requests ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Change,
    Undo,
    Redo,
}

/// A request from the local frontend. For `change` requests the ops
/// come from a mutation session; for `undo`/`redo` the backend draws
/// them from its own stacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub request_type: RequestType,
    pub actor: ActorId,
    pub seq: u64,
    pub deps: Clock,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ops: Vec<Op>,
    /// Whether this change should push an undo frame. Meaningful only
    /// for `change` requests.
    #[serde(default)]
    pub undoable: bool,
}
