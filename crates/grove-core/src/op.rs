//! Operation identifiers, operation variants, and the JSONL line codec.
//!
//! OpId is the ordering primitive: (counter, peer) with counter compared
//! first and the peer id as lexicographic tiebreak. Every conflict in the
//! engine (property writes, parent moves, cycle rejection) resolves by
//! this order, so it must be total and identical on every peer.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::DecodeError;
use super::id::{PeerId, VertexId};

const MOVE_TAG: &str = "m";
const PROPERTY_TAG: &str = "p";

/// Operation identifier - a per-peer Lamport counter plus the peer id.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub peer: PeerId,
}

impl OpId {
    pub fn new(counter: u64, peer: PeerId) -> Self {
        Self { counter, peer }
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.peer.cmp(&other.peer)) // deterministic tiebreak
    }
}

/// A property value as it travels on the wire and sits in the store.
///
/// Scalars plus small arrays of scalars. There is deliberately no object
/// variant: the empty JSON object is the wire sentinel for an absent
/// ("undefined") value and decodes to `None` at the op layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Number(n) => Value::Number(n.clone()),
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::Array(items) => {
                Value::Array(items.iter().map(PropertyValue::to_json).collect())
            }
        }
    }

    fn from_json(value: &Value) -> Result<Self, DecodeError> {
        match value {
            Value::Null => Ok(PropertyValue::Null),
            Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
            Value::Number(n) => Ok(PropertyValue::Number(n.clone())),
            Value::String(s) => Ok(PropertyValue::String(s.clone())),
            Value::Array(items) => Ok(PropertyValue::Array(
                items
                    .iter()
                    .map(PropertyValue::from_json)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Object(_) => Err(DecodeError::Field { field: "value" }),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n.into())
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

/// Sets the target's parent. A Move with a never-before-seen target
/// creates that vertex; `parent == None` designates a root.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveOp {
    pub id: OpId,
    pub target: VertexId,
    pub parent: Option<VertexId>,
}

/// Sets one property on the target vertex. `value == None` is the
/// "undefined" tombstone. Transient ops are applied in memory and may be
/// broadcast, but are never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct SetPropertyOp {
    pub id: OpId,
    pub target: VertexId,
    pub key: String,
    pub value: Option<PropertyValue>,
    pub transient: bool,
}

/// A tree operation. The op multiset fully determines tree state;
/// applying any permutation of the same multiset converges.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeOp {
    Move(MoveOp),
    SetProperty(SetPropertyOp),
}

impl TreeOp {
    pub fn id(&self) -> &OpId {
        match self {
            TreeOp::Move(op) => &op.id,
            TreeOp::SetProperty(op) => &op.id,
        }
    }

    pub fn target(&self) -> &VertexId {
        match self {
            TreeOp::Move(op) => &op.target,
            TreeOp::SetProperty(op) => &op.target,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            TreeOp::Move(_) => false,
            TreeOp::SetProperty(op) => op.transient,
        }
    }
}

/// Encode one op as a compact JSONL line (no trailing newline).
///
/// Shapes: `["m", counter, target, parentOrNull]` and
/// `["p", counter, target, key, value]`. The peer id is not embedded;
/// it rides on the containing file name or wire batch.
pub fn encode_line(op: &TreeOp) -> String {
    let value = match op {
        TreeOp::Move(op) => json!([
            MOVE_TAG,
            op.id.counter,
            op.target.as_str(),
            op.parent.as_ref().map(|p| p.as_str()),
        ]),
        TreeOp::SetProperty(op) => json!([
            PROPERTY_TAG,
            op.id.counter,
            op.target.as_str(),
            op.key,
            match &op.value {
                Some(v) => v.to_json(),
                // Absent values are not transportable; the empty object is
                // the wire sentinel and decodes back to None.
                None => json!({}),
            },
        ]),
    };
    value.to_string()
}

/// Decode one JSONL line into an op, reconstructing the full OpId from
/// the caller-supplied peer.
pub fn decode_line(line: &str, peer: &PeerId) -> Result<TreeOp, DecodeError> {
    let value: Value = serde_json::from_str(line).map_err(|err| DecodeError::Json {
        message: err.to_string(),
    })?;
    let items = value.as_array().ok_or(DecodeError::NotAnArray)?;
    let tag = items
        .first()
        .and_then(Value::as_str)
        .ok_or(DecodeError::Field { field: "tag" })?;

    let counter = items
        .get(1)
        .and_then(Value::as_u64)
        .ok_or(DecodeError::Field { field: "counter" })?;
    let target = items
        .get(2)
        .and_then(Value::as_str)
        .and_then(|s| VertexId::new(s).ok())
        .ok_or(DecodeError::Field { field: "target" })?;
    let id = OpId::new(counter, peer.clone());

    match tag {
        MOVE_TAG => {
            let parent = match items.get(3) {
                Some(Value::Null) | None => None,
                Some(Value::String(s)) => {
                    Some(VertexId::new(s.as_str()).map_err(|_| DecodeError::Field {
                        field: "parent",
                    })?)
                }
                Some(_) => return Err(DecodeError::Field { field: "parent" }),
            };
            Ok(TreeOp::Move(MoveOp { id, target, parent }))
        }
        PROPERTY_TAG => {
            let key = items
                .get(3)
                .and_then(Value::as_str)
                .ok_or(DecodeError::Field { field: "key" })?
                .to_string();
            let value = match items.get(4) {
                None => return Err(DecodeError::Field { field: "value" }),
                Some(Value::Object(map)) if map.is_empty() => None,
                Some(other) => Some(PropertyValue::from_json(other)?),
            };
            Ok(TreeOp::SetProperty(SetPropertyOp {
                id,
                target,
                key,
                value,
                transient: false,
            }))
        }
        other => Err(DecodeError::UnknownTag {
            tag: other.to_string(),
        }),
    }
}
