//! Replicated tree engine.
//!
//! Module hierarchy follows type dependency order:
//! - id: PeerId, VertexId
//! - error: CoreError, DecodeError
//! - op: OpId, PropertyValue, TreeOp, JSONL line codec
//! - store: VertexStore, events, observers
//! - tree: RepTree merge engine
//! - vertex: ergonomic handles

#![forbid(unsafe_code)]

pub mod error;
pub mod id;
pub mod op;
pub mod store;
pub mod tree;
pub mod vertex;

pub use error::{CoreError, DecodeError, InvalidId};
pub use id::{PeerId, VertexId};
pub use op::{decode_line, encode_line, MoveOp, OpId, PropertyValue, SetPropertyOp, TreeOp};
pub use store::{
    ObserverHandle, PropertySlot, TreeEvent, VertexStore, CREATED_AT_KEY, NAME_KEY,
};
pub use tree::{RepTree, TreeSnapshot, TOMBSTONE_NAME};
pub use vertex::{Vertex, VertexMut};
