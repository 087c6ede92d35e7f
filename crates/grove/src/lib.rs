//! Local-first replicated workspaces over the grove-core tree engine.
//!
//! A space directory holds per-peer JSONL op logs plus an encrypted
//! secrets blob; any number of peers share it and converge by merging
//! each other's ops. Module layering:
//! - layout: paths of the space directory
//! - oplog: append-only JSONL persistence
//! - secrets: encrypted blob
//! - space: Space/AppTree conventions
//! - sync: fs watching and wire framing
//! - connection: the per-peer runtime
//! - config, telemetry, error: ambient concerns

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod layout;
pub mod oplog;
pub mod secrets;
pub mod space;
pub mod sync;
pub mod telemetry;

pub use config::ConnectionConfig;
pub use connection::SpaceConnection;
pub use error::SpaceError;
pub use layout::SpacePointer;
pub use secrets::SecretMap;
pub use space::{AppConfig, AppTree, Space};
pub use sync::watch::{WatchEvent, Watcher};
pub use sync::wire::{
    apply_op_batch, BroadcastAction, OpBatch, RequestEnvelope, ResponseEnvelope, Router,
    SyncMessage, Verb,
};

pub use grove_core::{
    CoreError, OpId, PeerId, PropertyValue, RepTree, TreeOp, Vertex, VertexId, VertexMut,
};
