//! Engine errors (parsing, validation, lookup).
//!
//! These are bounded and stable: the engine never errors on op *content* -
//! malformed ops are dropped at the decode boundary, conflicting ops are
//! resolved deterministically.

use thiserror::Error;

/// Invalid identifier string.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("peer id `{raw}` is invalid: {reason}")]
    Peer { raw: String, reason: String },
    #[error("vertex id `{raw}` is invalid: {reason}")]
    Vertex { raw: String, reason: String },
}

/// Op line decode failure. The persistence and sync layers skip the line
/// and keep going; nothing in the engine consumes a malformed op.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("op line is not valid JSON: {message}")]
    Json { message: String },
    #[error("op line is not a JSON array")]
    NotAnArray,
    #[error("unknown op tag `{tag}`")]
    UnknownTag { tag: String },
    #[error("op line field `{field}` is malformed")]
    Field { field: &'static str },
}

/// Canonical error enum for the tree engine.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("vertex {id} does not exist in this tree")]
    UnknownVertex { id: String },
    #[error("tree has no root vertex")]
    NoRoot,
    #[error("the root vertex cannot be moved")]
    RootImmutable,
    #[error("typed projection failed: {reason}")]
    Projection { reason: String },
}
