//! Space-layer errors.
//!
//! The engine itself never errors on op content; everything here is
//! about the surrounding fabric: directories, pointers, blobs, trees
//! that cannot be loaded.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpaceError {
    /// `space.json` missing/malformed, or the directory is not a space.
    /// Corrupt op *lines* are not this error: they are skipped and logged.
    #[error("space at `{path}` is invalid: {reason}")]
    InvalidSpace { path: PathBuf, reason: String },

    /// Operation addressed a tree that is not loaded and cannot be
    /// loaded from disk.
    #[error("tree `{id}` is not loaded and cannot be loaded")]
    MissingTree { id: String },

    /// The space tree lacks one of its conventional vertices.
    #[error("space tree is missing required vertex `{name}`")]
    MissingSpaceVertex { name: &'static str },

    #[error("i/o error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The secrets blob failed to decrypt. Callers fall back to an empty
    /// secret map; the space stays usable.
    #[error("secrets blob could not be decrypted")]
    SecretDecryptFailed,

    #[error("secrets blob could not be encrypted")]
    SecretEncryptFailed,

    /// The loaded tree's root differs from the pointer's declared id.
    /// Hard failure: the space is refused.
    #[error("space id mismatch: pointer declares `{expected}`, tree root is `{found}`")]
    SpaceIdMismatch { expected: String, found: String },

    #[error("config at `{path}` is invalid: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error(transparent)]
    Core(#[from] grove_core::CoreError),
}

impl SpaceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpaceError::Io {
            path: path.into(),
            source,
        }
    }
}
