use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Writer attach on an existing directory without resume or multi-writer
    /// permission.
    #[error("stream directory '{0}' already exists (use resume or multi-writer mode to reattach)")]
    AlreadyExists(PathBuf),

    /// The root lock for this role is held by another instance. A
    /// misconfiguration, never a retry case.
    #[error("stream '{path}' already has an active {role}")]
    AlreadyActive {
        role: &'static str,
        path: PathBuf,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A freshly generated chunk name collided on disk. Points at a naming
    /// bug or a stepped clock, so it fails loudly instead of retrying.
    #[error("chunk name collision at '{0}'")]
    ChunkCollision(PathBuf),

    /// Offset sidecar could not be read or applied and the configured
    /// policy forbids falling back to offset zero.
    #[error("unusable offset checkpoint '{0}'")]
    BadCheckpoint(PathBuf),

    /// Cooperative shutdown was requested through the stop flag while the
    /// reader was polling. Distinct from the `Ok(0)` end-of-stream signal.
    #[error("shutdown requested")]
    Stopped,

    /// Operation on a handle that was already detached.
    #[error("stream handle already detached")]
    Detached,
}

pub type Result<T> = std::result::Result<T, Error>;
