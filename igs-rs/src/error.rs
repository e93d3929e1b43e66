use serde::{Deserialize, Serialize};

/// Coarse classification of every error that can be returned over the
/// control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// No free IP address, partition or disk is left.
    ResourceExhausted,

    /// The VM is in the wrong state for the requested transition, or a
    /// prerequisite (such as the base image) is missing.
    PreconditionFailed,

    /// Unknown VM name, disk index or partition.
    NotFound,

    /// An external tool exited with a non-zero status or could not be
    /// spawned.
    ExternalToolFailed,

    /// The hypervisor did not expose an expected channel in time.
    Timeout,

    /// The in-memory view disagrees with the filesystem or process reality.
    StateInconsistent,

    /// Failure inside the dataplane itself, e.g. local filesystem I/O.
    Internal,
}

impl ErrorKind {
    /// Human-readable summary of this error class, used by the shell.
    pub fn summary(&self) -> &'static str {
        match self {
            ErrorKind::ResourceExhausted => "No free resources left",
            ErrorKind::PreconditionFailed => "Operation not possible in the current state",
            ErrorKind::NotFound => "No such object",
            ErrorKind::ExternalToolFailed => "A host tool failed",
            ErrorKind::Timeout => "Timed out waiting for the hypervisor",
            ErrorKind::StateInconsistent => "Dataplane state is out of sync with the host",
            ErrorKind::Internal => "Internal dataplane error",
        }
    }
}

/// Error transported over the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {description}")]
pub struct ControlError {
    pub kind: ErrorKind,
    pub description: String,
}

impl ControlError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        ControlError {
            kind,
            description: description.into(),
        }
    }
}
