//! Runtime error types

use thiserror::Error;

/// Token unwound through the interpreter when a primitive surrenders control
/// to the message loop (finish, exit, interrupt). Carries no payload: the
/// loop's own state records why the interpreter stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit;

/// Why a collection was started. Shown in trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum GcReason {
    NewSpace,
    Tenure,
    OldSpace,
    ClassTable,
    Primitive,
    SnapshotTest,
}

/// Snapshot streams are parsed defensively: any violation is reported with
/// the byte offset where it was detected.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The stream does not begin with the expected magic value.
    #[error("wrong snapshot magic 0x{found:04x} at byte {offset}")]
    WrongMagic { found: u16, offset: usize },
    /// The stream's version is not understood by this VM.
    #[error("wrong snapshot version {found} at byte {offset}")]
    WrongVersion { found: usize, offset: usize },
    /// A cluster record carried an unrecognized format tag.
    #[error("unknown cluster format {format} at byte {offset}")]
    UnknownClusterFormat { format: i64, offset: usize },
    /// The stream ended before the object graph was complete.
    #[error("truncated snapshot at byte {offset}")]
    Truncated { offset: usize },
    /// The declared node count disagrees with the clusters' contents.
    #[error("snapshot declared {declared} nodes but clusters produced {read}")]
    NodeCountMismatch { declared: usize, read: usize },
    /// An edge named a reference id outside the allocated range.
    #[error("reference {id} out of range at byte {offset}")]
    InvalidRef { id: usize, offset: usize },
}
