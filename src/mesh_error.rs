//! MeshError: Unified error type for mesh-redistribute public APIs
//!
//! Every component returns this error and propagates it immediately; nothing
//! in the engine retries. Variants fall in three groups:
//! - configuration errors (bad input, detected locally),
//! - protocol errors (malformed or inconsistent messages),
//! - the tolerance check of the shared-point pass.

use thiserror::Error;

/// Decoding failures of the sub-mesh and coupling wire formats.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated message: needed {needed} more bytes for {what}, {available} left")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("unsupported wire version {found} (expected {expected})")]
    Version { found: u16, expected: u16 },
    #[error("unexpected message kind {found} (expected {expected})")]
    Kind { found: u16, expected: u16 },
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),
    #[error("invalid value {value} for {what}")]
    InvalidValue { what: &'static str, value: i64 },
    #[error("{0} trailing bytes after message")]
    Trailing(usize),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Unified error type for mesh-redistribute operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The distribution array does not cover exactly the local cells.
    #[error("distribution has {found} entries but the mesh has {expected} cells")]
    DistributionLength { expected: usize, found: usize },
    /// A target process is outside `[0, n_ranks)`.
    #[error("cell {cell} assigned to process {target}, but only {n_ranks} processes exist")]
    TargetOutOfRange {
        cell: usize,
        target: usize,
        n_ranks: usize,
    },
    /// The local mesh violates a structural invariant.
    #[error("invalid mesh topology: {0}")]
    InvalidTopology(String),
    /// A processor patch precedes a non-processor patch, or patches are not contiguous.
    #[error("patch ordering violated: {0}")]
    PatchOrdering(String),
    /// A coupled face has no counterpart on the other side.
    #[error("unmatched coupling on rank {rank}: {detail}")]
    UnmatchedCoupling { rank: usize, detail: String },
    /// Two coupling faces on the same side claim the same origin.
    #[error("duplicate coupling key (face {face}, process {process})")]
    DuplicateCouplingKey { face: usize, process: usize },
    /// Another rank reported an invalid input; the round is abandoned everywhere.
    #[error("rank {rank} reported an invalid redistribution input")]
    RemoteConfiguration { rank: usize },
    /// The non-processor patches of `rank` differ from those of rank 0.
    #[error("rank {rank} has different non-processor patches than rank 0")]
    PatchListMismatch { rank: usize },
    /// A message could not be decoded.
    #[error("protocol error from rank {peer}: {source}")]
    Protocol {
        peer: usize,
        #[source]
        source: WireError,
    },
    /// Field registries differ between sender and receiver.
    #[error("field registry mismatch: {0}")]
    FieldMismatch(String),
    /// A patch with the same name has a different kind on another process.
    #[error("patch `{name}` has kind {local} locally but {remote} remotely")]
    PatchKindMismatch {
        name: String,
        local: String,
        remote: String,
    },
    /// A field collaborator rejected its data.
    #[error("field `{name}`: {reason}")]
    Field { name: String, reason: String },
    /// Communication with a neighbor failed.
    #[error("communication with rank {neighbor} failed: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The communicator was aborted by another rank.
    #[error("collective operation aborted")]
    Aborted,
    /// Coupled points disagree by more than the merge tolerance.
    #[error("max sync discrepancy {max} exceeds tolerance {tolerance}")]
    SyncDiscrepancy { max: f64, tolerance: f64 },
    /// Two index maps cannot be composed.
    #[error("cannot compose maps: {0}")]
    MapComposition(String),
}

impl MeshError {
    /// Wrap a wire decoding failure attributed to `peer`.
    pub fn protocol(peer: usize, source: WireError) -> Self {
        MeshError::Protocol { peer, source }
    }

    /// `true` for the errors caused by local input rather than by messages.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MeshError::DistributionLength { .. }
                | MeshError::TargetOutOfRange { .. }
                | MeshError::InvalidTopology(_)
                | MeshError::PatchOrdering(_)
                | MeshError::UnmatchedCoupling { .. }
                | MeshError::DuplicateCouplingKey { .. }
                | MeshError::RemoteConfiguration { .. }
                | MeshError::PatchListMismatch { .. }
        )
    }
}
