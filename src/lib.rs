#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-redistribute
//!
//! mesh-redistribute moves cells of an unstructured polyhedral mesh between
//! the processes of an SPMD job. Every process holds one shard; given the new
//! process of each local cell, a round extracts the outgoing cells, exchanges
//! them, glues the received pieces back onto the retained cells and rebuilds
//! the processor boundaries so that the result can be redistributed again.
//!
//! ## Features
//! - Polyhedral shards with physical, cyclic and processor patches, and zones
//! - Old↔new index maps ([`TopologyChangeMap`]) for every edit of a round
//! - Field transport through an explicit [`FieldRegistry`]
//! - Pluggable communication backends (serial, in-process threads, MPI)
//! - Optional parallel extraction with the `rayon` feature
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-redistribute = "0.3"
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! Each rank builds a [`Redistributor`] over its communicator and calls
//! [`Redistributor::redistribute`] with the same options. The call either
//! succeeds everywhere or fails everywhere; a failing rank aborts the
//! communicator.
//!
//! ## Determinism
//!
//! Received pieces are merged in ascending sender rank, so the result does
//! not depend on message arrival order.
//!
//! [`TopologyChangeMap`]: crate::topology::TopologyChangeMap
//! [`FieldRegistry`]: crate::data::FieldRegistry
//! [`Redistributor`]: crate::algs::Redistributor
//! [`Redistributor::redistribute`]: crate::algs::Redistributor::redistribute

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod mesh_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::distribute::{RedistributeOptions, RedistributeReport, Redistributor};
    pub use crate::algs::distribute_map::RedistributeMap;
    pub use crate::data::field::{EntityKind, FieldRegistry, FieldTransport, PodFieldStore};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::mesh_error::MeshError;
    pub use crate::topology::{Patch, PatchKind, PolyMesh, TopologyChangeMap, Zone, Zones};
}
