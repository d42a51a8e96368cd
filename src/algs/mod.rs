//! Re-export public algorithms.

pub mod boundary_env;
pub mod collective;
pub mod communicator;
pub mod distribute;
pub mod distribute_map;
pub mod exchange;
pub mod merge;
pub mod repatch;
pub mod shared_points;
pub mod submesh;
pub mod wire;

pub use boundary_env::{BoundaryEnvironment, BoundaryFaceEnvironment, resolve_boundary_environment};
pub use distribute::{RedistributeOptions, RedistributeReport, Redistributor};
pub use distribute_map::{DistributeMap, RedistributeMap};
pub use merge::merge_meshes;
pub use repatch::reconcile_patches;
pub use shared_points::{SharedPointReport, merge_shared_points};
pub use submesh::extract_subset;
