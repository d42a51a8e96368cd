//! Mesh topology: the polyhedral shard, its patches and zones, and the index
//! maps that translate between mesh generations.

pub mod change_map;
pub mod mesh;
pub mod patch;
pub mod validation;
pub mod zone;

pub use change_map::{EntityMap, Origin, Target, TopologyChangeMap};
pub use mesh::{Face, Point, PolyMesh};
pub use patch::{Patch, PatchKind};
pub use zone::{Zone, ZoneList, Zones};
