//! Re-filing boundary faces into their final patches after all merges.
//!
//! Layout on exit:
//! - internal faces in upper-triangular `(owner, neighbour)` order;
//! - non-processor patches in their existing order (the catch-all patch of
//!   exposed faces is dropped);
//! - processor patches sorted by neighbour rank, plain before cyclic.
//!
//! Faces of coupled patches are sorted by their origin key, so both sides of
//! every coupling list the faces in the same order.

use crate::algs::boundary_env::{BoundaryEnvironment, coupling_key};
use crate::mesh_error::MeshError;
use crate::topology::change_map::{EntityMap, TopologyChangeMap};
use crate::topology::mesh::PolyMesh;
use crate::topology::patch::{Patch, PatchKind};
use crate::topology::validation::check_patch_layout;
use crate::topology::zone::Zones;
use itertools::Itertools;
use std::collections::BTreeMap;

/// Result of [`reconcile_patches`].
#[derive(Clone, Debug)]
pub struct RepatchResult {
    pub mesh: PolyMesh,
    /// Faces are permuted; points and cells are untouched.
    pub map: TopologyChangeMap,
    /// Number of processor and processor-cyclic patches created.
    pub n_processor_patches: usize,
}

/// Where a boundary face goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Destination {
    Patch(usize),
    /// `(neighbour rank, referred cyclic patch)`
    Processor(usize, Option<usize>),
}

/// Compute the final patch of every boundary face of `mesh` and rebuild the
/// face layout accordingly.
pub fn reconcile_patches(
    mesh: PolyMesh,
    env: &BoundaryEnvironment,
    my_rank: usize,
    exposed_patch_name: &str,
) -> Result<RepatchResult, MeshError> {
    let n_internal = mesh.n_internal_faces();
    if env.len() != mesh.n_boundary_faces() {
        return Err(MeshError::InvalidTopology(format!(
            "{} environments for {} boundary faces",
            env.len(),
            mesh.n_boundary_faces()
        )));
    }

    let mut destination = Vec::with_capacity(env.len());
    for (pi, patch) in mesh.patches().iter().enumerate() {
        for f in patch.range() {
            let e = env.get(f - n_internal);
            let is_exposed = patch.name == exposed_patch_name;
            let d = match (&patch.kind, e.origin) {
                (PatchKind::Physical, None) if !is_exposed => Destination::Patch(pi),
                (_, None) => {
                    return Err(MeshError::InvalidTopology(format!(
                        "face {f} of coupled patch `{}` has no origin",
                        patch.name
                    )));
                }
                (_, Some(origin)) => {
                    let dest = e.neighbour_destination.ok_or_else(|| {
                        MeshError::InvalidTopology(format!(
                            "coupled face {f} has no neighbour destination"
                        ))
                    })?;
                    match (dest == my_rank, e.originating_patch) {
                        (true, Some(cp)) => Destination::Patch(cp),
                        (true, None) => {
                            return Err(MeshError::UnmatchedCoupling {
                                rank: my_rank,
                                detail: format!(
                                    "face {f} (origin face {} on rank {}) stayed local \
                                     but was never glued",
                                    origin.face, origin.process
                                ),
                            });
                        }
                        (false, referred) => Destination::Processor(dest, referred),
                    }
                }
            };
            destination.push(d);
        }
    }

    // non-processor patches keep their order; processor ones are rebuilt
    let kept: Vec<usize> = mesh
        .patches()
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.kind.is_processor() && p.name != exposed_patch_name)
        .map(|(i, _)| i)
        .collect();
    for d in &destination {
        if let Destination::Patch(cp) = *d {
            let ok = kept.binary_search(&cp).is_ok();
            if !ok {
                return Err(MeshError::InvalidTopology(format!(
                    "face filed into patch {cp}, which is not a non-processor patch"
                )));
            }
        }
    }

    let mut processor_keys: BTreeMap<(usize, i64), Option<usize>> = BTreeMap::new();
    for d in &destination {
        if let Destination::Processor(nbr, referred) = *d {
            if let Some(cp) = referred {
                let kind = mesh.patches().get(cp).map(|p| &p.kind);
                if !matches!(kind, Some(PatchKind::Cyclic { .. })) {
                    return Err(MeshError::InvalidTopology(format!(
                        "processor-cyclic coupling through patch {cp}, which is not cyclic"
                    )));
                }
            }
            let key = coupling_key(mesh.patches(), my_rank, nbr, referred)?;
            // lazy and once per key
            processor_keys.entry((nbr, key)).or_insert(referred);
        }
    }

    // bucket the boundary faces
    let mut buckets: BTreeMap<Destination, Vec<usize>> = BTreeMap::new();
    for (i, d) in destination.iter().enumerate() {
        buckets.entry(*d).or_default().push(n_internal + i);
    }
    let origin_of = |f: usize| env.get(f - n_internal).origin;
    for (d, faces) in buckets.iter_mut() {
        let coupled = match d {
            Destination::Processor(..) => true,
            Destination::Patch(p) => mesh.patches()[*p].kind.is_coupled(),
        };
        if coupled {
            faces.sort_by_key(|&f| origin_of(f).map(|o| (o.process, o.face)));
        }
    }

    // upper-triangular internal faces
    let internal: Vec<usize> = (0..n_internal)
        .sorted_by_key(|&f| (mesh.owner()[f], mesh.neighbour()[f]))
        .collect();

    let mut new_order = internal;
    let mut patches = Vec::with_capacity(kept.len() + processor_keys.len());
    for &pi in &kept {
        let mut p = mesh.patches()[pi].clone();
        p.start = new_order.len();
        if let Some(faces) = buckets.get(&Destination::Patch(pi)) {
            new_order.extend_from_slice(faces);
        }
        p.size = new_order.len() - p.start;
        patches.push(p);
    }
    for (&(nbr, _), &referred) in &processor_keys {
        let mut p = match referred {
            Some(cp) => Patch::processor_cyclic(my_rank, nbr, &mesh.patches()[cp].name),
            None => Patch::processor(my_rank, nbr),
        };
        p.start = new_order.len();
        if let Some(faces) = buckets.get(&Destination::Processor(nbr, referred)) {
            new_order.extend_from_slice(faces);
        }
        p.size = new_order.len() - p.start;
        if p.size > 0 {
            patches.push(p);
        }
    }
    if new_order.len() != mesh.n_faces() {
        return Err(MeshError::PatchOrdering(format!(
            "{} of {} faces re-filed",
            new_order.len(),
            mesh.n_faces()
        )));
    }

    let face_map = EntityMap::from_kept(mesh.n_faces(), &new_order)?;
    let (n_points, n_cells) = (mesh.n_points(), mesh.n_cells());
    let n_processor_patches = patches.iter().filter(|p| p.kind.is_processor()).count();
    let (points, faces, owner, neighbour, _, zones) = mesh.into_parts();
    let faces = new_order.iter().map(|&f| faces[f].clone()).collect();
    let new_owner = new_order.iter().map(|&f| owner[f]).collect();
    let new_neighbour = new_order[..n_internal].iter().map(|&f| neighbour[f]).collect();
    let zones = Zones {
        points: zones.points,
        faces: zones.faces.remapped(&face_map),
        cells: zones.cells,
    };
    let out =
        PolyMesh::from_parts_unchecked(points, faces, new_owner, new_neighbour, patches, zones);
    check_patch_layout(&out)?;

    Ok(RepatchResult {
        mesh: out,
        map: TopologyChangeMap {
            points: EntityMap::identity(n_points),
            faces: face_map,
            cells: EntityMap::identity(n_cells),
        },
        n_processor_patches,
    })
}
