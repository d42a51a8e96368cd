//! Gluing a received sub-mesh onto the local mesh.
//!
//! Coupled faces are matched by their `(origin face, origin process)` key,
//! never by geometry. Each matched pair becomes one internal face owned by
//! the local cell; the incoming cells, faces and points are appended and only
//! the glued faces and the points they share are deduplicated. Copies of one
//! point reached through different glued faces collapse to the lowest index.

use crate::algs::boundary_env::{BoundaryEnvironment, FaceOrigin};
use crate::algs::shared_points::PointEquivalence;
use crate::mesh_error::MeshError;
use crate::topology::change_map::{EntityMap, TopologyChangeMap};
use crate::topology::mesh::{Face, PolyMesh, paired_position};
use crate::topology::patch::Patch;
use crate::topology::zone::{ZoneList, Zones};
use hashbrown::HashMap;

/// Output of one merge.
#[derive(Clone, Debug)]
pub struct MergeResult {
    pub mesh: PolyMesh,
    pub environment: BoundaryEnvironment,
    /// Old index space is `local ++ incoming` for every entity kind.
    pub map: TopologyChangeMap,
    pub n_glued: usize,
}

/// Key → face table over the gluable boundary faces of one side.
fn coupling_table(
    mesh: &PolyMesh,
    env: &BoundaryEnvironment,
) -> Result<HashMap<FaceOrigin, usize>, MeshError> {
    let n_internal = mesh.n_internal_faces();
    let mut table = HashMap::new();
    for (i, e) in env.iter().enumerate() {
        if !e.is_gluable() {
            continue;
        }
        let Some(key) = e.origin else { continue };
        if table.insert(key, n_internal + i).is_some() {
            return Err(MeshError::DuplicateCouplingKey {
                face: key.face,
                process: key.process,
            });
        }
    }
    Ok(table)
}

fn gluable_count(env: &BoundaryEnvironment) -> usize {
    env.iter().filter(|e| e.is_gluable()).count()
}

/// Matched `(local face, incoming face)` pairs, in local face order.
fn match_faces(
    local: &PolyMesh,
    local_env: &BoundaryEnvironment,
    incoming: &PolyMesh,
    incoming_env: &BoundaryEnvironment,
) -> Result<Vec<(usize, usize)>, MeshError> {
    let local_smaller = gluable_count(local_env) <= gluable_count(incoming_env);
    let (built_mesh, built_env, probe_mesh, probe_env) = if local_smaller {
        (local, local_env, incoming, incoming_env)
    } else {
        (incoming, incoming_env, local, local_env)
    };
    let table = coupling_table(built_mesh, built_env)?;
    let n_probe_internal = probe_mesh.n_internal_faces();
    let mut seen = hashbrown::HashSet::with_capacity(table.len());
    let mut pairs = Vec::new();
    for (i, e) in probe_env.iter().enumerate() {
        let Some(key) = e.origin.filter(|_| e.is_gluable()) else {
            continue;
        };
        let Some(&other) = table.get(&key) else {
            continue;
        };
        if !seen.insert(key) {
            return Err(MeshError::DuplicateCouplingKey {
                face: key.face,
                process: key.process,
            });
        }
        let probed = n_probe_internal + i;
        pairs.push(if local_smaller {
            (other, probed)
        } else {
            (probed, other)
        });
    }
    pairs.sort_unstable();
    Ok(pairs)
}

enum NewFace {
    Local(usize),
    Glued(usize, usize),
    Incoming(usize),
}

/// Patch list of the merge: non-processor patches first (local order, then
/// incoming-only ones), processor patches after. Returns, per merged patch,
/// the matching local and incoming patch indices.
fn merge_patch_lists(
    local: &[Patch],
    incoming: &[Patch],
) -> Result<Vec<(Patch, Option<usize>, Option<usize>)>, MeshError> {
    let mut merged: Vec<(Patch, Option<usize>, Option<usize>)> = Vec::new();
    let find_incoming = |name: &str| incoming.iter().position(|p| p.name == name);
    for processor in [false, true] {
        for (i, p) in local.iter().enumerate() {
            if p.kind.is_processor() != processor {
                continue;
            }
            let j = find_incoming(&p.name);
            if let Some(j) = j {
                if incoming[j].kind != p.kind {
                    return Err(MeshError::PatchKindMismatch {
                        name: p.name.clone(),
                        local: p.kind.to_string(),
                        remote: incoming[j].kind.to_string(),
                    });
                }
            }
            merged.push((p.clone(), Some(i), j));
        }
        for (j, p) in incoming.iter().enumerate() {
            if p.kind.is_processor() == processor && !local.iter().any(|q| q.name == p.name) {
                merged.push((p.clone(), None, Some(j)));
            }
        }
    }
    Ok(merged)
}

fn merge_zone_lists(
    local: &ZoneList,
    incoming: &ZoneList,
    map: &EntityMap,
    offset: usize,
) -> ZoneList {
    let mut out = ZoneList::default();
    for z in local.iter() {
        out.merge_into(&z.name, map.remap_indices(z.members()));
    }
    for z in incoming.iter() {
        let shifted: Vec<usize> = z.members().iter().map(|&m| m + offset).collect();
        out.merge_into(&z.name, map.remap_indices(&shifted));
    }
    out
}

/// Merge `incoming` into `local`, consuming both.
pub fn merge_meshes(
    local: PolyMesh,
    local_env: BoundaryEnvironment,
    incoming: PolyMesh,
    incoming_env: BoundaryEnvironment,
) -> Result<MergeResult, MeshError> {
    for (m, e, side) in [(&local, &local_env, "local"), (&incoming, &incoming_env, "incoming")] {
        if m.n_boundary_faces() != e.len() {
            return Err(MeshError::InvalidTopology(format!(
                "{side} mesh has {} boundary faces but {} environments",
                m.n_boundary_faces(),
                e.len()
            )));
        }
    }
    let pairs = match_faces(&local, &local_env, &incoming, &incoming_env)?;

    let (nl_points, nl_faces, nl_cells) = (local.n_points(), local.n_faces(), local.n_cells());
    let (ni_points, ni_faces, ni_cells) =
        (incoming.n_points(), incoming.n_faces(), incoming.n_cells());

    // identify the points of glued faces; one point may be reached through
    // several glued faces naming different local copies
    let n_all_points = nl_points + ni_points;
    let mut same = PointEquivalence::new(n_all_points);
    let mut glued_incoming = vec![false; ni_faces];
    let mut glued_local = vec![false; nl_faces];
    for &(lf, inf) in &pairs {
        let (a, b) = (&local.faces()[lf], &incoming.faces()[inf]);
        if a.len() != b.len() {
            return Err(MeshError::InvalidTopology(format!(
                "coupled faces {lf} (local) and {inf} (incoming) have {} and {} points",
                a.len(),
                b.len()
            )));
        }
        let n = a.len();
        for (k, &ip) in b.iter().enumerate() {
            same.union(a[paired_position(k, n)], nl_points + ip);
        }
        glued_local[lf] = true;
        glued_incoming[inf] = true;
    }

    let mut pb = EntityMap::builder(n_all_points);
    let mut new_point = vec![0usize; n_all_points];
    for p in 0..n_all_points {
        let root = same.find(p);
        if root == p {
            new_point[p] = pb.preserve(p)?;
        } else {
            pb.absorb(p, new_point[root])?;
            new_point[p] = new_point[root];
        }
    }
    let point_map = pb.finish();
    let remap = |face: &[usize], offset: usize| -> Face {
        face.iter().map(|&p| new_point[offset + p]).collect()
    };

    let cell_map = EntityMap::identity(nl_cells + ni_cells);

    // face order: local internal, glued, incoming internal, then patches
    let mut order: Vec<NewFace> = Vec::with_capacity(nl_faces + ni_faces - pairs.len());
    order.extend((0..local.n_internal_faces()).map(NewFace::Local));
    order.extend(pairs.iter().map(|&(l, i)| NewFace::Glued(l, i)));
    order.extend((0..incoming.n_internal_faces()).map(NewFace::Incoming));
    let n_internal = order.len();

    let merged_patches = merge_patch_lists(local.patches(), incoming.patches())?;
    let mut patches = Vec::with_capacity(merged_patches.len());
    let mut env = Vec::new();
    for (mut patch, li, ii) in merged_patches {
        patch.start = order.len();
        if let Some(li) = li {
            for f in local.patches()[li].range().filter(|&f| !glued_local[f]) {
                order.push(NewFace::Local(f));
                env.push(*local_env.get(f - local.n_internal_faces()));
            }
        }
        if let Some(ii) = ii {
            for f in incoming.patches()[ii].range().filter(|&f| !glued_incoming[f]) {
                order.push(NewFace::Incoming(f));
                env.push(*incoming_env.get(f - incoming.n_internal_faces()));
            }
        }
        patch.size = order.len() - patch.start;
        patches.push(patch);
    }
    if order.len() + pairs.len() != nl_faces + ni_faces {
        return Err(MeshError::PatchOrdering(format!(
            "{} faces lost while merging patches",
            nl_faces + ni_faces - pairs.len() - order.len()
        )));
    }

    let mut fb = EntityMap::builder(nl_faces + ni_faces);
    let mut faces: Vec<Face> = Vec::with_capacity(order.len());
    let mut owner = Vec::with_capacity(order.len());
    let mut neighbour = Vec::with_capacity(n_internal);
    for (n, item) in order.iter().enumerate() {
        match *item {
            NewFace::Local(f) => {
                fb.preserve(f)?;
                faces.push(remap(&local.faces()[f], 0));
                owner.push(local.owner()[f]);
                if n < n_internal {
                    neighbour.push(local.neighbour()[f]);
                }
            }
            NewFace::Glued(lf, inf) => {
                fb.merge(lf, &[nl_faces + inf])?;
                faces.push(remap(&local.faces()[lf], 0));
                owner.push(local.owner()[lf]);
                neighbour.push(nl_cells + incoming.owner()[inf]);
            }
            NewFace::Incoming(f) => {
                fb.preserve(nl_faces + f)?;
                faces.push(remap(&incoming.faces()[f], nl_points));
                owner.push(nl_cells + incoming.owner()[f]);
                if n < n_internal {
                    neighbour.push(nl_cells + incoming.neighbour()[f]);
                }
            }
        }
    }
    let face_map = fb.finish();

    let (lz, iz) = (local.zones(), incoming.zones());
    let zones = Zones {
        points: merge_zone_lists(&lz.points, &iz.points, &point_map, nl_points),
        faces: merge_zone_lists(&lz.faces, &iz.faces, &face_map, nl_faces),
        cells: merge_zone_lists(&lz.cells, &iz.cells, &cell_map, nl_cells),
    };

    let (mut all_points, ..) = local.into_parts();
    let (in_points, ..) = incoming.into_parts();
    all_points.extend(in_points);
    let points = (0..point_map.n_new())
        .filter_map(|n| point_map.old_of(n).map(|o| all_points[o]))
        .collect();

    let n_glued = pairs.len();
    let mesh = PolyMesh::from_parts_unchecked(points, faces, owner, neighbour, patches, zones);
    log::debug!(
        "merged {ni_cells} cells: {n_glued} faces glued, {} points shared",
        point_map.n_merged()
    );
    Ok(MergeResult {
        mesh,
        environment: BoundaryEnvironment::new(env),
        map: TopologyChangeMap {
            points: point_map,
            faces: face_map,
            cells: cell_map,
        },
        n_glued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::boundary_env::BoundaryFaceEnvironment;
    use crate::topology::change_map::{Origin, Target};
    use crate::topology::mesh::reverse_face;
    use crate::topology::patch::EXPOSED_PATCH_NAME;

    /// One unit cube `[x0, x0+1]` whose +x face (index 5) is coupled with `key`;
    /// when `flip` the coupled face is stored reversed and sits on -x.
    fn cube(x0: f64, key: FaceOrigin, flip: bool) -> (PolyMesh, BoundaryEnvironment) {
        let mut points = Vec::new();
        for i in 0..2 {
            for (y, z) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                points.push([x0 + i as f64, y, z]);
            }
        }
        let a = vec![0, 1, 2, 3];
        let b = vec![4, 5, 6, 7];
        let mut faces: Vec<Face> = (0..4)
            .map(|k| vec![a[k], a[(k + 1) % 4], b[(k + 1) % 4], b[k]])
            .collect();
        // coupled face last
        if flip {
            faces.push(b.clone());
            faces.push(reverse_face(&a));
        } else {
            faces.push(reverse_face(&a));
            faces.push(b.clone());
        }
        let mut walls = Patch::physical("walls");
        walls.size = 5;
        let mut cut = Patch::physical(EXPOSED_PATCH_NAME);
        cut.start = 5;
        cut.size = 1;
        let mesh =
            PolyMesh::new(points, faces, vec![0; 6], vec![], vec![walls, cut], Zones::default())
                .unwrap();
        let mut env = vec![BoundaryFaceEnvironment::PHYSICAL; 6];
        env[5] = BoundaryFaceEnvironment {
            origin: Some(key),
            originating_patch: None,
            neighbour_destination: Some(0),
        };
        (mesh, BoundaryEnvironment::new(env))
    }

    #[test]
    fn glues_matching_faces_into_one_internal_face() {
        let key = FaceOrigin { face: 3, process: 1 };
        let (l, le) = cube(0.0, key, false);
        let (i, ie) = cube(1.0, key, true);
        let r = merge_meshes(l, le, i, ie).unwrap();
        let m = &r.mesh;
        assert_eq!(r.n_glued, 1);
        assert_eq!(m.n_cells(), 2);
        assert_eq!(m.n_internal_faces(), 1);
        assert_eq!(m.n_faces(), 11);
        assert_eq!(m.n_points(), 12);
        assert_eq!((m.owner()[0], m.neighbour()[0]), (0, 1));
        assert_eq!(m.faces()[0], vec![4, 5, 6, 7]);
        // the exposed patch is now empty, walls hold 10 faces
        let walls = &m.patches()[m.find_patch("walls").unwrap()];
        assert_eq!(walls.size, 10);
        assert_eq!(m.patches()[m.find_patch(EXPOSED_PATCH_NAME).unwrap()].size, 0);
        assert!(r.environment.iter().all(|e| e.origin.is_none()));

        assert_eq!(r.map.faces.origin(0), Origin::Merged { master: 5 });
        assert_eq!(r.map.faces.target(6 + 5), Target::MergedInto(0));
        assert_eq!(r.map.points.n_merged(), 4);
        // incoming point 0 sits at x=1, y=z=0: same as local point 4
        assert_eq!(r.map.points.resolve(8), Some(4));
        r.map.check_sound().unwrap();
    }

    #[test]
    fn unmatched_faces_stay_on_the_boundary() {
        let (l, le) = cube(0.0, FaceOrigin { face: 3, process: 1 }, false);
        let (i, ie) = cube(1.0, FaceOrigin { face: 4, process: 1 }, true);
        let r = merge_meshes(l, le, i, ie).unwrap();
        assert_eq!(r.n_glued, 0);
        assert_eq!(r.mesh.n_internal_faces(), 0);
        assert_eq!(r.mesh.n_points(), 16);
        assert_eq!(r.environment.iter().filter(|e| e.is_gluable()).count(), 2);
    }

    #[test]
    fn duplicate_key_on_one_side_is_rejected() {
        let key = FaceOrigin { face: 3, process: 1 };
        let (l, mut le) = cube(0.0, key, false);
        let mut v = le.clone().into_vec();
        v[4] = v[5];
        le = BoundaryEnvironment::new(v);
        let (i, ie) = cube(1.0, key, true);
        assert!(matches!(
            merge_meshes(l, le, i, ie),
            Err(MeshError::DuplicateCouplingKey { face: 3, process: 1 })
        ));
    }

    #[test]
    fn patch_kind_mismatch_is_rejected() {
        let key = FaceOrigin { face: 3, process: 1 };
        let (l, le) = cube(0.0, key, false);
        let (i, ie) = cube(1.0, key, true);
        let (pts, faces, owner, nbr, mut patches, zones) = i.into_parts();
        patches[0].kind = crate::topology::patch::PatchKind::Cyclic {
            neighbour_patch: "walls".into(),
        };
        let i = PolyMesh::from_parts_unchecked(pts, faces, owner, nbr, patches, zones);
        assert!(matches!(
            merge_meshes(l, le, i, ie),
            Err(MeshError::PatchKindMismatch { .. })
        ));
    }
}
