//! Submesh extraction: carve the cells bound for one process out of the
//! local mesh.
//!
//! The extracted mesh is self-contained and densely renumbered, keeping the
//! parent's relative order of cells, faces and points. Internal faces that
//! lose one of their cells are exposed as boundary faces in a catch-all patch
//! and tagged with their parent identity so the receiving side can glue them
//! back together.

use crate::algs::boundary_env::{BoundaryEnvironment, BoundaryFaceEnvironment, FaceOrigin};
use crate::data::field::{EntityKind, FieldRegistry};
use crate::mesh_error::MeshError;
use crate::topology::change_map::{EntityMap, TopologyChangeMap};
use crate::topology::mesh::{PolyMesh, reverse_face};
use crate::topology::patch::Patch;
use crate::topology::zone::Zones;
use bytes::Bytes;

/// Serialized values of one field family restricted to a sub-mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldBlock {
    pub tag: String,
    pub location: EntityKind,
    /// `(field name, serialized values)` in registry order.
    pub values: Vec<(String, Bytes)>,
}

/// A standalone piece of the local mesh, ready to be sent or kept.
#[derive(Clone, Debug)]
pub struct SubMesh {
    pub mesh: PolyMesh,
    pub environment: BoundaryEnvironment,
    /// Parent → sub-mesh index maps; unselected entities are `Removed`.
    pub map: TopologyChangeMap,
    pub fields: Vec<FieldBlock>,
}

impl SubMesh {
    /// Parent indices of the sub-mesh entities of `kind`, in sub-mesh order.
    pub fn parent_indices(&self, kind: EntityKind) -> Vec<usize> {
        let m = match kind {
            EntityKind::Point => &self.map.points,
            EntityKind::Face => &self.map.faces,
            EntityKind::Cell => &self.map.cells,
        };
        (0..m.n_new()).filter_map(|n| m.old_of(n)).collect()
    }
}

/// Everything the extractor needs besides the cell set.
#[derive(Clone, Copy, Debug)]
pub struct ExtractContext<'a> {
    pub mesh: &'a PolyMesh,
    pub environment: &'a BoundaryEnvironment,
    /// New process of every parent cell.
    pub distribution: &'a [usize],
    /// Rank of the process holding `mesh`.
    pub my_rank: usize,
    /// Patch collecting faces exposed by the cut.
    pub exposed_patch_name: &'a str,
    pub fields: &'a FieldRegistry,
}

/// Extract the cells `cells` (parent indices) into a standalone sub-mesh.
///
/// The parent mesh is never modified.
pub fn extract_subset(ctx: &ExtractContext<'_>, cells: &[usize]) -> Result<SubMesh, MeshError> {
    let mesh = ctx.mesh;
    let n_cells = mesh.n_cells();
    let n_internal = mesh.n_internal_faces();
    if ctx.environment.len() != mesh.n_boundary_faces() {
        return Err(MeshError::InvalidTopology(format!(
            "{} boundary environments for {} boundary faces",
            ctx.environment.len(),
            mesh.n_boundary_faces()
        )));
    }

    let mut selected = vec![false; n_cells];
    for &c in cells {
        if c >= n_cells {
            return Err(MeshError::InvalidTopology(format!(
                "cell {c} selected from a mesh of {n_cells} cells"
            )));
        }
        selected[c] = true;
    }
    let kept_cells: Vec<usize> = (0..n_cells).filter(|&c| selected[c]).collect();
    let cell_map = EntityMap::from_kept(n_cells, &kept_cells)?;
    let new_cell = |c: usize| cell_map.resolve(c);

    let mut kept_faces = Vec::new();
    let mut faces = Vec::new();
    let mut owner = Vec::new();
    let mut neighbour = Vec::new();
    let mut env = Vec::new();

    // internal faces with both cells selected
    for f in 0..n_internal {
        if let (Some(o), Some(n)) = (new_cell(mesh.owner()[f]), new_cell(mesh.neighbour()[f])) {
            kept_faces.push(f);
            faces.push(mesh.faces()[f].clone());
            owner.push(o);
            neighbour.push(n);
        }
    }

    // boundary faces by patch; the catch-all patch sits after the last
    // non-processor patch
    let n_non_proc = mesh.non_processor_patches().count();
    let mut patches: Vec<Patch> = Vec::with_capacity(mesh.patches().len() + 1);
    let existing_exposed = mesh.find_patch(ctx.exposed_patch_name);
    if existing_exposed.is_some_and(|i| i + 1 != n_non_proc) {
        return Err(MeshError::PatchOrdering(format!(
            "patch `{}` must be the last non-processor patch",
            ctx.exposed_patch_name
        )));
    }
    let keep_patch_faces = |patch: &Patch,
                            faces: &mut Vec<Vec<usize>>,
                            owner: &mut Vec<usize>,
                            kept_faces: &mut Vec<usize>,
                            env: &mut Vec<BoundaryFaceEnvironment>| {
        let mut p = patch.clone();
        p.start = faces.len();
        for f in patch.range() {
            if let Some(o) = new_cell(mesh.owner()[f]) {
                kept_faces.push(f);
                faces.push(mesh.faces()[f].clone());
                owner.push(o);
                env.push(*ctx.environment.get(f - n_internal));
            }
        }
        p.size = faces.len() - p.start;
        p
    };

    for (i, patch) in mesh.patches().iter().enumerate() {
        if i == n_non_proc {
            break;
        }
        if Some(i) == existing_exposed {
            continue;
        }
        patches.push(keep_patch_faces(patch, &mut faces, &mut owner, &mut kept_faces, &mut env));
    }

    let mut exposed = match existing_exposed {
        Some(i) => keep_patch_faces(
            &mesh.patches()[i],
            &mut faces,
            &mut owner,
            &mut kept_faces,
            &mut env,
        ),
        None => {
            let mut p = Patch::physical(ctx.exposed_patch_name);
            p.start = faces.len();
            p
        }
    };
    for f in 0..n_internal {
        let (o, n) = (mesh.owner()[f], mesh.neighbour()[f]);
        let (kept, other, face) = match (selected[o], selected[n]) {
            (true, false) => (o, n, mesh.faces()[f].clone()),
            (false, true) => (n, o, reverse_face(&mesh.faces()[f])),
            _ => continue,
        };
        kept_faces.push(f);
        faces.push(face);
        owner.extend(new_cell(kept));
        env.push(BoundaryFaceEnvironment {
            origin: Some(FaceOrigin {
                face: f,
                process: ctx.my_rank,
            }),
            originating_patch: None,
            neighbour_destination: Some(ctx.distribution[other]),
        });
    }
    exposed.size = faces.len() - exposed.start;
    patches.push(exposed);

    for patch in &mesh.patches()[n_non_proc..] {
        patches.push(keep_patch_faces(patch, &mut faces, &mut owner, &mut kept_faces, &mut env));
    }

    // points used by kept faces, in parent order
    let mut used = vec![false; mesh.n_points()];
    for face in &faces {
        for &p in face {
            used[p] = true;
        }
    }
    let kept_points: Vec<usize> = (0..mesh.n_points()).filter(|&p| used[p]).collect();
    let point_map = EntityMap::from_kept(mesh.n_points(), &kept_points)?;
    for face in &mut faces {
        for p in face.iter_mut() {
            let old = *p;
            *p = point_map.resolve(old).ok_or_else(|| {
                MeshError::InvalidTopology(format!("point {old} lost during extraction"))
            })?;
        }
    }
    let points = kept_points.iter().map(|&p| mesh.points()[p]).collect();
    let face_map = EntityMap::from_kept(mesh.n_faces(), &kept_faces)?;

    let zones = Zones {
        points: mesh.zones().points.remapped(&point_map),
        faces: mesh.zones().faces.remapped(&face_map),
        cells: mesh.zones().cells.remapped(&cell_map),
    };

    let sub = PolyMesh::from_parts_unchecked(points, faces, owner, neighbour, patches, zones);
    let mut out = SubMesh {
        mesh: sub,
        environment: BoundaryEnvironment::new(env),
        map: TopologyChangeMap {
            points: point_map,
            faces: face_map,
            cells: cell_map,
        },
        fields: Vec::new(),
    };
    out.fields = extract_fields(&out, ctx.fields)?;
    Ok(out)
}

fn extract_fields(sub: &SubMesh, registry: &FieldRegistry) -> Result<Vec<FieldBlock>, MeshError> {
    let mut blocks = Vec::with_capacity(registry.len());
    for (tag, transport) in registry.iter() {
        let location = transport.location();
        let indices = sub.parent_indices(location);
        let mut values = Vec::new();
        for name in transport.field_names() {
            let data = transport.extract(&name, &indices)?;
            values.push((name, data));
        }
        blocks.push(FieldBlock {
            tag: tag.to_owned(),
            location,
            values,
        });
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::field::PodFieldStore;
    use crate::topology::patch::EXPOSED_PATCH_NAME;
    use crate::topology::zone::Zone;

    /// Three unit cubes in a row along x, one "walls" patch, a cell zone.
    fn line3() -> PolyMesh {
        let n = 3;
        let mut points = Vec::new();
        for i in 0..=n {
            for (y, z) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                points.push([i as f64, y, z]);
            }
        }
        let q = |i: usize| vec![4 * i, 4 * i + 1, 4 * i + 2, 4 * i + 3];
        let mut faces = Vec::new();
        let mut owner = Vec::new();
        let mut neighbour = Vec::new();
        for i in 1..n {
            faces.push(q(i));
            owner.push(i - 1);
            neighbour.push(i);
        }
        for c in 0..n {
            let (a, b) = (q(c), q(c + 1));
            for k in 0..4 {
                faces.push(vec![a[k], a[(k + 1) % 4], b[(k + 1) % 4], b[k]]);
                owner.push(c);
            }
        }
        faces.push(reverse_face(&q(0)));
        owner.push(0);
        faces.push(q(n));
        owner.push(n - 1);
        let mut walls = Patch::physical("walls");
        walls.start = n - 1;
        walls.size = faces.len() - walls.start;
        let zones = Zones {
            cells: crate::topology::zone::ZoneList::new(vec![Zone::new("right", [2])]),
            ..Zones::default()
        };
        PolyMesh::new(points, faces, owner, neighbour, vec![walls], zones).unwrap()
    }

    fn ctx<'a>(
        mesh: &'a PolyMesh,
        env: &'a BoundaryEnvironment,
        dist: &'a [usize],
        fields: &'a FieldRegistry,
    ) -> ExtractContext<'a> {
        ExtractContext {
            mesh,
            environment: env,
            distribution: dist,
            my_rank: 0,
            exposed_patch_name: EXPOSED_PATCH_NAME,
            fields,
        }
    }

    #[test]
    fn extracting_the_middle_cell_exposes_two_faces() {
        let mesh = line3();
        let env = BoundaryEnvironment::physical(mesh.n_boundary_faces());
        let dist = [0, 1, 0];
        let reg = FieldRegistry::new();
        let sub = extract_subset(&ctx(&mesh, &env, &dist, &reg), &[1]).unwrap();
        let m = &sub.mesh;
        assert_eq!(m.n_cells(), 1);
        assert_eq!(m.n_internal_faces(), 0);
        assert_eq!(m.n_points(), 8);
        let exposed = &m.patches()[m.find_patch(EXPOSED_PATCH_NAME).unwrap()];
        assert_eq!(exposed.size, 2);
        // parent face 0 had cell 1 as neighbour: reversed, first point kept
        let f0 = &m.faces()[exposed.start];
        assert_eq!(f0, &reverse_face(&[0, 1, 2, 3]));
        let e0 = sub.environment.get(exposed.start);
        assert_eq!(e0.origin, Some(FaceOrigin { face: 0, process: 0 }));
        assert_eq!(e0.neighbour_destination, Some(0));
        assert!(e0.is_gluable());
        assert!(m.zones().cells.find("right").unwrap().is_empty());
        sub.map.check_sound().unwrap();
        assert_eq!(sub.map.cells.resolve(1), Some(0));
        assert_eq!(sub.map.cells.resolve(0), None);
    }

    #[test]
    fn extracting_everything_is_a_renumbering_identity() {
        let mesh = line3();
        let env = BoundaryEnvironment::physical(mesh.n_boundary_faces());
        let dist = [0, 0, 0];
        let reg = FieldRegistry::new();
        let sub = extract_subset(&ctx(&mesh, &env, &dist, &reg), &[0, 1, 2]).unwrap();
        assert!(sub.map.is_identity());
        assert_eq!(sub.mesh.points(), mesh.points());
        assert_eq!(sub.mesh.faces(), mesh.faces());
        let exposed = sub.mesh.find_patch(EXPOSED_PATCH_NAME).unwrap();
        assert_eq!(sub.mesh.patches()[exposed].size, 0);
    }

    #[test]
    fn fields_follow_the_selected_cells() {
        let mesh = line3();
        let env = BoundaryEnvironment::physical(mesh.n_boundary_faces());
        let dist = [1, 0, 1];
        let mut reg = FieldRegistry::new();
        reg.register(
            "scalar",
            Box::new(PodFieldStore::new(EntityKind::Cell).with("p", vec![10.0f64, 11.0, 12.0])),
        );
        let sub = extract_subset(&ctx(&mesh, &env, &dist, &reg), &[2, 0]).unwrap();
        assert_eq!(sub.fields.len(), 1);
        let (name, bytes) = &sub.fields[0].values[0];
        assert_eq!(name, "p");
        let vals: Vec<f64> = bytes
            .chunks_exact(8)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(vals, vec![10.0, 12.0]);
        assert_eq!(sub.mesh.zones().cells.find("right").unwrap().members(), &[1]);
    }

    #[test]
    fn parent_is_untouched() {
        let mesh = line3();
        let before = mesh.clone();
        let env = BoundaryEnvironment::physical(mesh.n_boundary_faces());
        let reg = FieldRegistry::new();
        let _ = extract_subset(&ctx(&mesh, &env, &[0, 0, 1], &reg), &[2]).unwrap();
        assert_eq!(mesh, before);
    }
}
