//! Structural validation of a [`PolyMesh`] shard.
//!
//! Run on entry to every redistribution round; all failures are
//! configuration errors.

use crate::algs::wire::Fnv1a;
use crate::mesh_error::MeshError;
use crate::topology::mesh::PolyMesh;
use crate::topology::patch::PatchKind;
use hashbrown::HashSet;

/// Optional validation toggles for mesh checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    /// Reject two faces with the same point set (non-manifold input).
    pub check_duplicate_faces: bool,
    /// Require internal faces in upper-triangular `(owner, neighbour)` order.
    pub check_upper_triangular: bool,
}

impl ValidationOptions {
    /// Enable all checks.
    pub fn all() -> Self {
        Self {
            check_duplicate_faces: true,
            check_upper_triangular: true,
        }
    }
}

fn invalid(msg: String) -> MeshError {
    MeshError::InvalidTopology(msg)
}

/// Validate array sizes, face/cell references, patch layout and patch order.
pub fn check_mesh(mesh: &PolyMesh, options: ValidationOptions) -> Result<(), MeshError> {
    let n_points = mesh.n_points();
    let n_faces = mesh.n_faces();
    let n_internal = mesh.n_internal_faces();
    let n_cells = mesh.n_cells();

    if mesh.owner().len() != n_faces {
        return Err(invalid(format!(
            "{} owners for {} faces",
            mesh.owner().len(),
            n_faces
        )));
    }
    if n_internal > n_faces {
        return Err(invalid(format!(
            "{n_internal} neighbours for {n_faces} faces"
        )));
    }

    for (f, face) in mesh.faces().iter().enumerate() {
        if face.len() < 3 {
            return Err(invalid(format!("face {f} has {} points", face.len())));
        }
        for (k, &p) in face.iter().enumerate() {
            if p >= n_points {
                return Err(invalid(format!("face {f} references point {p} of {n_points}")));
            }
            if face[..k].contains(&p) {
                return Err(invalid(format!("face {f} repeats point {p}")));
            }
        }
    }

    for f in 0..n_internal {
        let (o, n) = (mesh.owner()[f], mesh.neighbour()[f]);
        if o >= n {
            return Err(invalid(format!(
                "internal face {f}: owner {o} must be below neighbour {n}"
            )));
        }
    }
    if options.check_upper_triangular {
        for f in 1..n_internal {
            let prev = (mesh.owner()[f - 1], mesh.neighbour()[f - 1]);
            let cur = (mesh.owner()[f], mesh.neighbour()[f]);
            if prev > cur {
                return Err(invalid(format!("internal face {f} out of upper-triangular order")));
            }
        }
    }

    let mut seen_cell = vec![false; n_cells];
    for &c in mesh.owner().iter().chain(mesh.neighbour()) {
        seen_cell[c] = true;
    }
    if let Some(c) = seen_cell.iter().position(|s| !s) {
        return Err(invalid(format!("cell {c} has no faces")));
    }

    check_patch_layout(mesh)?;

    if options.check_duplicate_faces {
        let mut seen = HashSet::with_capacity(n_faces);
        for (f, face) in mesh.faces().iter().enumerate() {
            let mut key = face.clone();
            key.sort_unstable();
            if !seen.insert(key) {
                return Err(invalid(format!("face {f} duplicates another face (non-manifold)")));
            }
        }
    }
    Ok(())
}

/// Patches must tile the boundary in order; processor patches come last;
/// cyclic partners must exist and agree in size.
pub fn check_patch_layout(mesh: &PolyMesh) -> Result<(), MeshError> {
    let mut next = mesh.n_internal_faces();
    let mut seen_processor = false;
    for (i, p) in mesh.patches().iter().enumerate() {
        if p.start != next {
            return Err(MeshError::PatchOrdering(format!(
                "patch `{}` starts at {} but the previous patch ends at {}",
                p.name, p.start, next
            )));
        }
        next += p.size;
        if p.kind.is_processor() {
            seen_processor = true;
        } else if seen_processor {
            return Err(MeshError::PatchOrdering(format!(
                "non-processor patch `{}` (index {i}) follows a processor patch",
                p.name
            )));
        }
        if let PatchKind::Cyclic { neighbour_patch } = &p.kind {
            let partner = mesh
                .patches()
                .iter()
                .find(|q| &q.name == neighbour_patch)
                .ok_or_else(|| {
                    invalid(format!(
                        "cyclic patch `{}` names missing partner `{neighbour_patch}`",
                        p.name
                    ))
                })?;
            match &partner.kind {
                PatchKind::Cyclic { neighbour_patch: back } if back == &p.name => {}
                _ => {
                    return Err(invalid(format!(
                        "cyclic patch `{}` and `{}` are not mutual partners",
                        p.name, partner.name
                    )));
                }
            }
            if partner.size != p.size {
                return Err(invalid(format!(
                    "cyclic patch `{}` has {} faces, partner `{}` has {}",
                    p.name, p.size, partner.name, partner.size
                )));
            }
        }
    }
    if next != mesh.n_faces() {
        return Err(MeshError::PatchOrdering(format!(
            "patches cover faces up to {next} but the mesh has {}",
            mesh.n_faces()
        )));
    }
    Ok(())
}

/// Non-processor patch names, in order; identical on every process.
pub fn non_processor_names(mesh: &PolyMesh) -> Vec<&str> {
    mesh.non_processor_patches().map(|p| p.name.as_str()).collect()
}

/// Digest of the non-processor patch names and kinds, in order.
///
/// Processes taking part in one round must agree on it.
pub fn patch_list_fingerprint(mesh: &PolyMesh) -> u64 {
    let mut h = Fnv1a::default();
    for p in mesh.non_processor_patches() {
        h.eat(p.name.as_bytes());
        h.eat(p.kind.to_string().as_bytes());
    }
    h.finish()
}
