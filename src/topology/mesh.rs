//! Arena-style polyhedral mesh shard.
//!
//! All entities live in dense arrays; cross references are plain indices
//! that are only meaningful within one `PolyMesh` generation. Internal faces
//! come first, followed by boundary faces grouped by patch.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshError;
use crate::topology::patch::Patch;
use crate::topology::validation::{ValidationOptions, check_mesh};
use crate::topology::zone::Zones;
use once_cell::sync::OnceCell;

/// Point coordinates.
pub type Point = [f64; 3];

/// Ordered list of point indices; the normal points out of the owner cell.
pub type Face = Vec<usize>;

/// Reverse a face while keeping its first point in place.
///
/// `[a, b, c, d]` becomes `[a, d, c, b]`; both sides of a coupled face use
/// this convention so point `k` of one side matches point `(n - k) % n` of
/// the other.
pub fn reverse_face(face: &[usize]) -> Face {
    let mut out = Vec::with_capacity(face.len());
    if let Some((&first, rest)) = face.split_first() {
        out.push(first);
        out.extend(rest.iter().rev().copied());
    }
    out
}

/// Position in the partner face that pairs with position `k` of a reversed face.
#[inline]
pub fn paired_position(k: usize, n: usize) -> usize {
    (n - k) % n
}

/// One process's share of the distributed mesh.
#[derive(Clone, Debug, Default)]
pub struct PolyMesh {
    points: Vec<Point>,
    faces: Vec<Face>,
    owner: Vec<usize>,
    neighbour: Vec<usize>,
    patches: Vec<Patch>,
    zones: Zones,
    n_cells: usize,
    cell_faces: OnceCell<Vec<Vec<usize>>>,
}

impl PartialEq for PolyMesh {
    fn eq(&self, other: &Self) -> bool {
        self.points == other.points
            && self.faces == other.faces
            && self.owner == other.owner
            && self.neighbour == other.neighbour
            && self.patches == other.patches
            && self.zones == other.zones
            && self.n_cells == other.n_cells
    }
}

impl PolyMesh {
    /// Assemble a mesh from raw arrays and validate it.
    ///
    /// `neighbour.len()` is the number of internal faces. Patch `start`/`size`
    /// must already describe the boundary face layout.
    pub fn new(
        points: Vec<Point>,
        faces: Vec<Face>,
        owner: Vec<usize>,
        neighbour: Vec<usize>,
        patches: Vec<Patch>,
        zones: Zones,
    ) -> Result<Self, MeshError> {
        let mesh = Self::from_parts_unchecked(points, faces, owner, neighbour, patches, zones);
        check_mesh(&mesh, ValidationOptions::default())?;
        Ok(mesh)
    }

    /// Assemble without validation. Callers inside the crate produce
    /// layouts that are valid by construction.
    pub(crate) fn from_parts_unchecked(
        points: Vec<Point>,
        faces: Vec<Face>,
        owner: Vec<usize>,
        neighbour: Vec<usize>,
        patches: Vec<Patch>,
        zones: Zones,
    ) -> Self {
        let n_cells = owner
            .iter()
            .chain(neighbour.iter())
            .max()
            .map_or(0, |&c| c + 1);
        Self {
            points,
            faces,
            owner,
            neighbour,
            patches,
            zones,
            n_cells,
            cell_faces: OnceCell::new(),
        }
    }

    /// A mesh with no cells carrying the given patches (all empty).
    pub fn empty_with_patches(patches: impl IntoIterator<Item = Patch>) -> Self {
        let patches = patches
            .into_iter()
            .map(|mut p| {
                p.start = 0;
                p.size = 0;
                p
            })
            .collect();
        Self::from_parts_unchecked(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            patches,
            Zones::default(),
        )
    }

    pub fn n_points(&self) -> usize {
        self.points.len()
    }

    pub fn n_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn n_internal_faces(&self) -> usize {
        self.neighbour.len()
    }

    pub fn n_boundary_faces(&self) -> usize {
        self.faces.len() - self.neighbour.len()
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Mutable coordinates; topology is unaffected.
    pub fn points_mut(&mut self) -> &mut [Point] {
        &mut self.points
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    pub fn owner(&self) -> &[usize] {
        &self.owner
    }

    pub fn neighbour(&self) -> &[usize] {
        &self.neighbour
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn zones(&self) -> &Zones {
        &self.zones
    }

    #[inline]
    pub fn is_internal(&self, face: usize) -> bool {
        face < self.neighbour.len()
    }

    /// Patch index of a boundary face.
    pub fn patch_of_face(&self, face: usize) -> Option<usize> {
        if self.is_internal(face) || face >= self.faces.len() {
            return None;
        }
        let i = self.patches.partition_point(|p| p.start + p.size <= face);
        (i < self.patches.len() && self.patches[i].range().contains(&face)).then_some(i)
    }

    pub fn find_patch(&self, name: &str) -> Option<usize> {
        self.patches.iter().position(|p| p.name == name)
    }

    /// Patches that are neither processor nor processor-cyclic.
    pub fn non_processor_patches(&self) -> impl Iterator<Item = &Patch> {
        self.patches.iter().filter(|p| !p.kind.is_processor())
    }

    /// Faces of every cell, built on first use.
    pub fn cell_faces(&self) -> &[Vec<usize>] {
        self.cell_faces.get_or_init(|| {
            let mut cf = vec![Vec::new(); self.n_cells];
            for (f, &o) in self.owner.iter().enumerate() {
                cf[o].push(f);
            }
            for (f, &n) in self.neighbour.iter().enumerate() {
                cf[n].push(f);
            }
            cf
        })
    }

    /// The cell on the other side of an internal face.
    pub fn other_cell(&self, face: usize, cell: usize) -> Option<usize> {
        let n = *self.neighbour.get(face)?;
        if self.owner[face] == cell { Some(n) } else { Some(self.owner[face]) }
    }

    /// Arithmetic mean of a face's points.
    pub fn face_centre(&self, face: usize) -> Point {
        let f = &self.faces[face];
        let mut c = [0.0; 3];
        for &p in f {
            for d in 0..3 {
                c[d] += self.points[p][d];
            }
        }
        let n = f.len().max(1) as f64;
        c.map(|x| x / n)
    }

    /// Arithmetic mean of a cell's face centres.
    pub fn cell_centre(&self, cell: usize) -> Point {
        let faces = &self.cell_faces()[cell];
        let mut c = [0.0; 3];
        for &f in faces {
            let fc = self.face_centre(f);
            for d in 0..3 {
                c[d] += fc[d];
            }
        }
        let n = faces.len().max(1) as f64;
        c.map(|x| x / n)
    }

    /// Split the mesh back into its arrays.
    pub(crate) fn into_parts(
        self,
    ) -> (Vec<Point>, Vec<Face>, Vec<usize>, Vec<usize>, Vec<Patch>, Zones) {
        (
            self.points,
            self.faces,
            self.owner,
            self.neighbour,
            self.patches,
            self.zones,
        )
    }
}

impl DebugInvariants for PolyMesh {
    fn validate_invariants(&self) -> Result<(), MeshError> {
        check_mesh(self, ValidationOptions::all())
    }
}
