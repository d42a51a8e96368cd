//! Boundary face environments: what every boundary face is coupled to and
//! where that coupling will live after redistribution.
//!
//! Coupled faces are identified across processes by the *owner side* of the
//! coupling: the lower rank for processor faces, the lower patch index for
//! cyclic pairs. Both sides of a coupling therefore carry the same
//! `(face, process)` origin key, which is what the merger joins on.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{
    WireCoupling, WireReader, WireWriter, cast_slice, i64_to_opt, kind, opt_to_i64,
};
use crate::mesh_error::{MeshError, WireError};
use crate::topology::mesh::PolyMesh;
use crate::topology::patch::{Patch, PatchKind};
use std::collections::BTreeMap;

/// Global identity of a coupled face: its index on the owner side and the
/// owner side's process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaceOrigin {
    pub face: usize,
    pub process: usize,
}

/// Environment of one boundary face.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundaryFaceEnvironment {
    /// `None` for physical boundary faces.
    pub origin: Option<FaceOrigin>,
    /// Cyclic patch the coupling started from, if any.
    pub originating_patch: Option<usize>,
    /// Process the cell across the coupling is assigned to.
    pub neighbour_destination: Option<usize>,
}

impl BoundaryFaceEnvironment {
    /// Environment of a physical face.
    pub const PHYSICAL: Self = Self {
        origin: None,
        originating_patch: None,
        neighbour_destination: None,
    };

    /// Coupled face that is glued when both sides meet on one process.
    #[inline]
    pub fn is_gluable(&self) -> bool {
        self.origin.is_some() && self.originating_patch.is_none()
    }
}

/// Environments of all boundary faces of one mesh, indexed by
/// `face - n_internal_faces`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundaryEnvironment {
    faces: Vec<BoundaryFaceEnvironment>,
}

impl BoundaryEnvironment {
    pub fn new(faces: Vec<BoundaryFaceEnvironment>) -> Self {
        Self { faces }
    }

    /// `n` physical faces.
    pub fn physical(n: usize) -> Self {
        Self {
            faces: vec![BoundaryFaceEnvironment::PHYSICAL; n],
        }
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Environment of the `i`-th boundary face.
    pub fn get(&self, i: usize) -> &BoundaryFaceEnvironment {
        &self.faces[i]
    }

    pub fn as_slice(&self) -> &[BoundaryFaceEnvironment] {
        &self.faces
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BoundaryFaceEnvironment> {
        self.faces.iter()
    }

    pub(crate) fn into_vec(self) -> Vec<BoundaryFaceEnvironment> {
        self.faces
    }

    /// Append the four environment arrays (−1 for "none").
    pub(crate) fn encode(&self, w: &mut WireWriter) {
        w.put_i64s(self.faces.iter().map(|e| opt_to_i64(e.origin.map(|o| o.face))));
        w.put_i64s(self.faces.iter().map(|e| opt_to_i64(e.origin.map(|o| o.process))));
        w.put_i64s(self.faces.iter().map(|e| opt_to_i64(e.originating_patch)));
        w.put_i64s(self.faces.iter().map(|e| opt_to_i64(e.neighbour_destination)));
    }

    pub(crate) fn decode(r: &mut WireReader, n_boundary: usize) -> Result<Self, WireError> {
        let origin_face = r.get_i64s("origin faces")?;
        let origin_proc = r.get_i64s("origin processes")?;
        let patch = r.get_i64s("originating patches")?;
        let dest = r.get_i64s("neighbour destinations")?;
        for len in [origin_face.len(), origin_proc.len(), patch.len(), dest.len()] {
            if len != n_boundary {
                return Err(WireError::Length {
                    expected: n_boundary,
                    actual: len,
                });
            }
        }
        let mut faces = Vec::with_capacity(n_boundary);
        for i in 0..n_boundary {
            let origin = match (
                i64_to_opt("origin face", origin_face[i])?,
                i64_to_opt("origin process", origin_proc[i])?,
            ) {
                (Some(face), Some(process)) => Some(FaceOrigin { face, process }),
                (None, None) => None,
                _ => {
                    return Err(WireError::InvalidValue {
                        what: "half-specified origin",
                        value: i as i64,
                    });
                }
            };
            faces.push(BoundaryFaceEnvironment {
                origin,
                originating_patch: i64_to_opt("originating patch", patch[i])?,
                neighbour_destination: i64_to_opt("neighbour destination", dest[i])?,
            });
        }
        Ok(Self { faces })
    }
}

fn unmatched(rank: usize, detail: String) -> MeshError {
    MeshError::UnmatchedCoupling { rank, detail }
}

/// One processor patch block as sent to the neighbour.
struct CouplingBlock {
    patch: usize,
    referred: Option<usize>,
    canonical: i64,
}

/// Order key of a processor patch towards `nbr` that both sides agree on.
///
/// Plain processor patches sort first (−1). A processor-cyclic patch is
/// named after the cyclic half on *its* side; the key is the index of the
/// half seen from the lower rank, so the two sides of one coupling get the
/// same key.
pub(crate) fn coupling_key(
    patches: &[Patch],
    me: usize,
    nbr: usize,
    referred: Option<usize>,
) -> Result<i64, MeshError> {
    let Some(i) = referred else {
        return Ok(-1);
    };
    if me < nbr {
        return Ok(i as i64);
    }
    match &patches[i].kind {
        PatchKind::Cyclic { neighbour_patch } => patches
            .iter()
            .position(|q| &q.name == neighbour_patch)
            .map(|j| j as i64)
            .ok_or_else(|| {
                MeshError::InvalidTopology(format!(
                    "cyclic patch `{}` names missing partner `{neighbour_patch}`",
                    patches[i].name
                ))
            }),
        other => Err(MeshError::InvalidTopology(format!(
            "processor-cyclic coupling refers to non-cyclic patch `{}` ({other})",
            patches[i].name
        ))),
    }
}

/// Processor patches grouped by neighbour rank, in coupling-key order.
fn processor_blocks(
    mesh: &PolyMesh,
    me: usize,
) -> Result<BTreeMap<usize, Vec<CouplingBlock>>, MeshError> {
    let mut by_nbr: BTreeMap<usize, Vec<CouplingBlock>> = BTreeMap::new();
    for (i, p) in mesh.patches().iter().enumerate() {
        let Some(nbr) = p.kind.neighbour_rank() else {
            continue;
        };
        if nbr == me {
            return Err(MeshError::InvalidTopology(format!(
                "processor patch `{}` couples rank {me} to itself",
                p.name
            )));
        }
        let referred = match p.kind.referred_patch() {
            Some(name) => Some(mesh.find_patch(name).ok_or_else(|| {
                MeshError::InvalidTopology(format!(
                    "patch `{}` refers to missing cyclic patch `{name}`",
                    p.name
                ))
            })?),
            None => None,
        };
        let canonical = coupling_key(mesh.patches(), me, nbr, referred)?;
        by_nbr.entry(nbr).or_default().push(CouplingBlock {
            patch: i,
            referred,
            canonical,
        });
    }
    for list in by_nbr.values_mut() {
        list.sort_by_key(|b| b.canonical);
        if list.windows(2).any(|w| w[0].canonical == w[1].canonical) {
            return Err(MeshError::InvalidTopology(format!(
                "two processor patches of rank {me} share the coupling `{}`",
                mesh.patches()[list[0].patch].name
            )));
        }
    }
    Ok(by_nbr)
}

/// Compute the environment of every boundary face of `mesh`.
///
/// `distribution[c]` is the new process of local cell `c`. Exchanges one
/// message with every process this mesh shares a processor patch with.
pub fn resolve_boundary_environment<C: Communicator>(
    mesh: &PolyMesh,
    distribution: &[usize],
    comm: &C,
    tag: CommTag,
) -> Result<BoundaryEnvironment, MeshError> {
    if distribution.len() != mesh.n_cells() {
        return Err(MeshError::DistributionLength {
            expected: mesh.n_cells(),
            found: distribution.len(),
        });
    }
    let me = comm.rank();
    let n_internal = mesh.n_internal_faces();
    let mut env = vec![BoundaryFaceEnvironment::PHYSICAL; mesh.n_boundary_faces()];

    // cyclic pairs are both local
    for (i, p) in mesh.patches().iter().enumerate() {
        let PatchKind::Cyclic { neighbour_patch } = &p.kind else {
            continue;
        };
        let j = mesh
            .find_patch(neighbour_patch)
            .ok_or_else(|| unmatched(me, format!("cyclic patch `{}` has no partner", p.name)))?;
        let partner = &mesh.patches()[j];
        if partner.size != p.size {
            return Err(unmatched(
                me,
                format!("cyclic patches `{}` and `{}` differ in size", p.name, partner.name),
            ));
        }
        for k in 0..p.size {
            let f = p.start + k;
            let g = partner.start + k;
            let owner_face = if i < j { f } else { g };
            env[f - n_internal] = BoundaryFaceEnvironment {
                origin: Some(FaceOrigin {
                    face: owner_face,
                    process: me,
                }),
                originating_patch: Some(i),
                neighbour_destination: Some(distribution[mesh.owner()[g]]),
            };
        }
    }

    let blocks = processor_blocks(mesh, me)?;
    if blocks.is_empty() {
        return Ok(BoundaryEnvironment::new(env));
    }

    // post receives first, then sends
    let mut recvs = Vec::with_capacity(blocks.len());
    for &nbr in blocks.keys() {
        let mut scratch = [0u8; 0];
        recvs.push((nbr, comm.irecv(nbr, tag.as_u16(), &mut scratch)));
    }
    let mut sends = Vec::with_capacity(blocks.len());
    for (&nbr, list) in &blocks {
        let mut w = WireWriter::new(kind::COUPLING);
        w.put_usize(list.len());
        for b in list {
            let p = &mesh.patches()[b.patch];
            w.put_i64(b.canonical);
            w.put_usize(p.size);
            let records: Vec<WireCoupling> = p
                .range()
                .map(|f| WireCoupling::new(f, distribution[mesh.owner()[f]]))
                .collect();
            w.put_bytes(cast_slice(&records));
        }
        sends.push(comm.isend(nbr, tag.as_u16(), &w.finish()));
    }

    let mut maybe_err = None;
    for (nbr, h) in recvs {
        let data = h.wait();
        if maybe_err.is_some() {
            continue;
        }
        let result = match data {
            Some(d) => apply_remote_blocks(mesh, me, nbr, &blocks[&nbr], d, &mut env),
            None => Err(MeshError::Aborted),
        };
        if let Err(e) = result {
            maybe_err = Some(e);
        }
    }
    for s in sends {
        let _ = s.wait();
    }
    match maybe_err {
        Some(e) => Err(e),
        None => Ok(BoundaryEnvironment::new(env)),
    }
}

fn apply_remote_blocks(
    mesh: &PolyMesh,
    me: usize,
    nbr: usize,
    mine: &[CouplingBlock],
    data: Vec<u8>,
    env: &mut [BoundaryFaceEnvironment],
) -> Result<(), MeshError> {
    let proto = |e| MeshError::protocol(nbr, e);
    let mut r = WireReader::new(data, kind::COUPLING).map_err(proto)?;
    let n_blocks = r.get_usize("coupling block count").map_err(proto)?;
    if n_blocks != mine.len() {
        return Err(unmatched(
            me,
            format!(
                "{} processor patches towards rank {nbr}, which reports {n_blocks}",
                mine.len()
            ),
        ));
    }
    let n_internal = mesh.n_internal_faces();
    for b in mine {
        let p = &mesh.patches()[b.patch];
        let canonical = r.get_i64("coupling key").map_err(proto)?;
        let size = r.get_usize("coupling block size").map_err(proto)?;
        if canonical != b.canonical || size != p.size {
            return Err(unmatched(
                me,
                format!(
                    "patch `{}` ({} faces, key {}) does not match rank {nbr}'s block \
                     ({size} faces, key {canonical})",
                    p.name, p.size, b.canonical
                ),
            ));
        }
        let raw = r.get_bytes("coupling records").map_err(proto)?;
        crate::algs::wire::expect_exact_len(raw.len(), size * std::mem::size_of::<WireCoupling>())
            .map_err(proto)?;
        for (k, chunk) in raw.chunks_exact(std::mem::size_of::<WireCoupling>()).enumerate() {
            let remote: WireCoupling = bytemuck::pod_read_unaligned(chunk);
            let f = p.start + k;
            let face = if me < nbr { f } else { remote.face() };
            let process = me.min(nbr);
            env[f - n_internal] = BoundaryFaceEnvironment {
                origin: Some(FaceOrigin { face, process }),
                originating_patch: b.referred,
                neighbour_destination: Some(remote.dest()),
            };
        }
    }
    r.finish().map_err(proto)?;
    Ok(())
}
