//! Merging of geometrically coincident points on processor boundaries.
//!
//! Subsets received from different processes carry their own copies of the
//! points on a common seam that was not a face (edge or corner contact).
//! After reconciliation such copies are identified geometrically and merged,
//! keeping the lowest index of each group. The seam is then checked: every
//! point of a processor face must sit where the neighbour has it.

use crate::algs::collective::{all_reduce_max_f64, exchange_sized};
use crate::algs::communicator::{Communicator, RedistributeTags};
use crate::algs::wire::{WireReader, WireWriter, kind};
use crate::mesh_error::{MeshError, WireError};
use crate::topology::change_map::{EntityMap, TopologyChangeMap};
use crate::topology::mesh::{Point, PolyMesh, paired_position};
use crate::topology::patch::PatchKind;
use crate::topology::zone::Zones;
use bytes::Bytes;
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Union-find structure tracking equivalence classes of point indices.
///
/// The representative of a class is always its lowest index.
#[derive(Debug, Clone)]
pub struct PointEquivalence {
    parent: Vec<usize>,
}

impl PointEquivalence {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    /// Representative of `p` (with path compression).
    pub fn find(&mut self, p: usize) -> usize {
        let mut root = p;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = p;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Join the classes of `a` and `b`; returns the representative.
    pub fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[hi] = lo;
        lo
    }
}

/// Outcome of one shared-point merge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SharedPointReport {
    /// Points lying on processor faces.
    pub n_candidates: usize,
    /// Points folded into another point.
    pub n_merged: usize,
    /// Largest seam mismatch over all processes.
    pub max_discrepancy: f64,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SharedPointResult {
    pub mesh: PolyMesh,
    /// Points renumbered and merged; faces and cells untouched.
    pub map: TopologyChangeMap,
    pub report: SharedPointReport,
}

fn dist2(a: &Point, b: &Point) -> f64 {
    (0..3).map(|k| (a[k] - b[k]) * (a[k] - b[k])).sum()
}

/// Group the `candidates` whose coordinates lie within `tolerance` of each
/// other. A tolerance of zero only groups bit-identical coordinates.
pub fn group_coincident(
    points: &[Point],
    candidates: &[usize],
    tolerance: f64,
) -> PointEquivalence {
    let mut eq = PointEquivalence::new(points.len());
    if tolerance <= 0.0 {
        let mut first: HashMap<[u64; 3], usize> = HashMap::new();
        for &p in candidates {
            // +0.0 folds -0.0 onto 0.0
            let key = points[p].map(|x| (x + 0.0).to_bits());
            match first.get(&key) {
                Some(&q) => {
                    eq.union(q, p);
                }
                None => {
                    first.insert(key, p);
                }
            }
        }
        return eq;
    }

    let tol2 = tolerance * tolerance;
    let cell_of = |x: &Point| x.map(|c| (c / tolerance).floor() as i64);
    let mut grid: HashMap<[i64; 3], Vec<usize>> = HashMap::new();
    for &p in candidates {
        let c = cell_of(&points[p]);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let key = [c[0] + dx, c[1] + dy, c[2] + dz];
                    if let Some(bucket) = grid.get(&key) {
                        for &q in bucket {
                            if dist2(&points[p], &points[q]) <= tol2 {
                                eq.union(q, p);
                            }
                        }
                    }
                }
            }
        }
        grid.entry(c).or_default().push(p);
    }
    eq
}

/// Points referenced by faces of processor and processor-cyclic patches.
fn seam_points(mesh: &PolyMesh) -> Vec<usize> {
    let set: BTreeSet<usize> = mesh
        .patches()
        .iter()
        .filter(|p| p.kind.is_processor())
        .flat_map(|p| mesh.faces()[p.range()].iter().flatten().copied())
        .collect();
    set.into_iter().collect()
}

fn merge_local(mesh: PolyMesh, tolerance: f64) -> Result<(PolyMesh, EntityMap, usize), MeshError> {
    let candidates = seam_points(&mesh);
    let mut eq = group_coincident(mesh.points(), &candidates, tolerance);

    let n = mesh.n_points();
    let mut b = EntityMap::builder(n);
    let mut new_of = vec![0usize; n];
    let mut n_merged = 0;
    for p in 0..n {
        let r = eq.find(p);
        if r == p {
            new_of[p] = b.preserve(p)?;
        } else {
            b.absorb(p, new_of[r])?;
            new_of[p] = new_of[r];
            n_merged += 1;
        }
    }
    let map = b.finish();
    if n_merged == 0 {
        return Ok((mesh, map, 0));
    }

    let (points, faces, owner, neighbour, patches, zones) = mesh.into_parts();
    let points: Vec<Point> = (0..map.n_new())
        .filter_map(|np| map.old_of(np).map(|o| points[o]))
        .collect();
    let mut new_faces = Vec::with_capacity(faces.len());
    for (f, face) in faces.into_iter().enumerate() {
        let face: Vec<usize> = face.iter().map(|&p| new_of[p]).collect();
        let distinct: BTreeSet<usize> = face.iter().copied().collect();
        if distinct.len() != face.len() {
            return Err(MeshError::InvalidTopology(format!(
                "merging points within {tolerance} collapses face {f}"
            )));
        }
        new_faces.push(face);
    }
    let zones = Zones {
        points: zones.points.remapped(&map),
        faces: zones.faces,
        cells: zones.cells,
    };
    let out = PolyMesh::from_parts_unchecked(points, new_faces, owner, neighbour, patches, zones);
    Ok((out, map, n_merged))
}

/// Face-ordered coordinates of one processor patch.
fn seam_payload(mesh: &PolyMesh, patch: usize) -> Bytes {
    let faces = &mesh.faces()[mesh.patches()[patch].range()];
    let sizes: Vec<usize> = faces.iter().map(Vec::len).collect();
    let coords: Vec<f64> = faces
        .iter()
        .flatten()
        .flat_map(|&p| mesh.points()[p])
        .collect();
    let mut w = WireWriter::new(kind::POINT_SYNC);
    w.put_usizes(&sizes);
    w.put_f64s(coords.iter().copied());
    w.finish()
}

/// Largest distance between a point of `patch` and its counterpart in the
/// neighbour's copy of the coupled faces.
fn seam_discrepancy(
    mesh: &PolyMesh,
    patch: usize,
    peer: usize,
    data: Bytes,
) -> Result<f64, MeshError> {
    let wire = |e: WireError| MeshError::protocol(peer, e);
    let mut r = WireReader::new(data, kind::POINT_SYNC).map_err(wire)?;
    let sizes = r.get_usizes("seam face sizes").map_err(wire)?;
    let coords = r.get_f64s("seam coordinates").map_err(wire)?;
    r.finish().map_err(wire)?;

    let faces = &mesh.faces()[mesh.patches()[patch].range()];
    if sizes.len() != faces.len() {
        return Err(wire(WireError::Length {
            expected: faces.len(),
            actual: sizes.len(),
        }));
    }
    let total: usize = sizes.iter().sum();
    if coords.len() != 3 * total {
        return Err(wire(WireError::Length {
            expected: 3 * total,
            actual: coords.len(),
        }));
    }

    let mut max = 0.0f64;
    let mut off = 0;
    for (face, &n) in faces.iter().zip(&sizes) {
        if n != face.len() {
            return Err(MeshError::InvalidTopology(format!(
                "seam face with {} points faces one with {n} on rank {peer}",
                face.len()
            )));
        }
        for (j, &p) in face.iter().enumerate() {
            let k = off + 3 * paired_position(j, n);
            let theirs = [coords[k], coords[k + 1], coords[k + 2]];
            max = max.max(dist2(&mesh.points()[p], &theirs).sqrt());
        }
        off += 3 * n;
    }
    Ok(max)
}

/// Merge coincident processor-boundary points, then check the seams
/// against the neighbours. Collective: every rank must call it.
pub fn merge_shared_points<C: Communicator>(
    mesh: PolyMesh,
    comm: &C,
    tags: &RedistributeTags,
    tolerance: f64,
    max_merge_fraction: f64,
) -> Result<SharedPointResult, MeshError> {
    let n_candidates = seam_points(&mesh).len();
    let (n_faces, n_cells) = (mesh.n_faces(), mesh.n_cells());
    let (mesh, point_map, n_merged) = merge_local(mesh, tolerance)?;

    let mut warnings = Vec::new();
    if n_candidates > 0 && n_merged == 0 {
        warnings.push(format!(
            "rank {}: no shared points merged among {n_candidates} candidates",
            comm.rank()
        ));
    }
    if n_candidates > 0 && (n_merged as f64) > max_merge_fraction * n_candidates as f64 {
        warnings.push(format!(
            "rank {}: merged {n_merged} of {n_candidates} candidates; \
             tolerance {tolerance} may be too large",
            comm.rank()
        ));
    }
    for w in &warnings {
        log::warn!("{w}");
    }

    // plain processor patches only; cyclic seams are transformed
    let plain: BTreeMap<usize, usize> = mesh
        .patches()
        .iter()
        .enumerate()
        .filter_map(|(i, p)| match p.kind {
            PatchKind::Processor { neighbour_rank, .. } => Some((neighbour_rank, i)),
            _ => None,
        })
        .collect();
    let outgoing: BTreeMap<usize, Bytes> = plain
        .iter()
        .map(|(&nbr, &patch)| (nbr, seam_payload(&mesh, patch)))
        .collect();
    let peers: Vec<usize> = plain.keys().copied().collect();
    let inbox = exchange_sized(
        comm,
        tags.shared_point_sizes,
        tags.shared_points,
        &outgoing,
        &peers,
    )?;

    let mut local_max = 0.0f64;
    for (nbr, data) in inbox {
        if let Some(&patch) = plain.get(&nbr) {
            local_max = local_max.max(seam_discrepancy(&mesh, patch, nbr, data)?);
        }
    }
    let max_discrepancy = all_reduce_max_f64(comm, tags.reduce, local_max)?;
    log::debug!(
        "rank {}: merged {n_merged}/{n_candidates} seam points, max discrepancy {:e}",
        comm.rank(),
        max_discrepancy
    );
    if max_discrepancy > tolerance {
        return Err(MeshError::SyncDiscrepancy {
            max: max_discrepancy,
            tolerance,
        });
    }

    Ok(SharedPointResult {
        mesh,
        map: TopologyChangeMap {
            points: point_map,
            faces: EntityMap::identity(n_faces),
            cells: EntityMap::identity(n_cells),
        },
        report: SharedPointReport {
            n_candidates,
            n_merged,
            max_discrepancy,
            warnings,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{CommTag, RayonComm};
    use crate::topology::patch::Patch;

    #[test]
    fn equivalence_keeps_lowest_index() {
        let mut eq = PointEquivalence::new(6);
        eq.union(4, 5);
        eq.union(5, 2);
        eq.union(3, 1);
        assert_eq!(eq.find(4), 2);
        assert_eq!(eq.find(5), 2);
        assert_eq!(eq.find(3), 1);
        assert_eq!(eq.find(0), 0);
    }

    #[test]
    fn grouping_respects_tolerance() {
        let pts = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0 + 1e-7, 0.0, 0.0],
            [-0.0, 0.0, 0.0],
            [1.0, 1e-3, 0.0],
        ];
        let all = [0, 1, 2, 3, 4];
        let mut exact = group_coincident(&pts, &all, 0.0);
        assert_eq!(exact.find(3), 0);
        assert_eq!(exact.find(2), 2);

        let mut loose = group_coincident(&pts, &all, 1e-6);
        assert_eq!(loose.find(2), 1);
        assert_eq!(loose.find(4), 4);

        // non-candidates never merge
        let mut some = group_coincident(&pts, &[1, 2], 1e-6);
        assert_eq!(some.find(3), 3);
    }

    #[test]
    fn jittered_clusters_collapse_to_their_first_member() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(7);
        let mut pts = Vec::new();
        let mut cluster = Vec::new();
        for _ in 0..400 {
            let c = rng.gen_range(0..60usize);
            let centre = [(c % 4) as f64, ((c / 4) % 5) as f64, (c / 20) as f64];
            pts.push(centre.map(|x| x + rng.gen_range(-1e-4..1e-4)));
            cluster.push(c);
        }
        let all: Vec<usize> = (0..pts.len()).collect();
        let mut eq = group_coincident(&pts, &all, 1e-3);
        for p in 0..pts.len() {
            let first = cluster.iter().position(|&c| c == cluster[p]).unwrap();
            assert_eq!(eq.find(p), first, "point {p}");
        }
    }

    /// One tet per rank sharing the face (1,0,0)-(0,1,0)-(0,0,1); rank 1's
    /// copy of (0,1,0) is shifted by `shift`.
    fn seam_tet(rank: usize, shift: f64) -> PolyMesh {
        let mut wall = Patch::physical("wall");
        wall.size = 3;
        let mut proc = Patch::processor(rank, 1 - rank);
        proc.start = 3;
        proc.size = 1;
        let (points, faces) = if rank == 0 {
            (
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                vec![vec![0, 2, 1], vec![0, 1, 3], vec![0, 3, 2], vec![1, 2, 3]],
            )
        } else {
            (
                vec![[1.0, 0.0, 0.0], [shift, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 1.0, 1.0]],
                vec![vec![0, 1, 3], vec![1, 2, 3], vec![2, 0, 3], vec![0, 2, 1]],
            )
        };
        let patches = vec![wall, proc];
        PolyMesh::from_parts_unchecked(points, faces, vec![0; 4], vec![], patches, Zones::default())
    }

    fn run_pair(shift: f64, tolerance: f64) -> Vec<Result<SharedPointResult, MeshError>> {
        let world = RayonComm::world(2);
        let tags = RedistributeTags::from_base(CommTag::new(300));
        std::thread::scope(|s| {
            let hs: Vec<_> = world
                .iter()
                .map(|c| {
                    let tags = &tags;
                    s.spawn(move || {
                        merge_shared_points(seam_tet(c.rank(), shift), c, tags, tolerance, 0.5)
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn matching_seams_pass() {
        for r in run_pair(0.0, 0.0) {
            let r = r.unwrap();
            assert_eq!(r.report.n_candidates, 3);
            assert_eq!(r.report.n_merged, 0);
            assert_eq!(r.report.max_discrepancy, 0.0);
            assert!(r.map.points.is_identity());
        }
    }

    #[test]
    fn shifted_seam_fails_on_every_rank() {
        for r in run_pair(1e-3, 1e-6) {
            assert!(matches!(r, Err(MeshError::SyncDiscrepancy { .. })));
        }
        for r in run_pair(1e-3, 1e-2) {
            let d = r.unwrap().report.max_discrepancy;
            assert!((d - 1e-3).abs() < 1e-12);
        }
    }

    #[test]
    fn local_duplicates_on_the_seam_are_merged() {
        // point 4 duplicates point 1; both lie on processor faces
        let mut wall = Patch::physical("wall");
        wall.size = 2;
        let mut proc = Patch::processor(0, 1);
        proc.start = 2;
        proc.size = 2;
        let points = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0],
        ];
        let faces = vec![vec![0, 2, 1], vec![0, 3, 2], vec![0, 1, 3], vec![4, 2, 3]];
        let patches = vec![wall, proc];
        let owner = vec![0; 4];
        let mesh =
            PolyMesh::from_parts_unchecked(points, faces, owner, vec![], patches, Zones::default());
        let (out, map, n) = merge_local(mesh, 1e-9).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out.n_points(), 4);
        assert_eq!(out.faces()[3], vec![1, 2, 3]);
        assert_eq!(map.resolve(4), Some(1));
        map.check_sound().unwrap();
    }
}
