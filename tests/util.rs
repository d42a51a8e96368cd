#![allow(dead_code)]
use mesh_redistribute::algs::communicator::RayonComm;
use mesh_redistribute::prelude::*;
use mesh_redistribute::topology::mesh::Point;
use mesh_redistribute::topology::zone::ZoneList;

/// Structured `nx × ny × nz` block of unit hexahedra.
///
/// Cell `(i, j, k)` has index `i + nx * (j + ny * k)`. With `cyclic_x` the
/// faces at `x = 0` and `x = nx` form the cyclic pair `left`/`right`; every
/// other boundary face is on `walls`. Cells with `i == 0` form the cell zone
/// `first_column`.
pub fn block_mesh(nx: usize, ny: usize, nz: usize, cyclic_x: bool) -> PolyMesh {
    let pt = |i: usize, j: usize, k: usize| i + (nx + 1) * (j + (ny + 1) * k);
    let cell = |i: usize, j: usize, k: usize| i + nx * (j + ny * k);

    let mut points = Vec::new();
    for k in 0..=nz {
        for j in 0..=ny {
            for i in 0..=nx {
                points.push([i as f64, j as f64, k as f64]);
            }
        }
    }

    let mut faces = Vec::new();
    let mut owner = Vec::new();
    let mut neighbour = Vec::new();
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let c = cell(i, j, k);
                let (a, b, d) = (i + 1, j + 1, k + 1);
                if a < nx {
                    faces.push(vec![pt(a, j, k), pt(a, b, k), pt(a, b, d), pt(a, j, d)]);
                    owner.push(c);
                    neighbour.push(cell(a, j, k));
                }
                if b < ny {
                    faces.push(vec![pt(i, b, k), pt(i, b, d), pt(a, b, d), pt(a, b, k)]);
                    owner.push(c);
                    neighbour.push(cell(i, b, k));
                }
                if d < nz {
                    faces.push(vec![pt(i, j, d), pt(a, j, d), pt(a, b, d), pt(i, b, d)]);
                    owner.push(c);
                    neighbour.push(cell(i, j, d));
                }
            }
        }
    }

    let mut patches = Vec::new();
    let mut x_min = Vec::new();
    let mut x_max = Vec::new();
    for k in 0..nz {
        for j in 0..ny {
            let (b, c) = (j + 1, k + 1);
            let lo = vec![pt(0, j, k), pt(0, j, c), pt(0, b, c), pt(0, b, k)];
            let hi = vec![pt(nx, j, k), pt(nx, b, k), pt(nx, b, c), pt(nx, j, c)];
            x_min.push((lo, cell(0, j, k)));
            x_max.push((hi, cell(nx - 1, j, k)));
        }
    }
    let mut walls = Vec::new();
    for k in 0..nz {
        for i in 0..nx {
            let (a, c) = (i + 1, k + 1);
            let lo = vec![pt(i, 0, k), pt(a, 0, k), pt(a, 0, c), pt(i, 0, c)];
            let hi = vec![pt(i, ny, k), pt(i, ny, c), pt(a, ny, c), pt(a, ny, k)];
            walls.push((lo, cell(i, 0, k)));
            walls.push((hi, cell(i, ny - 1, k)));
        }
    }
    for j in 0..ny {
        for i in 0..nx {
            let (a, b) = (i + 1, j + 1);
            let lo = vec![pt(i, j, 0), pt(i, b, 0), pt(a, b, 0), pt(a, j, 0)];
            let hi = vec![pt(i, j, nz), pt(a, j, nz), pt(a, b, nz), pt(i, b, nz)];
            walls.push((lo, cell(i, j, 0)));
            walls.push((hi, cell(i, j, nz - 1)));
        }
    }

    let groups = if cyclic_x {
        vec![
            (Patch::cyclic("left", "right"), x_min),
            (Patch::cyclic("right", "left"), x_max),
            (Patch::physical("walls"), walls),
        ]
    } else {
        walls.extend(x_min);
        walls.extend(x_max);
        vec![(Patch::physical("walls"), walls)]
    };
    for (mut p, list) in groups {
        p.start = faces.len();
        for (f, c) in list {
            faces.push(f);
            owner.push(c);
        }
        p.size = faces.len() - p.start;
        patches.push(p);
    }

    let column: Vec<usize> = (0..nx * ny * nz).filter(|c| c % nx == 0).collect();
    let zones = Zones {
        cells: ZoneList::new(vec![Zone::new("first_column", column)]),
        ..Zones::default()
    };
    PolyMesh::new(points, faces, owner, neighbour, patches, zones).expect("valid block mesh")
}

/// Centre of the block cell with global index `id`.
pub fn block_centre(id: usize, nx: usize, ny: usize) -> Point {
    let (i, j, k) = (id % nx, (id / nx) % ny, id / (nx * ny));
    [i as f64 + 0.5, j as f64 + 0.5, k as f64 + 0.5]
}

/// Cell ids under `cells/id`, point coordinates under `coords/x`.
pub fn tracking_fields(ids: Vec<f64>, coords: Vec<[f64; 3]>) -> FieldRegistry {
    let mut reg = FieldRegistry::new();
    reg.register("cells", Box::new(PodFieldStore::new(EntityKind::Cell).with("id", ids)));
    reg.register("coords", Box::new(PodFieldStore::new(EntityKind::Point).with("x", coords)));
    reg
}

/// Read back a POD field through its transport.
pub fn read_field<T: bytemuck::Pod>(
    reg: &FieldRegistry,
    tag: &str,
    name: &str,
    n: usize,
) -> Vec<T> {
    let all: Vec<usize> = (0..n).collect();
    let bytes = reg.get(tag).expect("family").extract(name, &all).expect("extract");
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// Local state of one rank.
pub struct Shard {
    pub mesh: PolyMesh,
    pub fields: FieldRegistry,
}

/// `global` on rank 0, empty meshes with the same patches elsewhere.
pub fn initial_shards(global: &PolyMesh, n_ranks: usize) -> Vec<Shard> {
    let ids = (0..global.n_cells()).map(|c| c as f64).collect();
    let mut shards = vec![Shard {
        mesh: global.clone(),
        fields: tracking_fields(ids, global.points().to_vec()),
    }];
    for _ in 1..n_ranks {
        shards.push(Shard {
            mesh: PolyMesh::empty_with_patches(global.patches().iter().cloned()),
            fields: tracking_fields(Vec::new(), Vec::new()),
        });
    }
    shards
}

/// Run `f` once per rank of a fresh in-process world.
pub fn run_world<T: Send>(n: usize, f: impl Fn(&RayonComm) -> T + Sync) -> Vec<T> {
    let world = RayonComm::world(n);
    std::thread::scope(|s| {
        let handles: Vec<_> = world.iter().map(|c| s.spawn(|| f(c))).collect();
        handles.into_iter().map(|h| h.join().expect("rank panicked")).collect()
    })
}

/// One round on every rank: `dists[r]` is rank `r`'s assignment.
pub fn redistribute_all(
    shards: Vec<Shard>,
    dists: &[Vec<usize>],
    options: &RedistributeOptions,
) -> RoundResults {
    let world = RayonComm::world(shards.len());
    std::thread::scope(|s| {
        let handles: Vec<_> = world
            .iter()
            .zip(shards)
            .map(|(comm, mut shard)| {
                let dist = &dists[comm.rank()];
                s.spawn(move || {
                    let engine = Redistributor::new(comm, options.clone());
                    engine
                        .redistribute(&mut shard.mesh, dist, &mut shard.fields)
                        .map(|report| (shard, report))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("rank panicked")).collect()
    })
}

/// Assignment of global cells to ranks as per-rank distributions of the
/// current shards (cells identified by their `cells/id` value).
pub fn assignment_for(shards: &[Shard], target_of: impl Fn(usize) -> usize) -> Vec<Vec<usize>> {
    shards
        .iter()
        .map(|s| {
            let ids: Vec<f64> = read_field(&s.fields, "cells", "id", s.mesh.n_cells());
            ids.iter().map(|&id| target_of(id as usize)).collect()
        })
        .collect()
}

/// Outcome of one round, indexed by rank.
pub type RoundResults = Vec<Result<(Shard, RedistributeReport), MeshError>>;

/// Unwrap a round that must succeed everywhere.
pub fn expect_round(results: RoundResults) -> (Vec<Shard>, Vec<RedistributeReport>) {
    results
        .into_iter()
        .map(|r| r.expect("round succeeds"))
        .unzip()
}

/// Global consistency checks after a round over an `nx × ny × nz` block.
pub fn check_shards(shards: &[Shard], nx: usize, ny: usize, nz: usize) {
    let mut seen = vec![false; nx * ny * nz];
    for (rank, s) in shards.iter().enumerate() {
        s.mesh.validate_invariants().expect("mesh invariants");
        let ids: Vec<f64> = read_field(&s.fields, "cells", "id", s.mesh.n_cells());
        for (c, &id) in ids.iter().enumerate() {
            let id = id as usize;
            assert!(!seen[id], "cell {id} held twice");
            seen[id] = true;
            let got = s.mesh.cell_centre(c);
            let want = block_centre(id, nx, ny);
            for d in 0..3 {
                let off = (got[d] - want[d]).abs();
                assert!(off < 1e-9, "rank {rank} cell {c} (id {id}) misplaced");
            }
        }
        let coords: Vec<[f64; 3]> = read_field(&s.fields, "coords", "x", s.mesh.n_points());
        assert_eq!(coords, s.mesh.points(), "rank {rank} point field out of step");
        let in_column = ids.iter().filter(|&&id| id as usize % nx == 0).count();
        match s.mesh.zones().cells.find("first_column") {
            Some(column) => {
                for &c in column.members() {
                    let id = ids[c] as usize;
                    assert_eq!(id % nx, 0, "rank {rank}: zone member {c} outside the column");
                }
                assert_eq!(column.len(), in_column);
            }
            None => assert_eq!(in_column, 0, "rank {rank} lost its cell zone"),
        }
    }
    assert!(seen.iter().all(|&s| s), "cells lost");

    // every processor patch has a partner with the same faces in the same order
    for (rank, s) in shards.iter().enumerate() {
        for p in s.mesh.patches().iter().filter(|p| p.kind.is_processor()) {
            let nbr = p.kind.neighbour_rank().expect("processor patch");
            let other = &shards[nbr].mesh;
            // the far side of a processor-cyclic patch refers to the cyclic partner
            let partner = p.kind.referred_patch().map(|r| {
                match &s.mesh.patches()[s.mesh.find_patch(r).expect("referred patch")].kind {
                    PatchKind::Cyclic { neighbour_patch } => neighbour_patch.as_str(),
                    _ => panic!("{} refers to non-cyclic `{r}`", p.name),
                }
            });
            let back = other
                .patches()
                .iter()
                .find(|q| {
                    q.kind.neighbour_rank() == Some(rank) && q.kind.referred_patch() == partner
                })
                .unwrap_or_else(|| panic!("rank {nbr} has no patch back to {rank}"));
            assert_eq!(p.size, back.size, "{} vs {}", p.name, back.name);
            if p.kind.referred_patch().is_none() {
                for (a, b) in p.range().zip(back.range()) {
                    let (ca, cb) = (s.mesh.face_centre(a), other.face_centre(b));
                    for d in 0..3 {
                        assert!((ca[d] - cb[d]).abs() < 1e-9, "{} face {a} unpaired", p.name);
                    }
                }
            }
        }
    }
}
