mod util;

use mesh_redistribute::algs::communicator::RayonComm;
use mesh_redistribute::prelude::*;
use std::sync::Mutex;
use util::*;

fn split_bar() -> Vec<Shard> {
    let global = block_mesh(6, 1, 1, false);
    let dists = vec![vec![0, 0, 0, 1, 1, 1], vec![]];
    let opts = RedistributeOptions::default();
    let (shards, _) = expect_round(redistribute_all(initial_shards(&global, 2), &dists, &opts));
    shards
}

/// One failing round per rank; also reports whether the world was aborted.
fn failing_round(shards: Vec<Shard>, dists: &[Vec<usize>]) -> (Vec<MeshError>, bool) {
    let slots: Vec<Mutex<Option<Shard>>> =
        shards.into_iter().map(|s| Mutex::new(Some(s))).collect();
    let outcome = run_world(slots.len(), |comm: &RayonComm| {
        let mut shard = slots[comm.rank()].lock().unwrap().take().unwrap();
        let engine = Redistributor::new(comm, RedistributeOptions::default());
        let result = engine.redistribute(&mut shard.mesh, &dists[comm.rank()], &mut shard.fields);
        (result.err().expect("round must fail"), comm.clone())
    });
    let aborted = outcome.iter().any(|(_, comm)| comm.is_aborted());
    (outcome.into_iter().map(|(e, _)| e).collect(), aborted)
}

#[test]
fn keeping_every_cell_is_an_identity_round() {
    let shards = split_bar();
    let before: Vec<PolyMesh> = shards.iter().map(|s| s.mesh.clone()).collect();
    let dists = vec![vec![0; 3], vec![1; 3]];
    let opts = RedistributeOptions::default();
    let (after, reports) = expect_round(redistribute_all(shards, &dists, &opts));
    for (rank, (s, r)) in after.iter().zip(&reports).enumerate() {
        assert!(r.is_identity(), "rank {rank}");
        assert_eq!(r.n_glued, 0);
        assert_eq!(s.mesh, before[rank]);
        assert_eq!(r.distribute_map.cells.sent_to(rank), &[0, 1, 2]);
    }
}

#[test]
fn single_process_without_communicator() {
    let mut mesh = block_mesh(3, 2, 1, true);
    let original = mesh.clone();
    let mut fields = tracking_fields((0..6).map(|c| c as f64).collect(), mesh.points().to_vec());
    let engine = Redistributor::new(&NoComm, RedistributeOptions::default());
    let report = engine.redistribute(&mut mesh, &[0; 6], &mut fields).unwrap();
    assert!(report.is_identity());
    assert_eq!(report.cells_before, vec![6]);
    assert_eq!(mesh, original);
    assert_eq!(engine.count_cells(&mesh).unwrap(), vec![6]);
}

#[test]
fn bad_target_on_one_rank_fails_every_rank() {
    for _ in 0..5 {
        let dists = vec![vec![0, 1, 0], vec![1, 7, 0]];
        let (errs, aborted) = failing_round(split_bar(), &dists);
        assert!(matches!(errs[0], MeshError::RemoteConfiguration { rank: 1 }));
        assert!(matches!(
            errs[1],
            MeshError::TargetOutOfRange { cell: 1, target: 7, n_ranks: 2 }
        ));
        assert!(errs.iter().all(MeshError::is_configuration));
        assert!(!aborted, "a reported input error must not abort the world");
    }
}

#[test]
fn wrong_distribution_length_is_reported_remotely() {
    let shards = split_bar();
    let dists = vec![vec![0, 0], vec![1, 1, 1]];
    let results = redistribute_all(shards, &dists, &RedistributeOptions::default());
    assert!(matches!(
        results[0],
        Err(MeshError::DistributionLength { expected: 3, found: 2 })
    ));
    assert!(matches!(results[1], Err(MeshError::RemoteConfiguration { rank: 0 })));
}

#[test]
fn differing_field_families_are_rejected() {
    let mut shards = split_bar();
    shards[1]
        .fields
        .register("extra", Box::new(PodFieldStore::<u32>::new(EntityKind::Face)));
    let dists = vec![vec![1; 3], vec![1; 3]];
    let results = redistribute_all(shards, &dists, &RedistributeOptions::default());
    for r in results {
        assert!(matches!(r, Err(MeshError::FieldMismatch(_))));
    }
}

#[test]
fn field_family_mismatch_reads_the_same_on_three_ranks() {
    let global = block_mesh(6, 1, 1, false);
    let dists = vec![vec![0, 0, 1, 1, 2, 2], vec![], vec![]];
    for _ in 0..5 {
        let mut shards = initial_shards(&global, 3);
        shards[2]
            .fields
            .register("extra", Box::new(PodFieldStore::<u32>::new(EntityKind::Cell)));
        let (errs, aborted) = failing_round(shards, &dists);
        for e in &errs {
            assert!(matches!(e, MeshError::FieldMismatch(_)), "{e}");
            assert_eq!(e.to_string(), errs[0].to_string());
        }
        assert!(errs[0].to_string().contains("rank 2"));
        assert!(!aborted);
    }
}

#[test]
fn differing_patch_lists_fail_every_rank() {
    for _ in 0..5 {
        let mesh = block_mesh(2, 1, 1, false);
        let ids = vec![0.0, 1.0];
        let shards = vec![
            Shard {
                fields: tracking_fields(ids, mesh.points().to_vec()),
                mesh,
            },
            Shard {
                mesh: PolyMesh::empty_with_patches([
                    Patch::physical("inlet"),
                    Patch::physical("walls"),
                ]),
                fields: tracking_fields(Vec::new(), Vec::new()),
            },
        ];
        let (errs, aborted) = failing_round(shards, &[vec![0, 1], vec![]]);
        for e in &errs {
            assert!(matches!(e, MeshError::PatchListMismatch { rank: 1 }), "{e}");
            assert!(e.is_configuration());
        }
        assert!(!aborted);
    }
}

#[test]
fn same_patch_lists_in_a_later_round_are_accepted() {
    // every rank keeps every non-processor patch, even with no faces on it
    let shards = split_bar();
    for s in &shards {
        assert_eq!(s.mesh.non_processor_patches().count(), 1);
    }
    let dists = vec![vec![1, 1, 1], vec![0, 0, 0]];
    let opts = RedistributeOptions::default();
    let (shards, _) = expect_round(redistribute_all(shards, &dists, &opts));
    check_shards(&shards, 6, 1, 1);
}
