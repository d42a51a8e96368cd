//! One redistribution round, end to end.
//!
//! Every rank calls [`Redistributor::redistribute`] with its local mesh and
//! the new process of each local cell. The round runs
//! counts → environments → extraction → exchange → merges → patch
//! reconciliation → shared points → field delivery, and either completes on
//! every rank or fails on every rank.

use crate::algs::boundary_env::resolve_boundary_environment;
use crate::algs::collective::all_gather_u64;
use crate::algs::communicator::{CommTag, Communicator, RedistributeTags};
use crate::algs::distribute_map::{DistributeMap, RedistributeMap};
use crate::algs::exchange::{
    IncomingMesh, STATUS_INVALID, STATUS_OK, SendCounts, all_gather_send_counts, encode_submesh,
    exchange_submeshes,
};
use crate::algs::merge::merge_meshes;
use crate::algs::repatch::reconcile_patches;
use crate::algs::shared_points::{SharedPointReport, merge_shared_points};
use crate::algs::submesh::{ExtractContext, FieldBlock, SubMesh, extract_subset};
use crate::data::field::{EntityKind, FieldAssembly, FieldRegistry};
use crate::debug_invariants::{DebugInvariants, validate_step};
use crate::mesh_error::MeshError;
use crate::topology::change_map::{EntityMap, TopologyChangeMap};
use crate::topology::mesh::PolyMesh;
use crate::topology::patch::EXPOSED_PATCH_NAME;
use crate::topology::validation::{ValidationOptions, check_mesh, patch_list_fingerprint};
use bytes::Bytes;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Knobs of the engine. Missing keys take their defaults when deserialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedistributeOptions {
    /// Absolute distance under which seam points are the same point.
    pub merge_tolerance: f64,
    /// Warn when more than this fraction of seam points merge.
    pub max_merge_fraction: f64,
    /// Compare field registries across ranks before exchanging anything.
    pub check_field_registries: bool,
    /// Transient patch collecting faces exposed by extraction.
    pub exposed_patch_name: String,
    /// First of the communication tags used by a round.
    pub tag_base: u16,
    /// Re-check the mesh after every edit of the round.
    pub validate_steps: bool,
}

impl Default for RedistributeOptions {
    fn default() -> Self {
        Self {
            merge_tolerance: 1e-6,
            max_merge_fraction: 0.5,
            check_field_registries: true,
            exposed_patch_name: EXPOSED_PATCH_NAME.to_owned(),
            tag_base: 0x5200,
            validate_steps: cfg!(feature = "strict-invariants"),
        }
    }
}

/// What a round did.
#[derive(Clone, Debug)]
pub struct RedistributeReport {
    /// Old local → new local, composed over every edit of the round.
    /// Entities received from other processes are `Appended`.
    pub map: TopologyChangeMap,
    /// Who sent what where; usable to move side data.
    pub distribute_map: RedistributeMap,
    pub shared_points: SharedPointReport,
    pub cells_before: Vec<u64>,
    pub cells_after: Vec<u64>,
    /// Faces glued back into internal faces on this rank.
    pub n_glued: usize,
}

impl RedistributeReport {
    /// `true` when the round changed nothing anywhere.
    pub fn is_identity(&self) -> bool {
        self.cells_before == self.cells_after && self.map.is_identity()
    }
}

/// Current index of entity `i` of every merged chunk, per entity kind.
#[derive(Default)]
struct Provenance {
    points: Vec<Vec<Option<usize>>>,
    faces: Vec<Vec<Option<usize>>>,
    cells: Vec<Vec<Option<usize>>>,
}

impl Provenance {
    fn kind(&self, kind: EntityKind) -> &[Vec<Option<usize>>] {
        match kind {
            EntityKind::Point => &self.points,
            EntityKind::Face => &self.faces,
            EntityKind::Cell => &self.cells,
        }
    }

    /// Record a chunk of `sizes` entities found at `offsets` in the old
    /// index space of `map`.
    fn push_chunk(&mut self, sizes: [usize; 3], offsets: [usize; 3], map: &TopologyChangeMap) {
        let chunk = |n: usize, off: usize, m: &EntityMap| -> Vec<Option<usize>> {
            (0..n).map(|i| m.resolve(off + i)).collect()
        };
        self.points.push(chunk(sizes[0], offsets[0], &map.points));
        self.faces.push(chunk(sizes[1], offsets[1], &map.faces));
        self.cells.push(chunk(sizes[2], offsets[2], &map.cells));
    }

    /// Carry every known index through one edit.
    fn follow(&mut self, map: &TopologyChangeMap) {
        let step = |lists: &mut Vec<Vec<Option<usize>>>, m: &EntityMap| {
            for idx in lists.iter_mut().flatten() {
                *idx = idx.and_then(|i| m.resolve(i));
            }
        };
        step(&mut self.points, &map.points);
        step(&mut self.faces, &map.faces);
        step(&mut self.cells, &map.cells);
    }

    /// First `(chunk, index)` of every final entity.
    fn sources(&self, kind: EntityKind, n_final: usize) -> Result<Vec<(usize, usize)>, MeshError> {
        let mut src = vec![None; n_final];
        for (c, list) in self.kind(kind).iter().enumerate() {
            for (i, n) in list.iter().enumerate() {
                if let Some(n) = *n {
                    if src[n].is_none() {
                        src[n] = Some((c, i));
                    }
                }
            }
        }
        src.into_iter()
            .enumerate()
            .map(|(n, s)| {
                s.ok_or_else(|| {
                    MeshError::InvalidTopology(format!("final {kind} {n} has no source entity"))
                })
            })
            .collect()
    }
}

/// How a failed round ended on this rank.
#[derive(Debug)]
enum RoundFailure {
    /// Every rank learned the error from the same collective and returns it.
    Agreed(MeshError),
    /// Only this rank saw the error; peers may still wait on it.
    Local(MeshError),
}

impl From<MeshError> for RoundFailure {
    fn from(e: MeshError) -> Self {
        RoundFailure::Local(e)
    }
}

/// Drives redistribution rounds over one communicator.
#[derive(Debug)]
pub struct Redistributor<'c, C: Communicator> {
    comm: &'c C,
    options: RedistributeOptions,
    tags: RedistributeTags,
}

impl<'c, C: Communicator> Redistributor<'c, C> {
    pub fn new(comm: &'c C, options: RedistributeOptions) -> Self {
        let tags = RedistributeTags::from_base(CommTag::new(options.tag_base));
        Self {
            comm,
            options,
            tags,
        }
    }

    pub fn options(&self) -> &RedistributeOptions {
        &self.options
    }

    pub fn tags(&self) -> &RedistributeTags {
        &self.tags
    }

    /// Cells held by every process. Collective.
    pub fn count_cells(&self, mesh: &PolyMesh) -> Result<Vec<u64>, MeshError> {
        let rows = all_gather_u64(self.comm, self.tags.reduce, &[mesh.n_cells() as u64])?;
        Ok(rows.iter().map(|r| r.first().copied().unwrap_or(0)).collect())
    }

    /// Move every local cell `c` to process `distribution[c]`. Collective.
    ///
    /// On success `mesh` holds exactly the cells assigned to this process and
    /// `fields` hold their values in the new numbering.
    ///
    /// Errors settled by a collective (invalid input on any rank, differing
    /// patch lists or field families, the seam tolerance check) are returned
    /// by every rank alike. Any other failure aborts the communicator so that
    /// no rank waits for a peer that gave up.
    pub fn redistribute(
        &self,
        mesh: &mut PolyMesh,
        distribution: &[usize],
        fields: &mut FieldRegistry,
    ) -> Result<RedistributeReport, MeshError> {
        let me = self.comm.rank();
        match self.run(mesh, distribution, fields) {
            Ok(report) => Ok(report),
            Err(RoundFailure::Agreed(e)) => {
                log::error!("rank {me}: redistribution failed on every rank: {e}");
                Err(e)
            }
            Err(RoundFailure::Local(e)) => {
                log::error!("rank {me}: redistribution failed: {e}");
                if !matches!(e, MeshError::Aborted) {
                    self.comm.abort(1);
                }
                Err(e)
            }
        }
    }

    fn check_input(&self, mesh: &PolyMesh, distribution: &[usize]) -> Result<Vec<u64>, MeshError> {
        let n_ranks = self.comm.size();
        if distribution.len() != mesh.n_cells() {
            return Err(MeshError::DistributionLength {
                expected: mesh.n_cells(),
                found: distribution.len(),
            });
        }
        let mut row = vec![0u64; n_ranks];
        for (cell, &target) in distribution.iter().enumerate() {
            if target >= n_ranks {
                return Err(MeshError::TargetOutOfRange {
                    cell,
                    target,
                    n_ranks,
                });
            }
            row[target] += 1;
        }
        let checks = if self.options.validate_steps {
            ValidationOptions::all()
        } else {
            ValidationOptions::default()
        };
        check_mesh(mesh, checks)?;
        Ok(row)
    }

    fn check_registries(&self, fields: &FieldRegistry) -> Result<(), RoundFailure> {
        let rows = all_gather_u64(self.comm, self.tags.fields_check, &[fields.fingerprint()])?;
        // compared against rank 0 so every rank reports the same culprit
        let first = rows.first().and_then(|r| r.first()).copied();
        match rows.iter().position(|r| r.first().copied() != first) {
            Some(rank) => Err(RoundFailure::Agreed(MeshError::FieldMismatch(format!(
                "rank {rank} registered different field families than rank 0"
            )))),
            None => Ok(()),
        }
    }

    fn extract_all(
        &self,
        ctx: &ExtractContext<'_>,
        counts: &SendCounts,
    ) -> Result<BTreeMap<usize, SubMesh>, MeshError> {
        let me = self.comm.rank();
        let mut cells_of = vec![Vec::new(); self.comm.size()];
        for (c, &d) in ctx.distribution.iter().enumerate() {
            cells_of[d].push(c);
        }
        let dests: Vec<usize> = (0..self.comm.size())
            .filter(|&d| d == me || counts.get(me, d) > 0)
            .collect();

        #[cfg(feature = "rayon")]
        let subs: Result<Vec<(usize, SubMesh)>, MeshError> = dests
            .par_iter()
            .map(|&d| extract_subset(ctx, &cells_of[d]).map(|s| (d, s)))
            .collect();
        #[cfg(not(feature = "rayon"))]
        let subs: Result<Vec<(usize, SubMesh)>, MeshError> = dests
            .iter()
            .map(|&d| extract_subset(ctx, &cells_of[d]).map(|s| (d, s)))
            .collect();

        Ok(subs?.into_iter().collect())
    }

    fn identity_report(&self, mesh: &PolyMesh, counts: &SendCounts) -> RedistributeReport {
        let (me, n) = (self.comm.rank(), self.comm.size());
        RedistributeReport {
            map: TopologyChangeMap::identity(mesh.n_points(), mesh.n_faces(), mesh.n_cells()),
            distribute_map: RedistributeMap {
                points: DistributeMap::identity(mesh.n_points(), n, me),
                faces: DistributeMap::identity(mesh.n_faces(), n, me),
                cells: DistributeMap::identity(mesh.n_cells(), n, me),
            },
            shared_points: SharedPointReport::default(),
            cells_before: counts.cells_before(),
            cells_after: counts.cells_after(),
            n_glued: 0,
        }
    }

    fn run(
        &self,
        mesh: &mut PolyMesh,
        distribution: &[usize],
        fields: &mut FieldRegistry,
    ) -> Result<RedistributeReport, RoundFailure> {
        let (me, n_ranks) = (self.comm.rank(), self.comm.size());
        let opts = &self.options;

        // a rank with bad input still joins the count exchange so every
        // other rank learns about it there
        let checked = self.check_input(mesh, distribution);
        let (row, status) = match &checked {
            Ok(row) => (row.clone(), STATUS_OK),
            Err(_) => (vec![0; n_ranks], STATUS_INVALID),
        };
        let patch_list = patch_list_fingerprint(mesh);
        let counts = all_gather_send_counts(self.comm, &self.tags, &row, status, patch_list)?;
        checked.map_err(RoundFailure::Agreed)?;
        if let Some(rank) = counts.first_invalid() {
            return Err(RoundFailure::Agreed(MeshError::RemoteConfiguration { rank }));
        }
        if let Some(rank) = counts.first_patch_list_mismatch() {
            return Err(RoundFailure::Agreed(MeshError::PatchListMismatch { rank }));
        }
        let cells_before = counts.cells_before();
        let cells_after = counts.cells_after();
        if me == 0 {
            log::info!("redistributing cells {cells_before:?} -> {cells_after:?}");
        }
        if counts.is_identity() {
            log::debug!("rank {me}: assignment keeps every cell in place");
            return Ok(self.identity_report(mesh, &counts));
        }
        if opts.check_field_registries {
            self.check_registries(fields)?;
        }

        let environment =
            resolve_boundary_environment(mesh, distribution, self.comm, self.tags.coupling)?;

        // extraction, including the cells this rank keeps
        let ctx = ExtractContext {
            mesh: &*mesh,
            environment: &environment,
            distribution,
            my_rank: me,
            exposed_patch_name: &opts.exposed_patch_name,
            fields: &*fields,
        };
        let mut subs = self.extract_all(&ctx, &counts)?;
        let sent = |kind: EntityKind| -> Vec<Vec<usize>> {
            (0..n_ranks)
                .map(|d| subs.get(&d).map(|s| s.parent_indices(kind)).unwrap_or_default())
                .collect()
        };
        let sent_maps = [
            sent(EntityKind::Point),
            sent(EntityKind::Face),
            sent(EntityKind::Cell),
        ];
        let retained = subs.remove(&me).ok_or_else(|| {
            MeshError::InvalidTopology(format!("rank {me} extracted no retained sub-mesh"))
        })?;
        let outgoing: BTreeMap<usize, Bytes> =
            subs.iter().map(|(&d, s)| (d, encode_submesh(s))).collect();
        drop(subs);

        let incoming = exchange_submeshes(self.comm, &self.tags, &counts, &outgoing, &*fields)?;
        drop(outgoing);

        // merges in ascending sender order onto the retained cells
        let mut round_map = retained.map.clone();
        let mut provenance = Provenance::default();
        let mut senders = vec![me];
        let mut field_chunks: Vec<Vec<FieldBlock>> = Vec::with_capacity(incoming.len() + 1);
        let IncomingMesh {
            mesh: mut merged,
            environment: mut merged_env,
            fields: own_fields,
            ..
        } = retained.into_incoming(me);
        let own = [merged.n_points(), merged.n_faces(), merged.n_cells()];
        let id = TopologyChangeMap::identity(own[0], own[1], own[2]);
        provenance.push_chunk(own, [0; 3], &id);
        field_chunks.push(own_fields);
        let mut n_glued = 0;

        for inc in incoming {
            let offsets = [merged.n_points(), merged.n_faces(), merged.n_cells()];
            let sizes = [inc.mesh.n_points(), inc.mesh.n_faces(), inc.mesh.n_cells()];
            let result = merge_meshes(merged, merged_env, inc.mesh, inc.environment)?;
            log::debug!(
                "rank {me}: merged {} cells from rank {}, {} faces glued",
                sizes[2],
                inc.sender,
                result.n_glued
            );
            provenance.follow(&result.map);
            provenance.push_chunk(sizes, offsets, &result.map);
            round_map = round_map.compose(&result.map)?;
            senders.push(inc.sender);
            field_chunks.push(inc.fields);
            n_glued += result.n_glued;
            merged = result.mesh;
            merged_env = result.environment;
        }

        let repatched = reconcile_patches(merged, &merged_env, me, &opts.exposed_patch_name)?;
        provenance.follow(&repatched.map);
        round_map = round_map.compose(&repatched.map)?;
        validate_step(&repatched.mesh, "patch reconciliation", opts.validate_steps)?;
        drop(merged_env);

        let shared = merge_shared_points(
            repatched.mesh,
            self.comm,
            &self.tags,
            opts.merge_tolerance,
            opts.max_merge_fraction,
        )
        .map_err(|e| match e {
            MeshError::SyncDiscrepancy { .. } => RoundFailure::Agreed(e),
            e => RoundFailure::Local(e),
        })?;
        provenance.follow(&shared.map);
        round_map = round_map.compose(&shared.map)?;
        let final_mesh = shared.mesh;
        validate_step(&final_mesh, "shared point merge", opts.validate_steps)?;
        if opts.validate_steps {
            round_map.check_sound()?;
        } else {
            round_map.debug_assert_invariants();
        }

        deliver_fields(fields, &final_mesh, &provenance, &field_chunks)?;

        let [sent_points, sent_faces, sent_cells] = sent_maps;
        let plan = |kind, sent, n_old, n_new| {
            construct_map(&provenance, kind, &senders, sent, n_old, n_new)
        };
        let distribute_map = RedistributeMap {
            points: plan(EntityKind::Point, sent_points, mesh.n_points(), final_mesh.n_points())?,
            faces: plan(EntityKind::Face, sent_faces, mesh.n_faces(), final_mesh.n_faces())?,
            cells: plan(EntityKind::Cell, sent_cells, mesh.n_cells(), final_mesh.n_cells())?,
        };

        log::info!(
            "rank {me}: {} -> {} cells, {} glued faces, {} shared points merged",
            mesh.n_cells(),
            final_mesh.n_cells(),
            n_glued,
            shared.report.n_merged
        );
        *mesh = final_mesh;
        Ok(RedistributeReport {
            map: round_map,
            distribute_map,
            shared_points: shared.report,
            cells_before,
            cells_after,
            n_glued,
        })
    }
}

/// Transfer plan of one entity kind: `sent` from the extraction, the
/// receive side from where every chunk entity ended up.
fn construct_map(
    provenance: &Provenance,
    kind: EntityKind,
    senders: &[usize],
    sent: Vec<Vec<usize>>,
    n_old: usize,
    n_new: usize,
) -> Result<DistributeMap, MeshError> {
    let mut construct = vec![Vec::new(); sent.len()];
    for (c, list) in provenance.kind(kind).iter().enumerate() {
        construct[senders[c]] = list
            .iter()
            .enumerate()
            .map(|(i, n)| {
                n.ok_or_else(|| {
                    MeshError::InvalidTopology(format!(
                        "{kind} {i} received from rank {} vanished",
                        senders[c]
                    ))
                })
            })
            .collect::<Result<_, _>>()?;
    }
    DistributeMap::new(n_old, n_new, sent, construct)
}

/// Hand every field family its values in the final numbering.
fn deliver_fields(
    fields: &mut FieldRegistry,
    mesh: &PolyMesh,
    provenance: &Provenance,
    chunks: &[Vec<FieldBlock>],
) -> Result<(), MeshError> {
    for (tag, transport) in fields.iter_mut() {
        let kind = transport.location();
        let n_final = match kind {
            EntityKind::Point => mesh.n_points(),
            EntityKind::Face => mesh.n_faces(),
            EntityKind::Cell => mesh.n_cells(),
        };
        let sources = provenance.sources(kind, n_final)?;
        for name in transport.field_names() {
            let data: Vec<Bytes> = chunks
                .iter()
                .map(|blocks| {
                    blocks
                        .iter()
                        .find(|b| b.tag == tag)
                        .and_then(|b| b.values.iter().find(|(n, _)| *n == name))
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| {
                            MeshError::FieldMismatch(format!(
                                "field `{name}` of `{tag}` was not received"
                            ))
                        })
                })
                .collect::<Result<_, _>>()?;
            transport.receive(
                &name,
                FieldAssembly {
                    chunks: &data,
                    sources: &sources,
                },
            )?;
        }
    }
    Ok(())
}
