//! Sub-mesh exchange protocol.
//!
//! 1. [`all_gather_send_counts`]: every rank learns the full send-count matrix
//!    (plus a status word and a patch-list digest per rank), so no
//!    coordinator is needed.
//! 2. [`exchange_submeshes`]: byte sizes, then payloads; all sends are posted
//!    before any receive is waited on.
//!
//! A sub-mesh message is, in this order: header, cell/internal-face counts,
//! point coordinates, face→point offsets and flat list, owner, neighbour,
//! patch descriptors, point/face/cell zones, the four boundary environment
//! arrays, and one block per field family.

use crate::algs::boundary_env::BoundaryEnvironment;
use crate::algs::collective::{all_gather_u64, exchange_sized};
use crate::algs::communicator::{Communicator, RedistributeTags};
use crate::algs::submesh::{FieldBlock, SubMesh};
use crate::algs::wire::{WireReader, WireWriter, kind};
use crate::data::field::{EntityKind, FieldRegistry};
use crate::mesh_error::{MeshError, WireError};
use crate::topology::mesh::{Face, PolyMesh};
use crate::topology::patch::{Patch, PatchKind};
use crate::topology::zone::{Zone, ZoneList, Zones};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Status word appended to every rank's count row.
pub const STATUS_OK: u64 = 0;
/// The rank found its input invalid and will not take part in the exchange.
pub const STATUS_INVALID: u64 = 1;

/// `counts[i][j]`: cells process `i` sends to process `j`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendCounts {
    counts: Vec<Vec<u64>>,
    status: Vec<u64>,
    patch_lists: Vec<u64>,
}

impl SendCounts {
    pub fn n_ranks(&self) -> usize {
        self.counts.len()
    }

    pub fn get(&self, from: usize, to: usize) -> u64 {
        self.counts[from][to]
    }

    pub fn row(&self, from: usize) -> &[u64] {
        &self.counts[from]
    }

    pub fn status(&self, rank: usize) -> u64 {
        self.status[rank]
    }

    /// Lowest rank that reported invalid input.
    pub fn first_invalid(&self) -> Option<usize> {
        self.status.iter().position(|&s| s != STATUS_OK)
    }

    /// Lowest rank whose patch-list digest differs from rank 0's.
    pub fn first_patch_list_mismatch(&self) -> Option<usize> {
        let first = self.patch_lists.first()?;
        self.patch_lists.iter().position(|d| d != first)
    }

    /// Ranks other than `me` that send cells to `me`, ascending.
    pub fn senders_to(&self, me: usize) -> Vec<usize> {
        (0..self.n_ranks())
            .filter(|&i| i != me && self.counts[i][me] > 0)
            .collect()
    }

    /// Cells held by each rank before the round.
    pub fn cells_before(&self) -> Vec<u64> {
        self.counts.iter().map(|r| r.iter().sum()).collect()
    }

    /// Cells held by each rank after the round.
    pub fn cells_after(&self) -> Vec<u64> {
        (0..self.n_ranks())
            .map(|j| self.counts.iter().map(|r| r[j]).sum())
            .collect()
    }

    /// `true` when nobody sends anything to anybody else.
    pub fn is_identity(&self) -> bool {
        self.counts
            .iter()
            .enumerate()
            .all(|(i, r)| r.iter().enumerate().all(|(j, &c)| i == j || c == 0))
    }
}

/// Collective: contribute this rank's send-count row, status word and
/// patch-list digest.
pub fn all_gather_send_counts<C: Communicator>(
    comm: &C,
    tags: &RedistributeTags,
    row: &[u64],
    status: u64,
    patch_list: u64,
) -> Result<SendCounts, MeshError> {
    let n = comm.size();
    let mut contribution = Vec::with_capacity(n + 2);
    contribution.extend_from_slice(row);
    contribution.resize(n, 0);
    contribution.push(status);
    contribution.push(patch_list);
    let rows = all_gather_u64(comm, tags.counts, &contribution)?;
    let mut counts = Vec::with_capacity(n);
    let mut statuses = Vec::with_capacity(n);
    let mut patch_lists = Vec::with_capacity(n);
    for mut r in rows {
        patch_lists.push(r.pop().unwrap_or_default());
        statuses.push(r.pop().unwrap_or(STATUS_INVALID));
        counts.push(r);
    }
    log::debug!("send-count matrix: {counts:?}");
    Ok(SendCounts {
        counts,
        status: statuses,
        patch_lists,
    })
}

/// A decoded sub-mesh from one sender.
#[derive(Clone, Debug)]
pub struct IncomingMesh {
    pub sender: usize,
    pub mesh: PolyMesh,
    pub environment: BoundaryEnvironment,
    pub fields: Vec<FieldBlock>,
}

impl SubMesh {
    /// The retained sub-mesh of `me`, in the form of a received one.
    pub fn into_incoming(self, me: usize) -> IncomingMesh {
        IncomingMesh {
            sender: me,
            mesh: self.mesh,
            environment: self.environment,
            fields: self.fields,
        }
    }
}

fn encode_patch(w: &mut WireWriter, p: &Patch) {
    w.put_str(&p.name);
    w.put_u64(p.kind.tag() as u64);
    w.put_usize(p.start);
    w.put_usize(p.size);
    match &p.kind {
        PatchKind::Physical => {}
        PatchKind::Cyclic { neighbour_patch } => w.put_str(neighbour_patch),
        PatchKind::Processor {
            my_rank,
            neighbour_rank,
        } => {
            w.put_usize(*my_rank);
            w.put_usize(*neighbour_rank);
        }
        PatchKind::ProcessorCyclic {
            my_rank,
            neighbour_rank,
            referred_patch,
        } => {
            w.put_usize(*my_rank);
            w.put_usize(*neighbour_rank);
            w.put_str(referred_patch);
        }
    }
}

fn decode_patch(r: &mut WireReader) -> Result<Patch, WireError> {
    let name = r.get_str("patch name")?;
    let tag = r.get_u64("patch kind")?;
    let start = r.get_usize("patch start")?;
    let size = r.get_usize("patch size")?;
    let kind = match tag {
        0 => PatchKind::Physical,
        1 => PatchKind::Cyclic {
            neighbour_patch: r.get_str("cyclic partner")?,
        },
        2 => PatchKind::Processor {
            my_rank: r.get_usize("processor rank")?,
            neighbour_rank: r.get_usize("processor neighbour")?,
        },
        3 => PatchKind::ProcessorCyclic {
            my_rank: r.get_usize("processor rank")?,
            neighbour_rank: r.get_usize("processor neighbour")?,
            referred_patch: r.get_str("referred patch")?,
        },
        other => {
            return Err(WireError::InvalidValue {
                what: "patch kind",
                value: other as i64,
            });
        }
    };
    Ok(Patch {
        name,
        kind,
        start,
        size,
    })
}

fn encode_zones(w: &mut WireWriter, list: &ZoneList) {
    w.put_usize(list.len());
    for z in list.iter() {
        w.put_str(&z.name);
        w.put_usizes(z.members());
    }
}

fn decode_zones(r: &mut WireReader, bound: usize) -> Result<ZoneList, WireError> {
    let n = r.get_usize("zone count")?;
    let mut zones = Vec::new();
    for _ in 0..n {
        let name = r.get_str("zone name")?;
        let members = r.get_usizes("zone members")?;
        if let Some(&bad) = members.iter().find(|&&m| m >= bound) {
            return Err(WireError::InvalidValue {
                what: "zone member",
                value: bad as i64,
            });
        }
        zones.push(Zone::new(name, members));
    }
    Ok(ZoneList::new(zones))
}

/// Serialize a sub-mesh and its field blocks.
pub fn encode_submesh(sub: &SubMesh) -> Bytes {
    let m = &sub.mesh;
    let mut w = WireWriter::new(kind::SUBMESH);
    w.put_usize(m.n_cells());
    w.put_usize(m.n_internal_faces());
    w.put_f64s(m.points().iter().flat_map(|p| p.iter().copied()).collect::<Vec<_>>().into_iter());

    let mut offsets = Vec::with_capacity(m.n_faces() + 1);
    let mut flat = Vec::new();
    offsets.push(0);
    for f in m.faces() {
        flat.extend_from_slice(f);
        offsets.push(flat.len());
    }
    w.put_usizes(&offsets);
    w.put_usizes(&flat);
    w.put_usizes(m.owner());
    w.put_usizes(m.neighbour());

    w.put_usize(m.patches().len());
    for p in m.patches() {
        encode_patch(&mut w, p);
    }
    encode_zones(&mut w, &m.zones().points);
    encode_zones(&mut w, &m.zones().faces);
    encode_zones(&mut w, &m.zones().cells);

    sub.environment.encode(&mut w);

    w.put_usize(sub.fields.len());
    for block in &sub.fields {
        w.put_str(&block.tag);
        w.put_u64(block.location.tag());
        w.put_usize(block.values.len());
        for (name, data) in &block.values {
            w.put_str(name);
            w.put_bytes(data);
        }
    }
    w.finish()
}

fn bad(what: &'static str, value: usize) -> WireError {
    WireError::InvalidValue {
        what,
        value: value as i64,
    }
}

fn decode_mesh(r: &mut WireReader) -> Result<(PolyMesh, usize), WireError> {
    let n_cells = r.get_usize("cell count")?;
    let n_internal = r.get_usize("internal face count")?;
    let coords = r.get_f64s("point coordinates")?;
    if coords.len() % 3 != 0 {
        return Err(bad("coordinate count", coords.len()));
    }
    let points: Vec<[f64; 3]> = coords.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect();

    let offsets = r.get_usizes("face offsets")?;
    let flat = r.get_usizes("face points")?;
    if offsets.first() != Some(&0) || offsets.last() != Some(&flat.len()) {
        return Err(bad("face offsets", offsets.len()));
    }
    let mut faces: Vec<Face> = Vec::with_capacity(offsets.len().saturating_sub(1));
    for w in offsets.windows(2) {
        if w[0] > w[1] {
            return Err(bad("face offset", w[1]));
        }
        faces.push(flat[w[0]..w[1]].to_vec());
    }
    if let Some(&p) = flat.iter().find(|&&p| p >= points.len()) {
        return Err(bad("face point", p));
    }

    let owner = r.get_usizes("owner")?;
    let neighbour = r.get_usizes("neighbour")?;
    if owner.len() != faces.len() {
        return Err(WireError::Length {
            expected: faces.len(),
            actual: owner.len(),
        });
    }
    if neighbour.len() != n_internal || n_internal > faces.len() {
        return Err(WireError::Length {
            expected: n_internal,
            actual: neighbour.len(),
        });
    }
    if let Some(&c) = owner.iter().chain(&neighbour).find(|&&c| c >= n_cells) {
        return Err(bad("cell index", c));
    }

    let n_patches = r.get_usize("patch count")?;
    let mut patches = Vec::new();
    let mut next = n_internal;
    for _ in 0..n_patches {
        let p = decode_patch(r)?;
        if p.start != next {
            return Err(bad("patch start", p.start));
        }
        next += p.size;
        patches.push(p);
    }
    if next != faces.len() {
        return Err(bad("patch coverage", next));
    }

    let zones = Zones {
        points: decode_zones(r, points.len())?,
        faces: decode_zones(r, faces.len())?,
        cells: decode_zones(r, n_cells)?,
    };
    let n_boundary = faces.len() - n_internal;
    let mesh = PolyMesh::from_parts_unchecked(points, faces, owner, neighbour, patches, zones);
    if mesh.n_cells() != n_cells {
        return Err(bad("cell count", n_cells));
    }
    Ok((mesh, n_boundary))
}

fn decode_fields(r: &mut WireReader) -> Result<Vec<FieldBlock>, WireError> {
    let n = r.get_usize("field block count")?;
    let mut blocks = Vec::new();
    for _ in 0..n {
        let tag = r.get_str("field type tag")?;
        let loc = r.get_u64("field location")?;
        let location = EntityKind::from_tag(loc).ok_or(WireError::InvalidValue {
            what: "field location",
            value: loc as i64,
        })?;
        let k = r.get_usize("field count")?;
        let mut values = Vec::new();
        for _ in 0..k {
            let name = r.get_str("field name")?;
            let data = r.get_bytes("field values")?;
            values.push((name, data));
        }
        blocks.push(FieldBlock {
            tag,
            location,
            values,
        });
    }
    Ok(blocks)
}

/// Every received block must match a registered family, with the same
/// location and field names, and every family must be present.
fn check_fields(
    peer: usize,
    blocks: &[FieldBlock],
    registry: &FieldRegistry,
) -> Result<(), MeshError> {
    let local = registry.describe();
    if blocks.len() != local.len() {
        return Err(MeshError::FieldMismatch(format!(
            "rank {peer} sent {} field families, {} are registered here",
            blocks.len(),
            local.len()
        )));
    }
    for (block, (tag, location, names)) in blocks.iter().zip(&local) {
        let remote_names: Vec<&str> = block.values.iter().map(|(n, _)| n.as_str()).collect();
        if &block.tag != tag
            || block.location != *location
            || remote_names != names.iter().map(String::as_str).collect::<Vec<_>>()
        {
            return Err(MeshError::FieldMismatch(format!(
                "rank {peer} sent `{}` on {} {:?}, expected `{tag}` on {location} {names:?}",
                block.tag, block.location, remote_names
            )));
        }
    }
    Ok(())
}

/// Decode a sub-mesh message from `peer` and check its field blocks.
pub fn decode_submesh(
    peer: usize,
    data: Bytes,
    registry: &FieldRegistry,
) -> Result<IncomingMesh, MeshError> {
    let proto = |e| MeshError::protocol(peer, e);
    let mut r = WireReader::new(data, kind::SUBMESH).map_err(proto)?;
    let (mesh, n_boundary) = decode_mesh(&mut r).map_err(proto)?;
    let environment = BoundaryEnvironment::decode(&mut r, n_boundary).map_err(proto)?;
    let fields = decode_fields(&mut r).map_err(proto)?;
    r.finish().map_err(proto)?;
    check_fields(peer, &fields, registry)?;
    Ok(IncomingMesh {
        sender: peer,
        mesh,
        environment,
        fields,
    })
}

/// Send `outgoing[dest]` to every destination and receive one sub-mesh from
/// every rank that `counts` says sends to us. The result is ordered by
/// sender rank.
pub fn exchange_submeshes<C: Communicator>(
    comm: &C,
    tags: &RedistributeTags,
    counts: &SendCounts,
    outgoing: &BTreeMap<usize, Bytes>,
    registry: &FieldRegistry,
) -> Result<Vec<IncomingMesh>, MeshError> {
    let me = comm.rank();
    for &dest in outgoing.keys() {
        if dest == me || counts.get(me, dest) == 0 {
            return Err(MeshError::InvalidTopology(format!(
                "sub-mesh for rank {dest} does not match the send-count matrix"
            )));
        }
    }
    let senders = counts.senders_to(me);
    let inbox = exchange_sized(comm, tags.mesh_sizes, tags.mesh_data, outgoing, &senders)?;
    let mut received = Vec::with_capacity(inbox.len());
    for (peer, data) in inbox {
        let incoming = decode_submesh(peer, data, registry)?;
        let expected = counts.get(peer, me) as usize;
        if incoming.mesh.n_cells() != expected {
            return Err(MeshError::protocol(
                peer,
                WireError::Length {
                    expected,
                    actual: incoming.mesh.n_cells(),
                },
            ));
        }
        log::debug!(
            "rank {me}: received {} cells, {} faces from rank {peer}",
            incoming.mesh.n_cells(),
            incoming.mesh.n_faces()
        );
        received.push(incoming);
    }
    Ok(received)
}
