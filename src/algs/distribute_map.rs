//! Old→new transfer plan of one redistribution round, reusable for side data.
//!
//! For each entity kind, `sub_map[p]` lists the old local indices sent to
//! process `p` (including this process), and `construct_map[p][i]` is the new
//! local index of the `i`-th entity received from `p`. Merged entities appear
//! in more than one construct list; the first writer in chunk order (this
//! process, then senders by ascending rank) wins, like field assembly.

use crate::algs::collective::exchange_sized;
use crate::algs::communicator::{Communicator, RedistributeTags};
use crate::algs::wire::{WireReader, WireWriter, cast_slice, expect_exact_len, kind};
use crate::data::field::EntityKind;
use crate::mesh_error::MeshError;
use bytemuck::Pod;
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistributeMap {
    n_old: usize,
    n_new: usize,
    sub_map: Vec<Vec<usize>>,
    construct_map: Vec<Vec<usize>>,
}

impl DistributeMap {
    /// Build a map; every index must be in range.
    pub fn new(
        n_old: usize,
        n_new: usize,
        sub_map: Vec<Vec<usize>>,
        construct_map: Vec<Vec<usize>>,
    ) -> Result<Self, MeshError> {
        if sub_map.len() != construct_map.len() {
            return Err(MeshError::InvalidTopology(format!(
                "{} send lists but {} receive lists",
                sub_map.len(),
                construct_map.len()
            )));
        }
        if let Some(&bad) = sub_map.iter().flatten().find(|&&i| i >= n_old) {
            return Err(MeshError::InvalidTopology(format!(
                "send index {bad} out of range ({n_old})"
            )));
        }
        if let Some(&bad) = construct_map.iter().flatten().find(|&&i| i >= n_new) {
            return Err(MeshError::InvalidTopology(format!(
                "receive index {bad} out of range ({n_new})"
            )));
        }
        Ok(Self {
            n_old,
            n_new,
            sub_map,
            construct_map,
        })
    }

    /// Nothing moves: one process keeps all `n` entities in place.
    pub fn identity(n: usize, n_ranks: usize, me: usize) -> Self {
        let mut sub_map = vec![Vec::new(); n_ranks];
        let mut construct_map = vec![Vec::new(); n_ranks];
        sub_map[me] = (0..n).collect();
        construct_map[me] = (0..n).collect();
        Self {
            n_old: n,
            n_new: n,
            sub_map,
            construct_map,
        }
    }

    pub fn n_old(&self) -> usize {
        self.n_old
    }

    pub fn n_new(&self) -> usize {
        self.n_new
    }

    pub fn sub_map(&self) -> &[Vec<usize>] {
        &self.sub_map
    }

    pub fn construct_map(&self) -> &[Vec<usize>] {
        &self.construct_map
    }

    /// Old indices sent to `proc`.
    pub fn sent_to(&self, proc: usize) -> &[usize] {
        &self.sub_map[proc]
    }

    /// New indices of what was received from `proc`.
    pub fn received_from(&self, proc: usize) -> &[usize] {
        &self.construct_map[proc]
    }

    /// Move per-entity values of type `T` from the old to the new layout.
    /// Collective over the processes this map exchanges with.
    pub fn distribute_pod<T: Pod, C: Communicator>(
        &self,
        comm: &C,
        tags: &RedistributeTags,
        values: &[T],
    ) -> Result<Vec<T>, MeshError> {
        let me = comm.rank();
        if values.len() != self.n_old {
            return Err(MeshError::Field {
                name: std::any::type_name::<T>().to_owned(),
                reason: format!("{} values for {} entities", values.len(), self.n_old),
            });
        }

        let mut outgoing = BTreeMap::new();
        for (p, idx) in self.sub_map.iter().enumerate() {
            if p == me || idx.is_empty() {
                continue;
            }
            let picked: Vec<T> = idx.iter().map(|&i| values[i]).collect();
            let mut w = WireWriter::new(kind::SIDE_DATA);
            w.put_bytes(cast_slice(&picked));
            outgoing.insert(p, w.finish());
        }
        let senders: Vec<usize> = (0..self.construct_map.len())
            .filter(|&p| p != me && !self.construct_map[p].is_empty())
            .collect();
        let inbox =
            exchange_sized(comm, tags.side_data_sizes, tags.side_data, &outgoing, &senders)?;

        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); self.n_new];
        let mut written = vec![false; self.n_new];
        let mut write = |targets: &[usize], chunk: &mut dyn Iterator<Item = T>| {
            for (&n, v) in targets.iter().zip(chunk) {
                if !written[n] {
                    out[n] = v;
                    written[n] = true;
                }
            }
        };

        let own = &self.sub_map[me];
        write(&self.construct_map[me], &mut own.iter().map(|&i| values[i]));
        for (peer, data) in inbox {
            let decoded = decode_chunk::<T>(data, self.construct_map[peer].len())
                .map_err(|e| MeshError::protocol(peer, e))?;
            write(&self.construct_map[peer], &mut decoded.into_iter());
        }
        Ok(out)
    }
}

fn decode_chunk<T: Pod>(data: Bytes, n: usize) -> Result<Vec<T>, crate::mesh_error::WireError> {
    let mut r = WireReader::new(data, kind::SIDE_DATA)?;
    let raw = r.get_bytes("side data")?;
    r.finish()?;
    let size = std::mem::size_of::<T>();
    expect_exact_len(raw.len(), n * size)?;
    Ok(raw
        .chunks_exact(size.max(1))
        .take(n)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

/// Transfer plans for points, faces and cells.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedistributeMap {
    pub points: DistributeMap,
    pub faces: DistributeMap,
    pub cells: DistributeMap,
}

impl RedistributeMap {
    pub fn get(&self, kind: EntityKind) -> &DistributeMap {
        match kind {
            EntityKind::Point => &self.points,
            EntityKind::Face => &self.faces,
            EntityKind::Cell => &self.cells,
        }
    }

    /// [`DistributeMap::distribute_pod`] for the map of `kind`.
    pub fn distribute_pod<T: Pod, C: Communicator>(
        &self,
        kind: EntityKind,
        comm: &C,
        tags: &RedistributeTags,
        values: &[T],
    ) -> Result<Vec<T>, MeshError> {
        self.get(kind).distribute_pod(comm, tags, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{CommTag, NoComm, RayonComm};

    #[test]
    fn identity_moves_nothing() {
        let m = DistributeMap::identity(3, 1, 0);
        let tags = RedistributeTags::from_base(CommTag::new(50));
        let out = m.distribute_pod(&NoComm, &tags, &[1.0f64, 2.0, 3.0]).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        assert!(DistributeMap::new(2, 2, vec![vec![0, 2]], vec![vec![0, 1]]).is_err());
        assert!(DistributeMap::new(2, 1, vec![vec![0, 1]], vec![vec![0, 1]]).is_err());
    }

    #[test]
    fn two_ranks_swap_and_merge() {
        // rank 0 keeps entity 1 and sends entity 0 to rank 1; rank 1 keeps
        // its single entity and receives one that merges with it.
        let maps = [
            DistributeMap::new(2, 1, vec![vec![1], vec![0]], vec![vec![0], vec![]]).unwrap(),
            DistributeMap::new(1, 1, vec![vec![], vec![0]], vec![vec![0], vec![0]]).unwrap(),
        ];
        let inputs = [vec![10u32, 11], vec![20u32]];
        let world = RayonComm::world(2);
        let tags = RedistributeTags::from_base(CommTag::new(60));
        let out: Vec<Vec<u32>> = std::thread::scope(|s| {
            let hs: Vec<_> = world
                .iter()
                .map(|c| {
                    let (m, v, tags) = (&maps[c.rank()], &inputs[c.rank()], &tags);
                    s.spawn(move || m.distribute_pod(c, tags, v).unwrap())
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out[0], vec![11]);
        // own value first
        assert_eq!(out[1], vec![20]);
    }
}
