//! Collectives built from point-to-point messages.
//!
//! There is no coordinator: every rank sends its contribution to every other
//! rank and reduces locally, so all ranks compute identical results. Every
//! function posts all sends before waiting on any receive and drains every
//! handle before returning, even on error.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, expect_exact_len};
use crate::mesh_error::MeshError;
use bytes::Bytes;
use std::collections::BTreeMap;

fn drain<H: Wait>(handles: Vec<H>) {
    for h in handles {
        let _ = h.wait();
    }
}

/// Receive result of one peer, mapped onto the crate error type.
fn received(peer: usize, data: Option<Vec<u8>>) -> Result<Vec<u8>, MeshError> {
    data.ok_or_else(|| {
        log::warn!("no message from rank {peer}: communicator aborted");
        MeshError::Aborted
    })
}

/// Every rank contributes `row`; returns all rows indexed by rank.
///
/// Rows must have the same length on every rank.
pub fn all_gather_u64<C: Communicator>(
    comm: &C,
    tag: CommTag,
    row: &[u64],
) -> Result<Vec<Vec<u64>>, MeshError> {
    let (me, n) = (comm.rank(), comm.size());
    let le: Vec<u64> = row.iter().map(|v| v.to_le()).collect();
    let bytes = cast_slice(&le);

    let mut recvs = Vec::with_capacity(n.saturating_sub(1));
    let mut scratch = vec![0u8; bytes.len()];
    for peer in (0..n).filter(|&p| p != me) {
        recvs.push((peer, comm.irecv(peer, tag.as_u16(), &mut scratch)));
    }
    let sends: Vec<_> = (0..n)
        .filter(|&p| p != me)
        .map(|peer| comm.isend(peer, tag.as_u16(), bytes))
        .collect();

    let mut rows = vec![Vec::new(); n];
    rows[me] = row.to_vec();
    let mut maybe_err = None;
    for (peer, h) in recvs {
        let data = h.wait();
        if maybe_err.is_some() {
            continue;
        }
        let decoded = received(peer, data).and_then(|d| {
            expect_exact_len(d.len(), bytes.len()).map_err(|e| MeshError::protocol(peer, e))?;
            Ok(d.chunks_exact(8)
                .map(|c| {
                    let mut w = [0u8; 8];
                    w.copy_from_slice(c);
                    u64::from_le_bytes(w)
                })
                .collect::<Vec<_>>())
        });
        match decoded {
            Ok(r) => rows[peer] = r,
            Err(e) => maybe_err = Some(e),
        }
    }
    drain(sends);
    match maybe_err {
        Some(e) => Err(e),
        None => Ok(rows),
    }
}

/// Maximum of `value` over all ranks.
pub fn all_reduce_max_f64<C: Communicator>(
    comm: &C,
    tag: CommTag,
    value: f64,
) -> Result<f64, MeshError> {
    let rows = all_gather_u64(comm, tag, &[value.to_bits()])?;
    Ok(rows
        .iter()
        .filter_map(|r| r.first())
        .map(|&b| f64::from_bits(b))
        .fold(f64::NEG_INFINITY, f64::max))
}

/// Stage 1: exchange payload byte counts with the given peers.
///
/// Sends the length of `outgoing[peer]` to every key of `outgoing`, and
/// expects one count from every rank in `incoming_from`.
pub fn exchange_sizes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    outgoing: &BTreeMap<usize, Bytes>,
    incoming_from: &[usize],
) -> Result<BTreeMap<usize, usize>, MeshError> {
    let mut recvs = Vec::with_capacity(incoming_from.len());
    for &peer in incoming_from {
        let mut cnt = [0u8; std::mem::size_of::<WireCount>()];
        recvs.push((peer, comm.irecv(peer, tag.as_u16(), &mut cnt)));
    }
    let mut sends = Vec::with_capacity(outgoing.len());
    for (&peer, payload) in outgoing {
        let count = WireCount::new(payload.len());
        sends.push(comm.isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&count))));
    }

    let mut sizes = BTreeMap::new();
    let mut maybe_err = None;
    for (peer, h) in recvs {
        let data = h.wait();
        if maybe_err.is_some() {
            continue;
        }
        match received(peer, data)
            .and_then(|d| WireCount::decode(&d).map_err(|e| MeshError::protocol(peer, e)))
        {
            Ok(n) => {
                sizes.insert(peer, n);
            }
            Err(e) => maybe_err = Some(e),
        }
    }
    drain(sends);
    match maybe_err {
        Some(e) => Err(e),
        None => Ok(sizes),
    }
}

/// Stage 2: send the payloads and receive exactly the announced sizes.
pub fn exchange_payloads<C: Communicator>(
    comm: &C,
    tag: CommTag,
    outgoing: &BTreeMap<usize, Bytes>,
    sizes: &BTreeMap<usize, usize>,
) -> Result<BTreeMap<usize, Bytes>, MeshError> {
    let mut recvs = Vec::with_capacity(sizes.len());
    for (&peer, &n) in sizes {
        let mut buf = vec![0u8; n];
        recvs.push((peer, n, comm.irecv(peer, tag.as_u16(), &mut buf)));
    }
    let sends: Vec<_> = outgoing
        .iter()
        .map(|(&peer, payload)| comm.isend(peer, tag.as_u16(), payload))
        .collect();

    let mut inbox = BTreeMap::new();
    let mut maybe_err = None;
    for (peer, n, h) in recvs {
        let data = h.wait();
        if maybe_err.is_some() {
            continue;
        }
        let checked = received(peer, data).and_then(|d| {
            expect_exact_len(d.len(), n).map_err(|e| MeshError::protocol(peer, e))?;
            Ok(d)
        });
        match checked {
            Ok(d) => {
                inbox.insert(peer, Bytes::from(d));
            }
            Err(e) => maybe_err = Some(e),
        }
    }
    drain(sends);
    match maybe_err {
        Some(e) => Err(e),
        None => Ok(inbox),
    }
}

/// Size exchange followed by payload exchange on consecutive tags.
pub fn exchange_sized<C: Communicator>(
    comm: &C,
    size_tag: CommTag,
    data_tag: CommTag,
    outgoing: &BTreeMap<usize, Bytes>,
    incoming_from: &[usize],
) -> Result<BTreeMap<usize, Bytes>, MeshError> {
    let sizes = exchange_sizes(comm, size_tag, outgoing, incoming_from)?;
    exchange_payloads(comm, data_tag, outgoing, &sizes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    #[test]
    fn single_rank_gather_is_local() {
        let rows = all_gather_u64(&NoComm, CommTag::new(1), &[5, 6]).unwrap();
        assert_eq!(rows, vec![vec![5, 6]]);
        assert_eq!(all_reduce_max_f64(&NoComm, CommTag::new(2), 1.5).unwrap(), 1.5);
    }

    #[test]
    fn three_rank_gather_and_max() {
        let world = RayonComm::world(3);
        let out: Vec<_> = std::thread::scope(|s| {
            let hs: Vec<_> = world
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let r = c.rank() as u64;
                        let rows = all_gather_u64(c, CommTag::new(10), &[r, r * 10]).unwrap();
                        let max = all_reduce_max_f64(c, CommTag::new(11), r as f64 * 0.5).unwrap();
                        (rows, max)
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (rows, max) in out {
            assert_eq!(rows, vec![vec![0, 0], vec![1, 10], vec![2, 20]]);
            assert_eq!(max, 1.0);
        }
    }

    #[test]
    fn sized_exchange_between_two_ranks() {
        let world = RayonComm::world(2);
        let got: Vec<_> = std::thread::scope(|s| {
            let hs: Vec<_> = world
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let peer = 1 - c.rank();
                        let mut out = BTreeMap::new();
                        out.insert(peer, Bytes::from(vec![c.rank() as u8; 3 + c.rank()]));
                        exchange_sized(c, CommTag::new(20), CommTag::new(21), &out, &[peer])
                            .unwrap()
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(got[0][&1].as_ref(), &[1u8, 1, 1, 1]);
        assert_eq!(got[1][&0].as_ref(), &[0u8, 0, 0]);
    }

    #[test]
    fn short_gather_row_is_a_protocol_error() {
        let world = RayonComm::world(2);
        world[1].isend(0, 30, &[1, 2, 3]);
        let err = all_gather_u64(&world[0], CommTag::new(30), &[1]).unwrap_err();
        assert!(matches!(err, MeshError::Protocol { peer: 1, .. }));
    }
}
