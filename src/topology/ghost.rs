//! Owner-to-ghost value exchange.
//!
//! A [`GhostPlan`] is built once per partition. Each rank tells every owner
//! which natural indices it holds as ghosts; afterwards a refresh sends the
//! owned values down those links in one pairwise round, lower rank first.

use crate::algs::collective::{Collective, SyncPoint};
use crate::algs::communicator::Communicator;
use crate::pit_error::PitError;
use crate::topology::partition::MeshPartition;
use bytemuck::Pod;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PeerLinks {
    /// Owned local indices this rank sends, in the peer's request order.
    send: Vec<usize>,
    /// Ghost local indices refreshed from the peer, sorted by natural index.
    recv: Vec<usize>,
}

/// Exchange schedule between owners and ghost holders.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GhostPlan {
    len: usize,
    peers: BTreeMap<usize, PeerLinks>,
}

impl GhostPlan {
    /// Build the plan; collective over all ranks.
    pub fn build<C: Communicator>(
        mesh: &MeshPartition,
        coll: &Collective<'_, C>,
    ) -> Result<Self, PitError> {
        coll.record(SyncPoint::GhostPlan);
        let me = coll.rank();
        let size = coll.size();
        let tag = SyncPoint::GhostPlan.tag();

        let mut requests: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        let mut maybe_err = None;
        for i in 0..mesh.len() {
            let q = mesh.owner(i);
            if q == me {
                continue;
            }
            if q >= size {
                maybe_err.get_or_insert(PitError::InvalidMesh(format!(
                    "node {} is owned by rank {q}, but the world has {size} ranks",
                    mesh.natural(i)
                )));
                continue;
            }
            requests.entry(q).or_default().push((mesh.natural(i), i));
        }
        for list in requests.values_mut() {
            list.sort_unstable();
        }

        let lookup = mesh.natural_to_local();
        let mut peers = BTreeMap::new();
        // every pair talks, even with nothing to say, so ranks stay in step
        for q in (0..size).filter(|&q| q != me) {
            let wanted: Vec<u64> = requests
                .get(&q)
                .map(|v| v.iter().map(|&(g, _)| g as u64).collect())
                .unwrap_or_default();
            let asked = match coll.swap(q, tag, &wanted) {
                Ok(asked) => asked,
                Err(e) => {
                    maybe_err.get_or_insert(e);
                    continue;
                }
            };
            let mut links = PeerLinks {
                send: Vec::with_capacity(asked.len()),
                recv: requests
                    .get(&q)
                    .map(|v| v.iter().map(|&(_, l)| l).collect())
                    .unwrap_or_default(),
            };
            for g in asked {
                match lookup.get(&(g as usize)).copied().filter(|&l| mesh.is_owned(l)) {
                    Some(l) => links.send.push(l),
                    None => {
                        maybe_err.get_or_insert(PitError::InvalidMesh(format!(
                            "rank {q} expects rank {me} to own node {g}"
                        )));
                    }
                }
            }
            if !links.send.is_empty() || !links.recv.is_empty() {
                peers.insert(q, links);
            }
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(Self {
                len: mesh.len(),
                peers,
            }),
        }
    }

    /// Ranks this partition exchanges values with.
    pub fn neighbors(&self) -> impl Iterator<Item = usize> + '_ {
        self.peers.keys().copied()
    }

    /// Number of ghost entries refreshed by [`exchange`](Self::exchange).
    pub fn ghost_count(&self) -> usize {
        self.peers.values().map(|l| l.recv.len()).sum()
    }

    /// Overwrite every ghost entry of `values` with its owner's value.
    pub fn exchange<T: Pod, C: Communicator>(
        &self,
        coll: &Collective<'_, C>,
        point: SyncPoint,
        values: &mut [T],
    ) -> Result<(), PitError> {
        coll.record(point);
        let mut maybe_err = PitError::check_len("ghost exchange", self.len, values.len()).err();
        for (&q, links) in &self.peers {
            let out: Vec<T> = if maybe_err.is_none() {
                links.send.iter().map(|&i| values[i]).collect()
            } else {
                Vec::new()
            };
            match coll.swap(q, point.tag(), &out) {
                Ok(got) if maybe_err.is_none() => {
                    if got.len() != links.recv.len() {
                        maybe_err = Some(PitError::BufferSizeMismatch {
                            neighbor: q,
                            expected: links.recv.len() * std::mem::size_of::<T>(),
                            got: got.len() * std::mem::size_of::<T>(),
                        });
                        continue;
                    }
                    for (&i, v) in links.recv.iter().zip(got) {
                        values[i] = v;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    maybe_err.get_or_insert(e);
                }
            }
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};

    /// Two ranks sharing a square split along its diagonal ghosts.
    fn half(rank: usize) -> MeshPartition {
        // naturals: 0 (rank 0), 1 (rank 0), 2 (rank 1), 3 (rank 1)
        let (natural, owner) = if rank == 0 {
            (vec![0, 1, 2, 3], vec![0, 0, 1, 1])
        } else {
            (vec![2, 3, 0, 1], vec![1, 1, 0, 0])
        };
        MeshPartition::new(
            rank,
            natural,
            owner,
            vec![[0.0; 3]; 4],
            vec![vec![0, 1, 2], vec![1, 3, 2]],
            vec![true; 4],
        )
        .unwrap()
    }

    #[test]
    fn exchange_refreshes_ghosts_from_owners() {
        let comms = RayonComm::world(2);
        let out: Vec<Vec<f64>> = std::thread::scope(|s| {
            let hs: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let mesh = half(c.rank());
                        let coll = Collective::new(c);
                        let plan = GhostPlan::build(&mesh, &coll).unwrap();
                        assert_eq!(plan.ghost_count(), 2);
                        // owners write 10 * natural, ghosts start at -1
                        let mut v: Vec<f64> = (0..mesh.len())
                            .map(|i| {
                                if mesh.is_owned(i) {
                                    10.0 * mesh.natural(i) as f64
                                } else {
                                    -1.0
                                }
                            })
                            .collect();
                        plan.exchange(&coll, SyncPoint::FillExchange, &mut v).unwrap();
                        v
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out[0], vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(out[1], vec![20.0, 30.0, 0.0, 10.0]);
    }

    #[test]
    fn serial_plan_is_empty() {
        let mesh = MeshPartition::new(
            0,
            vec![0, 1, 2],
            vec![0; 3],
            vec![[0.0; 3]; 3],
            vec![vec![0, 1, 2]],
            vec![true; 3],
        )
        .unwrap();
        let comm = NoComm;
        let coll = Collective::new(&comm);
        let plan = GhostPlan::build(&mesh, &coll).unwrap();
        assert_eq!(plan.neighbors().count(), 0);
        let mut v = vec![1i64, 2, 3];
        plan.exchange(&coll, SyncPoint::WatershedExchange, &mut v).unwrap();
        assert_eq!(v, vec![1, 2, 3]);
        assert!(matches!(
            plan.exchange(&coll, SyncPoint::WatershedExchange, &mut v[..2]),
            Err(PitError::FieldLength { .. })
        ));
    }

    #[test]
    fn owner_outside_world_is_rejected() {
        let mesh = MeshPartition::new(
            0,
            vec![0, 1, 2],
            vec![0, 0, 3],
            vec![[0.0; 3]; 3],
            vec![vec![0, 1, 2]],
            vec![true; 3],
        )
        .unwrap();
        let comm = NoComm;
        let coll = Collective::new(&comm);
        assert!(matches!(
            GhostPlan::build(&mesh, &coll),
            Err(PitError::InvalidMesh(_))
        ));
    }
}
