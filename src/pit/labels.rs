//! Global watershed label allocation.
//!
//! Rank `r` reserves `count_r = max(1, local labels) + 1` ids starting at
//! `offset_r = Σ_{i<r} count_i`. The first id of every range is never handed
//! out, which makes global id 0 on rank 0 free to stand for the exterior.

use crate::algs::collective::{Collective, SyncPoint};
use crate::algs::communicator::Communicator;
use crate::pit::graph_fill::EXTERIOR;
use crate::pit_error::PitError;

/// Label ranges of every rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelOffsets {
    rank: usize,
    counts: Vec<u64>,
    offsets: Vec<u64>,
}

impl LabelOffsets {
    /// Ids reserved by a rank with `local_labels` non-exterior labels.
    pub fn local_count(local_labels: usize) -> u64 {
        local_labels.max(1) as u64 + 1
    }

    /// Collective: agree on every rank's range.
    pub fn allocate<C: Communicator>(
        coll: &Collective<'_, C>,
        local_labels: usize,
    ) -> Result<Self, PitError> {
        let mut slots = vec![0i64; coll.size()];
        slots[coll.rank()] = Self::local_count(local_labels) as i64;
        let counts = coll.allreduce_max_i64(SyncPoint::LabelCounts, &slots)?;
        Ok(Self::from_counts(
            coll.rank(),
            counts.into_iter().map(|c| c.max(1) as u64).collect(),
        ))
    }

    /// Build from already agreed counts.
    pub fn from_counts(rank: usize, counts: Vec<u64>) -> Self {
        let offsets = counts
            .iter()
            .scan(0u64, |acc, &c| {
                let start = *acc;
                *acc += c;
                Some(start)
            })
            .collect();
        Self {
            rank,
            counts,
            offsets,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offsets[self.rank]
    }

    /// Size of the global label space.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Global id of a local label; the exterior is shared by every rank.
    pub fn global(&self, local: usize) -> u64 {
        if local == EXTERIOR {
            EXTERIOR as u64
        } else {
            self.offset() + local as u64
        }
    }

    /// Rank whose range contains `global`.
    pub fn owner_of(&self, global: u64) -> Option<usize> {
        if global >= self.total() {
            return None;
        }
        Some(self.offsets.partition_point(|&o| o <= global) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn ranges_are_disjoint_and_increasing() {
        let counts: Vec<u64> = [0usize, 3, 1, 7]
            .iter()
            .map(|&k| LabelOffsets::local_count(k))
            .collect();
        assert_eq!(counts, vec![2, 4, 2, 8]);
        let ranks: Vec<LabelOffsets> = (0..4)
            .map(|r| LabelOffsets::from_counts(r, counts.clone()))
            .collect();
        assert_eq!(
            ranks.iter().map(LabelOffsets::offset).collect::<Vec<_>>(),
            vec![0, 2, 6, 8]
        );
        // last local label of rank 1 and first of rank 2 never collide
        assert_eq!(ranks[1].global(3), 5);
        assert_eq!(ranks[2].global(1), 7);
        assert_eq!(ranks[3].global(0), 0);
        assert_eq!(ranks[0].owner_of(5), Some(1));
        assert_eq!(ranks[0].owner_of(16), None);
    }

    #[test]
    fn serial_allocation_starts_at_zero() {
        let comm = NoComm;
        let coll = Collective::new(&comm);
        let offsets = LabelOffsets::allocate(&coll, 4).unwrap();
        assert_eq!(offsets.offset(), 0);
        assert_eq!(offsets.total(), 5);
        assert_eq!(offsets.global(4), 4);
    }
}
