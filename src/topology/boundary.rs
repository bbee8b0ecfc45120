//! Boundary classification for one mesh partition.
//!
//! Splits the local node set into the nodes this rank fills (`id_local`),
//! the ghost nodes that close straddling cells (`id_comm`) and the owned
//! nodes on the outer boundary of the global mesh (`id_gbounds`).

use crate::debug_invariants::DebugInvariants;
use crate::pit_error::PitError;
use crate::topology::partition::MeshPartition;

/// Classified node sets, all holding ascending local indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundarySets {
    /// Owned nodes.
    pub id_local: Vec<usize>,
    /// Ghost nodes of cells that mix owned and non-owned vertices.
    pub id_comm: Vec<usize>,
    /// Owned nodes on the global boundary.
    pub id_gbounds: Vec<usize>,
    /// `id_comm ∪ id_gbounds`: fixed boundary conditions of the local fill.
    pub id_lbounds: Vec<usize>,
    /// Per-node global-boundary flag.
    pub gbounds: Vec<bool>,
    /// Per-node membership of the local fill domain (`id_local ∪ id_comm`).
    pub in_domain: Vec<bool>,
    /// Per-node `id_comm` membership.
    pub is_comm: Vec<bool>,
}

/// Classify the nodes of `mesh`.
///
/// A node is a communication node when it is not owned and belongs to a
/// cell holding between one and `valence - 1` owned nodes.
pub fn classify(mesh: &MeshPartition) -> BoundarySets {
    let n = mesh.len();
    let owned: Vec<bool> = (0..n).map(|i| mesh.is_owned(i)).collect();

    let mut is_comm = vec![false; n];
    for cell in mesh.cells() {
        let k = cell.iter().filter(|&&v| owned[v]).count();
        if k >= 1 && k < cell.len() {
            for &v in cell.iter().filter(|&&v| !owned[v]) {
                is_comm[v] = true;
            }
        }
    }

    let gbounds: Vec<bool> = (0..n).map(|i| mesh.is_global_boundary(i)).collect();
    let id_local: Vec<usize> = (0..n).filter(|&i| owned[i]).collect();
    let id_comm: Vec<usize> = (0..n).filter(|&i| is_comm[i]).collect();
    let id_gbounds: Vec<usize> = id_local.iter().copied().filter(|&i| gbounds[i]).collect();
    let id_lbounds: Vec<usize> = (0..n)
        .filter(|&i| is_comm[i] || (owned[i] && gbounds[i]))
        .collect();
    let in_domain: Vec<bool> = (0..n).map(|i| owned[i] || is_comm[i]).collect();

    let sets = BoundarySets {
        id_local,
        id_comm,
        id_gbounds,
        id_lbounds,
        gbounds,
        in_domain,
        is_comm,
    };
    crate::debug_invariants!(sets.validate_invariants(), "boundary classification");
    sets
}

impl DebugInvariants for BoundarySets {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "BoundarySets");
    }

    fn validate_invariants(&self) -> Result<(), PitError> {
        if let Some(&g) = self
            .id_gbounds
            .iter()
            .find(|g| self.id_local.binary_search(g).is_err())
        {
            return Err(PitError::InvalidMesh(format!(
                "global boundary node {g} is not owned"
            )));
        }
        if let Some(&c) = self.id_comm.iter().find(|c| self.id_local.binary_search(c).is_ok()) {
            return Err(PitError::InvalidMesh(format!(
                "communication node {c} is owned locally"
            )));
        }
        Ok(())
    }
}
