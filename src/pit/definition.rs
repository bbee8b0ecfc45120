//! Distribution of the solved graph and the per-step depression table.

use crate::algs::collective::{Collective, SyncPoint};
use crate::algs::communicator::Communicator;
use crate::algs::wire::{MaxMerge, WireNodeFill, WireSpillOwner};
use crate::pit::graph_fill::{PitSolution, SolvedGraph};
use crate::pit::kernels::{DepressionFill, fill_depression};
use crate::pit_error::PitError;
use crate::topology::ghost::GhostPlan;
use crate::topology::partition::MeshPartition;
use hashbrown::HashMap;
use serde::Serialize;

/// One resolved depression. Elevations are in model units.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DepressionRecord {
    /// Position in fill order; downstream pits have smaller ids.
    pub id: usize,
    /// Fill elevation.
    pub elevation: f64,
    /// Natural index of the spill node (`None` for terminal sinks).
    pub spill_natural: Option<usize>,
    /// Rank owning the spill node.
    pub spill_rank: Option<usize>,
    /// Local index of the spill node on `spill_rank`.
    pub spill_node: Option<usize>,
    pub spill_elevation: Option<f64>,
    /// Volume capacity: Σ area · (filled − elevation) over the pit's nodes.
    pub volume: f64,
    pub node_count: usize,
    /// Pit receiving the overflow.
    pub target: Option<usize>,
}

/// Depressions of one step, indexed by id.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DepressionTable {
    pub records: Vec<DepressionRecord>,
}

impl DepressionTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DepressionRecord> {
        self.records.iter()
    }

    pub fn get(&self, id: usize) -> Option<&DepressionRecord> {
        self.records.get(id)
    }

    pub fn total_volume(&self) -> f64 {
        self.records.iter().map(|r| r.volume).sum()
    }
}

/// Collective: ship the root's solution to every rank.
///
/// The root passes `Some` (its solve result); a failed solve is broadcast as
/// a failure marker so every rank leaves the step with an error together.
pub fn broadcast_solution<C: Communicator>(
    coll: &Collective<'_, C>,
    root_outcome: Option<Result<SolvedGraph, PitError>>,
) -> Result<SolvedGraph, PitError> {
    let mut root_err = None;
    let bytes = match root_outcome {
        Some(Ok(solved)) => solved.to_bytes(),
        Some(Err(e)) => {
            log::error!("depression graph solve failed on root: {e}");
            root_err = Some(e);
            SolvedGraph::failure_bytes()
        }
        None => Vec::new(),
    };
    let bytes = coll.broadcast(SyncPoint::SolvedGraph, 0, &bytes)?;
    if let Some(e) = root_err {
        return Err(e);
    }
    SolvedGraph::from_bytes(&bytes)
}

/// Owner of a pit's spill node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpillOwner {
    pub rank: Option<usize>,
    pub local: Option<usize>,
    pub on_boundary: bool,
}

/// Collective: find the rank, local index and boundary flag of every
/// pit's spill node.
pub fn resolve_spill_owners<C: Communicator>(
    coll: &Collective<'_, C>,
    mesh: &MeshPartition,
    lookup: &HashMap<usize, usize>,
    pits: &[PitSolution],
) -> Result<Vec<SpillOwner>, PitError> {
    let rows: Vec<WireSpillOwner> = pits
        .iter()
        .map(|p| {
            p.spill
                .and_then(|s| lookup.get(&s.node).copied())
                .filter(|&l| mesh.is_owned(l))
                .map_or_else(WireSpillOwner::sentinel, |l| {
                    WireSpillOwner::new(mesh.rank(), l, mesh.is_global_boundary(l))
                })
        })
        .collect();
    let rows = coll.allreduce(SyncPoint::SpillOwners, &rows, WireSpillOwner::merge_max)?;
    Ok(rows
        .iter()
        .map(|w| SpillOwner {
            rank: w.rank(),
            local: w.local(),
            on_boundary: w.on_boundary(),
        })
        .collect())
}

/// Cut the downstream link of pits that drain off the mesh.
///
/// A pit whose spill node lies on the global boundary, and whose spill
/// elevation equals the level of the pit it would flow into, drains off the
/// map instead. Pits are visited in id order. Returns the number of links
/// cut.
///
/// Solutions built from a mesh never need the cut: an owned global-boundary
/// node is always exterior, so a spill over one already leads out of the
/// mesh. The pass guards solutions assembled elsewhere.
pub fn sever_boundary_spills(pits: &mut [PitSolution], spill_on_boundary: &[bool]) -> usize {
    let mut severed = 0;
    for id in 0..pits.len() {
        if !spill_on_boundary.get(id).copied().unwrap_or(false) {
            continue;
        }
        let (Some(spill), Some(target)) = (pits[id].spill, pits[id].target) else {
            continue;
        };
        if pits.get(target).is_some_and(|t| t.level == spill.elevation) {
            pits[id].target = None;
            severed += 1;
        }
    }
    severed
}

/// Node fields and depression table of one step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PitDefinition {
    pub filled: Vec<f64>,
    pub pit: Vec<Option<usize>>,
    pub table: DepressionTable,
}

/// Inputs of [`define_pits`], all indexed by local node.
pub struct PitFields<'a> {
    pub elevation: &'a [f64],
    /// Global label of owned nodes; `None` on ghosts.
    pub label: &'a [Option<usize>],
    pub area: &'a [f64],
    pub datum: f64,
}

/// Collective: materialise filled elevation, pit membership and the
/// depression table on every rank.
pub fn define_pits<C: Communicator>(
    coll: &Collective<'_, C>,
    ghosts: &GhostPlan,
    mesh: &MeshPartition,
    fields: PitFields<'_>,
    solved: &SolvedGraph,
    owners: &[SpillOwner],
) -> Result<PitDefinition, PitError> {
    let owned: Vec<bool> = (0..mesh.len()).map(|i| mesh.is_owned(i)).collect();
    let DepressionFill {
        filled,
        pit,
        volume,
        node_count,
    } = fill_depression(
        fields.elevation,
        fields.datum,
        fields.label,
        solved,
        fields.area,
        &owned,
    );

    let npits = solved.pits.len();
    let partial: Vec<f64> = volume.into_iter().chain(node_count).collect();
    let sums = coll.allreduce_sum_f64(SyncPoint::PitVolumes, &partial)?;

    let mut nodes: Vec<WireNodeFill> = filled
        .iter()
        .zip(&pit)
        .map(|(&f, &p)| WireNodeFill::new(f, p))
        .collect();
    ghosts.exchange(coll, SyncPoint::FillExchange, &mut nodes)?;

    let records = solved
        .pits
        .iter()
        .enumerate()
        .map(|(id, p)| {
            let owner = owners.get(id).copied().unwrap_or_default();
            DepressionRecord {
                id,
                elevation: p.level + fields.datum,
                spill_natural: p.spill.map(|s| s.node),
                spill_rank: owner.rank,
                spill_node: owner.local,
                spill_elevation: p.spill.map(|s| s.elevation + fields.datum),
                volume: sums[id],
                node_count: sums[npits + id].round() as usize,
                target: p.target,
            }
        })
        .collect();

    Ok(PitDefinition {
        filled: nodes.iter().map(WireNodeFill::filled).collect(),
        pit: nodes.iter().map(WireNodeFill::pit).collect(),
        table: DepressionTable { records },
    })
}
