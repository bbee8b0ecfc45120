//! Per-node kernels: the single-partition labelling and the volume/height
//! helpers that turn a solved depression graph back into node fields.
//!
//! All elevations handed to [`local_fill`] are datum-shifted. Region basins
//! and spill elevations are clamped at zero so that they can travel through
//! the sentinel reductions unchanged.

use crate::pit::graph_fill::{EXTERIOR, GraphEdge, GraphNode, SolvedGraph, flood};
use crate::topology::partition::Adjacency;
use hashbrown::HashMap;
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Marker of the exterior region. It sorts after every natural index and
/// still fits the signed wire encoding.
pub const EXTERIOR_MARKER: usize = i64::MAX as usize;

/// What seeded a local region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Global boundary and open-water nodes; always label 0.
    Exterior,
    /// Connected flat of owned nodes with no lower neighbour.
    Plateau,
    /// A communication node, identified by its local index.
    Boundary { node: usize },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Region {
    pub kind: RegionKind,
    pub basin: f64,
    /// Natural index naming the region.
    pub marker: usize,
}

/// Lowest connection between two local regions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalSpill {
    pub source: usize,
    pub target: usize,
    pub elevation: f64,
    /// Natural index of the spill node.
    pub node: usize,
}

/// Inputs of the single-partition flood, all indexed by local node.
#[derive(Clone, Copy, Debug)]
pub struct LocalFillInput<'a> {
    pub elevation: &'a [f64],
    pub natural: &'a [usize],
    pub adjacency: &'a Adjacency,
    /// Nodes taking part in the fill.
    pub domain: &'a [bool],
    /// Nodes draining straight out of the mesh.
    pub exterior: &'a [bool],
    /// Communication nodes, each seeding its own region.
    pub comm: &'a [usize],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalFill {
    /// Locally filled elevation, seeds treated as outlets.
    pub filled: Vec<f64>,
    /// Region label per node; `None` outside the domain.
    pub labels: Vec<Option<usize>>,
    /// Region table indexed by label; entry 0 is the exterior.
    pub regions: Vec<Region>,
    pub edges: Vec<LocalSpill>,
    /// Plateaus without an equal-height neighbour that drains them.
    pub depressions: usize,
}

#[inline]
fn lift(z: f64) -> f64 {
    z.max(0.0)
}

#[inline]
fn by_height(elevation: &[f64], natural: &[usize], a: usize, b: usize) -> Ordering {
    elevation[a]
        .total_cmp(&elevation[b])
        .then(natural[a].cmp(&natural[b]))
}

/// Steepest-descent labelling of one partition.
///
/// Every owned node with a lower neighbour takes the label of its lowest
/// neighbour (ties by natural index), so a node's label only depends on its
/// own neighbourhood. Owned nodes without a lower neighbour form plateaus
/// (labels `1..=k`, named by their smallest natural index). Exterior nodes
/// are label 0 and each communication node seeds a region above `k`. Every
/// pair of adjacent nodes with different labels proposes a spill edge at the
/// higher of the two elevations, and the lowest `(elevation, natural)`
/// proposal per label pair is kept.
pub fn local_fill(input: LocalFillInput<'_>) -> LocalFill {
    let LocalFillInput {
        elevation,
        natural,
        adjacency,
        domain,
        exterior,
        comm,
    } = input;
    let n = elevation.len();
    debug_assert_eq!(natural.len(), n);
    debug_assert_eq!(domain.len(), n);
    debug_assert_eq!(exterior.len(), n);
    debug_assert_eq!(adjacency.len(), n);

    let mut is_comm = vec![false; n];
    for &c in comm {
        is_comm[c] = true;
    }
    let plain = |i: usize| domain[i] && !exterior[i] && !is_comm[i];
    let receiver = |i: usize| {
        adjacency
            .neighbors(i)
            .iter()
            .copied()
            .filter(|&j| domain[j] && elevation[j] < elevation[i])
            .min_by(|&a, &b| by_height(elevation, natural, a, b))
    };

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut regions = vec![Region {
        kind: RegionKind::Exterior,
        basin: 0.0,
        marker: EXTERIOR_MARKER,
    }];
    for i in (0..n).filter(|&i| domain[i] && exterior[i]) {
        labels[i] = Some(EXTERIOR);
    }

    let mut start: Vec<usize> = (0..n).filter(|&i| plain(i) && receiver(i).is_none()).collect();
    start.sort_unstable_by_key(|&i| natural[i]);
    let mut depressions = 0;
    let mut queue = VecDeque::new();
    for s in start {
        if labels[s].is_some() {
            continue;
        }
        let label = regions.len();
        let z = elevation[s];
        let mut drains = false;
        labels[s] = Some(label);
        queue.push_back(s);
        while let Some(i) = queue.pop_front() {
            for &j in adjacency.neighbors(i) {
                if !domain[j] || is_comm[j] || elevation[j] != z || labels[j] == Some(label) {
                    continue;
                }
                if plain(j) && labels[j].is_none() && receiver(j).is_none() {
                    labels[j] = Some(label);
                    queue.push_back(j);
                } else {
                    drains = true;
                }
            }
        }
        regions.push(Region {
            kind: RegionKind::Plateau,
            basin: lift(z),
            marker: natural[s],
        });
        if !drains {
            depressions += 1;
        }
    }

    let mut comm_sorted = comm.to_vec();
    comm_sorted.sort_unstable_by_key(|&c| natural[c]);
    for c in comm_sorted {
        if labels[c].is_some() || !domain[c] {
            continue;
        }
        labels[c] = Some(regions.len());
        regions.push(Region {
            kind: RegionKind::Boundary { node: c },
            basin: lift(elevation[c]),
            marker: natural[c],
        });
    }

    let mut rest: Vec<usize> = (0..n).filter(|&i| plain(i) && labels[i].is_none()).collect();
    rest.sort_unstable_by(|&a, &b| by_height(elevation, natural, a, b));
    for i in rest {
        labels[i] = receiver(i).and_then(|r| labels[r]);
    }

    let mut best: HashMap<(usize, usize), (f64, usize)> = HashMap::new();
    for i in 0..n {
        let Some(li) = labels[i] else { continue };
        for &j in adjacency.neighbors(i) {
            let Some(lj) = labels[j].filter(|&lj| j > i && lj != li) else {
                continue;
            };
            let spill = lift(elevation[i].max(elevation[j]));
            let node = match elevation[i].total_cmp(&elevation[j]) {
                Ordering::Less => natural[j],
                Ordering::Greater => natural[i],
                Ordering::Equal => natural[i].min(natural[j]),
            };
            best.entry((li.min(lj), li.max(lj)))
                .and_modify(|cur| {
                    if spill.total_cmp(&cur.0).then(node.cmp(&cur.1)) == Ordering::Less {
                        *cur = (spill, node);
                    }
                })
                .or_insert((spill, node));
        }
    }

    let mut edges: Vec<LocalSpill> = best
        .into_iter()
        .map(|((source, target), (elevation, node))| LocalSpill {
            source,
            target,
            elevation,
            node,
        })
        .collect();
    edges.sort_unstable_by_key(|e| (e.source, e.target));

    // local fill level: outlets are the exterior and every communication region
    let nodes: Vec<Option<GraphNode>> = regions
        .iter()
        .map(|r| {
            Some(GraphNode {
                basin: r.basin,
                marker: r.marker,
            })
        })
        .collect();
    let graph_edges: Vec<GraphEdge> = edges
        .iter()
        .map(|e| GraphEdge {
            a: e.source,
            b: e.target,
            elevation: e.elevation,
            node: e.node,
        })
        .collect();
    let sources: Vec<(usize, f64)> = std::iter::once((EXTERIOR, 0.0))
        .chain(
            regions
                .iter()
                .enumerate()
                .filter(|(_, r)| matches!(r.kind, RegionKind::Boundary { .. }))
                .map(|(l, r)| (l, r.basin)),
        )
        .collect();
    let levels = flood(&nodes, &graph_edges, &sources).levels;
    let filled = (0..n)
        .map(|i| match labels[i] {
            Some(l) if l != EXTERIOR => elevation[i].max(levels[l]),
            _ => elevation[i],
        })
        .collect();

    LocalFill {
        filled,
        labels,
        regions,
        edges,
        depressions,
    }
}

/// Filled field, pit membership and per-pit partial sums of one rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DepressionFill {
    pub filled: Vec<f64>,
    pub pit: Vec<Option<usize>>,
    /// Σ area · (filled − elevation) over counted nodes, per pit.
    pub volume: Vec<f64>,
    /// Number of counted nodes per pit.
    pub node_count: Vec<f64>,
}

/// Materialise the solved graph on local nodes.
///
/// `label` holds the global label of each node whose label is known
/// (`None` for ghosts, which are refreshed from their owners). Only nodes
/// with `counted[i]` contribute to the per-pit sums.
pub fn fill_depression(
    elevation: &[f64],
    datum: f64,
    label: &[Option<usize>],
    solved: &SolvedGraph,
    area: &[f64],
    counted: &[bool],
) -> DepressionFill {
    let npits = solved.pits.len();
    let mut out = DepressionFill {
        filled: elevation.to_vec(),
        pit: vec![None; elevation.len()],
        volume: vec![0.0; npits],
        node_count: vec![0.0; npits],
    };
    for (i, &z) in elevation.iter().enumerate() {
        let Some(g) = label[i].filter(|&g| g != EXTERIOR) else {
            continue;
        };
        let (Some(&level), Some(&pit)) = (solved.levels.get(g), solved.label_pit.get(g)) else {
            continue;
        };
        if !(level > z - datum) {
            continue;
        }
        let filled = (level + datum).max(z);
        out.filled[i] = filled;
        out.pit[i] = pit;
        if let Some(p) = pit.filter(|_| counted[i]) {
            out.volume[p] += area[i] * (filled - z);
            out.node_count[p] += 1.0;
        }
    }
    out
}

/// Split deposits into per-pit sums (over counted nodes) and the residual
/// left on nodes outside every pit.
pub fn pit_volume(
    deposit: &[f64],
    pit: &[Option<usize>],
    counted: &[bool],
    npits: usize,
) -> (Vec<f64>, Vec<f64>) {
    let mut per_pit = vec![0.0; npits];
    let mut residual = vec![0.0; deposit.len()];
    for (i, &d) in deposit.iter().enumerate() {
        match pit[i] {
            Some(p) if p < npits => {
                if counted[i] {
                    per_pit[p] += d;
                }
            }
            _ => residual[i] = d,
        }
    }
    (per_pit, residual)
}

/// Raise pit nodes by the fraction of capacity each pit retains.
///
/// Returns the new elevation, the sediment each pit could not hold and the
/// number of counted nodes per pit. A pit filled to capacity takes its
/// filled elevation exactly.
pub fn pit_height(
    elevation: &[f64],
    filled: &[f64],
    pit: &[Option<usize>],
    capacity: &[f64],
    deposited: &[f64],
    counted: &[bool],
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let npits = capacity.len();
    let fraction: Vec<f64> = capacity
        .iter()
        .zip(deposited)
        .map(|(&cap, &dep)| if cap > 0.0 { (dep / cap).min(1.0) } else { 1.0 })
        .collect();
    let remaining: Vec<f64> = capacity
        .iter()
        .zip(deposited)
        .map(|(&cap, &dep)| (dep - cap).max(0.0))
        .collect();
    let mut count = vec![0.0; npits];
    let new_elevation = elevation
        .iter()
        .enumerate()
        .map(|(i, &z)| match pit[i] {
            Some(p) if p < npits => {
                if counted[i] {
                    count[p] += 1.0;
                }
                if fraction[p] >= 1.0 {
                    filled[i]
                } else {
                    z + fraction[p] * (filled[i] - z)
                }
            }
            _ => z,
        })
        .collect();
    (new_elevation, remaining, count)
}

/// Spread each pit's excess evenly over its nodes.
pub fn add_excess(excess: &[f64], pit: &[Option<usize>], node_count: &[f64]) -> Vec<f64> {
    pit.iter()
        .map(|p| match *p {
            Some(p) if p < excess.len() && node_count[p] > 0.0 => excess[p] / node_count[p],
            _ => 0.0,
        })
        .collect()
}
