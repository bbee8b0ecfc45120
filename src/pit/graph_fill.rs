//! Priority flood over the depression graph.
//!
//! Vertices are watershed labels, edges are spill connections. The flood
//! starts at the outlets and always expands the lowest `(level, spill node,
//! marker, parent marker)` entry, so every label is resolved at the lowest
//! level at which water leaving it can reach an outlet. Label numbers never
//! decide the order; only elevations and natural indices do. Labels no
//! outlet can reach are sealed as terminal sinks, lowest basin first.

use crate::algs::wire::{
    KIND_SOLVE_FAILED, KIND_SOLVED_GRAPH, WIRE_VERSION, WireGraphSizes, WireHdr, WirePit,
    WireSolvedLabel, cast_slice, records_from_bytes,
};
use crate::debug_invariants::DebugInvariants;
use crate::pit_error::PitError;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::mem::size_of;

/// Label reserved for everything that drains out of the mesh.
pub const EXTERIOR: usize = 0;

/// A vertex of the depression graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GraphNode {
    /// Lowest elevation inside the region.
    pub basin: f64,
    /// Natural index of the node that names the region.
    pub marker: usize,
}

/// Undirected spill connection between labels `a` and `b`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GraphEdge {
    pub a: usize,
    pub b: usize,
    pub elevation: f64,
    /// Natural index of the spill node.
    pub node: usize,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    level: f64,
    node: usize,
    marker: usize,
    via: Option<usize>,
    label: usize,
    parent: Option<(usize, usize)>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.level
            .total_cmp(&other.level)
            .then(self.node.cmp(&other.node))
            .then(self.marker.cmp(&other.marker))
            .then(self.via.cmp(&other.via))
            .then(self.label.cmp(&other.label))
    }
}

/// Raw flood result: level, parent `(label, edge)` and pop order.
#[derive(Clone, Debug, Default)]
pub(crate) struct Flood {
    pub levels: Vec<f64>,
    pub parent: Vec<Option<(usize, usize)>>,
    pub order: Vec<usize>,
}

/// Flood `nodes` from `sources` (label, level). Unused label slots are `None`
/// and keep a NaN level.
pub(crate) fn flood(
    nodes: &[Option<GraphNode>],
    edges: &[GraphEdge],
    sources: &[(usize, f64)],
) -> Flood {
    let n = nodes.len();
    let mut adj: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    for (k, e) in edges.iter().enumerate() {
        if e.a < n && e.b < n && e.a != e.b {
            adj[e.a].push((e.b, k));
            adj[e.b].push((e.a, k));
        }
    }

    let mut sinks: Vec<usize> = (0..n).filter(|&l| nodes[l].is_some()).collect();
    sinks.sort_by(|&x, &y| {
        let (gx, gy) = (nodes[x], nodes[y]);
        let (bx, mx) = gx.map_or((f64::NAN, 0), |g| (g.basin, g.marker));
        let (by, my) = gy.map_or((f64::NAN, 0), |g| (g.basin, g.marker));
        bx.total_cmp(&by).then(mx.cmp(&my)).then(x.cmp(&y))
    });
    let mut next_sink = sinks.into_iter();

    let mut out = Flood {
        levels: vec![f64::NAN; n],
        parent: vec![None; n],
        order: Vec::with_capacity(n),
    };
    let mut resolved = vec![false; n];
    let mut heap = BinaryHeap::new();
    for &(label, level) in sources {
        if let Some(g) = nodes.get(label).copied().flatten() {
            heap.push(Reverse(Entry {
                level,
                node: g.marker,
                marker: g.marker,
                via: None,
                label,
                parent: None,
            }));
        }
    }

    loop {
        while let Some(Reverse(e)) = heap.pop() {
            if resolved[e.label] {
                continue;
            }
            resolved[e.label] = true;
            let via = nodes[e.label].map(|g| g.marker);
            out.levels[e.label] = e.level;
            out.parent[e.label] = e.parent;
            out.order.push(e.label);
            for &(m, k) in &adj[e.label] {
                let Some(g) = nodes[m] else { continue };
                if resolved[m] {
                    continue;
                }
                let edge = &edges[k];
                heap.push(Reverse(Entry {
                    level: e.level.max(edge.elevation).max(g.basin),
                    node: edge.node,
                    marker: g.marker,
                    via,
                    label: m,
                    parent: Some((e.label, k)),
                }));
            }
        }
        // seal the lowest basin nothing has reached yet
        match next_sink.by_ref().find(|&l| !resolved[l]) {
            Some(l) => {
                if let Some(g) = nodes[l] {
                    heap.push(Reverse(Entry {
                        level: g.basin,
                        node: g.marker,
                        marker: g.marker,
                        via: None,
                        label: l,
                        parent: None,
                    }));
                }
            }
            None => break,
        }
    }
    out
}

/// Where a pit overflows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpillPoint {
    /// Natural index of the spill node.
    pub node: usize,
    pub elevation: f64,
}

/// One resolved depression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PitSolution {
    /// Fill level (datum-shifted).
    pub level: f64,
    /// `None` for terminal sinks.
    pub spill: Option<SpillPoint>,
    /// Pit receiving the overflow; `None` when it leaves the mesh or the pit
    /// is a terminal sink.
    pub target: Option<usize>,
}

/// Result of the graph flood, shared by every rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SolvedGraph {
    /// Fill level per label; NaN for unused slots.
    pub levels: Vec<f64>,
    /// Pit id per label, `None` if the label is not flooded.
    pub label_pit: Vec<Option<usize>>,
    /// Pits in fill order; a pit's target always has a smaller id.
    pub pits: Vec<PitSolution>,
}

/// Disjoint sets whose representative is always the smallest member.
pub(crate) struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub(crate) fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

fn is_flooded(nodes: &[Option<GraphNode>], levels: &[f64], l: usize) -> bool {
    nodes[l].is_some_and(|g| g.basin < levels[l])
}

/// Group flooded labels into pits: two flooded labels share a pit when an
/// edge between them lies below their common level. Returns the smallest
/// member label of each flooded label's pit.
pub fn combine_pits(
    nodes: &[Option<GraphNode>],
    levels: &[f64],
    edges: &[GraphEdge],
) -> Vec<Option<usize>> {
    let n = nodes.len();
    let mut uf = UnionFind::new(n);
    for e in edges {
        if e.a >= n || e.b >= n {
            continue;
        }
        if is_flooded(nodes, levels, e.a)
            && is_flooded(nodes, levels, e.b)
            && e.elevation < levels[e.a]
            && e.elevation < levels[e.b]
        {
            uf.union(e.a, e.b);
        }
    }
    (0..n)
        .map(|l| is_flooded(nodes, levels, l).then(|| uf.find(l)))
        .collect()
}

/// Solve the merged depression graph.
pub fn graph_fill(nodes: &[Option<GraphNode>], edges: &[GraphEdge]) -> SolvedGraph {
    let n = nodes.len();
    let flood = flood(nodes, edges, &[(EXTERIOR, 0.0)]);
    let roots = combine_pits(nodes, &flood.levels, edges);

    let mut pit_of_root: Vec<Option<usize>> = vec![None; n];
    let mut downstream: Vec<Option<usize>> = vec![None; n];
    let mut label_pit: Vec<Option<usize>> = vec![None; n];
    let mut pits: Vec<PitSolution> = Vec::new();

    for &l in &flood.order {
        let upstream = flood.parent[l].and_then(|(p, _)| downstream[p]);
        if let Some(root) = roots[l] {
            let id = match pit_of_root[root] {
                Some(id) => id,
                None => {
                    let id = pits.len();
                    pits.push(PitSolution {
                        level: flood.levels[l],
                        spill: flood.parent[l].map(|(_, k)| SpillPoint {
                            node: edges[k].node,
                            elevation: edges[k].elevation,
                        }),
                        target: upstream,
                    });
                    pit_of_root[root] = Some(id);
                    id
                }
            };
            label_pit[l] = Some(id);
            downstream[l] = Some(id);
        } else {
            downstream[l] = upstream;
        }
    }

    let solved = SolvedGraph {
        levels: flood.levels,
        label_pit,
        pits,
    };
    crate::debug_invariants!(solved.validate_invariants(), "graph fill");
    solved
}

impl SolvedGraph {
    pub fn pit_count(&self) -> usize {
        self.pits.len()
    }

    /// Serialise for the broadcast from root.
    pub fn to_bytes(&self) -> Vec<u8> {
        let labels: Vec<WireSolvedLabel> = self
            .levels
            .iter()
            .zip(&self.label_pit)
            .map(|(&lv, &p)| WireSolvedLabel::new(lv, p))
            .collect();
        let pits: Vec<WirePit> = self
            .pits
            .iter()
            .map(|p| WirePit::new(p.level, p.spill.map(|s| (s.node, s.elevation)), p.target))
            .collect();
        let mut out = Vec::with_capacity(
            size_of::<WireHdr>()
                + size_of::<WireGraphSizes>()
                + labels.len() * size_of::<WireSolvedLabel>()
                + pits.len() * size_of::<WirePit>(),
        );
        out.extend_from_slice(cast_slice(&[WireHdr::new(KIND_SOLVED_GRAPH)]));
        out.extend_from_slice(cast_slice(&[WireGraphSizes::new(labels.len(), pits.len())]));
        out.extend_from_slice(cast_slice(&labels));
        out.extend_from_slice(cast_slice(&pits));
        out
    }

    /// Marker broadcast by root when it could not solve the graph.
    pub fn failure_bytes() -> Vec<u8> {
        cast_slice(&[WireHdr::new(KIND_SOLVE_FAILED)]).to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PitError> {
        let bad = |msg: String| PitError::MalformedGraph(msg);
        let hdr_len = size_of::<WireHdr>();
        let hdr: WireHdr = bytes
            .get(..hdr_len)
            .map(bytemuck::pod_read_unaligned)
            .ok_or_else(|| bad("missing header".into()))?;
        if hdr.version() != WIRE_VERSION {
            return Err(bad(format!("unsupported wire version {}", hdr.version())));
        }
        match hdr.kind() {
            KIND_SOLVED_GRAPH => {}
            KIND_SOLVE_FAILED => {
                return Err(bad("root failed to solve the depression graph".into()));
            }
            k => return Err(bad(format!("unexpected record kind {k}"))),
        }
        let sizes_end = hdr_len + size_of::<WireGraphSizes>();
        let sizes: WireGraphSizes = bytes
            .get(hdr_len..sizes_end)
            .map(bytemuck::pod_read_unaligned)
            .ok_or_else(|| bad("missing table sizes".into()))?;
        let labels_end = sizes_end + sizes.labels() * size_of::<WireSolvedLabel>();
        let pits_end = labels_end + sizes.pits() * size_of::<WirePit>();
        if bytes.len() != pits_end {
            return Err(bad(format!(
                "expected {pits_end} bytes of solved graph, got {}",
                bytes.len()
            )));
        }
        let labels: Vec<WireSolvedLabel> =
            records_from_bytes(&bytes[sizes_end..labels_end]).map_err(bad)?;
        let pits: Vec<WirePit> = records_from_bytes(&bytes[labels_end..]).map_err(bad)?;
        let solved = Self {
            levels: labels.iter().map(WireSolvedLabel::level).collect(),
            label_pit: labels.iter().map(WireSolvedLabel::pit).collect(),
            pits: pits
                .iter()
                .map(|p| PitSolution {
                    level: p.level(),
                    spill: p.spill().map(|(node, elevation)| SpillPoint { node, elevation }),
                    target: p.target(),
                })
                .collect(),
        };
        solved.validate_invariants()?;
        Ok(solved)
    }
}

impl DebugInvariants for SolvedGraph {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "SolvedGraph");
    }

    fn validate_invariants(&self) -> Result<(), PitError> {
        if self.levels.len() != self.label_pit.len() {
            return Err(PitError::MalformedGraph(format!(
                "{} levels for {} labels",
                self.levels.len(),
                self.label_pit.len()
            )));
        }
        if let Some(p) = self.label_pit.iter().flatten().find(|&&p| p >= self.pits.len()) {
            return Err(PitError::MalformedGraph(format!(
                "label refers to pit {p} of {}",
                self.pits.len()
            )));
        }
        for (id, pit) in self.pits.iter().enumerate() {
            if let Some(t) = pit.target {
                if t >= id {
                    return Err(PitError::MalformedGraph(format!(
                        "pit {id} spills into pit {t}, which is not filled earlier"
                    )));
                }
            }
        }
        Ok(())
    }
}
