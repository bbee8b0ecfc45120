//! Assembly of the global depression graph on the root rank.
//!
//! Each rank relabels its local spill edges into the global label space and
//! writes one table row per local region. A communication region's row also
//! carries the label the node's owner gave it. Edge rows and label rows are
//! written into sentinel-filled buffers at agreed offsets and reduced to the
//! root with a component-wise maximum.
//!
//! On the root every communication label is folded into its owner's label,
//! and plateaus cut by a partition boundary are joined again. The graph that
//! remains is the same for every partitioning, so the flood over it is too.

use crate::algs::collective::{Collective, SyncPoint};
use crate::algs::communicator::Communicator;
use crate::algs::wire::{MaxMerge, WireLabel, WireSpillEdge};
use crate::pit::graph_fill::{
    EXTERIOR, GraphEdge, GraphNode, SolvedGraph, UnionFind, graph_fill,
};
use crate::pit::kernels::{LocalFill, RegionKind};
use crate::pit::labels::LabelOffsets;
use crate::pit_error::PitError;
use hashbrown::HashMap;
use std::cmp::Ordering;

/// Far end of a spill edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpillTarget {
    Exterior,
    Label(u64),
}

impl SpillTarget {
    fn of(global: u64) -> Self {
        if global == EXTERIOR as u64 {
            SpillTarget::Exterior
        } else {
            SpillTarget::Label(global)
        }
    }

    pub fn id(self) -> u64 {
        match self {
            SpillTarget::Exterior => EXTERIOR as u64,
            SpillTarget::Label(l) => l,
        }
    }
}

/// A globally labelled spill edge.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpillEdge {
    pub source: u64,
    pub target: SpillTarget,
    pub elevation: f64,
    /// Natural index of the spill node.
    pub node: usize,
    /// Rank that reported the edge.
    pub rank: usize,
}

impl SpillEdge {
    /// Build an edge between two global labels, keeping the exterior on the
    /// target side.
    pub fn between(a: u64, b: u64, elevation: f64, node: usize, rank: usize) -> Self {
        let (source, target) = if a == EXTERIOR as u64 { (b, a) } else { (a, b) };
        Self {
            source,
            target: SpillTarget::of(target),
            elevation,
            node,
            rank,
        }
    }

    /// Unordered label pair.
    pub fn key(&self) -> (u64, u64) {
        let t = self.target.id();
        (self.source.min(t), self.source.max(t))
    }

    fn to_wire(self) -> WireSpillEdge {
        let target = match self.target {
            SpillTarget::Exterior => -1,
            SpillTarget::Label(l) => l as i64,
        };
        WireSpillEdge::new(
            self.source as i64,
            target,
            self.elevation,
            self.node as i64,
            self.rank as i64,
        )
    }

    fn from_wire(w: &WireSpillEdge) -> Result<Self, PitError> {
        let bad = || PitError::MalformedGraph(format!("unwritten or corrupt edge row {w:?}"));
        let source = u64::try_from(w.source()).map_err(|_| bad())?;
        let node = usize::try_from(w.node()).map_err(|_| bad())?;
        let rank = usize::try_from(w.rank()).map_err(|_| bad())?;
        let target = match w.target() {
            -1 => SpillTarget::Exterior,
            t => SpillTarget::of(u64::try_from(t).map_err(|_| bad())?),
        };
        Ok(Self {
            source,
            target,
            elevation: w.elevation(),
            node,
            rank,
        })
    }
}

/// One row of the global label table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LabelRow {
    pub basin: f64,
    pub marker: usize,
    /// Label the owner gave a communication node; `None` for owned regions.
    pub owner: Option<u64>,
}

impl LabelRow {
    fn to_wire(self) -> WireLabel {
        WireLabel::new(self.basin, self.marker as i64, self.owner)
    }

    fn from_wire(w: &WireLabel) -> Option<Self> {
        (!w.is_sentinel()).then(|| Self {
            basin: w.basin(),
            marker: w.marker() as usize,
            owner: w.owner(),
        })
    }
}

/// One rank's share of the global graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CombinedGraph {
    /// Global label and table row of every local region.
    pub labels: Vec<(u64, LabelRow)>,
    pub edges: Vec<SpillEdge>,
}

/// Relabel one rank's regions and spill edges into the global label space.
///
/// `owner_label[i]` is the global label the owner of node `i` assigned
/// (`-1` if unknown). A communication region without an owner label keeps no
/// owner and is logged.
pub fn combine_graphs(
    local: &LocalFill,
    offsets: &LabelOffsets,
    owner_label: &[i64],
    natural: &[usize],
    rank: usize,
) -> CombinedGraph {
    let edges = local
        .edges
        .iter()
        .map(|e| {
            SpillEdge::between(
                offsets.global(e.source),
                offsets.global(e.target),
                e.elevation,
                e.node,
                rank,
            )
        })
        .collect();
    let labels = local
        .regions
        .iter()
        .enumerate()
        .map(|(label, region)| {
            let owner = match region.kind {
                RegionKind::Boundary { node } => {
                    let owner = u64::try_from(owner_label[node]).ok();
                    if owner.is_none() {
                        log::warn!(
                            "rank {rank}: communication node {} has no owner label",
                            natural[node]
                        );
                    }
                    owner
                }
                _ => None,
            };
            let row = LabelRow {
                basin: region.basin,
                marker: region.marker,
                owner,
            };
            (offsets.global(label), row)
        })
        .collect();
    CombinedGraph { labels, edges }
}

/// Keep the lowest `(elevation, node)` edge per unordered label pair.
/// Equal edges keep the first one in input order. Self-loops are dropped.
/// The result is sorted by label pair.
pub fn dedup_spill_edges<I>(edges: I) -> Vec<SpillEdge>
where
    I: IntoIterator<Item = SpillEdge>,
{
    let mut best: HashMap<(u64, u64), SpillEdge> = HashMap::new();
    for e in edges {
        let key = e.key();
        if key.0 == key.1 {
            continue;
        }
        best.entry(key)
            .and_modify(|cur| {
                let ord = e
                    .elevation
                    .total_cmp(&cur.elevation)
                    .then(e.node.cmp(&cur.node));
                if ord == Ordering::Less {
                    *cur = e;
                }
            })
            .or_insert(e);
    }
    let mut out: Vec<SpillEdge> = best.into_values().collect();
    out.sort_unstable_by_key(SpillEdge::key);
    out
}

/// Merged graph, available on the root only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedGraph {
    pub labels: Vec<Option<LabelRow>>,
    pub edges: Vec<SpillEdge>,
}

/// Class vertices: the smallest basin of the members and the smallest marker
/// among owned members (any member if none is owned).
fn class_nodes(labels: &[Option<LabelRow>], uf: &mut UnionFind) -> Vec<Option<GraphNode>> {
    let mut nodes: Vec<Option<GraphNode>> = vec![None; labels.len()];
    let mut owned_marker: Vec<Option<usize>> = vec![None; labels.len()];
    for (l, row) in labels.iter().enumerate() {
        let Some(row) = row else { continue };
        let r = uf.find(l);
        let node = nodes[r].get_or_insert(GraphNode {
            basin: row.basin,
            marker: row.marker,
        });
        node.basin = node.basin.min(row.basin);
        node.marker = node.marker.min(row.marker);
        if row.owner.is_none() {
            owned_marker[r] = Some(owned_marker[r].map_or(row.marker, |m| m.min(row.marker)));
        }
    }
    for (node, marker) in nodes.iter_mut().zip(owned_marker) {
        if let (Some(node), Some(marker)) = (node.as_mut(), marker) {
            node.marker = marker;
        }
    }
    nodes
}

impl MergedGraph {
    fn check_edges(&self) -> Result<(), PitError> {
        let n = self.labels.len();
        let known = |l: u64| (l as usize) < n && self.labels[l as usize].is_some();
        match self.edges.iter().find(|e| !known(e.source) || !known(e.target.id())) {
            Some(e) => Err(PitError::MalformedGraph(format!(
                "edge {}-{} references a label without a table entry",
                e.source,
                e.target.id()
            ))),
            None => Ok(()),
        }
    }

    /// Fold communication labels into their owners, join plateaus split by
    /// partition boundaries, flood the resulting graph and spread the
    /// solution back onto every label.
    pub fn solve(&self) -> Result<SolvedGraph, PitError> {
        let n = self.labels.len();
        if self.labels.get(EXTERIOR).copied().flatten().is_none() {
            return Err(PitError::MalformedGraph("exterior label row missing".into()));
        }
        self.check_edges()?;

        let mut uf = UnionFind::new(n);
        for (l, row) in self.labels.iter().enumerate() {
            let Some(owner) = row.and_then(|r| r.owner) else {
                continue;
            };
            match self.labels.get(owner as usize) {
                Some(Some(_)) => uf.union(l, owner as usize),
                _ => {
                    return Err(PitError::MalformedGraph(format!(
                        "label {l} belongs to label {owner}, which has no table entry"
                    )));
                }
            }
        }

        // halves of one flat meet at exactly their common basin
        let nodes = class_nodes(&self.labels, &mut uf);
        for e in &self.edges {
            let (a, b) = (uf.find(e.source as usize), uf.find(e.target.id() as usize));
            if a == b || a == EXTERIOR || b == EXTERIOR {
                continue;
            }
            if let (Some(na), Some(nb)) = (nodes[a], nodes[b]) {
                if e.elevation == na.basin && e.elevation == nb.basin {
                    uf.union(a, b);
                }
            }
        }
        let nodes = class_nodes(&self.labels, &mut uf);

        let edges: Vec<GraphEdge> = dedup_spill_edges(self.edges.iter().map(|e| {
            let (a, b) = (uf.find(e.source as usize), uf.find(e.target.id() as usize));
            SpillEdge::between(a as u64, b as u64, e.elevation, e.node, e.rank)
        }))
        .into_iter()
        .map(|e| GraphEdge {
            a: e.source as usize,
            b: e.target.id() as usize,
            elevation: e.elevation,
            node: e.node,
        })
        .collect();

        let mut solved = graph_fill(&nodes, &edges);
        for l in (0..n).filter(|&l| self.labels[l].is_some()) {
            let r = uf.find(l);
            solved.levels[l] = solved.levels[r];
            solved.label_pit[l] = solved.label_pit[r];
        }
        Ok(solved)
    }
}

/// Raw reduced buffers on the root.
pub struct RootBuffers {
    edges: Vec<WireSpillEdge>,
    labels: Vec<WireLabel>,
}

/// Collective: reduce every rank's edges and label table to rank 0.
pub fn merge_spill_graph<C: Communicator>(
    coll: &Collective<'_, C>,
    offsets: &LabelOffsets,
    graph: &CombinedGraph,
) -> Result<Option<RootBuffers>, PitError> {
    let me = coll.rank();
    let edges = &graph.edges;
    let mut counts = vec![0i64; coll.size()];
    counts[me] = edges.len() as i64;
    let counts = coll.allreduce_max_i64(SyncPoint::EdgeCounts, &counts)?;
    let start: usize = counts[..me].iter().map(|&c| c.max(0) as usize).sum();
    let total: usize = counts.iter().map(|&c| c.max(0) as usize).sum();

    let mut rows = vec![WireSpillEdge::sentinel(); total];
    for (row, e) in rows[start..start + edges.len()].iter_mut().zip(edges) {
        *row = e.to_wire();
    }
    let rows = coll.reduce(SyncPoint::SpillEdges, 0, &rows, WireSpillEdge::merge_max);

    // every rank writes the same exterior row
    let mut table = vec![WireLabel::sentinel(); offsets.total() as usize];
    for &(label, row) in &graph.labels {
        table[label as usize] = row.to_wire();
    }
    let table = coll.reduce(SyncPoint::LabelTable, 0, &table, WireLabel::merge_max);
    // both reductions run before either error surfaces
    let (rows, table) = (rows?, table?);

    Ok(rows.zip(table).map(|(edges, labels)| RootBuffers { edges, labels }))
}

impl RootBuffers {
    /// Decode and deduplicate the reduced buffers.
    pub fn decode(self) -> Result<MergedGraph, PitError> {
        let labels = self.labels.iter().map(LabelRow::from_wire).collect();
        let edges = self
            .edges
            .iter()
            .map(SpillEdge::from_wire)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MergedGraph {
            labels,
            edges: dedup_spill_edges(edges),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pit::kernels::{EXTERIOR_MARKER, LocalSpill, Region};

    fn edge(a: u64, b: u64, elevation: f64, node: usize, rank: usize) -> SpillEdge {
        SpillEdge::between(a, b, elevation, node, rank)
    }

    #[test]
    fn dedup_keeps_lower_spill_of_reciprocal_edges() {
        let out = dedup_spill_edges([edge(3, 7, 12.0, 40, 1), edge(7, 3, 10.0, 41, 0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].elevation, 10.0);
        assert_eq!(out[0].node, 41);
    }

    #[test]
    fn dedup_ties_prefer_lower_node_then_input_order() {
        let out = dedup_spill_edges([
            edge(1, 2, 5.0, 9, 0),
            edge(2, 1, 5.0, 8, 1),
            edge(1, 2, 5.0, 8, 2),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].node, out[0].rank), (8, 1));
    }

    #[test]
    fn exterior_always_ends_up_as_target() {
        let e = edge(0, 5, 1.0, 3, 0);
        assert_eq!(e.source, 5);
        assert_eq!(e.target, SpillTarget::Exterior);
        assert!(dedup_spill_edges([edge(4, 4, 1.0, 0, 0)]).is_empty());
    }

    #[test]
    fn wire_rows_roundtrip_and_reject_sentinels() {
        let e = edge(9, 0, 2.5, 17, 3);
        let back = SpillEdge::from_wire(&e.to_wire()).unwrap();
        assert_eq!(back, e);
        assert!(matches!(
            SpillEdge::from_wire(&WireSpillEdge::sentinel()),
            Err(PitError::MalformedGraph(_))
        ));
    }

    #[test]
    fn combine_tags_comm_regions_with_their_owner_label() {
        let local = LocalFill {
            filled: vec![1.0, 3.0],
            labels: vec![Some(1), Some(2)],
            regions: vec![
                Region { kind: RegionKind::Exterior, basin: 0.0, marker: EXTERIOR_MARKER },
                Region { kind: RegionKind::Plateau, basin: 1.0, marker: 20 },
                Region { kind: RegionKind::Boundary { node: 1 }, basin: 3.0, marker: 21 },
            ],
            edges: vec![LocalSpill { source: 1, target: 2, elevation: 3.0, node: 21 }],
            depressions: 1,
        };
        let offsets = LabelOffsets::from_counts(1, vec![2, 3]);
        let graph = combine_graphs(&local, &offsets, &[-1, 1], &[20, 21], 1);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].key(), (3, 4));
        let owners: Vec<(u64, Option<u64>)> =
            graph.labels.iter().map(|(l, row)| (*l, row.owner)).collect();
        // region 2 on rank 1 is global 4; its owner called node 21 label 1
        assert_eq!(owners, vec![(0, None), (3, None), (4, Some(1))]);
    }

    fn row(basin: f64, marker: usize, owner: Option<u64>) -> Option<LabelRow> {
        Some(LabelRow { basin, marker, owner })
    }

    /// One flat basin at 2 cut in two, rim at 6, and a ridge node at 5 that
    /// drains into the western half through a communication label.
    fn split_flat(west: u64, east: u64) -> MergedGraph {
        let mut labels = vec![None; 8];
        labels[0] = row(0.0, EXTERIOR_MARKER, None);
        labels[west as usize] = row(2.0, 14, None);
        labels[east as usize] = row(2.0, 11, None);
        // ghost of a western node seen from the eastern rank
        labels[5] = row(2.0, 14, Some(west));
        // ghost of a node whose owner labelled it through another ghost
        labels[7] = row(3.0, 15, Some(5));
        MergedGraph {
            labels,
            edges: dedup_spill_edges([
                edge(east, 5, 2.0, 11, 1),
                edge(east, 7, 5.0, 30, 1),
                edge(west, 0, 6.0, 40, 0),
                edge(east, 0, 7.0, 41, 1),
            ]),
        }
    }

    #[test]
    fn solve_joins_split_flats_through_comm_labels() {
        let a = split_flat(1, 3).solve().unwrap();
        assert_eq!(a.pits.len(), 1);
        for l in [1, 3, 5, 7] {
            assert_eq!(a.levels[l], 6.0, "label {l}");
            assert_eq!(a.label_pit[l], Some(0), "label {l}");
        }
        assert_eq!(a.pits[0].spill.map(|s| s.node), Some(40));

        // the same terrain numbered the other way round solves the same way
        let b = split_flat(3, 1).solve().unwrap();
        assert_eq!(b.pits, a.pits);
    }

    #[test]
    fn solve_rejects_comm_labels_with_missing_owner() {
        let mut graph = split_flat(1, 3);
        graph.labels[5] = row(2.0, 14, Some(6));
        assert!(matches!(graph.solve(), Err(PitError::MalformedGraph(_))));
    }
}
