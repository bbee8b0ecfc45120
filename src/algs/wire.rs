//! Fixed, versioned, little-endian wire types for the depression-graph exchanges.
//!
//! Elevations travel shifted by the sea datum, so every valid value on the
//! wire is non-negative and `-1` marks an empty slot in MAX-reduced buffers.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Copy a byte buffer into freshly allocated, properly aligned records.
pub fn records_from_bytes<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, String> {
    let width = size_of::<T>();
    if width == 0 || bytes.len() % width != 0 {
        return Err(format!(
            "{} bytes is not a whole number of {width}-byte records",
            bytes.len()
        ));
    }
    let mut out = vec![T::zeroed(); bytes.len() / width];
    cast_slice_mut(&mut out).copy_from_slice(bytes);
    Ok(out)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 2;

/// Record kinds carried in [`WireHdr`].
pub const KIND_SOLVED_GRAPH: u16 = 1;
pub const KIND_SOLVE_FAILED: u16 = 0xFFFF;

/// Component-wise maximum, used by the sentinel-buffer reductions.
pub trait MaxMerge {
    fn merge_max(&mut self, other: &Self);
}

#[inline]
fn enc_f64(v: f64) -> u64 {
    v.to_bits().to_le()
}
#[inline]
fn dec_f64(v: u64) -> f64 {
    f64::from_bits(u64::from_le(v))
}
#[inline]
fn max_f64(a: u64, b: u64) -> u64 {
    enc_f64(dec_f64(a).max(dec_f64(b)))
}
#[inline]
fn max_i64(a: i64, b: i64) -> i64 {
    i64::from_le(a).max(i64::from_le(b)).to_le()
}

// ===== Common records ======================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64, // count of following records
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

// ===== Spill graph =========================================================

/// One spill-graph edge in a MAX-reduced root buffer.
///
/// `target == -1` stands for the exterior outlet; a row whose `source` is
/// still `-1` after the reduction was never written.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireSpillEdge {
    pub source_le: i64,
    pub target_le: i64,
    pub elevation_le: u64,
    pub node_le: i64,
    pub rank_le: i64,
}

impl WireSpillEdge {
    pub fn new(source: i64, target: i64, elevation: f64, node: i64, rank: i64) -> Self {
        Self {
            source_le: source.to_le(),
            target_le: target.to_le(),
            elevation_le: enc_f64(elevation),
            node_le: node.to_le(),
            rank_le: rank.to_le(),
        }
    }
    pub fn sentinel() -> Self {
        Self::new(-1, -1, -1.0, -1, -1)
    }
    pub fn source(&self) -> i64 {
        i64::from_le(self.source_le)
    }
    pub fn target(&self) -> i64 {
        i64::from_le(self.target_le)
    }
    pub fn elevation(&self) -> f64 {
        dec_f64(self.elevation_le)
    }
    pub fn node(&self) -> i64 {
        i64::from_le(self.node_le)
    }
    pub fn rank(&self) -> i64 {
        i64::from_le(self.rank_le)
    }
    pub fn is_sentinel(&self) -> bool {
        self.source() < 0
    }
}

impl MaxMerge for WireSpillEdge {
    fn merge_max(&mut self, other: &Self) {
        self.source_le = max_i64(self.source_le, other.source_le);
        self.target_le = max_i64(self.target_le, other.target_le);
        self.elevation_le = max_f64(self.elevation_le, other.elevation_le);
        self.node_le = max_i64(self.node_le, other.node_le);
        self.rank_le = max_i64(self.rank_le, other.rank_le);
    }
}

/// Per-label table row: minimum elevation of the region, its marker node and,
/// for communication regions, the global label the node's owner assigned.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireLabel {
    pub basin_le: u64,
    pub marker_le: i64,
    pub owner_le: i64,
}

impl WireLabel {
    pub fn new(basin: f64, marker: i64, owner: Option<u64>) -> Self {
        Self {
            basin_le: enc_f64(basin),
            marker_le: marker.to_le(),
            owner_le: owner.map_or(-1, |o| o as i64).to_le(),
        }
    }
    pub fn sentinel() -> Self {
        Self::new(-1.0, -1, None)
    }
    pub fn basin(&self) -> f64 {
        dec_f64(self.basin_le)
    }
    pub fn marker(&self) -> i64 {
        i64::from_le(self.marker_le)
    }
    pub fn owner(&self) -> Option<u64> {
        u64::try_from(i64::from_le(self.owner_le)).ok()
    }
    pub fn is_sentinel(&self) -> bool {
        self.marker() < 0
    }
}

impl MaxMerge for WireLabel {
    fn merge_max(&mut self, other: &Self) {
        self.basin_le = max_f64(self.basin_le, other.basin_le);
        self.marker_le = max_i64(self.marker_le, other.marker_le);
        self.owner_le = max_i64(self.owner_le, other.owner_le);
    }
}

// ===== Solved graph ========================================================

/// Sizes of the two tables following a solved-graph header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireGraphSizes {
    pub labels_le: u64,
    pub pits_le: u64,
}

impl WireGraphSizes {
    pub fn new(labels: usize, pits: usize) -> Self {
        Self {
            labels_le: (labels as u64).to_le(),
            pits_le: (pits as u64).to_le(),
        }
    }
    pub fn labels(&self) -> usize {
        u64::from_le(self.labels_le) as usize
    }
    pub fn pits(&self) -> usize {
        u64::from_le(self.pits_le) as usize
    }
}

/// Flood level of one global label and the pit it belongs to (`-1` = none).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireSolvedLabel {
    pub level_le: u64,
    pub pit_le: i64,
}

impl WireSolvedLabel {
    pub fn new(level: f64, pit: Option<usize>) -> Self {
        Self {
            level_le: enc_f64(level),
            pit_le: pit.map_or(-1, |p| p as i64).to_le(),
        }
    }
    pub fn level(&self) -> f64 {
        dec_f64(self.level_le)
    }
    pub fn pit(&self) -> Option<usize> {
        usize::try_from(i64::from_le(self.pit_le)).ok()
    }
}

/// One pit: fill level, spill point and downstream pit (`-1` = none).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WirePit {
    pub level_le: u64,
    pub spill_elevation_le: u64,
    pub spill_node_le: i64,
    pub target_le: i64,
}

impl WirePit {
    pub fn new(level: f64, spill: Option<(usize, f64)>, target: Option<usize>) -> Self {
        let (node, elevation) = spill.map_or((-1, -1.0), |(n, e)| (n as i64, e));
        Self {
            level_le: enc_f64(level),
            spill_elevation_le: enc_f64(elevation),
            spill_node_le: node.to_le(),
            target_le: target.map_or(-1, |t| t as i64).to_le(),
        }
    }
    pub fn level(&self) -> f64 {
        dec_f64(self.level_le)
    }
    pub fn spill(&self) -> Option<(usize, f64)> {
        usize::try_from(i64::from_le(self.spill_node_le))
            .ok()
            .map(|n| (n, dec_f64(self.spill_elevation_le)))
    }
    pub fn target(&self) -> Option<usize> {
        usize::try_from(i64::from_le(self.target_le)).ok()
    }
}

// ===== Node-level records ==================================================

/// Owner of a pit's spill node: `(rank, local index, on global boundary)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireSpillOwner {
    pub rank_le: i64,
    pub local_le: i64,
    pub boundary_le: i64,
}

impl WireSpillOwner {
    pub fn new(rank: usize, local: usize, on_boundary: bool) -> Self {
        Self {
            rank_le: (rank as i64).to_le(),
            local_le: (local as i64).to_le(),
            boundary_le: i64::from(on_boundary).to_le(),
        }
    }
    pub fn sentinel() -> Self {
        Self {
            rank_le: (-1i64).to_le(),
            local_le: (-1i64).to_le(),
            boundary_le: 0,
        }
    }
    pub fn rank(&self) -> Option<usize> {
        usize::try_from(i64::from_le(self.rank_le)).ok()
    }
    pub fn local(&self) -> Option<usize> {
        usize::try_from(i64::from_le(self.local_le)).ok()
    }
    pub fn on_boundary(&self) -> bool {
        i64::from_le(self.boundary_le) > 0
    }
}

impl MaxMerge for WireSpillOwner {
    fn merge_max(&mut self, other: &Self) {
        self.rank_le = max_i64(self.rank_le, other.rank_le);
        self.local_le = max_i64(self.local_le, other.local_le);
        self.boundary_le = max_i64(self.boundary_le, other.boundary_le);
    }
}

/// Filled elevation and pit id of one node, sent owner -> ghost.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireNodeFill {
    pub filled_le: u64,
    pub pit_le: i64,
}

impl WireNodeFill {
    pub fn new(filled: f64, pit: Option<usize>) -> Self {
        Self {
            filled_le: enc_f64(filled),
            pit_le: pit.map_or(-1, |p| p as i64).to_le(),
        }
    }
    pub fn filled(&self) -> f64 {
        dec_f64(self.filled_le)
    }
    pub fn pit(&self) -> Option<usize> {
        usize::try_from(i64::from_le(self.pit_le)).ok()
    }
}

/// Post-deposition state of one node, sent owner -> ghost.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireNodeSediment {
    pub elevation_le: u64,
    pub erosion_deposition_le: u64,
    pub residual_le: u64,
}

impl WireNodeSediment {
    pub fn new(elevation: f64, erosion_deposition: f64, residual: f64) -> Self {
        Self {
            elevation_le: enc_f64(elevation),
            erosion_deposition_le: enc_f64(erosion_deposition),
            residual_le: enc_f64(residual),
        }
    }
    pub fn elevation(&self) -> f64 {
        dec_f64(self.elevation_le)
    }
    pub fn erosion_deposition(&self) -> f64 {
        dec_f64(self.erosion_deposition_le)
    }
    pub fn residual(&self) -> f64 {
        dec_f64(self.residual_le)
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireSpillEdge>(), 40);
const_assert_eq!(size_of::<WireLabel>(), 24);
const_assert_eq!(size_of::<WireGraphSizes>(), 16);
const_assert_eq!(size_of::<WireSolvedLabel>(), 16);
const_assert_eq!(size_of::<WirePit>(), 32);
const_assert_eq!(size_of::<WireSpillOwner>(), 24);
const_assert_eq!(size_of::<WireNodeFill>(), 16);
const_assert_eq!(size_of::<WireNodeSediment>(), 24);
