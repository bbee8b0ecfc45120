//! Local view of a partitioned surface mesh.
//!
//! A [`MeshPartition`] is what one rank knows about the global mesh: its
//! owned nodes, the ghost nodes needed to close every local cell, the cells
//! themselves and a global-boundary flag per node. Local indices are dense in
//! `0..len()`; natural indices identify a node across all ranks.

use crate::pit_error::PitError;
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;

/// One rank's share of the mesh.
#[derive(Clone, Debug)]
pub struct MeshPartition {
    rank: usize,
    natural: Vec<usize>,
    owner: Vec<usize>,
    coords: Vec<[f64; 3]>,
    cells: Vec<Vec<usize>>,
    boundary: Vec<bool>,
}

impl MeshPartition {
    /// Build and validate a partition.
    ///
    /// Every per-node vector must have the same length, cell vertices must be
    /// local indices, cells need at least three vertices and natural indices
    /// must be unique.
    pub fn new(
        rank: usize,
        natural: Vec<usize>,
        owner: Vec<usize>,
        coords: Vec<[f64; 3]>,
        cells: Vec<Vec<usize>>,
        boundary: Vec<bool>,
    ) -> Result<Self, PitError> {
        let n = natural.len();
        PitError::check_len("owner", n, owner.len())?;
        PitError::check_len("coords", n, coords.len())?;
        PitError::check_len("boundary", n, boundary.len())?;

        let mut seen = HashSet::with_capacity(n);
        for &g in &natural {
            if !seen.insert(g) {
                return Err(PitError::InvalidMesh(format!(
                    "natural index {g} appears twice on rank {rank}"
                )));
            }
        }
        for (c, cell) in cells.iter().enumerate() {
            if cell.len() < 3 {
                return Err(PitError::InvalidMesh(format!(
                    "cell {c} has only {} vertices",
                    cell.len()
                )));
            }
            if let Some(&v) = cell.iter().find(|&&v| v >= n) {
                return Err(PitError::InvalidMesh(format!(
                    "cell {c} references local node {v}, but only {n} nodes exist"
                )));
            }
        }
        Ok(Self {
            rank,
            natural,
            owner,
            coords,
            cells,
            boundary,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
    pub fn len(&self) -> usize {
        self.natural.len()
    }
    pub fn is_empty(&self) -> bool {
        self.natural.is_empty()
    }
    pub fn natural(&self, i: usize) -> usize {
        self.natural[i]
    }
    pub fn naturals(&self) -> &[usize] {
        &self.natural
    }
    pub fn owner(&self, i: usize) -> usize {
        self.owner[i]
    }
    pub fn is_owned(&self, i: usize) -> bool {
        self.owner[i] == self.rank
    }
    pub fn coords(&self) -> &[[f64; 3]] {
        &self.coords
    }
    pub fn cells(&self) -> &[Vec<usize>] {
        &self.cells
    }
    pub fn is_global_boundary(&self, i: usize) -> bool {
        self.boundary[i]
    }

    /// Local indices of owned nodes, ascending.
    pub fn owned(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(move |&i| self.is_owned(i))
    }

    /// Owned-only view of a per-node field, as `(natural, value)` pairs.
    pub fn owned_values<'a, T: Copy>(
        &'a self,
        field: &'a [T],
    ) -> impl Iterator<Item = (usize, T)> + 'a {
        self.owned().map(move |i| (self.natural[i], field[i]))
    }

    /// Map from natural index to local index.
    pub fn natural_to_local(&self) -> HashMap<usize, usize> {
        self.natural
            .iter()
            .enumerate()
            .map(|(i, &g)| (g, i))
            .collect()
    }

    /// Node adjacency induced by cell edges.
    pub fn adjacency(&self) -> Adjacency {
        Adjacency::from_cells(self.len(), &self.cells)
    }

    /// Voronoi-style node areas: each cell's area shared equally between
    /// its vertices. Ghost entries only see local cells and are overwritten
    /// by the owner during the area exchange.
    pub fn node_areas(&self) -> Vec<f64> {
        let mut area = vec![0.0; self.len()];
        for cell in &self.cells {
            let a = polygon_area(cell.iter().map(|&v| self.coords[v]));
            let share = a / cell.len() as f64;
            for &v in cell {
                area[v] += share;
            }
        }
        area
    }
}

/// Area of a planar polygon in 3-D, by fan triangulation from its first vertex.
pub fn polygon_area(mut vertices: impl Iterator<Item = [f64; 3]>) -> f64 {
    let Some(origin) = vertices.next() else {
        return 0.0;
    };
    let sub = |a: [f64; 3], b: [f64; 3]| [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
    vertices
        .map(|v| sub(v, origin))
        .tuple_windows()
        .map(|(u, w)| {
            let c = [
                u[1] * w[2] - u[2] * w[1],
                u[2] * w[0] - u[0] * w[2],
                u[0] * w[1] - u[1] * w[0],
            ];
            0.5 * (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt()
        })
        .sum()
}

/// Compressed node-to-node adjacency.
#[derive(Clone, Debug, Default)]
pub struct Adjacency {
    offsets: Vec<usize>,
    targets: Vec<usize>,
}

impl Adjacency {
    /// Connect consecutive vertices of every cell, closing each polygon.
    /// Neighbour lists come out sorted and free of duplicates.
    pub fn from_cells(n: usize, cells: &[Vec<usize>]) -> Self {
        let mut lists: Vec<Vec<usize>> = vec![Vec::new(); n];
        for cell in cells {
            for (&a, &b) in cell.iter().circular_tuple_windows() {
                if a != b {
                    lists[a].push(b);
                    lists[b].push(a);
                }
            }
        }
        let mut offsets = Vec::with_capacity(n + 1);
        let mut targets = Vec::new();
        offsets.push(0);
        for mut list in lists {
            list.sort_unstable();
            list.dedup();
            targets.extend(list);
            offsets.push(targets.len());
        }
        Self { offsets, targets }
    }

    pub fn len(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn neighbors(&self, i: usize) -> &[usize] {
        &self.targets[self.offsets[i]..self.offsets[i + 1]]
    }
}
