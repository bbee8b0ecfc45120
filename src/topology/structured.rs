//! Partitioned structured grids for demos and tests.
//!
//! Nodes sit on an `nx × ny` lattice with natural index `j * nx + i`. The
//! outer ring of the lattice is the global boundary. A rank's partition holds
//! its owned nodes plus every vertex of a cell touching one of them.

use crate::pit_error::PitError;
use crate::topology::partition::MeshPartition;
use hashbrown::HashMap;

/// Cell-type choices for structured grids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StructuredCellType {
    /// Each lattice square split along its `(i, j)–(i+1, j+1)` diagonal.
    #[default]
    Triangle,
    Quadrilateral,
}

/// A rectangular lattice of nodes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StructuredGrid {
    pub nx: usize,
    pub ny: usize,
    pub spacing: f64,
    pub cell_type: StructuredCellType,
}

impl StructuredGrid {
    pub fn new(nx: usize, ny: usize, spacing: f64) -> Result<Self, PitError> {
        if nx < 2 || ny < 2 {
            return Err(PitError::InvalidMesh(format!(
                "structured grid needs at least 2x2 nodes, got {nx}x{ny}"
            )));
        }
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(PitError::InvalidMesh(format!(
                "grid spacing must be positive, got {spacing}"
            )));
        }
        Ok(Self {
            nx,
            ny,
            spacing,
            cell_type: StructuredCellType::Triangle,
        })
    }

    pub fn with_cell_type(mut self, cell_type: StructuredCellType) -> Self {
        self.cell_type = cell_type;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nx * self.ny
    }

    pub fn natural(&self, i: usize, j: usize) -> usize {
        j * self.nx + i
    }

    /// Lattice position `(i, j)` of a natural index.
    pub fn position(&self, natural: usize) -> (usize, usize) {
        (natural % self.nx, natural / self.nx)
    }

    pub fn is_border(&self, natural: usize) -> bool {
        let (i, j) = self.position(natural);
        i == 0 || j == 0 || i + 1 == self.nx || j + 1 == self.ny
    }

    pub fn coords(&self, natural: usize) -> [f64; 3] {
        let (i, j) = self.position(natural);
        [i as f64 * self.spacing, j as f64 * self.spacing, 0.0]
    }

    /// All cells in natural indices.
    pub fn cells(&self) -> Vec<Vec<usize>> {
        let mut cells = Vec::new();
        for j in 0..self.ny - 1 {
            for i in 0..self.nx - 1 {
                let v0 = self.natural(i, j);
                let v1 = self.natural(i + 1, j);
                let v2 = self.natural(i + 1, j + 1);
                let v3 = self.natural(i, j + 1);
                match self.cell_type {
                    StructuredCellType::Triangle => {
                        cells.push(vec![v0, v1, v2]);
                        cells.push(vec![v0, v2, v3]);
                    }
                    StructuredCellType::Quadrilateral => cells.push(vec![v0, v1, v2, v3]),
                }
            }
        }
        cells
    }

    /// Split into `parts` vertical strips of nearly equal width.
    pub fn partition(&self, parts: usize) -> Result<Vec<MeshPartition>, PitError> {
        let parts = parts.max(1);
        let nx = self.nx;
        self.partition_by(parts, |g| (g % nx) * parts / nx)
    }

    /// Split with an arbitrary owner per natural index.
    pub fn partition_by<F>(&self, parts: usize, owner: F) -> Result<Vec<MeshPartition>, PitError>
    where
        F: Fn(usize) -> usize,
    {
        let owners: Vec<usize> = (0..self.node_count()).map(owner).collect();
        if let Some(g) = owners.iter().position(|&r| r >= parts) {
            return Err(PitError::InvalidMesh(format!(
                "node {g} assigned to rank {}, but only {parts} ranks exist",
                owners[g]
            )));
        }
        let cells = self.cells();
        (0..parts).map(|r| self.local(r, &owners, &cells)).collect()
    }

    fn local(
        &self,
        rank: usize,
        owners: &[usize],
        cells: &[Vec<usize>],
    ) -> Result<MeshPartition, PitError> {
        let local_cells: Vec<&Vec<usize>> = cells
            .iter()
            .filter(|c| c.iter().any(|&g| owners[g] == rank))
            .collect();

        let mut owned: Vec<usize> = (0..owners.len()).filter(|&g| owners[g] == rank).collect();
        let mut ghosts: Vec<usize> = local_cells
            .iter()
            .flat_map(|c| c.iter().copied())
            .filter(|&g| owners[g] != rank)
            .collect();
        owned.sort_unstable();
        ghosts.sort_unstable();
        ghosts.dedup();

        let natural: Vec<usize> = owned.into_iter().chain(ghosts).collect();
        let index: HashMap<usize, usize> =
            natural.iter().enumerate().map(|(i, &g)| (g, i)).collect();
        let cells = local_cells
            .iter()
            .map(|c| c.iter().map(|g| index[g]).collect())
            .collect();

        MeshPartition::new(
            rank,
            natural.clone(),
            natural.iter().map(|&g| owners[g]).collect(),
            natural.iter().map(|&g| self.coords(g)).collect(),
            cells,
            natural.iter().map(|&g| self.is_border(g)).collect(),
        )
    }

    /// Restrict a natural-indexed global field to a partition's local nodes.
    pub fn restrict(&self, mesh: &MeshPartition, global: &[f64]) -> Vec<f64> {
        mesh.naturals().iter().map(|&g| global[g]).collect()
    }
}
