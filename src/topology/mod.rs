//! Partitioned mesh topology: local partitions, boundary sets and ghost links.

pub mod boundary;
pub mod ghost;
pub mod partition;
pub mod structured;

pub use boundary::{BoundarySets, classify};
pub use ghost::GhostPlan;
pub use partition::{Adjacency, MeshPartition};
pub use structured::{StructuredCellType, StructuredGrid};
