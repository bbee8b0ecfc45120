#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-pitfill
//!
//! mesh-pitfill fills the closed depressions of a surface mesh that has been
//! partitioned across ranks, and routes deposited sediment into them. The
//! result is independent of how the mesh was cut: the same global mesh gives
//! the same filled surface, the same depression table and the same sediment
//! budget on one rank or on many.
//!
//! ## Pipeline
//! Each rank splits its own partition into steepest-descent catchments,
//! giving every node it shares with a neighbouring partition a region of its
//! own. The catchments and their lowest spill edges are merged into one
//! small graph on rank 0, where shared nodes are folded back into the
//! catchments their owners found. That graph is flooded to find the spill
//! level of every depression. The solution is broadcast, materialised on the
//! nodes and refreshed on ghosts.
//!
//! ## Features
//! - Pluggable communication backends (serial, in-process threads, MPI)
//! - Lockstep collectives with a per-step fingerprint, so a bad input fails
//!   every rank at the same point
//! - Sediment routing from upstream to downstream depressions with a global
//!   conservation check
//!
//! ```toml
//! [dependencies]
//! mesh-pitfill = "0.1"
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ## Usage
//! ```
//! use mesh_pitfill::prelude::*;
//!
//! let grid = StructuredGrid::new(5, 5, 1.0)?;
//! let mesh = grid.partition(1)?.remove(0);
//! let comm = NoComm;
//! let filler = PitFiller::new(mesh, &comm, PitConfig::default())?;
//! let mut z = vec![3.0; grid.node_count()];
//! z[grid.natural(2, 2)] = 1.0;
//! let mut ctx = filler.context(z);
//! assert_eq!(filler.fill(&mut ctx)?, FillOutcome::Depressions(1));
//! assert_eq!(ctx.filled[grid.natural(2, 2)], 3.0);
//! # Ok::<(), mesh_pitfill::pit_error::PitError>(())
//! ```

pub mod algs;
pub mod config;
pub mod debug_invariants;
pub mod pit;
pub mod pit_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::collective::{Collective, SyncPoint};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    pub use crate::config::PitConfig;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::pit::{
        DepressionRecord, DepressionTable, FillOutcome, PitFiller, SedimentBalance, StepContext,
        StepMode,
    };
    pub use crate::pit_error::PitError;
    pub use crate::topology::{MeshPartition, StructuredGrid};
}
