//! Depression filling and sediment redistribution.

pub mod definition;
pub mod graph_fill;
pub mod kernels;
pub mod labels;
pub mod sediment;
pub mod spill_graph;
pub mod step;

pub use definition::{DepressionRecord, DepressionTable};
pub use graph_fill::{PitSolution, SolvedGraph, SpillPoint, graph_fill};
pub use labels::LabelOffsets;
pub use sediment::SedimentBalance;
pub use spill_graph::{SpillEdge, SpillTarget};
pub use step::{FillOutcome, PitFiller, StepContext, StepMode};
