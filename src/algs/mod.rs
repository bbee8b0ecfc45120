//! Message passing and the collective protocol built on top of it.

pub mod collective;
pub mod communicator;
pub mod wire;

pub use collective::{Collective, SyncPoint};
pub use communicator::{CommTag, Communicator, NoComm, RayonComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
