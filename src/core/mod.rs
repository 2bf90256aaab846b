//! Core interferogram processing modules

pub mod design_matrix;
pub mod epochs;
pub mod linalg;
pub mod loops;
pub mod multilook;
pub mod network;
pub mod orbital;

// Re-export main types
pub use design_matrix::{get_design_matrix, DesignMatrixBuilder, DEFAULT_SCALE};
pub use epochs::{all_epochs, epoch_ids, mst_indices, EpochNetwork};
pub use loops::{dedupe_loops, find_cycles, LoopSet};
pub use multilook::{MultilookParams, MultilookProcessor};
pub use network::{network_design_matrix, NetworkCorrector, NetworkModel};
pub use orbital::{
    remove_orbital_error, IndependentCorrector, OrbfitDegree, OrbfitMethod, OrbitalFitParams,
    RawOrbitalConfig,
};
