//! I/O modules for interferogram rasters and orbital correction records

pub mod ifg;
pub mod orbfit_cache;

pub use ifg::IfgReader;
pub use orbfit_cache::{CorrectionCache, CorrectionKey};
