//! ifgnet: orbital error correction and loop analysis for interferogram networks
//!
//! Removes long-wavelength orbital ramps from unwrapped interferograms,
//! either per interferogram or jointly over a spanning-tree network of
//! epochs, and enumerates closed interferogram loops for phase closure
//! checks.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{Epoch, GeoTransform, IfgError, IfgResult, Interferogram, PhaseImage};

pub use io::{CorrectionCache, CorrectionKey, IfgReader};

pub use crate::core::{
    find_cycles, get_design_matrix, remove_orbital_error, EpochNetwork, LoopSet, OrbfitDegree,
    OrbfitMethod, OrbitalFitParams,
};

#[cfg(feature = "python")]
mod python {
    use crate::core::{DesignMatrixBuilder, OrbfitDegree, OrbfitMethod, OrbitalFitParams};
    use crate::io::IfgReader;
    use crate::types::{IfgError, Interferogram};
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use std::path::PathBuf;

    fn to_py_err(e: IfgError) -> PyErr {
        match e {
            IfgError::Io(_) | IfgError::Gdal(_) | IfgError::CacheWrite(_) => PyIOError::new_err(e.to_string()),
            IfgError::OrbitalModel(_) | IfgError::Validation(_) | IfgError::InvalidFormat(_) => {
                PyValueError::new_err(e.to_string())
            }
            IfgError::Computation(_) => PyRuntimeError::new_err(e.to_string()),
        }
    }

    /// Find all loops of `loop_length` epochs in a 0/1 adjacency matrix.
    /// Returns the cycle count and the deduplicated loops.
    #[pyfunction]
    fn find_cycles<'py>(graph: PyReadonlyArray2<'py, u8>, loop_length: usize) -> PyResult<(usize, Vec<Vec<usize>>)> {
        let graph = graph.as_array().to_owned();
        let result = crate::core::find_cycles(&graph, loop_length).map_err(to_py_err)?;
        Ok((result.count, result.loops))
    }

    /// Orbital design matrix for a raster of the given shape and pixel size
    #[pyfunction]
    #[pyo3(signature = (nrows, ncols, x_size, y_size, degree, offset, scale = Some(100.0)))]
    fn get_design_matrix<'py>(
        py: Python<'py>,
        nrows: usize,
        ncols: usize,
        x_size: f64,
        y_size: f64,
        degree: u8,
        offset: bool,
        scale: Option<f64>,
    ) -> PyResult<&'py PyArray2<f32>> {
        let degree = OrbfitDegree::try_from(degree).map_err(to_py_err)?;
        let dm = DesignMatrixBuilder::new(degree, offset)
            .with_scale(scale)
            .build(nrows, ncols, x_size, y_size)
            .map_err(to_py_err)?;
        Ok(dm.into_pyarray(py))
    }

    /// Remove orbital error from interferogram rasters in place
    #[pyfunction]
    #[pyo3(signature = (paths, out_dir, method = 1, degree = 1, offset = false, x_looks = 1, y_looks = 1))]
    fn remove_orbital_error(
        py: Python<'_>,
        paths: Vec<String>,
        out_dir: String,
        method: u8,
        degree: u8,
        offset: bool,
        x_looks: usize,
        y_looks: usize,
    ) -> PyResult<()> {
        let params = OrbitalFitParams {
            method: OrbfitMethod::try_from(method).map_err(to_py_err)?,
            degree: OrbfitDegree::try_from(degree).map_err(to_py_err)?,
            offset,
            x_looks,
            y_looks,
            out_dir: PathBuf::from(out_dir),
            ..Default::default()
        };

        py.allow_threads(|| {
            let mut ifgs = paths
                .iter()
                .map(IfgReader::read_ifg)
                .collect::<Result<Vec<Interferogram>, _>>()?;
            crate::core::remove_orbital_error(&mut ifgs, &params)
        })
        .map_err(to_py_err)
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(find_cycles, m)?)?;
        m.add_function(wrap_pyfunction!(get_design_matrix, m)?)?;
        m.add_function(wrap_pyfunction!(remove_orbital_error, m)?)?;
        Ok(())
    }
}
