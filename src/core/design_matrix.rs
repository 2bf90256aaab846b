use crate::core::linalg::condition_number;
use crate::core::orbital::OrbfitDegree;
use crate::types::{IfgError, IfgResult, Interferogram};
use ndarray::Array2;

/// Default divisor applied to the pixel size before building the design
/// matrix. Keeps the higher order terms well conditioned.
pub const DEFAULT_SCALE: f64 = 100.0;

/// Builds per-pixel polynomial regression matrices for orbital fitting
#[derive(Debug, Clone, Copy)]
pub struct DesignMatrixBuilder {
    degree: OrbfitDegree,
    offset: bool,
    scale: Option<f64>,
}

impl DesignMatrixBuilder {
    /// Create a builder with the default distance scale
    pub fn new(degree: OrbfitDegree, offset: bool) -> Self {
        Self {
            degree,
            offset,
            scale: Some(DEFAULT_SCALE),
        }
    }

    /// Override the pixel size divisor (`None` uses the raw pixel size)
    pub fn with_scale(mut self, scale: Option<f64>) -> Self {
        self.scale = scale;
        self
    }

    /// Number of columns the built matrix will have
    pub fn num_params(&self) -> usize {
        self.degree.num_params() + usize::from(self.offset)
    }

    /// Design matrix for the geometry of `ifg`
    pub fn for_ifg(&self, ifg: &Interferogram) -> IfgResult<Array2<f32>> {
        self.build(ifg.nrows(), ifg.ncols(), ifg.x_size, ifg.y_size)
    }

    /// Build a `(nrows * ncols, num_params)` design matrix.
    ///
    /// Pixels are enumerated row-major. Coordinates start at 1 so the first
    /// cell does not collapse to zero, and are multiplied by the (scaled)
    /// pixel size to give distance from the origin. Column order:
    ///
    /// * planar: `[x, y]`
    /// * quadratic: `[x², y², xy, x, y]`
    /// * part-cubic: `[xy², x², y², xy, x, y]`
    ///
    /// followed by a column of ones when an offset is requested.
    pub fn build(&self, nrows: usize, ncols: usize, x_size: f64, y_size: f64) -> IfgResult<Array2<f32>> {
        let (xsize, ysize) = match self.scale {
            Some(scale) if !scale.is_finite() || scale == 0.0 => {
                return Err(IfgError::OrbitalModel(format!(
                    "Invalid design matrix scale factor: {}",
                    scale
                )));
            }
            Some(scale) => (x_size / scale, y_size / scale),
            None => (x_size, y_size),
        };

        let num_cells = nrows * ncols;
        let nparams = self.num_params();
        let mut dm = Array2::<f32>::zeros((num_cells, nparams));

        for (idx, mut row) in dm.outer_iter_mut().enumerate() {
            let x = ((idx % ncols) + 1) as f64 * xsize;
            let y = ((idx / ncols) + 1) as f64 * ysize;

            match self.degree {
                OrbfitDegree::Planar => {
                    row[0] = x as f32;
                    row[1] = y as f32;
                }
                OrbfitDegree::Quadratic => {
                    row[0] = (x * x) as f32;
                    row[1] = (y * y) as f32;
                    row[2] = (x * y) as f32;
                    row[3] = x as f32;
                    row[4] = y as f32;
                }
                OrbfitDegree::PartCubic => {
                    row[0] = (x * y * y) as f32;
                    row[1] = (x * x) as f32;
                    row[2] = (y * y) as f32;
                    row[3] = (x * y) as f32;
                    row[4] = x as f32;
                    row[5] = y as f32;
                }
            }

            if self.offset {
                row[nparams - 1] = 1.0;
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "Condition number of the {} design matrix is {}",
                self.degree,
                condition_number(&dm)
            );
        }

        Ok(dm)
    }
}

/// Design matrix for `ifg` with the given model
pub fn get_design_matrix(
    ifg: &Interferogram,
    degree: OrbfitDegree,
    offset: bool,
    scale: Option<f64>,
) -> IfgResult<Array2<f32>> {
    DesignMatrixBuilder::new(degree, offset)
        .with_scale(scale)
        .for_ifg(ifg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_column_counts() {
        for (degree, expected) in [
            (OrbfitDegree::Planar, 2),
            (OrbfitDegree::Quadratic, 5),
            (OrbfitDegree::PartCubic, 6),
        ] {
            let dm = DesignMatrixBuilder::new(degree, false).build(3, 4, 10.0, 10.0).unwrap();
            assert_eq!(dm.dim(), (12, expected));

            let dm = DesignMatrixBuilder::new(degree, true).build(3, 4, 10.0, 10.0).unwrap();
            assert_eq!(dm.dim(), (12, expected + 1));
            assert!(dm.column(expected).iter().all(|&v| v == 1.0));
        }
    }

    #[test]
    fn test_planar_coordinates_start_at_one() {
        let dm = DesignMatrixBuilder::new(OrbfitDegree::Planar, false)
            .with_scale(None)
            .build(2, 3, 10.0, 20.0)
            .unwrap();

        // first cell, row 0 col 0
        assert_eq!(dm[[0, 0]], 10.0);
        assert_eq!(dm[[0, 1]], 20.0);
        // last cell of first row, col 2
        assert_eq!(dm[[2, 0]], 30.0);
        assert_eq!(dm[[2, 1]], 20.0);
        // first cell of second row
        assert_eq!(dm[[3, 0]], 10.0);
        assert_eq!(dm[[3, 1]], 40.0);
    }

    #[test]
    fn test_part_cubic_terms() {
        let dm = DesignMatrixBuilder::new(OrbfitDegree::PartCubic, false)
            .build(2, 2, 100.0, 200.0)
            .unwrap();

        // last pixel: x = 2 * 1.0, y = 2 * 2.0 after scaling by 100
        let row = dm.row(3);
        let (x, y) = (2.0f32, 4.0f32);
        assert_abs_diff_eq!(row[0], x * y * y);
        assert_abs_diff_eq!(row[1], x * x);
        assert_abs_diff_eq!(row[2], y * y);
        assert_abs_diff_eq!(row[3], x * y);
        assert_abs_diff_eq!(row[4], x);
        assert_abs_diff_eq!(row[5], y);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let builder = DesignMatrixBuilder::new(OrbfitDegree::Quadratic, true);
        let a = builder.build(5, 7, 25.0, 25.0).unwrap();
        let b = builder.build(5, 7, 25.0, 25.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_scale_is_rejected() {
        let result = DesignMatrixBuilder::new(OrbfitDegree::Planar, false)
            .with_scale(Some(0.0))
            .build(2, 2, 1.0, 1.0);
        assert!(matches!(result, Err(IfgError::OrbitalModel(_))));
    }
}
