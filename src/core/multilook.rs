use crate::types::{GeoTransform, IfgError, IfgResult, Interferogram};
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Multilooking parameters for reduced resolution orbital fitting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultilookParams {
    /// Number of looks in x (columns)
    pub x_looks: usize,
    /// Number of looks in y (rows)
    pub y_looks: usize,
    /// Windows whose NaN fraction exceeds this become NaN
    pub nodata_threshold: f32,
}

impl Default for MultilookParams {
    fn default() -> Self {
        Self {
            x_looks: 1,
            y_looks: 1,
            nodata_threshold: 0.5,
        }
    }
}

/// Block-averaging multilook processor for phase rasters
#[derive(Debug, Clone)]
pub struct MultilookProcessor {
    params: MultilookParams,
}

impl MultilookProcessor {
    /// Create a new multilook processor
    pub fn new(params: MultilookParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &MultilookParams {
        &self.params
    }

    /// Apply multilooking to phase data
    ///
    /// # Arguments
    /// * `phase` - 2D array of phase values, NaN where invalid
    /// * `x_size` - Original pixel size in x
    /// * `y_size` - Original pixel size in y
    ///
    /// # Returns
    /// * Multilooked phase and the new pixel sizes
    pub fn apply_multilook<S: Data<Elem = f32>>(
        &self,
        phase: &ArrayBase<S, Ix2>,
        x_size: f64,
        y_size: f64,
    ) -> IfgResult<(Array2<f32>, f64, f64)> {
        let (rows, cols) = phase.dim();
        let MultilookParams {
            x_looks,
            y_looks,
            nodata_threshold,
        } = self.params;

        if x_looks == 0 || y_looks == 0 {
            return Err(IfgError::OrbitalModel(format!(
                "Multilook factors must be positive, got X = {} and Y = {}",
                x_looks, y_looks
            )));
        }

        log::debug!(
            "Applying multilook: {}x{} looks to {}x{} image",
            y_looks, x_looks, rows, cols
        );

        let out_rows = rows / y_looks;
        let out_cols = cols / x_looks;

        if out_rows == 0 || out_cols == 0 {
            return Err(IfgError::Validation(format!(
                "Multilook factors {}x{} too large for {}x{} image",
                y_looks, x_looks, rows, cols
            )));
        }

        let window = (x_looks * y_looks) as f32;
        let mut output = Array2::<f32>::from_elem((out_rows, out_cols), f32::NAN);

        for out_row in 0..out_rows {
            for out_col in 0..out_cols {
                let mut sum = 0.0f64;
                let mut count = 0usize;

                let start_row = out_row * y_looks;
                let start_col = out_col * x_looks;
                for in_row in start_row..start_row + y_looks {
                    for in_col in start_col..start_col + x_looks {
                        let v = phase[[in_row, in_col]];
                        if !v.is_nan() {
                            sum += v as f64;
                            count += 1;
                        }
                    }
                }

                let nan_frac = 1.0 - count as f32 / window;
                if count > 0 && nan_frac <= nodata_threshold {
                    output[[out_row, out_col]] = (sum / count as f64) as f32;
                }
            }
        }

        let new_x_size = x_size * x_looks as f64;
        let new_y_size = y_size * y_looks as f64;

        log::debug!(
            "Multilooking complete: {}x{} -> {}x{}, pixel size {} x {} -> {} x {}",
            rows, cols, out_rows, out_cols, x_size, y_size, new_x_size, new_y_size
        );

        Ok((output, new_x_size, new_y_size))
    }

    /// In-memory multilooked copy of `ifg`, keeping its identity and epochs
    pub fn multilook_ifg(&self, ifg: &Interferogram) -> IfgResult<Interferogram> {
        log::debug!(
            "Multi-looking {} with factors X = {} and Y = {}",
            ifg.data_path.display(),
            self.params.x_looks,
            self.params.y_looks
        );

        let (phase, x_size, y_size) = self.apply_multilook(&ifg.phase_data(), ifg.x_size, ifg.y_size)?;
        let mut mlooked = Interferogram::new(&ifg.data_path, phase, x_size, y_size, ifg.first(), ifg.second())?;
        mlooked.geo_transform = ifg.geo_transform.map(|gt| GeoTransform {
            pixel_width: gt.pixel_width * self.params.x_looks as f64,
            pixel_height: gt.pixel_height * self.params.y_looks as f64,
            ..gt
        });
        Ok(mlooked)
    }
}
