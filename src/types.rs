use chrono::NaiveDate;
use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 2D real-valued phase raster (rows x columns)
pub type PhaseImage = Array2<f32>;

/// Metadata key marking whether orbital error has been removed
pub const PYRATE_ORBITAL_ERROR: &str = "PYRATE_ORBITAL_ERROR";
/// Value written under [`PYRATE_ORBITAL_ERROR`] once the correction is applied
pub const ORB_REMOVED: &str = "REMOVED";
pub const PYRATE_ORB_METHOD: &str = "PYRATE_ORB_METHOD";
pub const PYRATE_ORB_DEG: &str = "PYRATE_ORB_DEG";
pub const PYRATE_ORB_XLOOKS: &str = "PYRATE_ORB_XLOOKS";
pub const PYRATE_ORB_YLOOKS: &str = "PYRATE_ORB_YLOOKS";
pub const FIRST_DATE: &str = "FIRST_DATE";
pub const SECOND_DATE: &str = "SECOND_DATE";

/// Acquisition date of a single radar image
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Epoch(NaiveDate);

impl Epoch {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Build an epoch from calendar components
    pub fn from_ymd(year: i32, month: u32, day: u32) -> IfgResult<Self> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| IfgError::InvalidFormat(format!("Invalid date {}-{}-{}", year, month, day)))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for Epoch {
    type Err = IfgError;

    /// Accepts both `YYYYMMDD` and `YYYY-MM-DD`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        NaiveDate::parse_from_str(s, "%Y%m%d")
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
            .map(Self)
            .map_err(|e| IfgError::InvalidFormat(format!("Cannot parse epoch '{}': {}", s, e)))
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

impl From<[f64; 6]> for GeoTransform {
    fn from(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }
}

/// Unwrapped interferogram between two acquisition epochs.
///
/// Phase is held in memory with nodata cells converted to NaN. The epoch
/// pair and the raster shape are fixed at construction; only the phase
/// values and the metadata tags change as corrections are applied.
#[derive(Debug, Clone)]
pub struct Interferogram {
    pub data_path: PathBuf,
    /// Pixel size in the x (column) direction
    pub x_size: f64,
    /// Pixel size in the y (row) direction
    pub y_size: f64,
    pub nodata: Option<f32>,
    pub geo_transform: Option<GeoTransform>,
    phase_data: PhaseImage,
    first: Epoch,
    second: Epoch,
    metadata: BTreeMap<String, String>,
    file_backed: bool,
}

impl Interferogram {
    /// Create an in-memory interferogram
    pub fn new<P: AsRef<Path>>(
        data_path: P,
        phase_data: PhaseImage,
        x_size: f64,
        y_size: f64,
        first: Epoch,
        second: Epoch,
    ) -> IfgResult<Self> {
        if first >= second {
            return Err(IfgError::Validation(format!(
                "First epoch {} must precede second epoch {} in {}",
                first,
                second,
                data_path.as_ref().display()
            )));
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(FIRST_DATE.to_string(), first.to_string());
        metadata.insert(SECOND_DATE.to_string(), second.to_string());

        Ok(Self {
            data_path: data_path.as_ref().to_path_buf(),
            phase_data,
            x_size,
            y_size,
            nodata: None,
            geo_transform: None,
            first,
            second,
            metadata,
            file_backed: false,
        })
    }

    /// Mark this interferogram as persisted through a GDAL raster at `data_path`
    pub(crate) fn with_file_backing(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self.file_backed = true;
        self
    }

    pub fn first(&self) -> Epoch {
        self.first
    }

    pub fn second(&self) -> Epoch {
        self.second
    }

    pub fn phase_data(&self) -> ArrayView2<'_, f32> {
        self.phase_data.view()
    }

    /// Mutable view of the phase; the raster shape cannot change through it
    pub fn phase_data_mut(&mut self) -> ArrayViewMut2<'_, f32> {
        self.phase_data.view_mut()
    }

    pub fn nrows(&self) -> usize {
        self.phase_data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.phase_data.ncols()
    }

    pub fn num_cells(&self) -> usize {
        self.phase_data.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.phase_data.dim()
    }

    pub fn is_file_backed(&self) -> bool {
        self.file_backed
    }

    /// Fraction of cells holding NaN
    pub fn nan_fraction(&self) -> f64 {
        if self.num_cells() == 0 {
            return 0.0;
        }
        let nans = self.phase_data.iter().filter(|v| v.is_nan()).count();
        nans as f64 / self.num_cells() as f64
    }

    /// Replace cells equal to the nodata marker with NaN
    pub fn convert_nodata_to_nan(&mut self) {
        if let Some(nodata) = self.nodata {
            if nodata.is_nan() {
                return;
            }
            self.phase_data.mapv_inplace(|v| if v == nodata { f32::NAN } else { v });
        }
    }

    pub fn metadata_item(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_metadata_item(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Whether an orbital correction has already been written to this raster
    pub fn is_orbital_corrected(&self) -> bool {
        self.metadata_item(PYRATE_ORBITAL_ERROR) == Some(ORB_REMOVED)
    }

    /// File stem used to derive artifact names
    pub fn stem(&self) -> String {
        self.data_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}-{}", self.first.date().format("%Y%m%d"), self.second.date().format("%Y%m%d")))
    }

    /// Persist the current phase and metadata.
    ///
    /// In-memory interferograms have nothing to write back.
    pub fn write_modified_phase(&self) -> IfgResult<()> {
        if self.file_backed {
            crate::io::IfgReader::write_phase(self)
        } else {
            log::debug!("{} is not file backed; keeping phase in memory", self.data_path.display());
            Ok(())
        }
    }
}

/// Error types for interferogram network processing
#[derive(Debug, thiserror::Error)]
pub enum IfgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Orbital model error: {0}")]
    OrbitalModel(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Computation error: {0}")]
    Computation(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Correction record write error: {0}")]
    CacheWrite(#[from] ndarray_npy::WriteNpyError),
}

/// Result type for interferogram operations
pub type IfgResult<T> = Result<T, IfgError>;
