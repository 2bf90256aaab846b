//! Orbital error correction for interferograms.
//!
//! Two estimation strategies are supported. The independent method fits and
//! removes a polynomial surface from each interferogram in isolation. The
//! network method (see [`crate::core::network`]) solves one model per epoch
//! jointly across a spanning-tree network of interferograms.
//!
//! Corrections are persisted through [`CorrectionCache`] and reused on later
//! runs with the same configuration.

use crate::core::design_matrix::{DesignMatrixBuilder, DEFAULT_SCALE};
use crate::core::epochs::mst_indices;
use crate::core::linalg::{nanmedian, pinv_solve, PINV_RCOND};
use crate::core::multilook::{MultilookParams, MultilookProcessor};
use crate::core::network::NetworkCorrector;
use crate::io::{CorrectionCache, CorrectionKey};
use crate::types::{
    IfgError, IfgResult, Interferogram, ORB_REMOVED, PYRATE_ORBITAL_ERROR, PYRATE_ORB_DEG,
    PYRATE_ORB_METHOD, PYRATE_ORB_XLOOKS, PYRATE_ORB_YLOOKS,
};
use ndarray::{Array1, Array2, Zip};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;

/// Orbital correction strategy
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrbfitMethod {
    Independent = 1,
    Network = 2,
}

impl TryFrom<u8> for OrbfitMethod {
    type Error = IfgError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(OrbfitMethod::Independent),
            2 => Ok(OrbfitMethod::Network),
            _ => Err(IfgError::OrbitalModel(format!(
                "Invalid method of {} for orbital correction",
                code
            ))),
        }
    }
}

impl fmt::Display for OrbfitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrbfitMethod::Independent => write!(f, "INDEPENDENT"),
            OrbfitMethod::Network => write!(f, "NETWORK"),
        }
    }
}

/// Polynomial form of the orbital error surface
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrbfitDegree {
    /// `[x, y]`
    Planar = 1,
    /// `[x², y², xy, x, y]`
    Quadratic = 2,
    /// `[xy², x², y², xy, x, y]`
    PartCubic = 3,
}

impl OrbfitDegree {
    /// Number of positional model parameters, excluding any offset
    pub fn num_params(&self) -> usize {
        match self {
            OrbfitDegree::Planar => 2,
            OrbfitDegree::Quadratic => 5,
            OrbfitDegree::PartCubic => 6,
        }
    }
}

impl TryFrom<u8> for OrbfitDegree {
    type Error = IfgError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(OrbfitDegree::Planar),
            2 => Ok(OrbfitDegree::Quadratic),
            3 => Ok(OrbfitDegree::PartCubic),
            _ => Err(IfgError::OrbitalModel(format!(
                "Invalid degree of {} for orbital correction",
                code
            ))),
        }
    }
}

impl fmt::Display for OrbfitDegree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrbfitDegree::Planar => write!(f, "PLANAR"),
            OrbfitDegree::Quadratic => write!(f, "QUADRATIC"),
            OrbfitDegree::PartCubic => write!(f, "PART CUBIC"),
        }
    }
}

/// Orbital correction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitalFitParams {
    pub method: OrbfitMethod,
    pub degree: OrbfitDegree,
    /// Fit an additional constant offset term
    pub offset: bool,
    /// Multilook factor applied in x before fitting
    pub x_looks: usize,
    /// Multilook factor applied in y before fitting
    pub y_looks: usize,
    /// Pixel size divisor for the design matrix
    pub scale: Option<f64>,
    /// Output directory; correction records go in `<out_dir>/orb_error`
    pub out_dir: PathBuf,
    /// Maximum NaN fraction tolerated in a multilook window
    pub nodata_threshold: f32,
}

impl Default for OrbitalFitParams {
    fn default() -> Self {
        Self {
            method: OrbfitMethod::Independent,
            degree: OrbfitDegree::Planar,
            offset: false,
            x_looks: 1,
            y_looks: 1,
            scale: Some(DEFAULT_SCALE),
            out_dir: PathBuf::from("."),
            nodata_threshold: 0.5,
        }
    }
}

impl OrbitalFitParams {
    /// Check values that the type system does not rule out
    pub fn validate(&self) -> IfgResult<()> {
        if self.x_looks == 0 || self.y_looks == 0 {
            return Err(IfgError::OrbitalModel(format!(
                "Multi-look factors for orbital correction must be positive integers, got X = {} and Y = {}",
                self.x_looks, self.y_looks
            )));
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(IfgError::OrbitalModel(format!(
                    "Invalid orbital fit scale factor: {}",
                    scale
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.nodata_threshold) {
            return Err(IfgError::OrbitalModel(format!(
                "No-data averaging threshold must be in [0, 1], got {}",
                self.nodata_threshold
            )));
        }
        Ok(())
    }

    pub fn needs_multilook(&self) -> bool {
        self.x_looks > 1 || self.y_looks > 1
    }

    pub fn multilook_params(&self) -> MultilookParams {
        MultilookParams {
            x_looks: self.x_looks,
            y_looks: self.y_looks,
            nodata_threshold: self.nodata_threshold,
        }
    }

    pub fn design_matrix_builder(&self, offset: bool) -> DesignMatrixBuilder {
        DesignMatrixBuilder::new(self.degree, offset).with_scale(self.scale)
    }
}

fn one() -> f64 {
    1.0
}

fn default_scale() -> Option<f64> {
    Some(DEFAULT_SCALE)
}

fn default_threshold() -> f32 {
    0.5
}

/// Orbital settings as they appear in a pipeline configuration, before
/// validation. Codes and look factors are kept loosely typed so invalid
/// values can be reported rather than rejected by the parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOrbitalConfig {
    #[serde(rename = "orbfitmethod")]
    pub method: u8,
    #[serde(rename = "orbfitdegrees")]
    pub degree: u8,
    #[serde(rename = "orbfitoffset", default)]
    pub offset: bool,
    #[serde(rename = "orbfitlksx", default = "one")]
    pub x_looks: f64,
    #[serde(rename = "orbfitlksy", default = "one")]
    pub y_looks: f64,
    #[serde(rename = "orbfitscale", default = "default_scale")]
    pub scale: Option<f64>,
    #[serde(rename = "outdir")]
    pub out_dir: PathBuf,
    #[serde(rename = "noDataAveragingThreshold", default = "default_threshold")]
    pub nodata_threshold: f32,
}

fn looks_factor(value: f64, axis: &str) -> IfgResult<usize> {
    if !value.is_finite() || value.fract() != 0.0 || value < 1.0 {
        return Err(IfgError::OrbitalModel(format!(
            "Multi-look factors for orbital correction should be positive integers, got {} = {}",
            axis, value
        )));
    }
    Ok(value as usize)
}

impl TryFrom<RawOrbitalConfig> for OrbitalFitParams {
    type Error = IfgError;

    fn try_from(raw: RawOrbitalConfig) -> Result<Self, Self::Error> {
        let params = OrbitalFitParams {
            method: OrbfitMethod::try_from(raw.method)?,
            degree: OrbfitDegree::try_from(raw.degree)?,
            offset: raw.offset,
            x_looks: looks_factor(raw.x_looks, "X")?,
            y_looks: looks_factor(raw.y_looks, "Y")?,
            scale: raw.scale,
            out_dir: raw.out_dir,
            nodata_threshold: raw.nodata_threshold,
        };
        params.validate()?;
        Ok(params)
    }
}

/// Remove orbital error from `ifgs` in place using the configured method.
///
/// For the network method the interferograms are first multilooked (when
/// requested) and reduced to a minimum spanning tree; the model fitted on
/// that tree is then removed from every interferogram in `ifgs`.
///
/// Interferograms already tagged with `PYRATE_ORBITAL_ERROR=REMOVED` are
/// left untouched, so running the correction twice is a no-op.
pub fn remove_orbital_error(ifgs: &mut [Interferogram], params: &OrbitalFitParams) -> IfgResult<()> {
    params.validate()?;

    log::info!(
        "Calculating {} orbital correction using {} method",
        params.degree,
        params.method
    );
    if params.needs_multilook() {
        log::info!(
            "Multi-looking interferograms for orbital correction with factors of X = {} and Y = {}",
            params.x_looks,
            params.y_looks
        );
    }

    match params.method {
        OrbfitMethod::Independent => IndependentCorrector::new(params.clone()).correct_all(ifgs),
        OrbfitMethod::Network => {
            if !ifgs.is_empty() && ifgs.iter().all(|ifg| ifg.is_orbital_corrected()) {
                log::warn!("Orbital error already removed from all {} interferograms", ifgs.len());
                return Ok(());
            }

            let corrector = NetworkCorrector::new(params.clone());
            if corrector.try_apply_cached(ifgs)? {
                return Ok(());
            }

            let pending: Vec<&Interferogram> = ifgs
                .iter()
                .filter(|ifg| !ifg.is_orbital_corrected())
                .collect();
            let fit_source: Vec<Interferogram> = if params.needs_multilook() {
                let processor = MultilookProcessor::new(params.multilook_params());
                let mlooked = pending
                    .iter()
                    .map(|ifg| processor.multilook_ifg(ifg))
                    .collect::<IfgResult<Vec<_>>>()?;
                validate_multilooked(&mlooked, &pending)?;
                mlooked
            } else {
                pending.into_iter().cloned().collect()
            };

            let tree = mst_indices(&fit_source)?;
            log::info!(
                "Network orbital fit on {} of {} interferograms after spanning tree reduction",
                tree.len(),
                fit_source.len()
            );
            let fit_ifgs: Vec<&Interferogram> = tree.iter().map(|&i| &fit_source[i]).collect();

            let model = corrector.fit(&fit_ifgs)?;
            corrector.apply_model(&model, ifgs)
        }
    }
}

/// Sanity checks on a multilooked copy of an interferogram set
pub fn validate_multilooked<I: Borrow<Interferogram>>(mlooked: &[Interferogram], ifgs: &[I]) -> IfgResult<()> {
    if mlooked.len() != ifgs.len() {
        return Err(IfgError::Validation(format!(
            "Mismatching # ifgs ({}) and # multilooked ifgs ({})",
            ifgs.len(),
            mlooked.len()
        )));
    }

    if let Some(empty) = mlooked.iter().find(|m| m.num_cells() == 0) {
        return Err(IfgError::Validation(format!(
            "Multilooked ifg {} has no phase data",
            empty.data_path.display()
        )));
    }

    for (m, i) in mlooked.iter().zip(ifgs) {
        let i: &Interferogram = i.borrow();
        if m.first() != i.first() || m.second() != i.second() {
            return Err(IfgError::Validation(format!(
                "Multilooked ifg {} does not match epochs of {}",
                m.data_path.display(),
                i.data_path.display()
            )));
        }
    }

    Ok(())
}

/// A surface ready to be subtracted, and whether it still has to be stored
#[derive(Debug)]
struct PendingCorrection {
    key: CorrectionKey,
    surface: Array2<f32>,
    fresh: bool,
}

/// Whether `ifg` already had its orbital error removed; such rasters are
/// skipped with a warning
pub(crate) fn already_corrected(ifg: &Interferogram) -> bool {
    let done = ifg.is_orbital_corrected();
    if done {
        log::warn!(
            "Orbital error already removed from {}, skipping",
            ifg.data_path.display()
        );
    }
    done
}

/// Per-interferogram orbital correction
#[derive(Debug, Clone)]
pub struct IndependentCorrector {
    params: OrbitalFitParams,
    cache: CorrectionCache,
    multilooker: MultilookProcessor,
}

impl IndependentCorrector {
    pub fn new(params: OrbitalFitParams) -> Self {
        let cache = CorrectionCache::from_params(&params);
        let multilooker = MultilookProcessor::new(params.multilook_params());
        Self {
            params,
            cache,
            multilooker,
        }
    }

    pub fn params(&self) -> &OrbitalFitParams {
        &self.params
    }

    pub fn cache(&self) -> &CorrectionCache {
        &self.cache
    }

    /// Correct every interferogram; each one is independent of the others.
    ///
    /// All surfaces are loaded or fitted before any phase is modified or any
    /// record is written, so a failed fit leaves `ifgs` and the cache as
    /// they were.
    pub fn correct_all(&self, ifgs: &mut [Interferogram]) -> IfgResult<()> {
        self.params.validate()?;

        #[cfg(feature = "parallel")]
        let prepared = {
            use rayon::prelude::*;
            ifgs.par_iter()
                .map(|ifg| self.prepare(ifg))
                .collect::<IfgResult<Vec<_>>>()
        };

        #[cfg(not(feature = "parallel"))]
        let prepared = ifgs
            .iter()
            .map(|ifg| self.prepare(ifg))
            .collect::<IfgResult<Vec<_>>>();

        let prepared = prepared?;

        #[cfg(feature = "parallel")]
        let result = {
            use rayon::prelude::*;
            ifgs.par_iter_mut()
                .zip(prepared.into_par_iter())
                .try_for_each(|(ifg, pending)| match pending {
                    Some(pending) => self.finish(ifg, pending),
                    None => Ok(()),
                })
        };

        #[cfg(not(feature = "parallel"))]
        let result = ifgs
            .iter_mut()
            .zip(prepared)
            .try_for_each(|(ifg, pending)| match pending {
                Some(pending) => self.finish(ifg, pending),
                None => Ok(()),
            });

        result
    }

    /// Remove the orbital error surface from one interferogram.
    ///
    /// A previously stored correction for the same configuration is applied
    /// directly; otherwise the surface is fitted, stored and then applied.
    pub fn correct(&self, ifg: &mut Interferogram) -> IfgResult<()> {
        match self.prepare(ifg)? {
            Some(pending) => self.finish(ifg, pending),
            None => Ok(()),
        }
    }

    /// Load or fit the surface for `ifg`. `None` when it is already corrected.
    fn prepare(&self, ifg: &Interferogram) -> IfgResult<Option<PendingCorrection>> {
        if already_corrected(ifg) {
            return Ok(None);
        }
        log::debug!("Orbital correction of {}", ifg.data_path.display());

        let key = self.cache.key(ifg, &self.params);
        let pending = match self.cache.load(&key, ifg.shape()) {
            Some(surface) => {
                log::info!(
                    "Reusing already computed orbital fit correction: {}",
                    key.path().display()
                );
                PendingCorrection { key, surface, fresh: false }
            }
            None => PendingCorrection {
                surface: self.compute_correction(ifg)?,
                key,
                fresh: true,
            },
        };
        Ok(Some(pending))
    }

    fn finish(&self, ifg: &mut Interferogram, pending: PendingCorrection) -> IfgResult<()> {
        if pending.fresh {
            self.cache.store(&pending.key, &pending.surface)?;
        }
        apply_correction(ifg, &pending.surface, &self.params)
    }

    /// Fit the orbital surface for `ifg` without modifying it.
    ///
    /// When multilooking is requested the model is fitted on the reduced
    /// resolution copy and evaluated on the full resolution grid.
    pub fn compute_correction(&self, ifg: &Interferogram) -> IfgResult<Array2<f32>> {
        let builder = self.params.design_matrix_builder(self.params.offset);
        let full_dm = builder.for_ifg(ifg)?;

        let model = if self.params.needs_multilook() {
            let mlooked = self.multilooker.multilook_ifg(ifg)?;
            let dm = builder.for_ifg(&mlooked)?;
            fit_model(&dm, &mlooked)?
        } else {
            fit_model(&full_dm, ifg)?
        };

        log::debug!("Orbital model for {}: {:?}", ifg.data_path.display(), model.as_slice());

        let mut fullorb = evaluate_model(&full_dm, &model, self.params.offset, ifg.shape())?;

        // restore the original zero reference
        let offset_removal = nanmedian(
            ifg.phase_data()
                .iter()
                .zip(fullorb.iter())
                .map(|(&p, &o)| p - o),
        );
        fullorb.mapv_inplace(|v| v - offset_removal);

        Ok(fullorb)
    }
}

/// Least-squares model parameters for `ifg` given its design matrix
pub fn fit_model(dm: &Array2<f32>, ifg: &Interferogram) -> IfgResult<Array1<f64>> {
    let vphase: Array1<f32> = ifg.phase_data().iter().copied().collect();
    pinv_solve(dm, vphase.view(), PINV_RCOND)
}

/// Evaluate a fitted model on a design matrix. When the model carries an
/// offset term it is left out of the surface.
pub fn evaluate_model(
    dm: &Array2<f32>,
    model: &Array1<f64>,
    offset: bool,
    shape: (usize, usize),
) -> IfgResult<Array2<f32>> {
    let nterms = if offset {
        model.len().saturating_sub(1)
    } else {
        model.len()
    };
    if dm.ncols() < nterms {
        return Err(IfgError::Validation(format!(
            "Design matrix has {} columns but the model has {} terms",
            dm.ncols(),
            nterms
        )));
    }

    let values: Vec<f32> = dm
        .outer_iter()
        .map(|row| {
            row.iter()
                .take(nterms)
                .zip(model.iter())
                .map(|(&d, &m)| d as f64 * m)
                .sum::<f64>() as f32
        })
        .collect();

    Array2::from_shape_vec(shape, values)
        .map_err(|e| IfgError::Validation(format!("Failed to reshape orbital surface: {}", e)))
}

/// Subtract `correction` from the phase, tag the raster and persist it
pub fn apply_correction(
    ifg: &mut Interferogram,
    correction: &Array2<f32>,
    params: &OrbitalFitParams,
) -> IfgResult<()> {
    if correction.dim() != ifg.shape() {
        return Err(IfgError::Validation(format!(
            "Correction shape {:?} does not match {} with shape {:?}",
            correction.dim(),
            ifg.data_path.display(),
            ifg.shape()
        )));
    }

    Zip::from(ifg.phase_data_mut())
        .and(correction)
        .for_each(|p, &c| *p -= c);

    save_orbital_error_corrected_phase(ifg, params)
}

fn save_orbital_error_corrected_phase(ifg: &mut Interferogram, params: &OrbitalFitParams) -> IfgResult<()> {
    ifg.set_metadata_item(PYRATE_ORB_METHOD, &params.method.to_string());
    ifg.set_metadata_item(PYRATE_ORB_DEG, &params.degree.to_string());
    ifg.set_metadata_item(PYRATE_ORB_XLOOKS, &params.x_looks.to_string());
    ifg.set_metadata_item(PYRATE_ORB_YLOOKS, &params.y_looks.to_string());
    ifg.set_metadata_item(PYRATE_ORBITAL_ERROR, ORB_REMOVED);
    ifg.write_modified_phase()
}
