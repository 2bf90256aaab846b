//! Network orbital correction.
//!
//! One polynomial surface is estimated per epoch from a spanning-tree network
//! of interferograms. An interferogram's correction is the difference of the
//! surfaces of its second and first epochs. Optional offsets are estimated per
//! interferogram and are never shared between interferograms.

use crate::core::design_matrix::DesignMatrixBuilder;
use crate::core::epochs::{all_epochs, epoch_ids};
use crate::core::linalg::{nanmedian, pinv_solve, PINV_RCOND};
use crate::core::orbital::{
    already_corrected, apply_correction, evaluate_model, OrbfitDegree, OrbitalFitParams,
};
use crate::io::CorrectionCache;
use crate::types::{Epoch, IfgError, IfgResult, Interferogram};
use ndarray::{s, Array1, Array2};
use std::borrow::Borrow;
use std::collections::BTreeMap;

/// Dense network design matrix.
///
/// Rows are the stacked pixels of every interferogram, columns are
/// `num_params` coefficients per epoch followed, when `offset` is set, by one
/// offset column per interferogram. Interferogram `i` spanning epochs
/// `(first, second)` gets the negated per-pixel design block in the columns of
/// `first` and the positive block in the columns of `second`.
pub fn network_design_matrix<I: Borrow<Interferogram>>(
    ifgs: &[I],
    degree: OrbfitDegree,
    offset: bool,
    scale: Option<f64>,
) -> IfgResult<Array2<f32>> {
    let nifgs = ifgs.len();
    if nifgs < 1 {
        return Err(IfgError::OrbitalModel(format!("Invalid number of Ifgs: {}", nifgs)));
    }

    let head: &Interferogram = ifgs[0].borrow();
    check_same_shape(ifgs)?;

    let epochs = all_epochs(ifgs);
    let ids = epoch_ids(&epochs);
    let nepochs = ids.len();
    let ncoef = degree.num_params();
    let ncells = head.num_cells();

    let mut ncols = ncoef * nepochs;
    if offset {
        ncols += nifgs;
    }
    let mut netdm = Array2::<f32>::zeros((ncells * nifgs, ncols));

    let tmpdm = DesignMatrixBuilder::new(degree, false)
        .with_scale(scale)
        .for_ifg(head)?;
    let neg_tmpdm = tmpdm.mapv(|v| -v);
    let offset_col = nepochs * ncoef;

    for (i, ifg) in ifgs.iter().enumerate() {
        let ifg: &Interferogram = ifg.borrow();
        let rs = i * ncells;
        let m = ids[&ifg.first()] * ncoef;
        let n = ids[&ifg.second()] * ncoef;

        netdm
            .slice_mut(s![rs..rs + ncells, m..m + ncoef])
            .assign(&neg_tmpdm);
        netdm
            .slice_mut(s![rs..rs + ncells, n..n + ncoef])
            .assign(&tmpdm);

        if offset {
            netdm
                .slice_mut(s![rs..rs + ncells, offset_col + i])
                .fill(1.0);
        }
    }

    log::debug!(
        "Network design matrix: {} ifgs, {} epochs, shape {:?}",
        nifgs,
        nepochs,
        netdm.dim()
    );

    Ok(netdm)
}

fn as_ifg<I: Borrow<Interferogram>>(ifg: &I) -> &Interferogram {
    ifg.borrow()
}

fn check_same_shape<I: Borrow<Interferogram>>(ifgs: &[I]) -> IfgResult<()> {
    let Some(head) = ifgs.first() else {
        return Ok(());
    };
    let head: &Interferogram = head.borrow();
    if let Some(odd) = ifgs
        .iter()
        .map(as_ifg)
        .find(|i| i.shape() != head.shape())
    {
        return Err(IfgError::Validation(format!(
            "Network interferograms must share one shape: {} is {:?}, {} is {:?}",
            head.data_path.display(),
            head.shape(),
            odd.data_path.display(),
            odd.shape()
        )));
    }
    Ok(())
}

/// Coefficients of a jointly fitted network orbital model
#[derive(Debug, Clone)]
pub struct NetworkModel {
    degree: OrbfitDegree,
    ids: BTreeMap<Epoch, usize>,
    coefs: Vec<Array1<f64>>,
    offsets: Vec<f64>,
}

impl NetworkModel {
    pub fn degree(&self) -> OrbfitDegree {
        self.degree
    }

    /// Epoch to coefficient block mapping
    pub fn epoch_ids(&self) -> &BTreeMap<Epoch, usize> {
        &self.ids
    }

    pub fn coefficients(&self, epoch: Epoch) -> Option<&Array1<f64>> {
        self.ids.get(&epoch).map(|&id| &self.coefs[id])
    }

    /// Per-interferogram offsets, in fit order. Empty without offsets.
    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    /// `coef[second] - coef[first]` for `ifg`
    pub fn ifg_coefficients(&self, ifg: &Interferogram) -> IfgResult<Array1<f64>> {
        let lookup = |epoch: Epoch| {
            self.coefficients(epoch).ok_or_else(|| {
                IfgError::Validation(format!(
                    "Epoch {} of {} is not part of the fitted network",
                    epoch,
                    ifg.data_path.display()
                ))
            })
        };
        Ok(lookup(ifg.second())? - lookup(ifg.first())?)
    }
}

/// Joint orbital correction over an interferogram network
#[derive(Debug, Clone)]
pub struct NetworkCorrector {
    params: OrbitalFitParams,
    cache: CorrectionCache,
}

impl NetworkCorrector {
    pub fn new(params: OrbitalFitParams) -> Self {
        let cache = CorrectionCache::from_params(&params);
        Self { params, cache }
    }

    pub fn cache(&self) -> &CorrectionCache {
        &self.cache
    }

    /// Fit the network model on `fit_ifgs` (already reduced to a spanning
    /// tree) and remove it from every interferogram in `ifgs`.
    ///
    /// When every interferogram already has a stored correction for this
    /// configuration those are applied instead and nothing is fitted.
    /// Interferograms tagged as corrected take part in neither the fit nor
    /// the correction.
    pub fn correct<I: Borrow<Interferogram>>(
        &self,
        fit_ifgs: &[I],
        ifgs: &mut [Interferogram],
    ) -> IfgResult<()> {
        self.params.validate()?;
        if ifgs.is_empty() {
            return Err(IfgError::OrbitalModel("Invalid number of Ifgs: 0".to_string()));
        }
        if self.try_apply_cached(ifgs)? {
            return Ok(());
        }

        let fit_ifgs: Vec<&Interferogram> = fit_ifgs
            .iter()
            .map(as_ifg)
            .filter(|ifg| !ifg.is_orbital_corrected())
            .collect();
        let model = self.fit(&fit_ifgs)?;
        self.apply_model(&model, ifgs)
    }

    /// Apply stored corrections if, and only if, all of them are available.
    /// Interferograms already tagged as corrected need no record.
    pub fn try_apply_cached(&self, ifgs: &mut [Interferogram]) -> IfgResult<bool> {
        if ifgs.is_empty() {
            return Ok(false);
        }

        let mut corrections = Vec::with_capacity(ifgs.len());
        for ifg in ifgs.iter() {
            if ifg.is_orbital_corrected() {
                corrections.push(None);
                continue;
            }
            let key = self.cache.key(ifg, &self.params);
            match self.cache.load(&key, ifg.shape()) {
                Some(c) => corrections.push(Some(c)),
                None => {
                    log::debug!(
                        "No stored network correction for {}; fitting the network",
                        ifg.data_path.display()
                    );
                    return Ok(false);
                }
            }
        }

        log::warn!("Reusing orbfit errors from previous run!");
        for (ifg, correction) in ifgs.iter_mut().zip(&corrections) {
            match correction {
                Some(correction) => apply_correction(ifg, correction, &self.params)?,
                None => {
                    already_corrected(ifg);
                }
            }
        }
        Ok(true)
    }

    /// Solve the network least-squares problem for one coefficient block
    /// per epoch
    pub fn fit<I: Borrow<Interferogram>>(&self, fit_ifgs: &[I]) -> IfgResult<NetworkModel> {
        let degree = self.params.degree;
        let b = network_design_matrix(fit_ifgs, degree, self.params.offset, self.params.scale)?;

        let vphase: Array1<f32> = fit_ifgs
            .iter()
            .map(as_ifg)
            .flat_map(|ifg| ifg.phase_data().into_iter().copied())
            .collect();

        let orbparams = pinv_solve(&b, vphase.view(), PINV_RCOND)?;

        let ids = epoch_ids(&all_epochs(fit_ifgs));
        let ncoef = degree.num_params();
        let coefs: Vec<Array1<f64>> = (0..ids.len())
            .map(|k| orbparams.slice(s![k * ncoef..(k + 1) * ncoef]).to_owned())
            .collect();
        let offsets = orbparams.slice(s![ids.len() * ncoef..]).to_vec();

        log::info!(
            "Fitted {} network orbital model over {} epochs",
            degree,
            ids.len()
        );

        Ok(NetworkModel {
            degree,
            ids,
            coefs,
            offsets,
        })
    }

    /// Full resolution correction surface of `ifg` under `model`
    pub fn correction_surface(
        &self,
        model: &NetworkModel,
        dm: &Array2<f32>,
        ifg: &Interferogram,
    ) -> IfgResult<Array2<f32>> {
        let diff = model.ifg_coefficients(ifg)?;
        let mut orb = evaluate_model(dm, &diff, false, ifg.shape())?;

        if self.params.offset {
            // bring every ifg to the same base level
            let median = nanmedian(
                ifg.phase_data()
                    .iter()
                    .zip(orb.iter())
                    .map(|(&p, &o)| p - o),
            );
            orb.mapv_inplace(|v| v - median);
        }
        Ok(orb)
    }

    /// Remove a fitted network model from every interferogram in `ifgs`,
    /// storing each correction surface.
    ///
    /// Every surface is evaluated before anything is stored or subtracted,
    /// so an interferogram outside the fitted network leaves `ifgs` and the
    /// cache untouched.
    pub fn apply_model(&self, model: &NetworkModel, ifgs: &mut [Interferogram]) -> IfgResult<()> {
        if ifgs.is_empty() {
            return Err(IfgError::OrbitalModel("Invalid number of Ifgs: 0".to_string()));
        }
        check_same_shape(&*ifgs)?;

        let pending: Vec<&mut Interferogram> = ifgs
            .iter_mut()
            .filter(|ifg| !already_corrected(ifg))
            .collect();
        let Some(head) = pending.first() else {
            return Ok(());
        };

        // full resolution DM expands a possibly coarser model
        let dm = self.params.design_matrix_builder(false).for_ifg(head)?;

        let surfaces = pending
            .iter()
            .map(|ifg| self.correction_surface(model, &dm, ifg))
            .collect::<IfgResult<Vec<_>>>()?;

        let apply = |(ifg, orb): (&mut Interferogram, &Array2<f32>)| -> IfgResult<()> {
            let key = self.cache.key(ifg, &self.params);
            self.cache.store(&key, orb)?;
            apply_correction(ifg, orb, &self.params)
        };

        #[cfg(feature = "parallel")]
        let result = {
            use rayon::prelude::*;
            pending.into_par_iter().zip(surfaces.par_iter()).try_for_each(apply)
        };

        #[cfg(not(feature = "parallel"))]
        let result = pending.into_iter().zip(surfaces.iter()).try_for_each(apply);

        result
    }
}
