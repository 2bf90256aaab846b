use approx::assert_abs_diff_eq;
use ifgnet::core::{mst_indices, DesignMatrixBuilder, NetworkCorrector};
use ifgnet::types::{ORB_REMOVED, PYRATE_ORBITAL_ERROR, PYRATE_ORB_METHOD};
use ifgnet::{remove_orbital_error, Epoch, IfgError, Interferogram, OrbfitDegree, OrbfitMethod, OrbitalFitParams};
use ndarray::{array, Array1, Array2};
use std::collections::BTreeMap;
use tempfile::TempDir;

const ROWS: usize = 6;
const COLS: usize = 8;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn epoch(month: u32) -> Epoch {
    Epoch::from_ymd(2007, month, 1).unwrap()
}

/// Per-epoch planar orbit surfaces
fn epoch_models() -> BTreeMap<Epoch, Array1<f64>> {
    [
        (epoch(1), array![0.0, 0.0]),
        (epoch(2), array![0.4, -0.2]),
        (epoch(3), array![-0.3, 0.6]),
        (epoch(4), array![0.1, 0.25]),
    ]
    .into_iter()
    .collect()
}

fn design_matrix() -> Array2<f32> {
    DesignMatrixBuilder::new(OrbfitDegree::Planar, false)
        .build(ROWS, COLS, 10.0, 10.0)
        .expect("Failed to build design matrix")
}

fn surface(dm: &Array2<f32>, model: &Array1<f64>) -> Array2<f32> {
    let values: Vec<f32> = dm
        .outer_iter()
        .map(|row| row.iter().zip(model.iter()).map(|(&d, &m)| d as f64 * m).sum::<f64>() as f32)
        .collect();
    Array2::from_shape_vec((ROWS, COLS), values).unwrap()
}

/// Interferograms whose phase is exactly the second minus first epoch surface
fn network_ifgs() -> Vec<Interferogram> {
    let dm = design_matrix();
    let models = epoch_models();
    [(1, 2), (2, 3), (3, 4), (1, 3), (2, 4)]
        .iter()
        .map(|&(f, s)| {
            let diff = &models[&epoch(s)] - &models[&epoch(f)];
            Interferogram::new(
                format!("2007{:02}01-2007{:02}01_unw.tif", f, s),
                surface(&dm, &diff),
                10.0,
                10.0,
                epoch(f),
                epoch(s),
            )
            .expect("Failed to create interferogram")
        })
        .collect()
}

fn params(out_dir: &TempDir) -> OrbitalFitParams {
    OrbitalFitParams {
        method: OrbfitMethod::Network,
        degree: OrbfitDegree::Planar,
        out_dir: out_dir.path().to_path_buf(),
        ..Default::default()
    }
}

#[test]
fn test_network_removes_all_ramps() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = params(&out);

    let mut ifgs = network_ifgs();
    remove_orbital_error(&mut ifgs, &params).expect("Network orbital correction failed");

    for ifg in &ifgs {
        assert!(ifg.is_orbital_corrected());
        assert_eq!(ifg.metadata_item(PYRATE_ORB_METHOD), Some("NETWORK"));
        for &v in ifg.phase_data().iter() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_correction_is_difference_of_epoch_models() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = params(&out);
    let originals = network_ifgs();

    let tree = mst_indices(&originals).unwrap();
    assert_eq!(tree.len(), 3);
    let fit_ifgs: Vec<&Interferogram> = tree.iter().map(|&i| &originals[i]).collect();

    let corrector = NetworkCorrector::new(params);
    let model = corrector.fit(&fit_ifgs).expect("Network fit failed");
    assert_eq!(model.epoch_ids().len(), 4);
    assert!(model.offsets().is_empty());

    let mut ifgs = originals.clone();
    corrector.apply_model(&model, &mut ifgs).unwrap();

    let dm = design_matrix();
    for (corrected, original) in ifgs.iter().zip(&originals) {
        let expected = &original.phase_data() - &surface(&dm, &model.ifg_coefficients(original).unwrap());
        for (a, b) in corrected.phase_data().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }
}

#[test]
fn test_stored_corrections_are_reused() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = params(&out);

    let originals = network_ifgs();
    remove_orbital_error(&mut originals.clone(), &params).unwrap();

    // flat copies only change when the stored surfaces are applied
    let mut flat = originals.clone();
    for ifg in flat.iter_mut() {
        ifg.phase_data_mut().fill(0.0);
    }
    remove_orbital_error(&mut flat, &params).unwrap();
    for (ifg, original) in flat.iter().zip(&originals) {
        for (a, b) in ifg.phase_data().iter().zip(original.phase_data().iter()) {
            assert_abs_diff_eq!(*a, -*b, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_partial_records_trigger_full_refit() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = params(&out);

    let originals = network_ifgs();
    remove_orbital_error(&mut originals.clone(), &params).unwrap();

    let corrector = NetworkCorrector::new(params.clone());
    let key = corrector.cache().key(&originals[4], &params);
    std::fs::remove_file(key.path()).unwrap();

    // with one record gone nothing stored is applied; the refit on flat
    // phase finds no orbit at all
    let mut flat = originals.clone();
    for ifg in flat.iter_mut() {
        ifg.phase_data_mut().fill(0.0);
    }
    remove_orbital_error(&mut flat, &params).unwrap();
    for ifg in &flat {
        assert!(ifg.phase_data().iter().all(|v| v.abs() < 1e-5));
    }
    assert!(corrector.cache().exists(&key));
}

#[test]
fn test_network_offsets_flatten_each_ifg() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = OrbitalFitParams {
        offset: true,
        ..params(&out)
    };

    let mut ifgs = network_ifgs();
    for (i, ifg) in ifgs.iter_mut().enumerate() {
        let shift = i as f32 - 2.0;
        ifg.phase_data_mut().mapv_inplace(|v| v + shift);
    }
    remove_orbital_error(&mut ifgs, &params).unwrap();

    for ifg in &ifgs {
        let reference = ifg.phase_data()[[0, 0]];
        for &v in ifg.phase_data().iter() {
            assert_abs_diff_eq!(v, reference, epsilon = 1e-3);
        }
    }
}

#[test]
fn test_multilooked_network_fit() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = OrbitalFitParams {
        x_looks: 2,
        y_looks: 2,
        offset: true,
        ..params(&out)
    };

    let mut ifgs = network_ifgs();
    remove_orbital_error(&mut ifgs, &params).unwrap();

    for ifg in &ifgs {
        let reference = ifg.phase_data()[[0, 0]];
        for &v in ifg.phase_data().iter() {
            assert_abs_diff_eq!(v, reference, epsilon = 1e-3);
        }
    }
}

#[test]
fn test_empty_network_is_rejected() {
    let out = TempDir::new().unwrap();
    let mut ifgs: Vec<Interferogram> = Vec::new();
    assert!(matches!(
        remove_orbital_error(&mut ifgs, &params(&out)),
        Err(IfgError::OrbitalModel(_))
    ));
}

#[test]
fn test_epoch_outside_fitted_network_is_rejected() {
    let out = TempDir::new().unwrap();
    let originals = network_ifgs();
    let corrector = NetworkCorrector::new(params(&out));

    // fit only on ifgs among epochs 1..=3
    let model = corrector.fit(&originals[..2]).unwrap();
    let mut ifgs = originals.clone();
    assert!(matches!(
        corrector.apply_model(&model, &mut ifgs),
        Err(IfgError::Validation(_))
    ));

    // nothing subtracted, tagged or stored
    for (ifg, original) in ifgs.iter().zip(&originals) {
        assert!(!ifg.is_orbital_corrected());
        assert_eq!(ifg.phase_data(), original.phase_data());
    }
    assert!(!corrector.cache().dir().exists());
}

#[test]
fn test_second_run_leaves_corrected_phase_alone() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = OrbitalFitParams {
        offset: true,
        ..params(&out)
    };

    let mut ifgs = network_ifgs();
    for (i, ifg) in ifgs.iter_mut().enumerate() {
        ifg.phase_data_mut().mapv_inplace(|v| v + i as f32);
    }
    remove_orbital_error(&mut ifgs, &params).unwrap();
    let once: Vec<Array2<f32>> = ifgs.iter().map(|ifg| ifg.phase_data().to_owned()).collect();

    remove_orbital_error(&mut ifgs, &params).unwrap();
    for (ifg, expected) in ifgs.iter().zip(&once) {
        assert!(ifg.is_orbital_corrected());
        assert_eq!(ifg.phase_data(), expected.view());
    }

    // a fresh output directory has no records to fall back on
    let elsewhere = TempDir::new().unwrap();
    remove_orbital_error(&mut ifgs, &OrbitalFitParams { out_dir: elsewhere.path().to_path_buf(), ..params })
        .unwrap();
    for (ifg, expected) in ifgs.iter().zip(&once) {
        assert_eq!(ifg.phase_data(), expected.view());
    }
    assert!(!elsewhere.path().join("orb_error").exists());
}

#[test]
fn test_corrected_ifgs_are_left_out_of_the_network() {
    init_logging();
    let out = TempDir::new().unwrap();
    let params = params(&out);

    let originals = network_ifgs();
    let mut ifgs = originals.clone();
    ifgs[4].set_metadata_item(PYRATE_ORBITAL_ERROR, ORB_REMOVED);
    remove_orbital_error(&mut ifgs, &params).unwrap();

    let corrector = NetworkCorrector::new(params.clone());
    assert_eq!(ifgs[4].phase_data(), originals[4].phase_data());
    assert!(!corrector.cache().exists(&corrector.cache().key(&originals[4], &params)));
    for ifg in &ifgs[..4] {
        assert!(ifg.phase_data().iter().all(|v| v.abs() < 1e-4));
    }
}

#[test]
fn test_nan_patch_is_dropped_from_network_fit() {
    init_logging();
    let out = TempDir::new().unwrap();
    let corrector = NetworkCorrector::new(params(&out));

    let mut ifgs = network_ifgs();
    for r in 1..3 {
        for c in 2..5 {
            ifgs[1].phase_data_mut()[[r, c]] = f32::NAN;
        }
    }

    // the chain 1-2, 2-3, 3-4 spans every epoch and includes the patched ifg
    let model = corrector.fit(&ifgs[..3]).expect("Network fit failed");
    assert_eq!(model.epoch_ids().len(), 4);
    corrector.apply_model(&model, &mut ifgs).unwrap();

    for (i, ifg) in ifgs.iter().enumerate() {
        let nans = ifg.phase_data().iter().filter(|v| v.is_nan()).count();
        assert_eq!(nans, if i == 1 { 6 } else { 0 });
        for &v in ifg.phase_data().iter().filter(|v| !v.is_nan()) {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-4);
        }
    }
    assert!(ifgs[1].phase_data()[[2, 4]].is_nan());
}
