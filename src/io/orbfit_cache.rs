use crate::core::orbital::OrbitalFitParams;
use crate::types::{IfgError, IfgResult, Interferogram};
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Sub-directory of the output directory holding correction records
pub const ORB_ERROR_DIR: &str = "orb_error";

/// Location of one persisted correction surface.
///
/// The key folds in every configuration value that changes the fitted
/// surface, so a configuration change always maps to a new record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrectionKey {
    path: PathBuf,
}

impl CorrectionKey {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// On-disk store of orbital correction surfaces, one `.npy` file per
/// interferogram and configuration. Records are written once and never
/// modified.
#[derive(Debug, Clone)]
pub struct CorrectionCache {
    dir: PathBuf,
}

impl CorrectionCache {
    /// Cache rooted at `<out_dir>/orb_error`
    pub fn new<P: AsRef<Path>>(out_dir: P) -> Self {
        Self {
            dir: out_dir.as_ref().join(ORB_ERROR_DIR),
        }
    }

    pub fn from_params(params: &OrbitalFitParams) -> Self {
        Self::new(&params.out_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Key for the interferogram stored at `ifg_path` under `params`
    pub fn key_for_path(&self, ifg_path: &Path, params: &OrbitalFitParams) -> CorrectionKey {
        let stem = ifg_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ifg".to_string());
        self.key_for_stem(&stem, params)
    }

    pub fn key(&self, ifg: &Interferogram, params: &OrbitalFitParams) -> CorrectionKey {
        self.key_for_stem(&ifg.stem(), params)
    }

    fn key_for_stem(&self, stem: &str, params: &OrbitalFitParams) -> CorrectionKey {
        let mut name = format!(
            "{}_{}_{}_{}_{}_{}",
            stem,
            params.method as u8,
            params.degree as u8,
            u8::from(params.offset),
            params.x_looks,
            params.y_looks
        );
        // the threshold only shapes the fit when windows are averaged
        if params.needs_multilook() {
            name.push_str(&format!("_{}", params.nodata_threshold));
        }
        name.push_str("_orbfit.npy");
        CorrectionKey {
            path: self.dir.join(name),
        }
    }

    pub fn exists(&self, key: &CorrectionKey) -> bool {
        key.path.is_file()
    }

    /// Load a record. Missing, unreadable or mis-shaped records are a cache
    /// miss, never an error.
    pub fn load(&self, key: &CorrectionKey, expected_shape: (usize, usize)) -> Option<Array2<f32>> {
        if !self.exists(key) {
            return None;
        }

        match read_npy::<_, Array2<f32>>(&key.path) {
            Ok(surface) if surface.dim() == expected_shape => Some(surface),
            Ok(surface) => {
                log::warn!(
                    "Ignoring correction record {} with shape {:?}, expected {:?}",
                    key.path.display(),
                    surface.dim(),
                    expected_shape
                );
                None
            }
            Err(e) => {
                log::warn!("Ignoring unreadable correction record {}: {}", key.path.display(), e);
                None
            }
        }
    }

    /// Persist a record. The file is written to a temporary sibling and
    /// moved into place without clobbering, so concurrent writers of the
    /// same key never interleave; the first one to land wins.
    pub fn store(&self, key: &CorrectionKey, surface: &Array2<f32>) -> IfgResult<()> {
        if self.exists(key) {
            log::debug!("Correction record {} already exists, not overwriting", key.path.display());
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let tmp = NamedTempFile::new_in(&self.dir)?;
        write_npy(tmp.path(), surface)?;

        match tmp.persist_noclobber(&key.path) {
            Ok(_) => {
                log::debug!("Saved correction record {}", key.path.display());
                Ok(())
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                log::debug!("Correction record {} written concurrently", key.path.display());
                Ok(())
            }
            Err(e) => Err(IfgError::Io(e.error)),
        }
    }
}
