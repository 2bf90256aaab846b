use crate::types::{Epoch, GeoTransform, IfgError, IfgResult, Interferogram, FIRST_DATE, SECOND_DATE};
use gdal::raster::Buffer;
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags, Metadata};
use ndarray::Array2;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

/// GDAL-backed reader and writer for single-band interferogram rasters
pub struct IfgReader;

impl IfgReader {
    /// Read an interferogram raster, converting nodata cells to NaN
    pub fn read_ifg<P: AsRef<Path>>(path: P) -> IfgResult<Interferogram> {
        let path = path.as_ref();
        log::info!("Reading interferogram from: {}", path.display());

        let dataset = Dataset::open(path)?;
        let (width, height) = dataset.raster_size();

        let geo_transform = match dataset.geo_transform() {
            Ok(gt) => Some(GeoTransform::from(gt)),
            Err(e) => {
                log::warn!("No geotransform in {}: {}", path.display(), e);
                None
            }
        };
        let (x_size, y_size) = geo_transform
            .map(|gt| (gt.pixel_width.abs(), gt.pixel_height.abs()))
            .unwrap_or((1.0, 1.0));

        let metadata = Self::read_metadata(&dataset);
        let (first, second) = Self::epochs(path, &metadata)?;

        let rasterband = dataset.rasterband(1)?;
        let nodata = rasterband.no_data_value().map(|v| v as f32);
        let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
        let phase = Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| IfgError::InvalidFormat(format!("Failed to reshape phase data: {}", e)))?;

        log::debug!(
            "Interferogram {} -> {}: {}x{}, pixel size {} x {}, nodata {:?}",
            first, second, height, width, x_size, y_size, nodata
        );

        let mut ifg = Interferogram::new(path, phase, x_size, y_size, first, second)?
            .with_file_backing(metadata);
        ifg.nodata = nodata;
        ifg.geo_transform = geo_transform;
        ifg.convert_nodata_to_nan();

        Ok(ifg)
    }

    /// Write the phase band and metadata of `ifg` back to its raster
    pub fn write_phase(ifg: &Interferogram) -> IfgResult<()> {
        log::debug!("Writing phase and metadata to {}", ifg.data_path.display());

        let options = DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
            ..Default::default()
        };
        let mut dataset = Dataset::open_ex(&ifg.data_path, options)?;

        let (width, height) = dataset.raster_size();
        if (height, width) != ifg.shape() {
            return Err(IfgError::Validation(format!(
                "Raster {} is {}x{} but phase is {}x{}",
                ifg.data_path.display(),
                height,
                width,
                ifg.nrows(),
                ifg.ncols()
            )));
        }

        Self::write_band(&dataset, ifg)?;

        for (key, value) in ifg.metadata() {
            dataset.set_metadata_item(key, value, "")?;
        }

        Ok(())
    }

    /// Create a new GeoTIFF at `path` holding the phase and metadata of `ifg`
    pub fn create_ifg<P: AsRef<Path>>(ifg: &Interferogram, path: P) -> IfgResult<()> {
        log::info!("Saving interferogram as GeoTIFF: {}", path.as_ref().display());

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (height, width) = ifg.shape();

        let mut dataset = driver.create_with_band_type::<f32, _>(
            path.as_ref(),
            width as isize,
            height as isize,
            1,
        )?;

        let transform = ifg.geo_transform.unwrap_or(GeoTransform {
            top_left_x: 0.0,
            pixel_width: ifg.x_size,
            rotation_x: 0.0,
            top_left_y: 0.0,
            rotation_y: 0.0,
            pixel_height: -ifg.y_size,
        });
        dataset.set_geo_transform(&transform.to_gdal())?;

        if let Some(nodata) = ifg.nodata {
            dataset.rasterband(1)?.set_no_data_value(Some(nodata as f64))?;
        }
        Self::write_band(&dataset, ifg)?;

        for (key, value) in ifg.metadata() {
            dataset.set_metadata_item(key, value, "")?;
        }

        Ok(())
    }

    fn write_band(dataset: &Dataset, ifg: &Interferogram) -> IfgResult<()> {
        let (height, width) = ifg.shape();
        let flat_data: Vec<f32> = match ifg.nodata {
            Some(nodata) => ifg
                .phase_data()
                .iter()
                .map(|&v| if v.is_nan() { nodata } else { v })
                .collect(),
            None => ifg.phase_data().iter().cloned().collect(),
        };

        let mut rasterband = dataset.rasterband(1)?;
        let buffer = Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
        Ok(())
    }

    fn read_metadata(dataset: &Dataset) -> BTreeMap<String, String> {
        dataset
            .metadata_domain("")
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn epochs(path: &Path, metadata: &BTreeMap<String, String>) -> IfgResult<(Epoch, Epoch)> {
        if let (Some(first), Some(second)) = (metadata.get(FIRST_DATE), metadata.get(SECOND_DATE)) {
            return Ok((first.parse()?, second.parse()?));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parse_epochs_from_name(&name).ok_or_else(|| {
            IfgError::InvalidFormat(format!(
                "No {}/{} metadata and no YYYYMMDD-YYYYMMDD token in {}",
                FIRST_DATE,
                SECOND_DATE,
                path.display()
            ))
        })
    }
}

/// Epoch pair from a `YYYYMMDD-YYYYMMDD` token in a file name
pub fn parse_epochs_from_name(name: &str) -> Option<(Epoch, Epoch)> {
    let re = Regex::new(r"(\d{8})-(\d{8})").ok()?;
    let caps = re.captures(name)?;
    let first = caps[1].parse().ok()?;
    let second = caps[2].parse().ok()?;
    Some((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_epochs_from_name() {
        let (first, second) = parse_epochs_from_name("geo_20060828-20061211_unw.tif").unwrap();
        assert_eq!(first, Epoch::from_ymd(2006, 8, 28).unwrap());
        assert_eq!(second, Epoch::from_ymd(2006, 12, 11).unwrap());

        assert!(parse_epochs_from_name("geo_unw.tif").is_none());
        assert!(parse_epochs_from_name("20061399-20061211.tif").is_none());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("20060828-20061211_ifg.tif");

        let first = Epoch::from_ymd(2006, 8, 28).unwrap();
        let second = Epoch::from_ymd(2006, 12, 11).unwrap();
        let mut phase = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f32);
        phase[[1, 1]] = f32::NAN;
        let mut ifg = Interferogram::new(&path, phase, 25.0, 25.0, first, second).unwrap();
        ifg.nodata = Some(-9999.0);
        IfgReader::create_ifg(&ifg, &path).unwrap();

        let mut read = IfgReader::read_ifg(&path).unwrap();
        assert!(read.is_file_backed());
        assert_eq!(read.shape(), (3, 4));
        assert_eq!((read.x_size, read.y_size), (25.0, 25.0));
        assert_eq!((read.first(), read.second()), (first, second));
        assert_eq!(read.nodata, Some(-9999.0));
        assert!(read.phase_data()[[1, 1]].is_nan());
        assert_eq!(read.phase_data()[[2, 3]], 11.0);

        read.phase_data_mut().mapv_inplace(|v| v - 1.0);
        read.set_metadata_item("PYRATE_ORBITAL_ERROR", "REMOVED");
        read.write_modified_phase().unwrap();

        let reread = IfgReader::read_ifg(&path).unwrap();
        assert!(reread.is_orbital_corrected());
        assert_eq!(reread.phase_data()[[2, 3]], 10.0);
        assert!(reread.phase_data()[[1, 1]].is_nan());
    }
}
