//! Single-band point sampling for static layers such as elevation or land cover.

use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::points::{PointDataset, Value};
use crate::raster::{RasterGrid, RasterSource, WindowedRaster};

/// How many features got a value from a zonal pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZonalReport {
    pub sampled: usize,
    /// Features outside the raster or on a no-data cell.
    pub skipped: usize,
}

/// Writes the value of one raster band under each point into a dataset field.
///
/// Points are located with the raster's own geotransform, so they must
/// already be in the raster's CRS.
#[derive(Debug, Clone)]
pub struct ZonalPointSampler {
    band: usize,
    nodata: Option<f64>,
}

impl Default for ZonalPointSampler {
    fn default() -> Self {
        Self {
            band: 1,
            nodata: None,
        }
    }
}

impl ZonalPointSampler {
    /// Samples `band` (1-based). `nodata` overrides the value in the file, if any.
    pub fn new(band: usize, nodata: Option<f64>) -> Self {
        Self { band, nodata }
    }

    /// Fills `field` in one pass over the dataset.
    ///
    /// Every value is read before the dataset is touched. Features with no value
    /// keep whatever the field already held for them, or null if it is new.
    pub fn sample<S: RasterSource>(
        &self,
        dataset: &mut PointDataset,
        raster: &mut S,
        field: &str,
    ) -> Result<ZonalReport> {
        let band = self
            .band
            .checked_sub(1)
            .ok_or_else(|| Error::raster(raster.path(), "bands are numbered from 1"))?;
        let nodata = self.nodata.or(raster.nodata());

        let geotransform = *raster.geotransform();
        let pixels: Vec<_> = dataset
            .points()
            .iter()
            .map(|&(x, y)| geotransform.geo_to_pixel(x, y))
            .collect();
        let read = raster.read_band(band, &pixels)?;

        let mut report = ZonalReport::default();
        let mut cells: Vec<Value> = match dataset.column(field) {
            Some(existing) => existing.to_vec(),
            None => vec![Value::Null; dataset.len()],
        };
        for (cell, value) in cells.iter_mut().zip(read) {
            match value.filter(|&v| Some(v) != nodata) {
                Some(v) => {
                    *cell = Value::Number(v);
                    report.sampled += 1;
                }
                None => report.skipped += 1,
            }
        }
        dataset.set_column(field, cells)?;
        debug!(
            field,
            band = self.band,
            sampled = report.sampled,
            skipped = report.skipped,
            "zonal pass complete"
        );
        Ok(report)
    }
}

/// Loads the point file, samples one band of the raster into `field` and saves
/// the file once.
pub fn sample_zonal(
    points_path: impl AsRef<Path>,
    raster_path: impl AsRef<Path>,
    field: &str,
    band: usize,
    nodata: Option<f64>,
) -> Result<ZonalReport> {
    let points_path = points_path.as_ref();
    let raster_path = raster_path.as_ref();
    let mut dataset = PointDataset::load(points_path)?;
    let mut raster = WindowedRaster::open(raster_path)?;
    let report = ZonalPointSampler::new(band, nodata).sample(&mut dataset, &mut raster, field)?;
    dataset.save(points_path)?;
    info!(
        points = %points_path.display(),
        raster = %raster_path.display(),
        field,
        sampled = report.sampled,
        skipped = report.skipped,
        "field written"
    );
    Ok(report)
}

/// [`ZonalPointSampler::sample`] against a raster decoded into memory.
pub fn sample_zonal_in_memory(
    dataset: &mut PointDataset,
    raster_path: impl AsRef<Path>,
    field: &str,
    band: usize,
    nodata: Option<f64>,
) -> Result<ZonalReport> {
    let mut raster = RasterGrid::open(raster_path)?;
    ZonalPointSampler::new(band, nodata).sample(dataset, &mut raster, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::GeoTransform;
    use crate::raster::testing::write_geotiff;
    use ndarray::Array3;

    fn grid(nodata: Option<f64>) -> RasterGrid {
        let gt = GeoTransform::new(0.0, 10.0, 20.0, -10.0).unwrap();
        let data = Array3::from_shape_vec((2, 2, 2), vec![1.0, 2.0, 3.0, 0.0, 5.0, 6.0, 7.0, 8.0])
            .unwrap();
        RasterGrid::new(gt, data, nodata, None).unwrap()
    }

    #[test]
    fn fills_field_and_skips_outside_and_nodata() {
        let mut ds = PointDataset::new(vec![(5.0, 15.0), (15.0, 5.0), (50.0, 5.0), (5.0, 5.0)]);
        let report = ZonalPointSampler::default()
            .sample(&mut ds, &mut grid(Some(0.0)), "elev")
            .unwrap();
        assert_eq!(report, ZonalReport { sampled: 2, skipped: 2 });
        assert_eq!(
            ds.column("elev").unwrap(),
            &[Value::Number(1.0), Value::Null, Value::Null, Value::Number(3.0)]
        );
    }

    #[test]
    fn explicit_nodata_and_second_band() {
        let mut ds = PointDataset::new(vec![(5.0, 15.0), (15.0, 15.0)]);
        let report = ZonalPointSampler::new(2, Some(6.0))
            .sample(&mut ds, &mut grid(None), "lc")
            .unwrap();
        assert_eq!(report.sampled, 1);
        assert_eq!(ds.value(0, "lc"), Some(&Value::Number(5.0)));
        assert!(ds.value(1, "lc").unwrap().is_null());
    }

    #[test]
    fn existing_values_survive_skips() {
        let mut ds = PointDataset::new(vec![(5.0, 15.0), (99.0, 99.0)]);
        ds.set_column("elev", vec![Value::Text("a".into()), Value::Text("b".into())])
            .unwrap();
        ZonalPointSampler::default()
            .sample(&mut ds, &mut grid(None), "elev")
            .unwrap();
        assert_eq!(
            ds.column("elev").unwrap(),
            &[Value::Number(1.0), Value::Text("b".into())]
        );
    }

    #[test]
    fn band_zero_or_past_end_is_rejected() {
        let mut ds = PointDataset::new(vec![(5.0, 15.0)]);
        assert!(ZonalPointSampler::new(0, None)
            .sample(&mut ds, &mut grid(None), "x")
            .is_err());
        assert!(ZonalPointSampler::new(3, None)
            .sample(&mut ds, &mut grid(None), "x")
            .is_err());
        assert!(!ds.has_column("x"));
    }

    #[test]
    fn file_pass_saves_once() {
        let dir = tempfile::tempdir().unwrap();
        let raster = dir.path().join("dtm.tif");
        let gt = GeoTransform::new(0.0, 10.0, 20.0, -10.0).unwrap();
        write_geotiff(&raster, &gt, &[vec![11.0, 12.0, 13.0, -9999.0]], 2, 2, None, Some(-9999.0));

        let points = dir.path().join("pts.csv");
        std::fs::write(&points, "id,POINT_X,POINT_Y\na,15,15\nb,15,5\n").unwrap();
        let report = sample_zonal(&points, &raster, "dtm", 1, None).unwrap();
        assert_eq!(report, ZonalReport { sampled: 1, skipped: 1 });
        assert_eq!(
            std::fs::read_to_string(&points).unwrap(),
            "id,POINT_X,POINT_Y,dtm\na,15,15,12\nb,15,5,\n"
        );

        let mut ds = PointDataset::load(&points).unwrap();
        sample_zonal_in_memory(&mut ds, &raster, "dtm2", 1, None).unwrap();
        assert_eq!(ds.value(0, "dtm2"), Some(&Value::Number(12.0)));
    }
}
