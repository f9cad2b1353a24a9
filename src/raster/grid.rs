use ndarray::{Array2, Array3, Axis};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::geotiff;
use super::{RasterShape, RasterSource, check_band, locate_all};
use crate::error::{Error, Result};
use crate::pixel::{GeoTransform, PixelCoordinate};
use crate::time::TimeAxis;

/// A raster held entirely in memory as a `[band, row, col]` array.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    path: PathBuf,
    geotransform: GeoTransform,
    data: Array3<f64>,
    nodata: Option<f64>,
    time_axis: Option<TimeAxis>,
}

impl RasterGrid {
    /// Builds a grid from values already in memory.
    ///
    /// A time axis, if given, must have one entry per band.
    pub fn new(
        geotransform: GeoTransform,
        data: Array3<f64>,
        nodata: Option<f64>,
        time_axis: Option<TimeAxis>,
    ) -> Result<Self> {
        if let Some(axis) = &time_axis {
            if axis.len() != data.shape()[0] {
                return Err(Error::raster(
                    "<memory>",
                    format!(
                        "time axis has {} steps for {} bands",
                        axis.len(),
                        data.shape()[0]
                    ),
                ));
            }
        }
        Ok(Self {
            path: PathBuf::from("<memory>"),
            geotransform,
            data,
            nodata,
            time_axis,
        })
    }

    /// Decodes every band of a GeoTIFF.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut decoder = geotiff::open(path)?;
        let layout = geotiff::read_layout(&mut decoder, path)?;
        let tiff_err = |e: tiff::TiffError| Error::raster(path, e.to_string());

        let plane = layout.width * layout.height;
        let bands = layout.bands();
        let mut values = Vec::with_capacity(plane * bands);

        if layout.samples > 1 {
            // pixel-interleaved: [row][col][band] -> [band][row][col]
            let interleaved = geotiff::to_f64(decoder.read_image().map_err(tiff_err)?);
            expect_len(path, interleaved.len(), plane * bands)?;
            for band in 0..bands {
                values.extend(interleaved.iter().skip(band).step_by(bands));
            }
        } else {
            for &ifd in &layout.pages {
                decoder.seek_to_image(ifd).map_err(tiff_err)?;
                let page = geotiff::to_f64(decoder.read_image().map_err(tiff_err)?);
                expect_len(path, page.len(), plane)?;
                values.extend(page);
            }
        }

        let data = Array3::from_shape_vec((bands, layout.height, layout.width), values)
            .map_err(|e| Error::raster(path, e.to_string()))?;
        debug!(
            path = %path.display(),
            bands,
            rows = layout.height,
            cols = layout.width,
            "raster loaded into memory"
        );

        Ok(Self {
            path: path.to_path_buf(),
            geotransform: layout.geotransform,
            data,
            nodata: layout.nodata,
            time_axis: layout.time_axis,
        })
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    fn mask(&self, v: f64) -> Option<f64> {
        match self.nodata {
            Some(nd) if v == nd || (nd.is_nan() && v.is_nan()) => None,
            _ => Some(v),
        }
    }
}

fn expect_len(path: &Path, got: usize, want: usize) -> Result<()> {
    if got != want {
        return Err(Error::raster(
            path,
            format!("decoded {} values, expected {}", got, want),
        ));
    }
    Ok(())
}

impl RasterSource for RasterGrid {
    fn path(&self) -> &Path {
        &self.path
    }

    fn geotransform(&self) -> &GeoTransform {
        &self.geotransform
    }

    fn shape(&self) -> RasterShape {
        let (bands, rows, cols) = self.data.dim();
        RasterShape { bands, rows, cols }
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn time_axis(&self) -> Option<&TimeAxis> {
        self.time_axis.as_ref()
    }

    fn read_series(&mut self, pixels: &[PixelCoordinate]) -> Result<Array2<f64>> {
        let index = locate_all(&self.path, self.shape(), pixels)?;
        let mut out = Array2::zeros((index.len(), self.data.dim().0));
        for (mut lane, &(row, col)) in out.outer_iter_mut().zip(&index) {
            lane.assign(&self.data.index_axis(Axis(2), col).index_axis(Axis(1), row));
        }
        Ok(out)
    }

    fn read_band(&mut self, band: usize, pixels: &[PixelCoordinate]) -> Result<Vec<Option<f64>>> {
        let shape = self.shape();
        check_band(&self.path, shape, band)?;
        Ok(pixels
            .iter()
            .map(|p| {
                p.index(shape.rows, shape.cols)
                    .and_then(|(r, c)| self.mask(self.data[[band, r, c]]))
            })
            .collect())
    }
}
