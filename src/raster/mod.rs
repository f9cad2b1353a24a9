//! Readers for geo-referenced, multi-time-step rasters.

mod geotiff;
mod grid;
mod windowed;

pub use grid::RasterGrid;
pub use windowed::WindowedRaster;

use ndarray::Array2;
use std::path::Path;

use crate::error::{Error, Result};
use crate::pixel::{GeoTransform, PixelCoordinate};
use crate::time::TimeAxis;

/// Band count and grid size of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterShape {
    pub bands: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Something point values can be pulled out of.
///
/// [`RasterGrid`] holds every band in memory and gathers with array
/// indexing; [`WindowedRaster`] keeps the file open and decodes only the
/// strips or tiles that contain requested pixels.
pub trait RasterSource {
    fn path(&self) -> &Path;

    fn geotransform(&self) -> &GeoTransform;

    fn shape(&self) -> RasterShape;

    fn nodata(&self) -> Option<f64>;

    fn time_axis(&self) -> Option<&TimeAxis>;

    /// Every band at every pixel, as a `[pixel, band]` array.
    ///
    /// All pixels must be inside the raster; the first one that is not is
    /// reported as a raster access error naming its index.
    fn read_series(&mut self, pixels: &[PixelCoordinate]) -> Result<Array2<f64>>;

    /// One band (0-based) at each pixel; `None` for pixels outside the raster.
    fn read_band(&mut self, band: usize, pixels: &[PixelCoordinate]) -> Result<Vec<Option<f64>>>;
}

/// Array indices of every pixel, failing on the first one outside `shape`.
pub(crate) fn locate_all(
    path: &Path,
    shape: RasterShape,
    pixels: &[PixelCoordinate],
) -> Result<Vec<(usize, usize)>> {
    pixels
        .iter()
        .enumerate()
        .map(|(i, p)| {
            p.index(shape.rows, shape.cols).ok_or_else(|| {
                Error::raster(
                    path,
                    format!(
                        "point {} maps to pixel (row {}, col {}) outside the {}x{} grid",
                        i, p.row, p.col, shape.rows, shape.cols
                    ),
                )
            })
        })
        .collect()
}

pub(crate) fn check_band(path: &Path, shape: RasterShape, band: usize) -> Result<()> {
    if band >= shape.bands {
        return Err(Error::raster(
            path,
            format!("band {} requested, raster has {}", band + 1, shape.bands),
        ));
    }
    Ok(())
}
