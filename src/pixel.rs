//! Map coordinates to raster pixel offsets.

use crate::crs::{CoordTransformer, Crs};
use crate::error::{Error, Result};

/// North-up affine transform of a raster.
///
/// `pixel_height` is normally negative: rows advance southwards from `origin_y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Result<Self> {
        let gt = Self {
            origin_x,
            pixel_width,
            origin_y,
            pixel_height,
        };
        gt.validate()?;
        Ok(gt)
    }

    /// From GDAL's six-term form. Rotated grids are rejected.
    pub fn from_gdal(gt: [f64; 6]) -> Result<Self> {
        if gt[2] != 0.0 || gt[4] != 0.0 {
            return Err(Error::Crs(format!(
                "rotated geotransforms are not supported (terms {} and {})",
                gt[2], gt[4]
            )));
        }
        Self::new(gt[0], gt[1], gt[3], gt[5])
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            self.pixel_height,
        ]
    }

    fn validate(&self) -> Result<()> {
        let finite = [
            self.origin_x,
            self.pixel_width,
            self.origin_y,
            self.pixel_height,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite || self.pixel_width == 0.0 || self.pixel_height == 0.0 {
            return Err(Error::Crs(format!("degenerate geotransform {:?}", self)));
        }
        Ok(())
    }

    /// Pixel containing (x, y).
    ///
    /// Offsets are truncated toward zero, so a point sitting exactly on a
    /// pixel edge lands in the pixel to its south-east, and points up to one
    /// pixel west/north of the origin map to row/col 0.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> PixelCoordinate {
        PixelCoordinate {
            row: ((y - self.origin_y) / self.pixel_height) as i64,
            col: ((x - self.origin_x) / self.pixel_width) as i64,
        }
    }

    /// Upper-left corner of a pixel in map coordinates.
    pub fn pixel_to_geo(&self, pixel: PixelCoordinate) -> (f64, f64) {
        (
            self.origin_x + pixel.col as f64 * self.pixel_width,
            self.origin_y + pixel.row as f64 * self.pixel_height,
        )
    }

    pub fn pixel_centre(&self, pixel: PixelCoordinate) -> (f64, f64) {
        let (x, y) = self.pixel_to_geo(pixel);
        (x + self.pixel_width / 2.0, y + self.pixel_height / 2.0)
    }
}

/// Row/column offset into a raster. May lie outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelCoordinate {
    pub row: i64,
    pub col: i64,
}

impl PixelCoordinate {
    pub fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }

    /// `(row, col)` as array indices if inside a `rows` x `cols` grid.
    pub fn index(&self, rows: usize, cols: usize) -> Option<(usize, usize)> {
        let row = usize::try_from(self.row).ok()?;
        let col = usize::try_from(self.col).ok()?;
        (row < rows && col < cols).then_some((row, col))
    }
}

/// Reprojects `points` from `src_crs` to `dst_crs` and locates them in the raster grid.
///
/// Returns the pixel of every point and its reprojected (x, y), both in input order.
/// When either CRS is missing, or both are the same, coordinates are used as given.
pub fn to_pixels(
    points: &[(f64, f64)],
    geotransform: &GeoTransform,
    src_crs: Option<&Crs>,
    dst_crs: Option<&Crs>,
) -> Result<(Vec<PixelCoordinate>, Vec<(f64, f64)>)> {
    let coords: Vec<(f64, f64)> = match (src_crs, dst_crs) {
        (Some(src), Some(dst)) if src != dst => {
            let transformer = CoordTransformer::new(src, dst)?;
            points
                .iter()
                .map(|&(x, y)| transformer.transform(x, y))
                .collect::<Result<_>>()?
        }
        _ => points.to_vec(),
    };

    if let Some(i) = coords
        .iter()
        .position(|(x, y)| !x.is_finite() || !y.is_finite())
    {
        return Err(Error::Crs(format!(
            "point {i} has a non-finite coordinate {:?}",
            coords[i]
        )));
    }

    let pixels = coords
        .iter()
        .map(|&(x, y)| geotransform.geo_to_pixel(x, y))
        .collect();
    Ok((pixels, coords))
}
