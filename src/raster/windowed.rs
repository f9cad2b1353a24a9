use ndarray::{Array2, ArrayView1};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::geotiff::{self, Layout, TiffDecoder};
use super::{RasterShape, RasterSource, check_band, locate_all};
use crate::error::{Error, Result};
use crate::pixel::{GeoTransform, PixelCoordinate};
use crate::time::TimeAxis;

/// A GeoTIFF read on demand, one strip or tile at a time.
///
/// Memory use is bounded by a single decoded chunk, at the cost of decoding
/// each touched chunk once per band.
pub struct WindowedRaster {
    path: PathBuf,
    decoder: TiffDecoder,
    layout: Layout,
}

impl std::fmt::Debug for WindowedRaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedRaster")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .finish()
    }
}

impl WindowedRaster {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut decoder = geotiff::open(path)?;
        let layout = geotiff::read_layout(&mut decoder, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            decoder,
            layout,
        })
    }

    /// Reads `band` at the given in-bounds cells, decoding each chunk once.
    ///
    /// `cells` holds `(slot, row, col)`; the value for each lands in `out[slot]`.
    fn gather_band(
        &mut self,
        band: usize,
        cells: &[(usize, usize, usize)],
        out: &mut [f64],
    ) -> Result<()> {
        let path = &self.path;
        let tiff_err = |e: tiff::TiffError| Error::raster(path, e.to_string());
        let (ifd, sample) = self.layout.locate_band(band);
        self.decoder.seek_to_image(ifd).map_err(tiff_err)?;

        let (chunk_w, chunk_h) = self.decoder.chunk_dimensions();
        let (chunk_w, chunk_h) = (chunk_w.max(1) as usize, chunk_h.max(1) as usize);
        let across = self.layout.width.div_ceil(chunk_w);

        let mut by_chunk: BTreeMap<usize, Vec<(usize, usize, usize)>> = BTreeMap::new();
        for &(slot, row, col) in cells {
            let chunk = (row / chunk_h) * across + col / chunk_w;
            by_chunk.entry(chunk).or_default().push((slot, row, col));
        }

        let samples = self.layout.samples.max(1);
        for (chunk, members) in by_chunk {
            let index = u32::try_from(chunk)
                .map_err(|_| Error::raster(path, format!("chunk index {chunk} overflows")))?;
            let data = geotiff::to_f64(self.decoder.read_chunk(index).map_err(tiff_err)?);
            let (_, data_h) = self.decoder.chunk_data_dimensions(index);
            let row_len = data.len() / (data_h.max(1) as usize);

            for (slot, row, col) in members {
                let i = (row % chunk_h) * row_len + (col % chunk_w) * samples + sample;
                out[slot] = *data.get(i).ok_or_else(|| {
                    Error::raster(path, format!("chunk {chunk} is shorter than expected"))
                })?;
            }
        }
        Ok(())
    }

    fn mask(&self, v: f64) -> Option<f64> {
        match self.layout.nodata {
            Some(nd) if v == nd || (nd.is_nan() && v.is_nan()) => None,
            _ => Some(v),
        }
    }
}

impl RasterSource for WindowedRaster {
    fn path(&self) -> &Path {
        &self.path
    }

    fn geotransform(&self) -> &GeoTransform {
        &self.layout.geotransform
    }

    fn shape(&self) -> RasterShape {
        RasterShape {
            bands: self.layout.bands(),
            rows: self.layout.height,
            cols: self.layout.width,
        }
    }

    fn nodata(&self) -> Option<f64> {
        self.layout.nodata
    }

    fn time_axis(&self) -> Option<&TimeAxis> {
        self.layout.time_axis.as_ref()
    }

    fn read_series(&mut self, pixels: &[PixelCoordinate]) -> Result<Array2<f64>> {
        let index = locate_all(&self.path, self.shape(), pixels)?;
        let cells: Vec<(usize, usize, usize)> = index
            .iter()
            .enumerate()
            .map(|(slot, &(row, col))| (slot, row, col))
            .collect();

        let bands = self.layout.bands();
        let mut out = Array2::zeros((pixels.len(), bands));
        let mut column = vec![0.0; pixels.len()];
        for band in 0..bands {
            self.gather_band(band, &cells, &mut column)?;
            out.column_mut(band).assign(&ArrayView1::from(column.as_slice()));
        }
        Ok(out)
    }

    fn read_band(&mut self, band: usize, pixels: &[PixelCoordinate]) -> Result<Vec<Option<f64>>> {
        let shape = self.shape();
        check_band(&self.path, shape, band)?;
        let cells: Vec<(usize, usize, usize)> = pixels
            .iter()
            .enumerate()
            .filter_map(|(slot, p)| p.index(shape.rows, shape.cols).map(|(r, c)| (slot, r, c)))
            .collect();

        let mut values = vec![f64::NAN; pixels.len()];
        self.gather_band(band, &cells, &mut values)?;

        let mut out = vec![None; pixels.len()];
        for &(slot, _, _) in &cells {
            out[slot] = self.mask(values[slot]);
        }
        Ok(out)
    }
}
