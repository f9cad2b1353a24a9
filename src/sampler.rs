use std::path::Path;
use tracing::{debug, info};

use crate::crs::Crs;
use crate::error::{Error, Result};
use crate::merge::SampledColumns;
use crate::pixel::to_pixels;
use crate::raster::{RasterGrid, RasterSource, WindowedRaster};

/// How a raster file is read while sampling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Decode every band into memory first.
    #[default]
    InMemory,
    /// Decode only the strips or tiles that hold requested pixels.
    Windowed,
}

/// Extracts every time step of a raster at a fixed set of points.
#[derive(Debug, Clone, Default)]
pub struct RasterTimeSampler {
    src_crs: Option<Crs>,
    dst_crs: Option<Crs>,
    mode: ReadMode,
}

impl RasterTimeSampler {
    /// A sampler that reprojects points from `src_crs` into `dst_crs`.
    ///
    /// With either left unset the points are taken to be in the raster's CRS.
    pub fn new(src_crs: Option<Crs>, dst_crs: Option<Crs>) -> Self {
        Self {
            src_crs,
            dst_crs,
            mode: ReadMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    /// Opens `raster_path` and samples it; see [`RasterTimeSampler::sample_source`].
    pub fn sample(
        &self,
        raster_path: &Path,
        points: &[(f64, f64)],
        variable: &str,
    ) -> Result<SampledColumns> {
        match self.mode {
            ReadMode::InMemory => {
                self.sample_source(&mut RasterGrid::open(raster_path)?, points, variable)
            }
            ReadMode::Windowed => {
                self.sample_source(&mut WindowedRaster::open(raster_path)?, points, variable)
            }
        }
    }

    /// One column per time step, labelled `<first four chars of variable>-YY-MM`,
    /// each holding one value per point in point order.
    ///
    /// Points are converted to pixels once. Any point outside the raster fails
    /// the whole raster; no-data cells come back as `None`.
    pub fn sample_source<S: RasterSource>(
        &self,
        raster: &mut S,
        points: &[(f64, f64)],
        variable: &str,
    ) -> Result<SampledColumns> {
        let path = raster.path().to_path_buf();
        let labels = match raster.time_axis() {
            Some(axis) => axis.labels(variable),
            None => return Err(Error::raster(&path, "no time axis in raster metadata")),
        };

        let (pixels, _) = to_pixels(
            points,
            raster.geotransform(),
            self.src_crs.as_ref(),
            self.dst_crs.as_ref(),
        )
        .map_err(|e| match e {
            Error::Crs(reason) => Error::raster(&path, reason),
            other => other,
        })?;

        let series = raster.read_series(&pixels)?;
        let nodata = raster.nodata();
        let is_missing = |v: f64| match nodata {
            Some(nd) => v == nd || (nd.is_nan() && v.is_nan()),
            None => false,
        };

        let mut sampled = SampledColumns::for_rows(points.len());
        for (band, label) in labels.into_iter().enumerate() {
            let values = series
                .column(band)
                .iter()
                .map(|&v| (!is_missing(v)).then_some(v))
                .collect();
            sampled.push(label, values);
        }
        debug!(
            path = %path.display(),
            points = points.len(),
            steps = sampled.columns.len(),
            "time series sampled"
        );
        Ok(sampled)
    }
}

/// Samples `raster_path` in memory with a one-off [`RasterTimeSampler`].
pub fn sample_series(
    raster_path: impl AsRef<Path>,
    points: &[(f64, f64)],
    variable: &str,
    src_crs: Option<&Crs>,
    dst_crs: Option<&Crs>,
) -> Result<SampledColumns> {
    let raster_path = raster_path.as_ref();
    let sampled = RasterTimeSampler::new(src_crs.cloned(), dst_crs.cloned()).sample(
        raster_path,
        points,
        variable,
    )?;
    info!(raster = %raster_path.display(), variable, "raster sampled");
    Ok(sampled)
}
