//! Attribute survey points with climate time series sampled from gridded rasters.
//!
//! The flow mirrors a typical met-data attribution run:
//! obtain a short-lived client certificate, download a batch of gridded
//! rasters with it, sample every time step of each raster at the points,
//! then merge the sampled columns (`rain-21-03`, `tas-21-04`, ...) back into
//! the point file.
//!
//! ## Quick start
//! - Configure credentials via explicit arguments, environment variables
//!   (`CEDA_USERNAME`, `CEDA_PASSWORD`, `CEDA_CERTS_DIR`) or a `.cedarc` file
//!   (current directory, then home directory).
//! - Build a [`Pipeline`] and call [`Pipeline::run`] with a list of [`RasterBatch`]es.
//!
//! ```no_run
//! use anyhow::Result;
//! use metattr::{BatchDownloader, CredentialConfig, CredentialManager, Crs, Pipeline, RasterBatch, RasterRequest};
//! use std::sync::Arc;
//!
//! fn main() -> Result<()> {
//!     let config = CredentialConfig::load(None, None)?;
//!     let credentials = Arc::new(CredentialManager::new(config)?);
//!     let pipeline = Pipeline::new(BatchDownloader::new(credentials), "met")
//!         .with_crs(Some(Crs::epsg(27700)?), Some(Crs::epsg(4326)?));
//!
//!     let batches = vec![RasterBatch {
//!         label: "2021".into(),
//!         requests: vec![RasterRequest::new(
//!             "rainfall",
//!             "https://dap.ceda.ac.uk/badc/ukmo-hadobs/data/insitu/MOHC/HadOBS/HadUK-Grid/v1.0.3.0/1km/rainfall/mon/latest/rainfall_hadukgrid_uk_1km_mon_202101-202112.tif",
//!         )],
//!     }];
//!     let report = pipeline.run("points.csv", "points-attributed.csv", &batches)?;
//!     for failure in report.failures() {
//!         eprintln!("{} {}: {:?}", failure.label, failure.variable, failure.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The pieces are usable on their own: [`CredentialManager::ensure_credentials`],
//! [`BatchDownloader::download`], [`to_pixels`], [`sample_series`], [`merge`]
//! and [`sample_zonal`].

#![forbid(unsafe_code)]

mod config;
mod credentials;
mod crs;
mod download;
mod dtm;
mod error;
mod merge;
mod onlineca;
mod pipeline;
mod pixel;
mod points;
mod raster;
mod sampler;
mod time;
mod util;
mod zonal;

pub use config::{
    CredentialConfig, Credentials, DEFAULT_CERTIFICATE_URL, DEFAULT_TRUSTROOTS_URL, default_cert_dir,
};
pub use credentials::{Certificate, CredentialManager};
pub use crs::{CoordTransformer, Crs};
pub use download::{BatchDownloader, DownloadFailure, DownloadResult};
pub use dtm::{
    DEFAULT_FTP_HOST, DEFAULT_TILE_WORKERS, DtmFetcher, ESRI_GRID_FILES, tile_dir_name, tile_path,
};
pub use error::{Error, Result};
pub use merge::{SampledColumns, merge, merge_and_save};
pub use pipeline::{
    Pipeline, REPORT_FILE, RasterBatch, RasterRequest, RequestOutcome, RequestStatus, RunReport,
};
pub use pixel::{GeoTransform, PixelCoordinate, to_pixels};
pub use points::{DEFAULT_X_FIELD, DEFAULT_Y_FIELD, PointDataset, Value};
pub use raster::{RasterGrid, RasterShape, RasterSource, WindowedRaster};
pub use sampler::{RasterTimeSampler, ReadMode, sample_series};
pub use time::TimeAxis;
pub use zonal::{ZonalPointSampler, ZonalReport, sample_zonal, sample_zonal_in_memory};
