//! Ties downloading, sampling and merging together for batches of rasters.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::crs::Crs;
use crate::download::BatchDownloader;
use crate::error::{Error, Result};
use crate::merge::{SampledColumns, merge_and_save};
use crate::points::PointDataset;
use crate::sampler::{RasterTimeSampler, ReadMode};

pub const REPORT_FILE: &str = "attribution-report.json";

/// A remote raster and the variable it holds, e.g. `rainfall`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterRequest {
    pub variable: String,
    pub url: String,
}

impl RasterRequest {
    pub fn new(variable: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            url: url.into(),
        }
    }
}

/// Rasters downloaded together into `<folder>/<label>`, typically one year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterBatch {
    pub label: String,
    pub requests: Vec<RasterRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Merged { columns: Vec<String> },
    Failed { error: String },
}

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestOutcome {
    pub label: String,
    pub variable: String,
    pub url: String,
    #[serde(flatten)]
    pub status: RequestStatus,
}

impl RequestOutcome {
    fn failed(label: &str, request: &RasterRequest, error: impl ToString) -> Self {
        Self {
            label: label.to_string(),
            variable: request.variable.clone(),
            url: request.url.clone(),
            status: RequestStatus::Failed {
                error: error.to_string(),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, RequestStatus::Failed { .. })
    }
}

/// Summary of a [`Pipeline::run`], written next to the downloads as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub output: PathBuf,
    pub rows: usize,
    pub outcomes: Vec<RequestOutcome>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &RequestOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Dataset(format!("cannot serialise run report: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Attributes a point file with every raster in a list of batches.
///
/// Per batch: download into `<folder>/<label>`, sample the downloaded rasters
/// in parallel, then merge them one at a time, saving the output after each.
/// A raster that fails to download, read or merge is recorded in the report
/// and skipped.
#[derive(Debug)]
pub struct Pipeline {
    downloader: BatchDownloader,
    sampler: RasterTimeSampler,
    folder: PathBuf,
    parallel: bool,
    max_workers: usize,
}

impl Pipeline {
    pub fn new(downloader: BatchDownloader, folder: impl Into<PathBuf>) -> Self {
        Self {
            downloader,
            sampler: RasterTimeSampler::default(),
            folder: folder.into(),
            parallel: true,
            max_workers: 0,
        }
    }

    /// Reproject points from `src` into the rasters' `dst` before indexing.
    pub fn with_crs(mut self, src: Option<Crs>, dst: Option<Crs>) -> Self {
        self.sampler = RasterTimeSampler::new(src, dst);
        self
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.sampler = self.sampler.with_mode(mode);
        self
    }

    /// Worker count for downloads and sampling; 0 picks the number of CPUs.
    pub fn with_workers(mut self, parallel: bool, max_workers: usize) -> Self {
        self.parallel = parallel;
        self.max_workers = max_workers;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Runs every batch against `points` and writes the attributed copy to `output`.
    ///
    /// Only a missing certificate or an unreadable point file stop the run;
    /// everything else ends up in the returned report.
    pub fn run(
        &self,
        points: impl AsRef<Path>,
        output: impl AsRef<Path>,
        batches: &[RasterBatch],
    ) -> Result<RunReport> {
        let output = output.as_ref();
        let mut dataset = PointDataset::load(points)?;
        let mut outcomes = Vec::new();

        for batch in batches {
            let dir = self.folder.join(&batch.label);
            let urls: Vec<&str> = batch.requests.iter().map(|r| r.url.as_str()).collect();
            let results = self
                .downloader
                .download(&urls, &dir, self.parallel, self.max_workers)?;

            let mut rasters = Vec::new();
            for (request, result) in batch.requests.iter().zip(results) {
                match result {
                    Ok(path) => rasters.push((request.clone(), path)),
                    Err(failure) => {
                        outcomes.push(RequestOutcome::failed(&batch.label, request, failure.error))
                    }
                }
            }
            outcomes.extend(self.attribute(&mut dataset, output, &batch.label, &rasters)?);
        }

        let report = RunReport {
            output: output.to_path_buf(),
            rows: dataset.len(),
            outcomes,
        };
        std::fs::create_dir_all(&self.folder)?;
        report.write(self.folder.join(REPORT_FILE))?;
        info!(
            rasters = report.outcomes.len(),
            failed = report.failures().count(),
            output = %output.display(),
            "attribution run finished"
        );
        Ok(report)
    }

    /// Samples local rasters into `dataset`, saving to `output` after each merge.
    ///
    /// Sampling runs in parallel; merging is sequential in `rasters` order.
    pub fn attribute(
        &self,
        dataset: &mut PointDataset,
        output: &Path,
        label: &str,
        rasters: &[(RasterRequest, PathBuf)],
    ) -> Result<Vec<RequestOutcome>> {
        let points = dataset.points();
        let sample = |(request, path): &(RasterRequest, PathBuf)| {
            self.sampler.sample(path, points, &request.variable)
        };
        let sampled: Vec<Result<SampledColumns>> = if self.parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.max_workers)
                .build()
                .map_err(|e| Error::Config(format!("cannot start sampling workers: {e}")))?;
            pool.install(|| rasters.par_iter().map(sample).collect())
        } else {
            rasters.iter().map(sample).collect()
        };

        let mut outcomes = Vec::with_capacity(rasters.len());
        for ((request, path), result) in rasters.iter().zip(sampled) {
            let merged = result.and_then(|columns| {
                merge_and_save(dataset, &columns, output)?;
                Ok(columns.names().map(str::to_string).collect::<Vec<_>>())
            });
            let outcome = match merged {
                Ok(columns) => {
                    info!(label, variable = %request.variable, columns = columns.len(), "raster merged");
                    RequestOutcome {
                        label: label.to_string(),
                        variable: request.variable.clone(),
                        url: request.url.clone(),
                        status: RequestStatus::Merged { columns },
                    }
                }
                Err(e) => {
                    warn!(label, variable = %request.variable, path = %path.display(), error = %e, "raster skipped");
                    RequestOutcome::failed(label, request, e)
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
