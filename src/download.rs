use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::credentials::CredentialManager;
use crate::error::{Error, Result, format_http_error};
use crate::util::{backoff, guess_filename_from_url, partial_path, retriable_status};

/// Outcome of one item of a batch: the local file, or why it could not be fetched.
pub type DownloadResult = std::result::Result<PathBuf, DownloadFailure>;

#[derive(Debug, thiserror::Error)]
#[error("{url}: {error}")]
pub struct DownloadFailure {
    pub url: String,
    pub error: Error,
}

struct Attempt {
    error: Error,
    retriable: bool,
}

impl Attempt {
    fn fatal(error: impl Into<Error>) -> Self {
        Self {
            error: error.into(),
            retriable: false,
        }
    }

    fn transient(error: impl Into<Error>) -> Self {
        Self {
            error: error.into(),
            retriable: true,
        }
    }
}

/// Fetches remote grid files with the cached client certificate.
///
/// Each item is isolated: a 404 or a dropped connection on one URL is
/// reported in that item's slot and the rest of the batch carries on.
#[derive(Debug)]
pub struct BatchDownloader {
    credentials: Arc<CredentialManager>,

    timeout: Duration,
    retry_max: usize,
    sleep_max: Duration,
    min_lifetime: Duration,
    progress: bool,

    http: Mutex<Option<(u64, HttpClient)>>,
}

impl BatchDownloader {
    pub fn new(credentials: Arc<CredentialManager>) -> Self {
        Self {
            credentials,
            timeout: Duration::from_secs(60),
            retry_max: 0,
            sleep_max: Duration::from_secs(120),
            min_lifetime: Duration::from_secs(600),
            progress: true,
            http: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra attempts for transient failures (connection errors, 5xx, 429, 408).
    ///
    /// Defaults to 0: a failed item is reported and left for the caller to re-run.
    pub fn with_retry_max(mut self, retry_max: usize) -> Self {
        self.retry_max = retry_max;
        self
    }

    pub fn with_sleep_max(mut self, sleep_max: Duration) -> Self {
        self.sleep_max = sleep_max;
        self
    }

    /// Remaining certificate lifetime below which a new certificate is requested.
    pub fn with_min_lifetime(mut self, min_lifetime: Duration) -> Self {
        self.min_lifetime = min_lifetime;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    /// Downloads every URL into `destination_dir/<basename(url)>`.
    ///
    /// The returned vector is in the same order as `urls`. With `parallel`
    /// set, up to `max_workers` downloads run at once (0 picks the number of CPUs).
    ///
    /// Two URLs with the same basename would race for one file, so every
    /// repeat of a target gets a failure in its slot and only the first is fetched.
    ///
    /// Fails as a whole only if no certificate can be obtained at all.
    pub fn download<S>(
        &self,
        urls: &[S],
        destination_dir: &Path,
        parallel: bool,
        max_workers: usize,
    ) -> Result<Vec<DownloadResult>>
    where
        S: AsRef<str> + Sync,
    {
        std::fs::create_dir_all(destination_dir)?;
        self.credentials.ensure(self.min_lifetime)?;

        let mut owners: HashMap<PathBuf, &str> = HashMap::new();
        let claimed_by: Vec<Option<String>> = urls
            .iter()
            .map(|url| {
                let url = url.as_ref();
                let target = destination_dir.join(guess_filename_from_url(url)?);
                match owners.entry(target) {
                    Entry::Occupied(first) => Some(first.get().to_string()),
                    Entry::Vacant(slot) => {
                        slot.insert(url);
                        None
                    }
                }
            })
            .collect();

        let pb = self.progress_bar(urls.len() as u64);
        let fetch = |(url, first): (&S, &Option<String>)| {
            let url = url.as_ref();
            let result = match first {
                Some(first) => Err(DownloadFailure {
                    url: url.to_string(),
                    error: Error::Config(format!(
                        "{url} has the same target file as {first}"
                    )),
                }),
                None => self.download_one(url, destination_dir),
            };
            if let Err(failure) = &result {
                warn!(url, error = %failure.error, "download failed");
            }
            pb.inc(1);
            result
        };

        let results: Vec<DownloadResult> = if parallel {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(max_workers)
                .build()
                .map_err(|e| Error::Config(format!("cannot start download workers: {e}")))?;
            pool.install(|| urls.par_iter().zip(claimed_by.par_iter()).map(fetch).collect())
        } else {
            urls.iter().zip(&claimed_by).map(fetch).collect()
        };
        pb.finish_and_clear();

        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            total = results.len(),
            failed,
            dir = %destination_dir.display(),
            "batch download finished"
        );
        Ok(results)
    }

    /// Downloads a single URL into `destination_dir`.
    pub fn download_one(&self, url: &str, destination_dir: &Path) -> DownloadResult {
        let fail = |error: Error| DownloadFailure {
            url: url.to_string(),
            error,
        };

        let name = guess_filename_from_url(url)
            .ok_or_else(|| fail(Error::Config(format!("no file name in url {url}"))))?;
        let target = destination_dir.join(name);

        self.credentials
            .ensure(self.min_lifetime)
            .map_err(fail)?;
        let http = self.http().map_err(fail)?;

        let mut tries = 0usize;
        let mut sleep = Duration::from_secs(1).min(self.sleep_max);
        loop {
            match self.fetch(&http, url, &target) {
                Ok(bytes) => {
                    debug!(url, bytes, path = %target.display(), "downloaded");
                    return Ok(target);
                }
                Err(attempt) if attempt.retriable && tries < self.retry_max => {
                    tries += 1;
                    debug!(url, tries, error = %attempt.error, "retrying download");
                    thread::sleep(sleep);
                    sleep = backoff(sleep, self.sleep_max);
                }
                Err(attempt) => return Err(fail(attempt.error)),
            }
        }
    }

    /// HTTP client carrying the current certificate; rebuilt when it is renewed.
    fn http(&self) -> Result<HttpClient> {
        let generation = self.credentials.generation();
        let mut cached = self.http.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((g, client)) = cached.as_ref() {
            if *g == generation {
                return Ok(client.clone());
            }
        }

        let mut builder = HttpClient::builder()
            .use_rustls_tls()
            .user_agent(concat!("metattr/", env!("CARGO_PKG_VERSION")))
            .timeout(self.timeout)
            .identity(self.credentials.identity()?);
        if self.credentials.config().verify {
            for root in self.credentials.trust_roots() {
                builder = builder.add_root_certificate(root);
            }
        } else {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;
        *cached = Some((generation, client.clone()));
        Ok(client)
    }

    /// One GET into `<target>.part`, resuming a previous partial file with a range request.
    fn fetch(
        &self,
        http: &HttpClient,
        url: &str,
        target: &Path,
    ) -> std::result::Result<u64, Attempt> {
        let part = partial_path(target);
        let offset = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);

        let mut headers = HeaderMap::new();
        if offset > 0 {
            let range = HeaderValue::from_str(&format!("bytes={}-", offset))
                .map_err(|e| Attempt::fatal(Error::Config(e.to_string())))?;
            headers.insert(RANGE, range);
        }

        let mut resp: Response = http
            .get(url)
            .headers(headers)
            .send()
            .map_err(Attempt::transient)?;
        let status = resp.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // the partial file already holds the whole body
            std::fs::rename(&part, target).map_err(Attempt::fatal)?;
            return Ok(offset);
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(Attempt {
                error: format_http_error(status, url, &body),
                retriable: retriable_status(status.as_u16()),
            });
        }

        let append = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&part)
            .map_err(Attempt::fatal)?;

        let mut downloaded = if append { offset } else { 0 };
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = match resp.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    // keep what we have; the next attempt resumes from here
                    out.flush().ok();
                    return Err(Attempt::transient(Error::Network(format!(
                        "download interrupted after {} byte(s): {}",
                        downloaded, e
                    ))));
                }
            };
            out.write_all(&buf[..n]).map_err(Attempt::fatal)?;
            downloaded += n as u64;
        }
        out.flush().map_err(Attempt::fatal)?;
        drop(out);

        std::fs::rename(&part, target).map_err(Attempt::fatal)?;
        Ok(downloaded)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} {pos}/{len} files {wide_bar} {eta}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb
    }
}
