//! Legacy NEXTMap DTM tiles, served as ESRI binary grids over FTP.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{info, warn};

use crate::config::Credentials;
use crate::error::{Error, Result};

pub const DEFAULT_FTP_HOST: &str = "ftp.ceda.ac.uk:21";

/// Concurrent FTP sessions used by [`DtmFetcher::fetch_tiles`] when given 0 workers.
pub const DEFAULT_TILE_WORKERS: usize = 8;

/// Files that make up one ESRI binary grid directory.
pub const ESRI_GRID_FILES: [&str; 6] = [
    "dblbnd.adf",
    "hdr.adf",
    "prj.adf",
    "sta.adf",
    "w001001.adf",
    "w001001x.adf",
];

/// Retrieves DTM tile directories from the archive's FTP service.
#[derive(Debug, Clone)]
pub struct DtmFetcher {
    host: String,
    credentials: Credentials,
}

impl DtmFetcher {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            host: DEFAULT_FTP_HOST.to_string(),
            credentials,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Downloads the grid files of one tile directory, e.g.
    /// `neodc/nextmap/by_tile/sh/sh60/dtm/sh60dtm/`, into `<main_dir>/sh60dtm`.
    pub fn fetch_tile(&self, ftp_path: &str, main_dir: &Path) -> Result<PathBuf> {
        let dir = main_dir.join(tile_dir_name(ftp_path)?);
        std::fs::create_dir_all(&dir)?;

        let mut ftp = FtpStream::connect(&self.host)?;
        ftp.login(&self.credentials.username, &self.credentials.password)
            .map_err(login_error)?;
        ftp.cwd(ftp_path)?;

        for name in ESRI_GRID_FILES {
            let data = ftp.retr_as_buffer(name)?;
            std::fs::write(dir.join(name), data.into_inner())?;
        }
        // a failed QUIT does not invalidate files already on disk
        if let Err(e) = ftp.quit() {
            warn!(error = %e, "ftp quit failed");
        }

        info!(tile = %dir.display(), "dtm tile downloaded");
        Ok(dir)
    }

    /// Fetches many tiles on `workers` threads (0 means [`DEFAULT_TILE_WORKERS`]).
    /// Results follow the order of `ftp_paths`.
    pub fn fetch_tiles<S>(
        &self,
        ftp_paths: &[S],
        main_dir: &Path,
        workers: usize,
    ) -> Result<Vec<Result<PathBuf>>>
    where
        S: AsRef<str> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(tile_workers(workers))
            .build()
            .map_err(|e| Error::Config(format!("cannot start ftp workers: {e}")))?;
        Ok(pool.install(|| {
            ftp_paths
                .par_iter()
                .map(|p| {
                    let r = self.fetch_tile(p.as_ref(), main_dir);
                    if let Err(e) = &r {
                        warn!(path = p.as_ref(), error = %e, "dtm tile failed");
                    }
                    r
                })
                .collect()
        }))
    }
}

fn tile_workers(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_TILE_WORKERS
    } else {
        requested
    }
}

/// Only a 530 reply means the credentials were refused; anything else is the link.
fn login_error(e: FtpError) -> Error {
    match e {
        FtpError::UnexpectedResponse(resp) if resp.status == Status::NotLoggedIn => {
            Error::Authentication(format!(
                "ftp login refused: {}",
                String::from_utf8_lossy(&resp.body).trim()
            ))
        }
        other => Error::from(other),
    }
}

/// Last non-empty segment of an FTP directory path.
pub fn tile_dir_name(ftp_path: &str) -> Result<&str> {
    ftp_path
        .split('/')
        .rev()
        .find(|s| !s.is_empty())
        .ok_or_else(|| Error::Config(format!("ftp path {ftp_path:?} names no directory")))
}

/// Rewrites a tile path template for another tile.
///
/// `tile` is a grid square plus tile number such as `sh60`; the template's
/// square and number (e.g. `hp` and `40` in `.../hp/hp40/dtm/hp40dtm/`) are replaced.
pub fn tile_path(template: &str, template_tile: &str, tile: &str) -> Result<String> {
    if tile.len() != 4 || template_tile.len() != 4 || !tile.is_ascii() || !template_tile.is_ascii()
    {
        return Err(Error::Config(format!(
            "tile names must look like `sh60`, got {tile:?} / {template_tile:?}"
        )));
    }
    Ok(template
        .replace(&template_tile[0..2], &tile[0..2])
        .replace(&template_tile[2..4], &tile[2..4]))
}
