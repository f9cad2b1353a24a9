use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the acquisition and attribution pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials are missing, or the certificate service rejected them.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transport failure or a non-success HTTP/FTP response.
    #[error("network error: {0}")]
    Network(String),

    /// A raster could not be read, or a point fell outside it.
    #[error("raster access failed for {}: {reason}", path.display())]
    RasterAccess { path: PathBuf, reason: String },

    /// A merge would have changed the row cardinality of the point dataset.
    #[error("join integrity violated: {0}")]
    JoinIntegrity(String),

    #[error("invalid coordinate reference system: {0}")]
    Crs(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("point dataset error: {0}")]
    Dataset(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn raster(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::RasterAccess {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Dataset(e.to_string())
    }
}

impl From<suppaftp::FtpError> for Error {
    fn from(e: suppaftp::FtpError) -> Self {
        Error::Network(format!("ftp: {}", e))
    }
}

/// Turns a failed HTTP exchange into an error with a hint the user can act on.
pub(crate) fn format_http_error(status: StatusCode, url: &str, body: &str) -> Error {
    let detail: String = body.trim().chars().take(300).collect();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Error::Authentication(format!(
            "archive refused the request (HTTP {}).\n- Check the username/password used to obtain the certificate\n- Delete the cached credentials.pem to force a new certificate\n\nrequest: {}\n{}",
            status.as_u16(),
            url,
            detail
        ));
    }

    if status == StatusCode::NOT_FOUND {
        return Error::Network(format!(
            "file not found (HTTP 404): {}\n- The variable is possibly not produced for this period, or the dataset version in the URL has moved",
            url
        ));
    }

    Error::Network(format!(
        "request failed: HTTP {} for url ({})\n{}",
        status.as_u16(),
        url,
        detail
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_maps_to_authentication() {
        let err = format_http_error(StatusCode::UNAUTHORIZED, "https://x/y.nc", "");
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn not_found_mentions_period() {
        let err = format_http_error(StatusCode::NOT_FOUND, "https://x/y.nc", "");
        match err {
            Error::Network(msg) => assert!(msg.contains("not produced for this period")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let err = format_http_error(StatusCode::BAD_GATEWAY, "u", &body);
        assert!(err.to_string().len() < 500);
    }
}
