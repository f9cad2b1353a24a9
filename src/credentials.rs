use chrono::{DateTime, TimeDelta, Utc};
use reqwest::blocking::Client as HttpClient;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use x509_parser::pem::Pem;

use crate::config::{CredentialConfig, Credentials};
use crate::error::{Error, Result};
use crate::onlineca;

const CREDENTIALS_FILE: &str = "credentials.pem";
const TRUSTROOTS_DIR: &str = "ca-trustroots";

/// Validity window of a client certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Certificate {
    pub not_valid_before: DateTime<Utc>,
    pub not_valid_after: DateTime<Utc>,
}

impl Certificate {
    /// Reads the first `CERTIFICATE` block of a PEM bundle.
    ///
    /// Returns `None` when there is none or it cannot be parsed.
    pub fn from_pem(data: &[u8]) -> Option<Self> {
        for pem in Pem::iter_from_buffer(data) {
            let pem = pem.ok()?;
            if pem.label != "CERTIFICATE" {
                continue;
            }
            let x509 = pem.parse_x509().ok()?;
            let validity = x509.validity();
            return Some(Self {
                not_valid_before: DateTime::from_timestamp(validity.not_before.timestamp(), 0)?,
                not_valid_after: DateTime::from_timestamp(validity.not_after.timestamp(), 0)?,
            });
        }
        None
    }

    pub fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read(path).ok()?;
        Self::from_pem(&data)
    }

    /// True if the certificate is in date at `now` and still has `min_lifetime` to run.
    pub fn is_valid_at(&self, now: DateTime<Utc>, min_lifetime: Duration) -> bool {
        let Ok(margin) = TimeDelta::from_std(min_lifetime) else {
            return false;
        };
        let Some(deadline) = now.checked_add_signed(margin) else {
            return false;
        };
        self.not_valid_before <= now && self.not_valid_after > deadline
    }

    pub fn is_valid(&self, min_lifetime: Duration) -> bool {
        self.is_valid_at(Utc::now(), min_lifetime)
    }

    pub fn remaining(&self) -> TimeDelta {
        self.not_valid_after - Utc::now()
    }
}

/// Obtains and caches the short-lived client certificate used against the archive.
///
/// The certificate and its private key are kept in `<cert_dir>/credentials.pem`,
/// the service's CA bundle in `<cert_dir>/ca-trustroots/`. Refreshes within one
/// process are serialised; separate processes sharing a `cert_dir` are not coordinated.
#[derive(Debug)]
pub struct CredentialManager {
    config: CredentialConfig,
    http: HttpClient,
    refresh: Mutex<()>,
    generation: AtomicU64,
}

impl CredentialManager {
    pub fn new(config: CredentialConfig) -> Result<Self> {
        let mut builder = HttpClient::builder()
            .user_agent(concat!("metattr/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60));
        if !config.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;

        Ok(Self {
            config,
            http,
            refresh: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.config.cert_dir.join(CREDENTIALS_FILE)
    }

    pub fn trustroots_dir(&self) -> PathBuf {
        self.config.cert_dir.join(TRUSTROOTS_DIR)
    }

    /// The cached certificate, if one is on disk and parses.
    pub fn cached_certificate(&self) -> Option<Certificate> {
        Certificate::load(&self.credentials_path())
    }

    pub fn has_valid_certificate(&self, min_lifetime: Duration) -> bool {
        self.cached_certificate()
            .is_some_and(|c| c.is_valid(min_lifetime))
    }

    /// Counter bumped every time a new certificate is written.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// [`ensure_credentials`](Self::ensure_credentials) with the configured credentials.
    pub fn ensure(&self, min_lifetime: Duration) -> Result<bool> {
        self.ensure_credentials(self.config.credentials.as_ref(), min_lifetime)
    }

    /// Makes sure a certificate valid for at least `min_lifetime` is cached.
    ///
    /// Returns `false` if the cached one was good enough (nothing was touched),
    /// `true` if a new certificate was obtained.
    pub fn ensure_credentials(
        &self,
        credentials: Option<&Credentials>,
        min_lifetime: Duration,
    ) -> Result<bool> {
        std::fs::create_dir_all(&self.config.cert_dir)?;

        let _guard = self.refresh.lock().unwrap_or_else(|p| p.into_inner());

        if self.has_valid_certificate(min_lifetime) {
            debug!("security credentials already set up");
            return Ok(false);
        }

        let credentials = match credentials {
            Some(c) if !c.username.is_empty() && !c.password.is_empty() => c,
            _ => {
                return Err(Error::Authentication(
                    "a username and password are required to obtain a certificate (set CEDA_USERNAME and CEDA_PASSWORD or add them to .cedarc)".into(),
                ));
            }
        };

        let roots = onlineca::fetch_trustroots(&self.http, &self.config.trustroots_url)?;
        let roots_dir = self.trustroots_dir();
        std::fs::create_dir_all(&roots_dir)?;
        for root in &roots {
            std::fs::write(roots_dir.join(&root.file_name), &root.pem)?;
        }
        debug!(count = roots.len(), dir = %roots_dir.display(), "trust roots written");

        let request = onlineca::build_request(&credentials.username)?;
        let cert_pem = onlineca::request_certificate(
            &self.http,
            &self.config.certificate_url,
            credentials,
            &request,
        )?;
        if Certificate::from_pem(cert_pem.as_bytes()).is_none() {
            return Err(Error::Authentication(
                "certificate service returned an unreadable certificate".into(),
            ));
        }

        self.write_credentials(&cert_pem, &request.key_pem)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(path = %self.credentials_path().display(), "security credentials set up");
        Ok(true)
    }

    fn write_credentials(&self, cert_pem: &str, key_pem: &str) -> Result<()> {
        // The temp file is created 0600 and only replaces the old bundle once complete.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.config.cert_dir)?;
        tmp.write_all(cert_pem.as_bytes())?;
        if !cert_pem.ends_with('\n') {
            tmp.write_all(b"\n")?;
        }
        tmp.write_all(key_pem.as_bytes())?;
        tmp.flush()?;
        tmp.persist(self.credentials_path())
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Certificate plus private key, ready for [`reqwest::Identity::from_pem`].
    pub fn identity(&self) -> Result<reqwest::Identity> {
        let pem = std::fs::read(self.credentials_path())?;
        reqwest::Identity::from_pem(&pem)
            .map_err(|e| Error::Authentication(format!("cached credentials are unusable: {e}")))
    }

    /// CA certificates fetched from the trust-root service.
    pub fn trust_roots(&self) -> Vec<reqwest::Certificate> {
        let Ok(entries) = std::fs::read_dir(self.trustroots_dir()) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| std::fs::read(e.path()).ok())
            .filter_map(|pem| reqwest::Certificate::from_pem(&pem).ok())
            .collect()
    }
}
