use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DEFAULT_TRUSTROOTS_URL: &str = "https://slcs.ceda.ac.uk/onlineca/trustroots/";
pub const DEFAULT_CERTIFICATE_URL: &str = "https://slcs.ceda.ac.uk/onlineca/certificate/";

/// Username/password pair for the certificate-issuing service.
///
/// Only ever held in memory; the service exchanges it for a short-lived certificate.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where certificates live and which services issue them.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// Directory holding `credentials.pem` and `ca-trustroots/`.
    pub cert_dir: PathBuf,
    pub trustroots_url: String,
    pub certificate_url: String,
    /// Whether to verify TLS certificates of the archive and the issuing service.
    pub verify: bool,
    /// Credentials, if known. A cached valid certificate makes them optional.
    pub credentials: Option<Credentials>,
}

impl CredentialConfig {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            trustroots_url: DEFAULT_TRUSTROOTS_URL.to_string(),
            certificate_url: DEFAULT_CERTIFICATE_URL.to_string(),
            verify: true,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_endpoints(
        mut self,
        trustroots_url: impl Into<String>,
        certificate_url: impl Into<String>,
    ) -> Self {
        self.trustroots_url = trustroots_url.into();
        self.certificate_url = certificate_url.into();
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Builds a configuration using (in order of precedence):
    /// - explicit `username`/`password` arguments
    /// - environment variables `CEDA_USERNAME` / `CEDA_PASSWORD` / `CEDA_CERTS_DIR`
    /// - config file from `CEDA_RC` or `.cedarc`
    ///
    /// Missing credentials are not an error here: a cached certificate may still be valid.
    pub fn load(username: Option<String>, password: Option<String>) -> Result<Self> {
        let mut username = username.or_else(|| std::env::var("CEDA_USERNAME").ok());
        let mut password = password.or_else(|| std::env::var("CEDA_PASSWORD").ok());
        let mut cert_dir = std::env::var("CEDA_CERTS_DIR").ok().map(PathBuf::from);
        let mut verify = None;

        for rc_path in rc_candidates() {
            if rc_path.exists() {
                let cfg = read_rc(&rc_path).map_err(|e| {
                    Error::Config(format!(
                        "failed to read configuration file {}: {}",
                        rc_path.display(),
                        e
                    ))
                })?;
                username = username.or(cfg.username);
                password = password.or(cfg.password);
                cert_dir = cert_dir.or(cfg.certs_dir.map(PathBuf::from));
                verify = cfg.verify;
                break;
            }
        }

        let cert_dir = match cert_dir {
            Some(dir) => dir,
            None => default_cert_dir()?,
        };

        let mut config = CredentialConfig::new(cert_dir).with_verify(verify.unwrap_or(true));
        if let (Some(u), Some(p)) = (username, password) {
            config = config.with_credentials(Credentials::new(u, p));
        }
        Ok(config)
    }
}

/// `~/.certs`, as used by the CEDA tooling.
pub fn default_cert_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|h| h.join(".certs"))
        .ok_or_else(|| Error::Config("cannot determine home directory for ~/.certs".into()))
}

#[derive(Debug, Default)]
struct RcConfig {
    username: Option<String>,
    password: Option<String>,
    certs_dir: Option<String>,
    verify: Option<bool>,
}

fn read_rc(path: &Path) -> std::io::Result<RcConfig> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_rc(&text))
}

fn parse_rc(text: &str) -> RcConfig {
    let mut cfg = RcConfig::default();

    // `password:` may be on one line with its value on the next.
    let mut pending_key: Option<&str> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(pk) = pending_key.take() {
            if !line.contains(':') {
                set_rc_value(&mut cfg, pk, strip_quotes(line));
                continue;
            }
        }

        if let Some((k, v)) = line.split_once(':') {
            let k = k.trim();
            let v = strip_quotes(v.trim());
            if v.is_empty() {
                pending_key = match k {
                    "username" => Some("username"),
                    "password" => Some("password"),
                    "certs_dir" => Some("certs_dir"),
                    _ => None,
                };
            } else {
                set_rc_value(&mut cfg, k, v);
            }
        }
    }

    cfg
}

fn set_rc_value(cfg: &mut RcConfig, key: &str, value: &str) {
    match key {
        "username" => cfg.username = Some(value.to_string()),
        "password" => cfg.password = Some(value.to_string()),
        "certs_dir" => cfg.certs_dir = Some(value.to_string()),
        "verify" => cfg.verify = Some(value != "0" && value != "false"),
        _ => {}
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn rc_candidates() -> Vec<PathBuf> {
    // 1) CEDA_RC (explicit)
    // 2) ./.cedarc
    // 3) ~/.cedarc
    if let Ok(p) = std::env::var("CEDA_RC") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".cedarc"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".cedarc"));
    }
    v
}
