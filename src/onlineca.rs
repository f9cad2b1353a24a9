//! Wire protocol of the OnlineCA short-lived certificate service.
//!
//! Two endpoints are involved:
//! - `trustroots/` returns one `<file name>=<base64 PEM>` line per CA certificate.
//! - `certificate/` accepts a PEM certificate signing request in the form field
//!   `certificate_request`, authenticated with HTTP basic auth, and answers with
//!   the signed certificate in PEM.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use reqwest::StatusCode;
use reqwest::blocking::Client as HttpClient;

use crate::config::Credentials;
use crate::error::{Error, Result, format_http_error};

#[derive(Debug, Clone)]
pub(crate) struct TrustRoot {
    pub(crate) file_name: String,
    pub(crate) pem: Vec<u8>,
}

pub(crate) fn parse_trustroots(body: &str) -> Result<Vec<TrustRoot>> {
    let mut roots = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, encoded) = line.split_once('=').ok_or_else(|| {
            Error::Authentication(format!("malformed trust root entry: {line}"))
        })?;
        let name = name.trim();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(Error::Authentication(format!(
                "refusing trust root with unsafe file name {name:?}"
            )));
        }
        let pem = STANDARD.decode(encoded.trim()).map_err(|e| {
            Error::Authentication(format!("trust root {name} is not valid base64: {e}"))
        })?;
        roots.push(TrustRoot {
            file_name: name.to_string(),
            pem,
        });
    }
    Ok(roots)
}

pub(crate) fn fetch_trustroots(http: &HttpClient, url: &str) -> Result<Vec<TrustRoot>> {
    let resp = http.get(url).send()?;
    let status = resp.status();
    let text = resp.text().unwrap_or_default();
    if !status.is_success() {
        return Err(format_http_error(status, url, &text));
    }
    parse_trustroots(&text)
}

/// A freshly generated key pair and the signing request that goes with it.
pub(crate) struct CertificateRequest {
    pub(crate) csr_pem: String,
    pub(crate) key_pem: String,
}

/// RSA 2048 with SHA-256: the key type OnlineCA services are known to sign.
pub(crate) fn build_request(username: &str) -> Result<CertificateRequest> {
    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)
        .map_err(|e| Error::Authentication(format!("failed to generate key pair: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, username.to_string());
    let mut params = CertificateParams::default();
    params.distinguished_name = dn;

    let csr_pem = params
        .serialize_request(&key_pair)
        .and_then(|csr| csr.pem())
        .map_err(|e| Error::Authentication(format!("failed to build certificate request: {e}")))?;

    Ok(CertificateRequest {
        csr_pem,
        key_pem: key_pair.serialize_pem(),
    })
}

/// Exchanges the credentials and a signing request for a PEM certificate.
pub(crate) fn request_certificate(
    http: &HttpClient,
    url: &str,
    credentials: &Credentials,
    request: &CertificateRequest,
) -> Result<String> {
    let resp = http
        .post(url)
        .basic_auth(&credentials.username, Some(&credentials.password))
        .form(&[("certificate_request", request.csr_pem.as_str())])
        .send()?;

    let status = resp.status();
    let text = resp.text().unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Authentication(format!(
            "certificate service rejected the username/password for {:?} (HTTP {})",
            credentials.username,
            status.as_u16()
        )));
    }
    if !status.is_success() {
        return Err(format_http_error(status, url, &text));
    }
    if !text.contains("-----BEGIN CERTIFICATE-----") {
        return Err(Error::Authentication(
            "certificate service answered without a PEM certificate".into(),
        ));
    }
    Ok(text)
}
