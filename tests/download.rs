//! Batch downloads against a local HTTP server, with a pre-seeded certificate.

mod common;

use metattr::{BatchDownloader, CredentialConfig, CredentialManager, Error};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TAS: &[u8] = b"II*\0 monthly tas grid bytes";

fn manager_with_cached_certificate(cert_dir: &Path) -> Arc<CredentialManager> {
    std::fs::create_dir_all(cert_dir).unwrap();
    std::fs::write(
        cert_dir.join("credentials.pem"),
        common::credentials_pem(time::Duration::days(1)),
    )
    .unwrap();
    Arc::new(CredentialManager::new(CredentialConfig::new(cert_dir)).unwrap())
}

fn downloader(dir: &Path) -> BatchDownloader {
    BatchDownloader::new(manager_with_cached_certificate(&dir.join("certs")))
        .with_timeout(Duration::from_secs(10))
        .with_progress(false)
}

/// Serves `TAS` at /tas.tif, honouring `Range: bytes=N-` with a 206 or a 416
/// when `ranges` is set. Every Range header received is recorded.
fn ranged_server(ranges: bool) -> (String, Arc<Mutex<Vec<Option<String>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let base = common::serve_with(move |req| {
        let range = req.header("range").map(str::to_string);
        log.lock().unwrap().push(range.clone());
        let start = range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());
        match start {
            Some(start) if ranges && start >= TAS.len() => (416, Vec::new(), Vec::new()),
            Some(start) if ranges => (
                206,
                vec![(
                    "Content-Range".to_string(),
                    format!("bytes {start}-{}/{}", TAS.len() - 1, TAS.len()),
                )],
                TAS[start..].to_vec(),
            ),
            _ => (200, Vec::new(), TAS.to_vec()),
        }
    });
    (base, seen)
}

#[test]
fn partial_file_is_resumed_with_a_range_request() {
    let (base, seen) = ranged_server(true);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("tas.tif.part"), &TAS[..6]).unwrap();

    let results = downloader(dir.path())
        .download(&[format!("{base}/tas.tif")], &out, false, 1)
        .unwrap();
    let path = results[0].as_ref().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), TAS);
    assert!(!out.join("tas.tif.part").exists());
    assert_eq!(*seen.lock().unwrap(), vec![Some("bytes=6-".to_string())]);
}

#[test]
fn server_ignoring_range_restarts_the_file() {
    let (base, _) = ranged_server(false);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("tas.tif.part"), b"stale").unwrap();

    let results = downloader(dir.path())
        .download(&[format!("{base}/tas.tif")], &out, false, 1)
        .unwrap();
    assert_eq!(std::fs::read(results[0].as_ref().unwrap()).unwrap(), TAS);
}

#[test]
fn complete_partial_file_is_promoted_on_416() {
    let (base, seen) = ranged_server(true);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("tas.tif.part"), TAS).unwrap();

    let results = downloader(dir.path())
        .download(&[format!("{base}/tas.tif")], &out, false, 1)
        .unwrap();
    assert_eq!(std::fs::read(results[0].as_ref().unwrap()).unwrap(), TAS);
    assert!(!out.join("tas.tif.part").exists());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some(format!("bytes={}-", TAS.len()))]
    );
}

/// /tas.tif answers 503 `failures` times, then the file; /gone.tif is always 404.
fn flaky_server(failures: usize) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let base = common::serve_with(move |req| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if req.path != "/tas.tif" {
            (404, Vec::new(), Vec::new())
        } else if n < failures {
            (503, Vec::new(), b"busy".to_vec())
        } else {
            (200, Vec::new(), TAS.to_vec())
        }
    });
    (base, hits)
}

#[test]
fn transient_errors_are_retried_when_enabled() {
    let (base, hits) = flaky_server(2);
    let dir = tempfile::tempdir().unwrap();
    let results = downloader(dir.path())
        .with_retry_max(2)
        .with_sleep_max(Duration::from_millis(20))
        .download(&[format!("{base}/tas.tif")], &dir.path().join("out"), false, 1)
        .unwrap();
    assert_eq!(std::fs::read(results[0].as_ref().unwrap()).unwrap(), TAS);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn transient_errors_are_reported_without_retries() {
    let (base, hits) = flaky_server(1);
    let dir = tempfile::tempdir().unwrap();
    let results = downloader(dir.path())
        .download(&[format!("{base}/tas.tif")], &dir.path().join("out"), false, 1)
        .unwrap();
    let failure = results[0].as_ref().unwrap_err();
    assert!(failure.to_string().contains("HTTP 503"), "{failure}");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn not_found_is_never_retried() {
    let (base, hits) = flaky_server(0);
    let dir = tempfile::tempdir().unwrap();
    let results = downloader(dir.path())
        .with_retry_max(3)
        .with_sleep_max(Duration::from_millis(20))
        .download(&[format!("{base}/gone.tif")], &dir.path().join("out"), false, 1)
        .unwrap();
    assert!(results[0].is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn repeated_target_names_are_fetched_once() {
    let base = common::serve(vec![
        ("/2016/tas.tif", b"2016 tas".to_vec()),
        ("/2017/tas.tif", b"2017 tas".to_vec()),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let urls = [format!("{base}/2016/tas.tif"), format!("{base}/2017/tas.tif")];

    let results = downloader(dir.path()).download(&urls, &out, true, 2).unwrap();
    assert_eq!(results[0].as_ref().unwrap(), &out.join("tas.tif"));
    let failure = results[1].as_ref().unwrap_err();
    assert!(matches!(failure.error, Error::Config(_)), "{failure}");
    assert_eq!(std::fs::read(out.join("tas.tif")).unwrap(), b"2016 tas");
}

#[test]
fn one_failing_url_is_isolated_and_order_is_kept() {
    let base = common::serve(vec![
        ("/tas.tif", b"tas bytes".to_vec()),
        ("/sun.tif", b"sun bytes".to_vec()),
        ("/pv.tif", b"pv bytes".to_vec()),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let credentials = manager_with_cached_certificate(&dir.path().join("certs"));
    let downloader = BatchDownloader::new(credentials)
        .with_timeout(Duration::from_secs(10))
        .with_progress(false);

    let urls = [
        format!("{base}/tas.tif"),
        format!("{base}/sun.tif"),
        format!("{base}/rainfall.tif"),
        format!("{base}/pv.tif?download=1"),
    ];
    let out = dir.path().join("2016");
    for parallel in [false, true] {
        let results = downloader.download(&urls, &out, parallel, 3).unwrap();
        assert_eq!(results.len(), 4);

        let failure = results[2].as_ref().unwrap_err();
        assert_eq!(failure.url, urls[2]);
        assert!(matches!(failure.error, Error::Network(_)), "{failure}");

        let pv = results[3].as_ref().unwrap();
        assert_eq!(pv, &out.join("pv.tif"));
        assert_eq!(std::fs::read(pv).unwrap(), b"pv bytes");
        assert_eq!(
            std::fs::read(results[0].as_ref().unwrap()).unwrap(),
            b"tas bytes"
        );
        assert!(results[1].is_ok());
        assert!(!out.join("rainfall.tif").exists());
    }
}

#[test]
fn unreachable_host_is_a_per_item_failure() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = manager_with_cached_certificate(&dir.path().join("certs"));
    let downloader = BatchDownloader::new(credentials)
        .with_timeout(Duration::from_secs(5))
        .with_progress(false);

    let results = downloader
        .download(&["http://127.0.0.1:9/hurs.tif"], dir.path(), false, 1)
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0].as_ref().unwrap_err().error,
        Error::Network(_)
    ));
}

#[test]
fn missing_credentials_fail_the_whole_batch() {
    let dir = tempfile::tempdir().unwrap();
    let cert_dir = dir.path().join("certs");
    let manager = Arc::new(CredentialManager::new(CredentialConfig::new(&cert_dir)).unwrap());
    let downloader = BatchDownloader::new(manager).with_progress(false);

    let err = downloader
        .download(&["http://127.0.0.1:9/tas.tif"], &dir.path().join("out"), true, 2)
        .unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
    assert!(cert_dir.is_dir());
}

#[test]
fn cached_certificate_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = manager_with_cached_certificate(&dir.path().join("certs"));
    let before = std::fs::read(credentials.credentials_path()).unwrap();

    assert!(!credentials.ensure(Duration::from_secs(3600)).unwrap());
    assert_eq!(std::fs::read(credentials.credentials_path()).unwrap(), before);
    assert_eq!(credentials.generation(), 0);
}
