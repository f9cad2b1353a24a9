//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GDAL_METADATA: u16 = 42112;

/// Writes a north-up GeoTIFF with one page per monthly time step.
///
/// `origin` is the upper-left corner and `times` are hours since 1800-01-01.
pub fn write_monthly_geotiff(
    path: &Path,
    origin: (f64, f64),
    pixel: f64,
    width: u32,
    height: u32,
    bands: &[Vec<f32>],
    times: &[f64],
) {
    let file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(file).unwrap();
    for (data, time) in bands.iter().zip(times) {
        let mut image = encoder
            .new_image::<colortype::Gray32Float>(width, height)
            .unwrap();
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE), &[pixel, pixel, 0.0][..])
            .unwrap();
        image
            .encoder()
            .write_tag(
                Tag::from_u16_exhaustive(MODEL_TIEPOINT),
                &[0.0, 0.0, 0.0, origin.0, origin.1, 0.0][..],
            )
            .unwrap();
        let xml = format!(
            "<GDALMetadata><Item name=\"time#units\">hours since 1800-01-01 00:00:00</Item><Item name=\"NETCDF_DIM_time\" sample=\"0\">{time}</Item></GDALMetadata>"
        );
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(GDAL_METADATA), xml.as_str())
            .unwrap();
        image.write_data(data).unwrap();
    }
}

/// PEM bundle of a self-signed certificate valid from an hour ago for
/// `valid_for`, followed by its private key.
pub fn credentials_pem(valid_for: time::Duration) -> String {
    let now = time::OffsetDateTime::now_utc();
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "tester");
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + valid_for;
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    format!("{}{}", cert.pem(), key.serialize_pem())
}

/// A request as seen by [`serve_with`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A throwaway HTTP server answering each path in `routes` with status 200 and
/// the given body, anything else with 404. Returns its base URL.
pub fn serve(routes: Vec<(&'static str, Vec<u8>)>) -> String {
    serve_with(move |req| match routes.iter().find(|(p, _)| *p == req.path) {
        Some((_, body)) => (200, Vec::new(), body.clone()),
        None => (404, Vec::new(), b"no such file".to_vec()),
    })
}

/// A throwaway HTTP server whose responses come from `handler` as
/// `(status, extra headers, body)`. The query string is stripped from the path.
pub fn serve_with<F>(handler: F) -> String
where
    F: Fn(&Request) -> (u16, Vec<(String, String)>, Vec<u8>) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let Ok(read_half) = stream.try_clone() else {
                continue;
            };
            let mut reader = BufReader::new(read_half);
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                continue;
            }
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) <= 2 {
                    break;
                }
                if let Some((k, v)) = line.split_once(':') {
                    headers.push((k.trim().to_string(), v.trim().to_string()));
                }
            }
            let length = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.parse::<usize>().ok())
                .unwrap_or(0);
            let mut body = vec![0u8; length];
            if reader.read_exact(&mut body).is_err() {
                continue;
            }

            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or("GET").to_string();
            let target = parts.next().unwrap_or("/");
            let path = target.split('?').next().unwrap_or(target).to_string();
            let request = Request {
                method,
                path,
                headers,
                body,
            };

            let (status, extra, body) = handler(&request);
            let mut head = format!(
                "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                reason(status),
                body.len()
            );
            for (k, v) in extra {
                head.push_str(&format!("{k}: {v}\r\n"));
            }
            head.push_str("\r\n");
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        }
    });
    format!("http://{addr}")
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        401 => "Unauthorized",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
