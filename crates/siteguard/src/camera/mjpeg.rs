//! MJPEG (`multipart/x-mixed-replace`) stream reading.
//!
//! The backend serves `/video_feed/{index}` as a never-ending multipart
//! body, one JPEG per part. [`MjpegParser`] splits the byte stream into
//! parts; [`MjpegSink`] runs the HTTP request and keeps the latest decoded
//! frame.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use image::DynamicImage;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{SlotSignal, StreamSink};
use crate::error::{Error, Result};

/// Boundary used when the response does not name one.
pub const DEFAULT_BOUNDARY: &str = "frame";

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Extract the multipart boundary from a `Content-Type` value.
#[must_use]
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let value = value.strip_prefix("--").unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn content_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers).lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Incremental multipart splitter.
#[derive(Debug)]
pub struct MjpegParser {
    marker: Vec<u8>,
    buf: Vec<u8>,
    max_part: usize,
}

impl MjpegParser {
    /// Create a parser for parts separated by `--{boundary}`, rejecting any
    /// part larger than `max_part` bytes.
    #[must_use]
    pub fn new(boundary: &str, max_part: usize) -> Self {
        Self {
            marker: format!("--{boundary}").into_bytes(),
            buf: Vec::new(),
            max_part,
        }
    }

    /// Feed a chunk and return every part it completed.
    ///
    /// # Errors
    ///
    /// Returns an error if a part grows beyond the size limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &self.marker, 0) else {
                // keep a tail long enough to hold a split marker
                let keep = self.marker.len().saturating_sub(1);
                if self.buf.len() > keep {
                    self.buf.drain(..self.buf.len() - keep);
                }
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            let Some(header_end) = find(&self.buf, HEADER_END, self.marker.len()) else {
                self.check_size(self.buf.len())?;
                break;
            };
            let body_start = header_end + HEADER_END.len();
            let headers = &self.buf[self.marker.len()..header_end];

            if let Some(len) = content_length(headers) {
                if len > self.max_part {
                    return Err(Error::stream(format!(
                        "MJPEG part of {len} bytes exceeds limit of {}",
                        self.max_part
                    )));
                }
                if self.buf.len() < body_start + len {
                    break;
                }
                parts.push(self.buf[body_start..body_start + len].to_vec());
                self.buf.drain(..body_start + len);
                continue;
            }

            let Some(next) = find(&self.buf, &self.marker, body_start) else {
                self.check_size(self.buf.len() - body_start)?;
                break;
            };
            let mut body = &self.buf[body_start..next];
            while let Some(rest) = body.strip_suffix(b"\r\n") {
                body = rest;
            }
            if !body.is_empty() {
                parts.push(body.to_vec());
            }
            self.buf.drain(..next);
        }

        Ok(parts)
    }

    fn check_size(&self, pending: usize) -> Result<()> {
        if pending > self.max_part {
            return Err(Error::stream(format!(
                "MJPEG part exceeds limit of {} bytes",
                self.max_part
            )));
        }
        Ok(())
    }
}

/// A sink showing a refreshable MJPEG image.
///
/// Rebinding replaces the stream in place: the previous reader is cancelled
/// and a new one starts.
#[derive(Debug)]
pub struct MjpegSink {
    http: Client,
    max_frame_bytes: usize,
    latest: Arc<Mutex<Option<DynamicImage>>>,
    reader: Option<CancellationToken>,
}

impl MjpegSink {
    /// Create an unbound sink.
    #[must_use]
    pub fn new(http: Client, max_frame_bytes: usize) -> Self {
        Self {
            http,
            max_frame_bytes,
            latest: Arc::new(Mutex::new(None)),
            reader: None,
        }
    }

    fn cancel_reader(&mut self) {
        if let Some(token) = self.reader.take() {
            token.cancel();
        }
    }
}

impl StreamSink for MjpegSink {
    fn bind(mut self: Box<Self>, url: Url, signal: SlotSignal) -> Box<dyn StreamSink> {
        self.cancel_reader();
        if let Ok(mut latest) = self.latest.lock() {
            *latest = None;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            signal.error("no async runtime to read the stream");
            return self;
        };

        let token = CancellationToken::new();
        self.reader = Some(token.clone());
        let http = self.http.clone();
        let latest = Arc::clone(&self.latest);
        let max = self.max_frame_bytes;

        runtime.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    trace!(%url, "MJPEG reader cancelled");
                }
                result = read_stream(&http, &url, &latest, &signal, max) => {
                    match result {
                        Ok(()) => signal.error("stream ended"),
                        Err(e) => signal.error(&e.to_string()),
                    }
                }
            }
        });

        self
    }

    fn latest_frame(&self) -> Option<DynamicImage> {
        self.latest.lock().ok().and_then(|f| f.clone())
    }

    fn stop(&mut self) {
        self.cancel_reader();
    }
}

impl Drop for MjpegSink {
    fn drop(&mut self) {
        self.cancel_reader();
    }
}

async fn read_stream(
    http: &Client,
    url: &Url,
    latest: &Mutex<Option<DynamicImage>>,
    signal: &SlotSignal,
    max_frame_bytes: usize,
) -> Result<()> {
    debug!(%url, "Opening MJPEG stream");
    let response = http.get(url.clone()).send().await?;
    if !response.status().is_success() {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let boundary = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(boundary_from_content_type)
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
    let mut parser = MjpegParser::new(&boundary, max_frame_bytes);
    let mut body = response.bytes_stream();
    let mut frames = 0u64;

    while let Some(chunk) = body.next().await {
        for part in parser.push(&chunk?)? {
            match image::load_from_memory(&part) {
                Ok(frame) => {
                    if let Ok(mut slot) = latest.lock() {
                        *slot = Some(frame);
                    }
                    frames += 1;
                    if frames == 1 {
                        signal.ready();
                    }
                }
                Err(e) => debug!(%url, error = %e, "Skipping undecodable frame"),
            }
        }
    }

    debug!(%url, frames, "MJPEG stream closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(body: &[u8]) -> Vec<u8> {
        let mut out = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame"),
            Some("frame".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--cam\""),
            Some("cam".to_string())
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
    }

    #[test]
    fn test_parts_without_length_need_next_boundary() {
        let mut parser = MjpegParser::new("frame", 1024);

        assert!(parser.push(&part(b"AAAA")).unwrap().is_empty());
        let parts = parser.push(&part(b"BBBB")).unwrap();
        assert_eq!(parts, vec![b"AAAA".to_vec()]);
    }

    #[test]
    fn test_parts_with_length_complete_immediately() {
        let mut parser = MjpegParser::new("frame", 1024);
        let data = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nxyz\r\n";

        let parts = parser.push(data).unwrap();
        assert_eq!(parts, vec![b"xyz".to_vec()]);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut stream = part(b"first-frame");
        stream.extend(part(b"second-frame"));
        stream.extend(part(b"third"));

        let mut parser = MjpegParser::new("frame", 1024);
        let mut parts = Vec::new();
        for chunk in stream.chunks(3) {
            parts.extend(parser.push(chunk).unwrap());
        }
        assert_eq!(
            parts,
            vec![b"first-frame".to_vec(), b"second-frame".to_vec()]
        );
    }

    #[test]
    fn test_leading_garbage_skipped() {
        let mut parser = MjpegParser::new("frame", 1024);
        let mut data = b"garbage bytes\r\n".to_vec();
        data.extend(part(b"one"));
        data.extend(part(b"two"));

        assert_eq!(parser.push(&data).unwrap(), vec![b"one".to_vec()]);
    }

    #[test]
    fn test_oversized_part_rejected() {
        let mut parser = MjpegParser::new("frame", 8);
        let data = b"--frame\r\nContent-Length: 100\r\n\r\n";
        assert!(parser.push(data).is_err());

        let mut parser = MjpegParser::new("frame", 8);
        let mut data = b"--frame\r\n\r\n".to_vec();
        data.extend_from_slice(&[0u8; 32]);
        assert!(parser.push(&data).is_err());
    }

    #[test]
    fn test_content_length_header_case() {
        assert_eq!(content_length(b"\r\nCONTENT-LENGTH: 12"), Some(12));
        assert_eq!(content_length(b"\r\nContent-Type: image/jpeg"), None);
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abcabc", b"bc", 0), Some(1));
        assert_eq!(find(b"abcabc", b"bc", 2), Some(4));
        assert_eq!(find(b"abc", b"zz", 0), None);
        assert_eq!(find(b"abc", b"a", 5), None);
    }
}
