//! Capture collaborator
//!
//! Supplies raw image bytes for a meter. `HttpCapture` fetches the meter's
//! camera URL; cameras that only expose an MJPEG stream are handled by
//! reading until the first complete JPEG frame arrives.

use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use umr_common::config::MeterSection;

use crate::error::PipelineError;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on bytes read from a stream while looking for a frame
const MAX_FRAME_SEARCH_BYTES: usize = 8 * 1024 * 1024;

/// Source of raw meter images
#[async_trait::async_trait]
pub trait CaptureSource: Send + Sync {
    /// Capture one image for a meter
    async fn capture(&self, meter_name: &str) -> Result<Vec<u8>, PipelineError>;

    /// Camera reference recorded in archive metadata
    fn source_for(&self, meter_name: &str) -> String;
}

/// HTTP snapshot / MJPEG capture
pub struct HttpCapture {
    http_client: reqwest::Client,
    urls: HashMap<String, String>,
}

impl HttpCapture {
    pub fn new(meters: &[MeterSection]) -> Result<Self, PipelineError> {
        let timeout = meters
            .iter()
            .map(|m| m.camera_timeout_secs)
            .max()
            .unwrap_or(10);
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| PipelineError::Capture(e.to_string()))?;

        Ok(Self {
            http_client,
            urls: meters
                .iter()
                .map(|m| (m.name.clone(), m.camera_url.clone()))
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl CaptureSource for HttpCapture {
    async fn capture(&self, meter_name: &str) -> Result<Vec<u8>, PipelineError> {
        let url = self
            .urls
            .get(meter_name)
            .ok_or_else(|| PipelineError::NotFound(format!("meter '{}'", meter_name)))?;

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Capture(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Capture(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }

        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("multipart/"))
            .unwrap_or(false);

        let bytes = if is_stream {
            read_first_frame(response).await?
        } else {
            response
                .bytes()
                .await
                .map_err(|e| PipelineError::Capture(e.to_string()))?
                .to_vec()
        };

        if bytes.is_empty() {
            return Err(PipelineError::Capture(format!("{}: empty image", url)));
        }
        debug!(meter = %meter_name, bytes = bytes.len(), "Captured image");
        Ok(bytes)
    }

    fn source_for(&self, meter_name: &str) -> String {
        self.urls.get(meter_name).cloned().unwrap_or_default()
    }
}

/// Read a multipart stream until one JPEG frame is complete
async fn read_first_frame(response: reqwest::Response) -> Result<Vec<u8>, PipelineError> {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PipelineError::Capture(e.to_string()))?;
        buf.extend_from_slice(&chunk);
        if let Some(frame) = extract_jpeg_frame(&buf) {
            return Ok(frame.to_vec());
        }
        if buf.len() > MAX_FRAME_SEARCH_BYTES {
            break;
        }
    }

    Err(PipelineError::Capture(
        "no complete JPEG frame in MJPEG stream".to_string(),
    ))
}

/// First complete JPEG (SOI ... EOI) inside a byte buffer
///
/// Walks the marker segments instead of stopping at the first EOI, so an
/// EXIF thumbnail embedded in an APPn segment does not cut the frame short.
/// Returns `None` while the frame is still incomplete.
pub fn extract_jpeg_frame(buf: &[u8]) -> Option<&[u8]> {
    let start = find(buf, &JPEG_SOI)?;
    let mut pos = start + 2;

    loop {
        if *buf.get(pos)? != 0xFF {
            // Not a marker: the structure is broken, take the next EOI
            let end = find(&buf[pos..], &JPEG_EOI)? + pos;
            return Some(&buf[start..end + 2]);
        }
        let marker = *buf.get(pos + 1)?;
        match marker {
            // Fill byte before a marker
            0xFF => pos += 1,
            0xD9 => return Some(&buf[start..pos + 2]),
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                let len = usize::from(u16::from_be_bytes([*buf.get(pos + 2)?, *buf.get(pos + 3)?]));
                pos += 2 + len;
                if marker == 0xDA {
                    pos = skip_entropy_coded(buf, pos)?;
                }
            }
        }
    }
}

/// Position of the first marker after entropy-coded scan data
///
/// Inside scan data `FF 00` is an escaped byte and `FF D0`..`FF D7` are
/// restart markers; anything else ends the scan.
fn skip_entropy_coded(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let offset = buf.get(pos..)?.iter().position(|&b| b == 0xFF)?;
        pos += offset;
        match *buf.get(pos + 1)? {
            0x00 | 0xD0..=0xD7 => pos += 2,
            _ => return Some(pos),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SOI, an APP1 segment carrying a complete thumbnail, one scan, EOI
    fn frame_with_thumbnail() -> Vec<u8> {
        let thumbnail = [0xFF, 0xD8, 0xFF, 0xD9];
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(&[0xFF, 0xE1, 0x00, (2 + 4 + thumbnail.len()) as u8]);
        frame.extend_from_slice(b"Exif");
        frame.extend_from_slice(&thumbnail);
        // Start of scan with a 2-byte header body, then escaped and restart bytes
        frame.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x02]);
        frame.extend_from_slice(&[0x12, 0xFF, 0x00, 0x34, 0xFF, 0xD0, 0x56]);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }

    #[test]
    fn test_extract_frame_from_multipart() {
        let mut stream = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        stream.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0x01, 0x02, 0xFF, 0xD9]);
        stream.extend_from_slice(b"\r\n--frame\r\n");
        stream.extend_from_slice(&[0xFF, 0xD8, 0x09, 0xFF, 0xD9]);

        let frame = extract_jpeg_frame(&stream).unwrap();
        assert_eq!(frame, &[0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0x01, 0x02, 0xFF, 0xD9]);
    }

    #[test]
    fn test_embedded_thumbnail_does_not_end_frame() {
        let expected = frame_with_thumbnail();
        let mut stream = b"--frame\r\n\r\n".to_vec();
        stream.extend_from_slice(&expected);
        stream.extend_from_slice(b"\r\n--frame\r\n");

        assert_eq!(extract_jpeg_frame(&stream).unwrap(), &expected[..]);
        // Everything up to the last byte is still incomplete
        assert!(extract_jpeg_frame(&expected[..expected.len() - 1]).is_none());
        assert!(extract_jpeg_frame(&expected[..8]).is_none());
    }

    #[test]
    fn test_incomplete_frame() {
        assert!(extract_jpeg_frame(&[0x00, 0xFF, 0xD8, 0x01]).is_none());
        assert!(extract_jpeg_frame(b"no jpeg here").is_none());
    }

    #[test]
    fn test_soi_immediately_followed_by_eoi() {
        let frame = extract_jpeg_frame(&[0xFF, 0xD8, 0xFF, 0xD9, 0x00]).unwrap();
        assert_eq!(frame.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_meter_not_found() {
        let capture = HttpCapture::new(&[]).unwrap();
        assert!(matches!(
            capture.capture("ghost").await,
            Err(PipelineError::NotFound(_))
        ));
        assert_eq!(capture.source_for("ghost"), "");
    }
}
