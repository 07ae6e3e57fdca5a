//! Frame values and the identifiers that route them.
//!
//! A [`Frame`] is immutable once built: the reassembler creates it, the hub
//! shares it behind an `Arc`, and relays and overlay renderers only read it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Header keys carrying the capture timestamp, in lookup order.
pub const TIMESTAMP_HEADERS: [&str; 3] = ["timestamp", "ts", "x-timestamp"];

/// Identifies one logical camera feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CameraKey {
    pub app_id: String,
    pub camera_id: String,
}

impl CameraKey {
    pub fn new(app_id: impl Into<String>, camera_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            camera_id: camera_id.into(),
        }
    }
}

impl fmt::Display for CameraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.camera_id)
    }
}

/// Upstream endpoint for one camera, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub key: CameraKey,
    pub host: String,
    pub port: u16,
}

impl CameraDescriptor {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A header value as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Number(i64),
    Text(String),
}

impl HeaderValue {
    /// Numbers are recognised by a full integer parse; anything else stays text.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => HeaderValue::Number(n),
            Err(_) => HeaderValue::Text(raw.to_string()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Number(n) => Some(*n),
            HeaderValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Number(n) => write!(f, "{}", n),
            // Line breaks would end the header block early.
            HeaderValue::Text(s) => f.write_str(&s.replace(['\r', '\n'], " ")),
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(n: i64) -> Self {
        HeaderValue::Number(n)
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

/// Ordered header map. Keys keep their original case; lookups ignore it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeaders {
    entries: Vec<(String, HeaderValue)>,
}

impl FrameHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared payload length, if present and sane.
    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length")
            .and_then(HeaderValue::as_i64)
            .and_then(|n| usize::try_from(n).ok())
    }

    /// Capture time from the first timestamp header that parses.
    pub fn timestamp(&self) -> Option<i64> {
        TIMESTAMP_HEADERS
            .iter()
            .find_map(|key| self.get(key).and_then(HeaderValue::as_i64))
    }
}

/// One JPEG image plus its capture metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
    timestamp: i64,
    headers: FrameHeaders,
}

impl Frame {
    pub fn new(bytes: Bytes, timestamp: i64, headers: FrameHeaders) -> Self {
        Self {
            bytes,
            timestamp,
            headers,
        }
    }

    /// Build a frame for a JPEG pushed from outside the upstream socket.
    pub fn from_jpeg(bytes: Bytes) -> Self {
        let timestamp = now_millis();
        let mut headers = FrameHeaders::new();
        headers.insert("Content-Type", "image/jpeg");
        headers.insert("Content-Length", bytes.len() as i64);
        headers.insert("timestamp", timestamp);
        Self::new(bytes, timestamp, headers)
    }

    /// Same metadata, new payload. A declared length is rewritten to match.
    pub fn with_payload(&self, bytes: Bytes) -> Self {
        let mut headers = self.headers.clone();
        if headers.get("content-length").is_some() {
            headers.insert("content-length", bytes.len() as i64);
        }
        Self::new(bytes, self.timestamp, headers)
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn headers(&self) -> &FrameHeaders {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A detected object in pixel coordinates of the frame it came with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A frame paired with the detections computed for it.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub frame: Arc<Frame>,
    pub detections: Vec<Detection>,
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_lookup_ignores_case() {
        let mut headers = FrameHeaders::new();
        headers.insert("Content-Length", 12);
        headers.insert("X-Camera", "dock-3");

        assert_eq!(headers.content_length(), Some(12));
        assert_eq!(
            headers.get("x-camera"),
            Some(&HeaderValue::Text("dock-3".to_string()))
        );
    }

    #[test]
    fn test_headers_replace_keeps_order() {
        let mut headers = FrameHeaders::new();
        headers.insert("a", 1);
        headers.insert("b", 2);
        headers.insert("A", 3);

        let keys: Vec<_> = headers.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(headers.get("a"), Some(&HeaderValue::Number(3)));
    }

    #[test]
    fn test_negative_content_length_is_ignored() {
        let mut headers = FrameHeaders::new();
        headers.insert("content-length", -5);
        assert_eq!(headers.content_length(), None);
    }

    #[test]
    fn test_timestamp_header_fallbacks() {
        let mut headers = FrameHeaders::new();
        headers.insert("ts", "1700000000123");
        assert_eq!(headers.timestamp(), Some(1_700_000_000_123));

        headers.insert("timestamp", "not-a-number");
        assert_eq!(headers.timestamp(), Some(1_700_000_000_123));
    }

    #[test]
    fn test_from_jpeg_sets_length() {
        let frame = Frame::from_jpeg(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));
        assert_eq!(frame.headers().content_length(), Some(4));
        assert_eq!(frame.headers().timestamp(), Some(frame.timestamp()));
    }

    #[test]
    fn test_with_payload_rewrites_length() {
        let original = Frame::from_jpeg(Bytes::from_static(b"abcd"));
        let replaced = original.with_payload(Bytes::from_static(b"abcdefgh"));

        assert_eq!(replaced.timestamp(), original.timestamp());
        assert_eq!(replaced.headers().content_length(), Some(8));
        assert_eq!(original.headers().content_length(), Some(4));
    }

    #[test]
    fn test_text_value_strips_line_breaks() {
        let value = HeaderValue::Text("a\r\nb".to_string());
        assert_eq!(value.to_string(), "a  b");
    }
}
