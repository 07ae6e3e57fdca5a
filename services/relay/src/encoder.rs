//! Multipart serialisation of frames for viewers.

use crate::frame::Frame;
use bytes::{BufMut, Bytes, BytesMut};

/// Boundary used when none is configured.
pub const DEFAULT_BOUNDARY: &str = "nier_frame_boundary";

/// Stateless `Frame` to multipart part serialiser.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    boundary: String,
}

impl FrameEncoder {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the response `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// Boundary line, headers, blank line, payload, then a line break so the
    /// next boundary starts on its own line.
    pub fn encode(&self, frame: &Frame) -> Bytes {
        let mut head = format!("--{}\r\n", self.boundary);
        for (key, value) in frame.headers().iter() {
            head.push_str(key);
            head.push_str(": ");
            head.push_str(&value.to_string());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut out = BytesMut::with_capacity(head.len() + frame.len() + 2);
        out.put_slice(head.as_bytes());
        out.put_slice(frame.bytes());
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeaders;

    #[test]
    fn test_encode_layout() {
        let mut headers = FrameHeaders::new();
        headers.insert("Content-Type", "image/jpeg");
        headers.insert("Content-Length", 4);
        let frame = Frame::new(Bytes::from_static(b"\xFF\xD8\xFF\xD9"), 10, headers);

        let encoded = FrameEncoder::new("B").encode(&frame);

        let mut expected = b"--B\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        expected.extend_from_slice(b"\xFF\xD8\xFF\xD9\r\n");
        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_encode_without_headers() {
        let frame = Frame::new(Bytes::from_static(b"xy"), 0, FrameHeaders::new());
        let encoded = FrameEncoder::new("b").encode(&frame);
        assert_eq!(encoded.as_ref(), b"--b\r\n\r\nxy\r\n");
    }

    #[test]
    fn test_content_type() {
        let encoder = FrameEncoder::default();
        assert_eq!(
            encoder.content_type(),
            "multipart/x-mixed-replace; boundary=nier_frame_boundary"
        );
    }
}
