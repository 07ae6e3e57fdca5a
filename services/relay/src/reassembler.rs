//! Frame reassembly from an undelimited multipart JPEG byte stream.
//!
//! Upstream encoders write a repeating structure with no outer framing:
//!
//! ```text
//! --<boundary>\r\n
//! <header-name>: <header-value>\r\n
//! \r\n
//! <raw JPEG bytes>
//! ```
//!
//! Network reads split this anywhere, including inside the boundary marker or
//! the JPEG markers. [`FrameReassembler`] buffers just enough state to rebuild
//! whole frames. A `content-length` header, when present and sane, decides
//! where the payload ends; otherwise the payload runs from the first
//! start-of-image marker to the first end-of-image marker after it.
//!
//! Malformed input never produces an error. The frame in progress is dropped
//! and parsing resumes at the next boundary marker.

use crate::frame::{now_millis, Frame, FrameHeaders, HeaderValue};
use bytes::{Buf, BytesMut};
use tracing::trace;

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Bounds that keep a corrupt stream from growing buffers without limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblerLimits {
    /// Largest header block accepted before the parser gives up on it.
    pub max_header_bytes: usize,
    /// Largest payload accepted, declared or scanned.
    pub max_frame_bytes: usize,
}

impl Default for ReassemblerLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Counters for one reassembler instance.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub frames_emitted: u64,
    pub frames_dropped: u64,
    pub bytes_discarded: u64,
}

/// A frame whose header block has been read but whose payload is incomplete.
#[derive(Debug)]
struct PartialFrame {
    headers: FrameHeaders,
    declared_length: Option<usize>,
    payload: BytesMut,
    /// In marker mode, whether the start-of-image marker has been seen.
    started: bool,
}

impl PartialFrame {
    fn with_headers(headers: FrameHeaders, declared_length: Option<usize>) -> Self {
        Self {
            headers,
            declared_length,
            payload: BytesMut::new(),
            started: declared_length.is_some(),
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    AwaitingBytes(PartialFrame),
}

/// Whether the parse loop should run another step.
enum Step {
    Continue,
    NeedMoreInput,
}

/// Stateful chunk-to-frame parser. One instance per upstream connection.
#[derive(Debug)]
pub struct FrameReassembler {
    marker: Vec<u8>,
    /// The bare `--` marker only counts at the start of a line.
    line_start_only: bool,
    limits: ReassemblerLimits,
    pending: BytesMut,
    state: State,
    stats: ReassemblerStats,
}

impl FrameReassembler {
    /// Accept any line starting with `--` as a boundary.
    pub fn new(limits: ReassemblerLimits) -> Self {
        Self {
            marker: b"--".to_vec(),
            line_start_only: true,
            limits,
            pending: BytesMut::new(),
            state: State::Idle,
            stats: ReassemblerStats::default(),
        }
    }

    /// Only accept `--<boundary>` lines as boundaries.
    pub fn with_boundary(boundary: &str, limits: ReassemblerLimits) -> Self {
        let mut reassembler = Self::new(limits);
        reassembler.marker = format!("--{}", boundary).into_bytes();
        reassembler.line_start_only = false;
        reassembler
    }

    pub fn stats(&self) -> &ReassemblerStats {
        &self.stats
    }

    /// True while a frame has been started but not completed.
    pub fn in_progress(&self) -> bool {
        matches!(self.state, State::AwaitingBytes(_))
    }

    /// Bytes held back from earlier chunks outside of any frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Feed one chunk and collect every frame it completes, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let step = match std::mem::replace(&mut self.state, State::Idle) {
                State::Idle => self.step_idle(),
                State::AwaitingBytes(partial) => self.step_awaiting(partial, &mut frames),
            };
            if let Step::NeedMoreInput = step {
                break;
            }
        }
        frames
    }

    /// Look for the start of the next frame in the pending bytes.
    fn step_idle(&mut self) -> Step {
        let boundary = self.find_boundary(0);
        let soi = find(&self.pending, &SOI, 0);

        match (boundary, soi) {
            (Some(b), Some(s)) if b < s => self.read_header_block(b),
            (Some(b), None) => self.read_header_block(b),
            (_, Some(s)) => {
                // Image data with no header block in front of it.
                self.discard(s);
                self.state = State::AwaitingBytes(PartialFrame {
                    started: true,
                    ..PartialFrame::with_headers(FrameHeaders::new(), None)
                });
                Step::Continue
            }
            (None, None) => {
                // Keep a tail long enough to complete a marker split across reads.
                let keep = self.marker.len().max(SOI.len());
                self.discard(self.pending.len().saturating_sub(keep));
                Step::NeedMoreInput
            }
        }
    }

    /// Parse the header block that starts with the boundary at `start`.
    fn read_header_block(&mut self, start: usize) -> Step {
        self.discard(start);

        let next_boundary = self.find_boundary(self.marker.len());
        let blank = find_blank_line(&self.pending, 0);

        match (blank, next_boundary) {
            (Some((end, _)), Some(next)) if next < end => {
                // Truncated header block; the next one starts here.
                trace!(skipped = next, "Header block interrupted by boundary");
                self.discard(next);
                Step::Continue
            }
            (Some((end, separator_len)), _) => {
                let headers = parse_headers(&self.pending[..end]);
                self.discard(end + separator_len);

                let declared_length = headers
                    .content_length()
                    .filter(|len| *len <= self.limits.max_frame_bytes);
                self.state =
                    State::AwaitingBytes(PartialFrame::with_headers(headers, declared_length));
                Step::Continue
            }
            (None, Some(next)) => {
                self.discard(next);
                Step::Continue
            }
            (None, None) if self.pending.len() > self.limits.max_header_bytes => {
                // Never terminated; resynchronise past this boundary.
                self.discard(self.marker.len());
                Step::Continue
            }
            (None, None) => Step::NeedMoreInput,
        }
    }

    fn step_awaiting(&mut self, partial: PartialFrame, frames: &mut Vec<Frame>) -> Step {
        match partial.declared_length {
            Some(length) => self.fill_declared(partial, length, frames),
            None if partial.started => self.scan_for_end(partial, frames),
            None => self.seek_start(partial),
        }
    }

    /// Length mode: copy exactly the declared number of bytes.
    fn fill_declared(
        &mut self,
        mut partial: PartialFrame,
        length: usize,
        frames: &mut Vec<Frame>,
    ) -> Step {
        let take = (length - partial.payload.len()).min(self.pending.len());
        partial.payload.extend_from_slice(&self.pending.split_to(take));

        if partial.payload.len() == length {
            self.emit(partial, frames);
            Step::Continue
        } else {
            self.state = State::AwaitingBytes(partial);
            Step::NeedMoreInput
        }
    }

    /// Marker mode, before the start-of-image marker has been found.
    fn seek_start(&mut self, mut partial: PartialFrame) -> Step {
        let soi = find(&self.pending, &SOI, 0);
        let boundary = self.find_boundary(0);

        match (soi, boundary) {
            (Some(s), Some(b)) if b < s => self.abandon_part(b),
            (None, Some(b)) => self.abandon_part(b),
            (Some(s), _) => {
                self.discard(s);
                partial.started = true;
                self.state = State::AwaitingBytes(partial);
                Step::Continue
            }
            (None, None) => {
                let keep = self.marker.len().max(SOI.len());
                self.discard(self.pending.len().saturating_sub(keep));
                self.state = State::AwaitingBytes(partial);
                Step::NeedMoreInput
            }
        }
    }

    /// A new part began at `boundary` before this one carried any image data.
    fn abandon_part(&mut self, boundary: usize) -> Step {
        self.drop_frame("no image data before next boundary");
        self.discard(boundary);
        Step::Continue
    }

    /// Marker mode: the payload starts with SOI and ends at the first EOI
    /// after it, so an EOI belonging to an earlier image is never matched.
    fn scan_for_end(&mut self, mut partial: PartialFrame, frames: &mut Vec<Frame>) -> Step {
        // An EOI split across reads leaves 0xFF at the end of the payload.
        let split_marker = partial.payload.len() > SOI.len()
            && partial.payload.last() == Some(&EOI[0])
            && self.pending.first() == Some(&EOI[1]);

        let end = if split_marker {
            Some(1)
        } else {
            let from = SOI.len().saturating_sub(partial.payload.len());
            find(&self.pending, &EOI, from).map(|pos| pos + EOI.len())
        };

        match end {
            Some(take) => {
                partial.payload.extend_from_slice(&self.pending.split_to(take));
                self.emit(partial, frames);
                Step::Continue
            }
            None => {
                partial.payload.extend_from_slice(&self.pending);
                self.pending.clear();

                if partial.payload.len() > self.limits.max_frame_bytes {
                    self.stats.bytes_discarded += partial.payload.len() as u64;
                    self.drop_frame("end-of-image marker not found within frame limit");
                } else {
                    self.state = State::AwaitingBytes(partial);
                }
                Step::NeedMoreInput
            }
        }
    }

    fn find_boundary(&self, from: usize) -> Option<usize> {
        if self.line_start_only {
            find_line_start(&self.pending, &self.marker, from)
        } else {
            find(&self.pending, &self.marker, from)
        }
    }

    fn emit(&mut self, partial: PartialFrame, frames: &mut Vec<Frame>) {
        if partial.payload.is_empty() {
            self.drop_frame("empty payload");
            return;
        }

        let timestamp = partial.headers.timestamp().unwrap_or_else(now_millis);
        self.stats.frames_emitted += 1;
        frames.push(Frame::new(
            partial.payload.freeze(),
            timestamp,
            partial.headers,
        ));
    }

    fn drop_frame(&mut self, reason: &'static str) {
        self.stats.frames_dropped += 1;
        trace!(reason, "Partial frame dropped");
    }

    fn discard(&mut self, count: usize) {
        if count > 0 {
            self.stats.bytes_discarded += count as u64;
            self.pending.advance(count);
        }
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(ReassemblerLimits::default())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Find `marker` at the start of a line, at or after `from`.
fn find_line_start(haystack: &[u8], marker: &[u8], from: usize) -> Option<usize> {
    let mut search = from;
    while let Some(pos) = find(haystack, marker, search) {
        if pos == 0 || haystack[pos - 1] == b'\n' {
            return Some(pos);
        }
        search = pos + 1;
    }
    None
}

/// Position and length of the first empty line separator.
fn find_blank_line(haystack: &[u8], from: usize) -> Option<(usize, usize)> {
    let crlf = find(haystack, b"\r\n\r\n", from).map(|pos| (pos, 4));
    let lf = find(haystack, b"\n\n", from).map(|pos| (pos, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse `name: value` lines following the boundary line. Lines without a
/// colon are skipped.
fn parse_headers(block: &[u8]) -> FrameHeaders {
    let text = String::from_utf8_lossy(block);
    let mut headers = FrameHeaders::new();

    for line in text.split('\n').skip(1) {
        let line = line.trim_end_matches('\r').trim();
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                headers.insert(key, HeaderValue::parse(value.trim()));
            }
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::FrameEncoder;
    use bytes::Bytes;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut data = SOI.to_vec();
        data.extend_from_slice(body);
        data.extend_from_slice(&EOI);
        data
    }

    fn part(boundary: &str, headers: &[(&str, String)], payload: &[u8]) -> Vec<u8> {
        let mut out = format!("--{}\r\n", boundary).into_bytes();
        for (k, v) in headers {
            out.extend_from_slice(format!("{}: {}\r\n", k, v).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn stream_of_three() -> Vec<u8> {
        let mut stream = Vec::new();
        let a = jpeg(b"first");
        stream.extend(part("B", &[("Content-Length", a.len().to_string())], &a));
        stream.extend(part("B", &[("timestamp", "1000".to_string())], &jpeg(b"second")));
        let c = jpeg(b"third\xFF\x00");
        stream.extend(part(
            "B",
            &[("Content-Type", "image/jpeg".to_string()), ("Content-Length", c.len().to_string())],
            &c,
        ));
        stream
    }

    fn payloads(frames: &[Frame]) -> Vec<Vec<u8>> {
        frames.iter().map(|f| f.bytes().to_vec()).collect()
    }

    #[test]
    fn test_split_header_and_payload() {
        let mut reassembler = FrameReassembler::default();

        assert!(reassembler.push(b"--B\r\ncontent-").is_empty());
        assert!(reassembler.push(b"length: 4\r\n\r\nab").is_empty());
        let frames = reassembler.push(b"cd");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes().as_ref(), b"abcd");
        assert_eq!(frames[0].headers().content_length(), Some(4));
    }

    #[test]
    fn test_two_chunks_yield_single_frame() {
        let mut stream = b"--B\r\ncontent-length: 4\r\n\r\n".to_vec();
        stream.extend_from_slice(b"wxyz");

        for split in 1..stream.len() {
            let mut reassembler = FrameReassembler::with_boundary("B", ReassemblerLimits::default());
            let mut frames = reassembler.push(&stream[..split]);
            frames.extend(reassembler.push(&stream[split..]));
            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(frames[0].len(), 4);
        }
    }

    #[test]
    fn test_single_chunk_matches_byte_chunks() {
        let stream = stream_of_three();

        let mut whole = FrameReassembler::default();
        let expected = whole.push(&stream);
        assert_eq!(expected.len(), 3);

        let mut bytewise = FrameReassembler::default();
        let mut actual = Vec::new();
        for byte in &stream {
            actual.extend(bytewise.push(std::slice::from_ref(byte)));
        }

        assert_eq!(payloads(&actual), payloads(&expected));
        let headers: Vec<_> = actual.iter().map(|f| f.headers().clone()).collect();
        let expected_headers: Vec<_> = expected.iter().map(|f| f.headers().clone()).collect();
        assert_eq!(headers, expected_headers);
    }

    #[test]
    fn test_encoder_round_trip_at_every_offset() {
        let mut headers = FrameHeaders::new();
        headers.insert("Content-Type", "image/jpeg");
        let payload = jpeg(b"\x01\x02\x03 payload");
        headers.insert("Content-Length", payload.len() as i64);
        headers.insert("timestamp", 1_700_000_000_000i64);
        let frame = Frame::new(Bytes::from(payload), 1_700_000_000_000, headers);

        let encoded = FrameEncoder::new("relay").encode(&frame);

        for split in 0..=encoded.len() {
            let mut reassembler = FrameReassembler::with_boundary("relay", ReassemblerLimits::default());
            let mut frames = reassembler.push(&encoded[..split]);
            frames.extend(reassembler.push(&encoded[split..]));

            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(frames[0], frame);
        }
    }

    #[test]
    fn test_chunk_boundary_between_eoi_and_next_soi() {
        let first = jpeg(b"one");
        let second = jpeg(b"two");
        let mut chunk_a = b"--B\r\n\r\n".to_vec();
        chunk_a.extend_from_slice(&first);
        let mut chunk_b = b"\r\n--B\r\n\r\n".to_vec();
        chunk_b.extend_from_slice(&second);

        let mut reassembler = FrameReassembler::default();
        let mut frames = reassembler.push(&chunk_a);
        frames.extend(reassembler.push(&chunk_b));

        assert_eq!(payloads(&frames), vec![first, second]);
    }

    #[test]
    fn test_tail_of_unseen_frame_is_not_welded() {
        // Joined mid-image: an EOI arrives before any SOI.
        let mut stream = b"garbage tail \xFF\xD9\r\n".to_vec();
        let image = jpeg(b"whole");
        stream.extend(part("B", &[], &image));

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);

        assert_eq!(payloads(&frames), vec![image]);
    }

    #[test]
    fn test_many_frames_in_one_chunk() {
        let mut stream = Vec::new();
        for i in 0..500u32 {
            stream.extend(part("B", &[], &jpeg(&i.to_be_bytes())));
        }

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);

        assert_eq!(frames.len(), 500);
        assert_eq!(&frames[499].bytes()[2..6], &499u32.to_be_bytes()[..]);
    }

    #[test]
    fn test_headerless_jpeg_stream() {
        let mut stream = jpeg(b"a");
        stream.extend(jpeg(b"b"));

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);

        assert_eq!(payloads(&frames), vec![jpeg(b"a"), jpeg(b"b")]);
        assert!(frames[0].headers().is_empty());
    }

    #[test]
    fn test_bad_content_length_falls_back_to_markers() {
        let image = jpeg(b"img");
        let stream = part("B", &[("Content-Length", "lots".to_string())], &image);

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);

        assert_eq!(payloads(&frames), vec![image]);
    }

    #[test]
    fn test_declared_length_wins_over_early_marker() {
        // An embedded thumbnail ends with EOI well before the real image end.
        let mut image = SOI.to_vec();
        image.extend_from_slice(b"thumb");
        image.extend_from_slice(&jpeg(b"inner"));
        image.extend_from_slice(b"rest");
        image.extend_from_slice(&EOI);
        let stream = part("B", &[("content-length", image.len().to_string())], &image);

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);

        assert_eq!(payloads(&frames), vec![image]);
    }

    #[test]
    fn test_timestamp_header_sets_frame_time() {
        let stream = part("B", &[("ts", "1234".to_string())], &jpeg(b"x"));
        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);
        assert_eq!(frames[0].timestamp(), 1234);
    }

    #[test]
    fn test_truncated_header_block_resynchronises() {
        let mut stream = b"--B\r\ncontent-length: 9\r\nX-Broken".to_vec();
        let image = jpeg(b"good");
        stream.extend_from_slice(b"\r\n");
        stream.extend(part("B", &[("content-length", image.len().to_string())], &image));

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);

        assert_eq!(payloads(&frames), vec![image]);
    }

    #[test]
    fn test_oversized_header_block_is_abandoned() {
        let limits = ReassemblerLimits {
            max_header_bytes: 64,
            max_frame_bytes: 1024,
        };
        let mut reassembler = FrameReassembler::with_boundary("B", limits);

        let mut junk = b"--B\r\nX-Junk: ".to_vec();
        junk.extend(std::iter::repeat(b'a').take(200));
        assert!(reassembler.push(&junk).is_empty());
        assert!(reassembler.buffered() <= 64);

        let image = jpeg(b"ok");
        let frames = reassembler.push(&part("B", &[], &image));
        assert_eq!(payloads(&frames), vec![image]);
    }

    #[test]
    fn test_runaway_payload_is_dropped() {
        let limits = ReassemblerLimits {
            max_header_bytes: 64,
            max_frame_bytes: 32,
        };
        let mut reassembler = FrameReassembler::with_boundary("B", limits);

        let mut stream = b"--B\r\n\r\n".to_vec();
        stream.extend_from_slice(&SOI);
        stream.extend(std::iter::repeat(0u8).take(100));
        assert!(reassembler.push(&stream).is_empty());
        assert!(!reassembler.in_progress());
        assert_eq!(reassembler.stats().frames_dropped, 1);

        let image = jpeg(b"next");
        let frames = reassembler.push(&part("B", &[], &image));
        assert_eq!(payloads(&frames), vec![image]);
    }

    #[test]
    fn test_part_without_image_is_skipped() {
        let mut stream = b"--B\r\nX-Note: empty\r\n\r\nnot an image\r\n".to_vec();
        let image = jpeg(b"real");
        stream.extend(part("B", &[], &image));

        let mut reassembler = FrameReassembler::default();
        let frames = reassembler.push(&stream);

        assert_eq!(payloads(&frames), vec![image]);
        assert_eq!(reassembler.stats().frames_dropped, 1);
    }

    #[test]
    fn test_header_block_arrives_before_image_bytes() {
        let mut reassembler = FrameReassembler::default();
        assert!(reassembler.push(b"--B\r\nX-Camera: dock\r\n\r\n").is_empty());
        assert!(reassembler.in_progress());

        let image = jpeg(b"late body");
        let mut rest = image.clone();
        rest.extend_from_slice(b"\r\n");
        let frames = reassembler.push(&rest);

        assert_eq!(payloads(&frames), vec![image]);
        assert_eq!(
            frames[0].headers().get("x-camera"),
            Some(&HeaderValue::Text("dock".to_string()))
        );
    }

    #[test]
    fn test_part_abandoned_when_next_boundary_arrives_first() {
        let mut reassembler = FrameReassembler::default();

        // The second header block is complete but its image has not arrived.
        let frames = reassembler.push(b"--B\r\nX-Note: empty\r\n\r\nnot an image\r\n--B\r\n\r\n");
        assert!(frames.is_empty());
        assert_eq!(reassembler.stats().frames_dropped, 1);
        assert!(reassembler.in_progress());

        let image = jpeg(b"kept");
        let mut rest = image.clone();
        rest.extend_from_slice(b"\r\n");
        assert_eq!(payloads(&reassembler.push(&rest)), vec![image]);
        assert_eq!(reassembler.stats().frames_dropped, 1);
    }

    /// Deterministic pseudo-random numbers for chunking.
    struct Lcg(u64);

    impl Lcg {
        fn below(&mut self, bound: u64) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    #[test]
    fn test_arbitrary_chunking_matches_whole_stream() {
        let mut rng = Lcg(0x5eed);

        for round in 0..300 {
            let mut stream = Vec::new();
            let mut expected = Vec::new();

            for _ in 0..1 + rng.below(5) {
                // No 0xFF inside bodies, and no dash that could start a boundary.
                let body: Vec<u8> = (0..rng.below(64))
                    .map(|_| match rng.below(0xFF) as u8 {
                        b'-' => 0,
                        byte => byte,
                    })
                    .collect();
                let image = jpeg(&body);
                let headers = match rng.below(3) {
                    0 => vec![("Content-Length", image.len().to_string())],
                    1 => Vec::new(),
                    _ => vec![
                        ("Content-Type", "image/jpeg".to_string()),
                        ("timestamp", "1700000000000".to_string()),
                    ],
                };
                stream.extend(part("B", &headers, &image));
                expected.push(image);
            }

            let mut cuts: Vec<usize> = (0..rng.below(8))
                .map(|_| rng.below(stream.len() as u64 + 1) as usize)
                .collect();
            cuts.push(0);
            cuts.push(stream.len());
            cuts.sort_unstable();

            let mut generic = FrameReassembler::default();
            let mut fixed = FrameReassembler::with_boundary("B", ReassemblerLimits::default());
            let mut from_generic = Vec::new();
            let mut from_fixed = Vec::new();
            for window in cuts.windows(2) {
                let chunk = &stream[window[0]..window[1]];
                from_generic.extend(generic.push(chunk));
                from_fixed.extend(fixed.push(chunk));
            }

            assert_eq!(payloads(&from_generic), expected, "round {}", round);
            assert_eq!(payloads(&from_fixed), expected, "round {}", round);
        }
    }

    #[test]
    fn test_noise_is_not_retained() {
        let mut reassembler = FrameReassembler::default();
        let noise = vec![0x42u8; 10_000];
        assert!(reassembler.push(&noise).is_empty());
        assert!(reassembler.buffered() <= 2);
        assert_eq!(reassembler.stats().bytes_discarded, 10_000 - reassembler.buffered() as u64);
    }

    #[test]
    fn test_parse_headers_skips_malformed_lines() {
        let headers = parse_headers(b"--B\r\nno colon here\r\n: empty key\r\nX-Ok: yes\r\n");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-ok"), Some(&HeaderValue::Text("yes".to_string())));
    }
}
