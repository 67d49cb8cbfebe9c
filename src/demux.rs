//! Frame demultiplexing for upstream camera bytes.
//!
//! A [`FrameDemuxer`] owns the per-stream byte buffer. Feeding it a chunk
//! returns every frame completed by that chunk and keeps the unfinished tail
//! for the next call. It performs no I/O; enforcing a size cap on the tail is
//! the caller's job (see [`FrameDemuxer::buffered_len`]).

use bytes::{Buf, Bytes, BytesMut};

use crate::config::DeliveryMode;

/// Bytes preceding every multipart boundary: CR LF followed by two dashes.
pub const BOUNDARY_MARKER: &[u8] = b"\r\n--";

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

pub struct FrameDemuxer {
    mode: DeliveryMode,
    buffer: BytesMut,
}

impl FrameDemuxer {
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            mode,
            buffer: BytesMut::with_capacity(100_000), // typical JPEG size
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Append `chunk` and return the frames it completed, in stream order.
    ///
    /// Zero-length segments are dropped. In poll-snapshot mode the whole
    /// accumulated buffer is one frame and the buffer is emptied.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        match self.mode {
            DeliveryMode::PollSnapshot => {
                self.buffer.extend_from_slice(chunk);
                if self.buffer.is_empty() {
                    return Vec::new();
                }
                vec![self.buffer.split().freeze()]
            }
            DeliveryMode::ContinuousStream => {
                // The tail never holds a complete marker, so only its last
                // few bytes can start one that this chunk finishes.
                let resume_at = self.buffer.len().saturating_sub(BOUNDARY_MARKER.len() - 1);
                self.buffer.extend_from_slice(chunk);
                split_frames(&mut self.buffer, resume_at)
            }
        }
    }

    /// Bytes held back waiting for the next boundary.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame; used when the upstream connection is replaced.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn split_frames(buffer: &mut BytesMut, mut search_from: usize) -> Vec<Bytes> {
    let mut frames = Vec::new();

    while let Some(offset) = find(&buffer[search_from..], BOUNDARY_MARKER) {
        let frame = buffer.split_to(search_from + offset).freeze();
        buffer.advance(BOUNDARY_MARKER.len());
        if !frame.is_empty() {
            frames.push(frame);
        }
        search_from = 0;
    }

    frames
}

/// Isolate the image inside one multipart segment.
///
/// Segments still carry the part's boundary token and headers. A segment that
/// already starts with a JPEG SOI marker is returned as-is; otherwise the body
/// after the first blank line is used. Header-only segments (including the
/// closing `--token--`) yield `None`.
pub fn frame_payload(segment: Bytes) -> Option<Bytes> {
    if segment.starts_with(&JPEG_SOI) {
        return Some(segment);
    }

    let header_end = find(&segment, HEADER_TERMINATOR)?;
    let payload = segment.slice(header_end + HEADER_TERMINATOR.len()..);
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn multipart(frames: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend_from_slice(b"--myboundary\r\nContent-Type: image/jpeg\r\n\r\n");
            out.extend_from_slice(frame);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--myboundary--\r\n");
        out
    }

    #[test]
    fn test_splits_on_marker_and_keeps_remainder() {
        let mut demuxer = FrameDemuxer::new(DeliveryMode::ContinuousStream);

        let frames = demuxer.feed(b"first\r\n--second\r\n--third");
        assert_eq!(frames, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
        assert_eq!(demuxer.buffered_len(), "third".len());

        let frames = demuxer.feed(b"\r\n--");
        assert_eq!(frames, vec![Bytes::from_static(b"third")]);
        assert_eq!(demuxer.buffered_len(), 0);
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut demuxer = FrameDemuxer::new(DeliveryMode::ContinuousStream);

        assert!(demuxer.feed(b"abc\r").is_empty());
        assert!(demuxer.feed(b"\n-").is_empty());
        let frames = demuxer.feed(b"-def");
        assert_eq!(frames, vec![Bytes::from_static(b"abc")]);
        assert_eq!(demuxer.buffered_len(), 3);
    }

    #[test]
    fn test_empty_segments_are_discarded() {
        let mut demuxer = FrameDemuxer::new(DeliveryMode::ContinuousStream);

        let frames = demuxer.feed(b"\r\n--\r\n--frame\r\n--");
        assert_eq!(frames, vec![Bytes::from_static(b"frame")]);
    }

    #[test]
    fn test_poll_snapshot_emits_whole_buffer() {
        let mut demuxer = FrameDemuxer::new(DeliveryMode::PollSnapshot);

        let frames = demuxer.feed(b"\xFF\xD8jpeg\r\n--not-a-boundary\xFF\xD9");
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"\xFF\xD8jpeg\r\n--not-a-boundary\xFF\xD9");
        assert_eq!(demuxer.buffered_len(), 0);
        assert!(demuxer.feed(b"").is_empty());
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut demuxer = FrameDemuxer::new(DeliveryMode::ContinuousStream);
        demuxer.feed(b"partial frame bytes");
        demuxer.reset();
        assert_eq!(demuxer.buffered_len(), 0);
        assert_eq!(demuxer.feed(b"next\r\n--"), vec![Bytes::from_static(b"next")]);
    }

    #[test]
    fn test_payloads_from_camera_multipart() {
        let jpeg_a: &[u8] = b"\xFF\xD8aaaa\xFF\xD9";
        let jpeg_b: &[u8] = b"\xFF\xD8bbbbbb\xFF\xD9";
        let body = multipart(&[jpeg_a, jpeg_b]);

        let mut demuxer = FrameDemuxer::new(DeliveryMode::ContinuousStream);
        let payloads: Vec<Bytes> = demuxer
            .feed(&body)
            .into_iter()
            .filter_map(frame_payload)
            .collect();

        assert_eq!(payloads, vec![Bytes::from(jpeg_a), Bytes::from(jpeg_b)]);
    }

    #[test]
    fn test_frame_payload_variants() {
        let raw = Bytes::from_static(b"\xFF\xD8raw");
        assert_eq!(frame_payload(raw.clone()), Some(raw));

        let with_headers = Bytes::from_static(b"token\r\nContent-Length: 3\r\n\r\nabc");
        assert_eq!(frame_payload(with_headers), Some(Bytes::from_static(b"abc")));

        assert_eq!(frame_payload(Bytes::from_static(b"token\r\nContent-Type: image/jpeg\r\n\r\n")), None);
        assert_eq!(frame_payload(Bytes::from_static(b"token--\r\n")), None);
    }

    proptest! {
        #[test]
        fn prop_every_marker_yields_one_frame(
            segments in prop::collection::vec(prop::collection::vec(b'a'..=b'z', 1..40), 0..12),
            tail in prop::collection::vec(b'a'..=b'z', 0..40),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut input = Vec::new();
            for segment in &segments {
                input.extend_from_slice(segment);
                input.extend_from_slice(BOUNDARY_MARKER);
            }
            input.extend_from_slice(&tail);

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(input.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut demuxer = FrameDemuxer::new(DeliveryMode::ContinuousStream);
            let mut frames = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(input.len())) {
                frames.extend(demuxer.feed(&input[start..point]));
                start = point;
            }

            prop_assert_eq!(frames.len(), segments.len());

            let mut rebuilt = Vec::new();
            for frame in &frames {
                rebuilt.extend_from_slice(frame);
                rebuilt.extend_from_slice(BOUNDARY_MARKER);
            }
            rebuilt.extend_from_slice(&demuxer.buffer);
            prop_assert_eq!(rebuilt, input);
        }
    }
}
