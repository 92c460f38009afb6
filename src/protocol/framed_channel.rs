//! Sentinel framing for worker output.
//!
//! Uses `bytes::BytesMut` for the inbound buffer. The worker writes each
//! response as free-form UTF-8 text followed by a sentinel (`__END__` by
//! default), so responses may contain embedded newlines.
//!
//! # Example
//!
//! ```
//! use worker_bridge::protocol::{Frame, FramedChannel};
//!
//! let mut channel = FramedChannel::new();
//!
//! // Data arrives in arbitrary chunks from the worker's stdout
//! let mut frames = channel.push(b"{\"id\": \"a\", \"res");
//! assert!(frames.is_empty());
//!
//! frames = channel.push(b"ult\": 1}__END__\n{\"id\"");
//! assert_eq!(frames.len(), 1);
//! assert!(matches!(&frames[0], Frame::Message(m) if m.id.as_deref() == Some("a")));
//! ```

use bytes::BytesMut;

use super::wire_format::{Message, DEFAULT_MAX_INBOUND_BUFFER, DEFAULT_SENTINEL};

/// Longest candidate prefix kept in a malformed-frame report.
const PREVIEW_LEN: usize = 100;

/// One unit extracted from the worker's output stream.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A well-formed response.
    Message(Message),
    /// Text between two sentinels that failed to parse.
    Malformed {
        /// Parser error.
        error: String,
        /// Leading bytes of the candidate, lossily decoded.
        preview: String,
    },
}

/// Buffer for accumulating worker output and extracting complete frames.
///
/// The inbound buffer never grows past `max_buffer` bytes. When that much
/// output arrives without a sentinel the oldest bytes are discarded, keeping
/// the most recent half. Any frame straddling the cut is lost.
pub struct FramedChannel {
    /// Undecoded tail of worker output.
    buffer: BytesMut,
    /// Frame terminator.
    sentinel: Vec<u8>,
    /// Hard ceiling for `buffer`.
    max_buffer: usize,
    /// Offset before which the sentinel is known to be absent.
    scanned: usize,
    /// Number of overflow truncations since creation.
    overflows: u64,
}

impl FramedChannel {
    /// Create a channel with the default sentinel and a 2 MiB ceiling.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_SENTINEL, DEFAULT_MAX_INBOUND_BUFFER)
    }

    /// Create a channel with a custom sentinel and ceiling.
    ///
    /// The ceiling is raised to at least twice the sentinel length so a split
    /// sentinel always survives truncation. An empty sentinel falls back to
    /// the default.
    pub fn with_limits(sentinel: &str, max_buffer: usize) -> Self {
        let sentinel = if sentinel.is_empty() {
            DEFAULT_SENTINEL.as_bytes().to_vec()
        } else {
            sentinel.as_bytes().to_vec()
        };
        let max_buffer = max_buffer.max(sentinel.len() * 2).max(2);
        Self {
            buffer: BytesMut::with_capacity(max_buffer.min(64 * 1024)),
            sentinel,
            max_buffer,
            scanned: 0,
            overflows: 0,
        }
    }

    /// Push a chunk of worker output and extract every complete frame.
    ///
    /// A single push may yield zero, one or many frames; a trailing partial
    /// frame stays buffered for the next push.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        while !data.is_empty() {
            let room = self.max_buffer - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            while let Some(frame) = self.try_extract_one() {
                if let Some(frame) = frame {
                    frames.push(frame);
                }
            }

            if self.buffer.len() >= self.max_buffer {
                self.truncate_overflow();
            }
        }

        frames
    }

    /// Extract the candidate before the first sentinel, if any.
    ///
    /// Returns `Some(None)` for a whitespace-only candidate.
    fn try_extract_one(&mut self) -> Option<Option<Frame>> {
        let start = self.scanned.min(self.buffer.len());
        let Some(pos) = find(&self.buffer[start..], &self.sentinel) else {
            // The sentinel may straddle the next chunk; rescan its tail.
            self.scanned = self.buffer.len().saturating_sub(self.sentinel.len() - 1);
            return None;
        };

        let end = start + pos;
        let candidate = self.buffer.split_to(end);
        let _ = self.buffer.split_to(self.sentinel.len());
        self.scanned = 0;

        let trimmed = trim_whitespace(&candidate);
        if trimmed.is_empty() {
            return Some(None);
        }

        let frame = match Message::parse(trimmed) {
            Ok(message) => Frame::Message(message),
            Err(e) => {
                let preview_end = trimmed.len().min(PREVIEW_LEN);
                Frame::Malformed {
                    error: e.to_string(),
                    preview: String::from_utf8_lossy(&trimmed[..preview_end]).into_owned(),
                }
            }
        };
        Some(Some(frame))
    }

    fn truncate_overflow(&mut self) {
        let keep = self.max_buffer / 2;
        let drop = self.buffer.len().saturating_sub(keep);
        let _ = self.buffer.split_to(drop);
        self.scanned = 0;
        self.overflows += 1;
        tracing::warn!(
            dropped_bytes = drop,
            kept_bytes = self.buffer.len(),
            max_buffer = self.max_buffer,
            "Worker output exceeded buffer ceiling without a sentinel, discarding oldest bytes"
        );
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Configured ceiling.
    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    /// How many times output was discarded to honor the ceiling.
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

impl Default for FramedChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Position of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(id: &str, value: serde_json::Value) -> Vec<u8> {
        let body = serde_json::to_string_pretty(&json!({"id": id, "result": value})).unwrap();
        let mut bytes = body.into_bytes();
        bytes.extend_from_slice(b"__END__\n");
        bytes
    }

    fn ids(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .map(|f| match f {
                Frame::Message(m) => m.id.clone().unwrap_or_default(),
                Frame::Malformed { .. } => "<malformed>".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut channel = FramedChannel::new();
        let frames = channel.push(&encoded("a", json!({"echo": true})));

        assert_eq!(ids(&frames), vec!["a"]);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_multiline_payload() {
        let mut channel = FramedChannel::new();
        let bytes = encoded("a", json!({"text": "line one\nline two", "n": [1, 2, 3]}));
        assert!(bytes.iter().filter(|&&b| b == b'\n').count() > 2);

        let frames = channel.push(&bytes);
        match &frames[..] {
            [Frame::Message(m)] => {
                assert_eq!(m.result.as_ref().unwrap()["text"], "line one\nline two");
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut channel = FramedChannel::new();
        let mut combined = Vec::new();
        for id in ["a", "b", "c"] {
            combined.extend(encoded(id, json!(id)));
        }

        let frames = channel.push(&combined);
        assert_eq!(ids(&frames), vec!["a", "b", "c"]);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut channel = FramedChannel::new();
        let first = encoded("a", json!(1));
        let second = encoded("b", json!(2));

        let mut data = first.clone();
        data.extend_from_slice(&second[..5]);
        assert_eq!(ids(&channel.push(&data)), vec!["a"]);
        assert_eq!(channel.len(), 5);

        assert_eq!(ids(&channel.push(&second[5..])), vec!["b"]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut channel = FramedChannel::new();
        let mut stream = Vec::new();
        for id in ["a", "b", "c", "d"] {
            stream.extend(encoded(id, json!({"id_echo": id})));
        }

        let mut all = Vec::new();
        for byte in &stream {
            all.extend(channel.push(&[*byte]));
        }

        assert_eq!(ids(&all), vec!["a", "b", "c", "d"]);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_every_split_point() {
        let mut stream = Vec::new();
        for id in ["a", "b", "c"] {
            stream.extend(encoded(id, json!(id)));
        }

        for split in 0..=stream.len() {
            let mut channel = FramedChannel::new();
            let mut all = channel.push(&stream[..split]);
            all.extend(channel.push(&stream[split..]));
            assert_eq!(ids(&all), vec!["a", "b", "c"], "split at {}", split);
        }
    }

    #[test]
    fn test_sentinel_split_across_reads() {
        let mut channel = FramedChannel::new();
        assert!(channel.push(br#"{"id": "a", "result": 1}__EN"#).is_empty());
        assert!(channel.push(b"D").is_empty());
        let frames = channel.push(b"__");
        assert_eq!(ids(&frames), vec!["a"]);
    }

    #[test]
    fn test_sentinel_inside_string_splits_anyway() {
        // Only the sentinel decides boundaries, even inside a JSON string.
        let mut channel = FramedChannel::new();
        let frames = channel.push(br#"{"id": "a", "result": "x__END__y"}__END__"#);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| matches!(f, Frame::Malformed { .. })));
    }

    #[test]
    fn test_malformed_then_valid() {
        let mut channel = FramedChannel::new();
        let mut data = b"{not json at all__END__".to_vec();
        data.extend(encoded("b", json!(2)));

        let frames = channel.push(&data);
        assert_eq!(ids(&frames), vec!["<malformed>", "b"]);
        match &frames[0] {
            Frame::Malformed { preview, .. } => assert!(preview.starts_with("{not json")),
            other => panic!("expected malformed frame, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_shape_json_is_not_malformed() {
        let mut channel = FramedChannel::new();
        let frames = channel.push(br#"{"id": 42, "result": 1}__END__[1,2]__END__"#);

        assert_eq!(frames.len(), 2);
        for frame in &frames {
            match frame {
                Frame::Message(m) => assert!(m.id.is_none()),
                other => panic!("expected unroutable message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_whitespace_between_frames_is_ignored() {
        let mut channel = FramedChannel::new();
        let frames = channel.push(b"\n\n__END__  \r\n__END__");
        assert!(frames.is_empty());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_custom_sentinel() {
        let mut channel = FramedChannel::with_limits("<<EOM>>", 1024);
        let frames = channel.push(br#"{"id": "a"}<<EOM>>{"id": "b"}<<EO"#);
        assert_eq!(ids(&frames), vec!["a"]);
        assert_eq!(ids(&channel.push(b"M>>")), vec!["b"]);
    }

    #[test]
    fn test_buffer_never_exceeds_ceiling() {
        let mut channel = FramedChannel::with_limits("__END__", 1024);
        let noise = vec![b'x'; 300];

        for _ in 0..50 {
            assert!(channel.push(&noise).is_empty());
            assert!(channel.len() <= channel.max_buffer());
        }

        assert!(channel.overflow_count() > 0);
    }

    #[test]
    fn test_single_huge_chunk_stays_bounded() {
        let mut channel = FramedChannel::with_limits("__END__", 1024);
        let frames = channel.push(&vec![b'x'; 10_000]);
        assert!(frames.is_empty());
        assert!(channel.len() <= 1024);
    }

    #[test]
    fn test_recovers_after_overflow() {
        let mut channel = FramedChannel::with_limits("__END__", 256);
        channel.push(&vec![b'x'; 1000]);

        // Close whatever garbage is left, then a clean frame follows.
        let mut data = b"__END__".to_vec();
        data.extend_from_slice(br#"{"id": "ok", "result": true}__END__"#);
        let frames = channel.push(&data);

        assert_eq!(ids(&frames), vec!["<malformed>", "ok"]);
    }

    #[test]
    fn test_clear() {
        let mut channel = FramedChannel::new();
        channel.push(b"{\"id\": \"partial");
        assert!(!channel.is_empty());

        channel.clear();
        assert!(channel.is_empty());
    }
}
