//! Incremental frame decoding
//!
//! The body arrives as arbitrary byte chunks. `FrameDecoder` carries two
//! pieces of state across chunks: an incomplete UTF-8 sequence at the end of
//! the previous chunk, and the text after the last frame delimiter. A chunk
//! may complete zero, one or many frames.

use crate::error::FrameError;

/// Blank line separating frames.
pub const FRAME_DELIMITER: &str = "\n\n";

const EVENT_PREFIX: &str = "event:";
const DATA_PREFIX: &str = "data:";

/// Type and raw payload of a single frame, before JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    pub data: String,
}

impl RawFrame {
    /// Parse the lines of one frame. A repeated field keeps the last value.
    ///
    /// Returns `Ok(None)` for frames with no fields at all (blank frames and
    /// comment-only keepalives).
    pub fn parse(text: &str) -> Result<Option<Self>, FrameError> {
        let mut event = None;
        let mut data = None;
        let mut saw_field = false;

        for line in text.lines() {
            if let Some(value) = line.strip_prefix(EVENT_PREFIX) {
                event = Some(value.trim().to_string());
                saw_field = true;
            } else if let Some(value) = line.strip_prefix(DATA_PREFIX) {
                data = Some(value.trim().to_string());
                saw_field = true;
            } else if !line.trim().is_empty() && !line.starts_with(':') {
                saw_field = true;
            }
        }

        if !saw_field {
            return Ok(None);
        }
        match (event, data) {
            (Some(event), Some(data)) => Ok(Some(Self { event, data })),
            (None, _) => Err(FrameError::MissingEvent),
            (Some(_), None) => Err(FrameError::MissingData),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Decoded text not yet terminated by a delimiter.
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the text of every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode_utf8(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find(FRAME_DELIMITER) {
            let frame = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + FRAME_DELIMITER.len());
            frames.push(frame);
        }
        frames
    }

    /// End of stream: return the unterminated remainder, if it holds anything.
    ///
    /// An incomplete UTF-8 tail is flushed as U+FFFD.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            self.buffer.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() { None } else { Some(rest) }
    }

    /// Bytes received but not yet emitted as part of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid + bad;
                        }
                        // Sequence continues in the next chunk.
                        None => {
                            consumed += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data() {
        let frame = RawFrame::parse("event: progress\ndata: {\"pct\":10}")
            .unwrap()
            .unwrap();
        assert_eq!(frame.event, "progress");
        assert_eq!(frame.data, "{\"pct\":10}");
    }

    #[test]
    fn last_field_wins() {
        let frame = RawFrame::parse("event: progress\nevent: result\ndata: 1\ndata: 2")
            .unwrap()
            .unwrap();
        assert_eq!(frame.event, "result");
        assert_eq!(frame.data, "2");
    }

    #[test]
    fn missing_fields_are_errors() {
        assert_eq!(
            RawFrame::parse("data: {}").unwrap_err(),
            FrameError::MissingEvent
        );
        assert_eq!(
            RawFrame::parse("event: progress").unwrap_err(),
            FrameError::MissingData
        );
    }

    #[test]
    fn blank_and_comment_frames_are_skipped() {
        assert_eq!(RawFrame::parse("").unwrap(), None);
        assert_eq!(RawFrame::parse(": keepalive").unwrap(), None);
    }

    #[test]
    fn one_chunk_many_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"event: a\ndata: 1\n\nevent: b\ndata: 2\n\nevent: c");
        assert_eq!(frames, vec!["event: a\ndata: 1", "event: b\ndata: 2"]);
        assert_eq!(decoder.finish().as_deref(), Some("event: c"));
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: progress\nda").is_empty());
        assert!(decoder.push(b"ta: {}\n").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["event: progress\ndata: {}"]);
        assert_eq!(decoder.buffered_len(), 0);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn crlf_delimiters_are_normalized() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: a\r\ndata: 1\r").is_empty());
        assert_eq!(decoder.push(b"\n\r\n"), vec!["event: a\ndata: 1"]);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let text = "event: progress\ndata: {\"label\":\"caf\u{e9} \u{1f680}\"}\n\n";
        let bytes = text.as_bytes();
        // Split inside the four-byte rocket.
        let split = text.find('\u{1f680}').unwrap() + 2;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let frames = decoder.push(&bytes[split..]);
        assert_eq!(frames, vec![text.trim_end_matches('\n')]);
    }

    #[test]
    fn invalid_bytes_become_replacement_chars() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"event: a\ndata: \xff\n\n");
        assert_eq!(frames, vec!["event: a\ndata: \u{fffd}"]);
    }

    #[test]
    fn truncated_sequence_flushed_at_finish() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: a\ndata: \xe2\x82").is_empty());
        assert_eq!(
            decoder.finish().as_deref(),
            Some("event: a\ndata: \u{fffd}")
        );
    }
}
