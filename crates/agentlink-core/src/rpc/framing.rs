//! Message framing over a byte stream
//!
//! Two framings are supported:
//!
//! ```text
//! content-length:  Content-Length: <n>\r\n\r\n<n bytes of JSON>
//! newline:         <JSON>\n
//! ```

use crate::error::TransportError;
use serde::{Deserialize, Serialize};

/// Header blocks longer than this are treated as garbage.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Default upper bound for a single frame payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// LSP-style `Content-Length` headers
    ContentLength,
    /// One JSON document per line
    Newline,
}

impl Default for Framing {
    fn default() -> Self {
        Self::ContentLength
    }
}

/// Frame a payload for the wire
pub fn encode_frame(framing: Framing, payload: &[u8]) -> Vec<u8> {
    match framing {
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            let mut frame = Vec::with_capacity(header.len() + payload.len());
            frame.extend_from_slice(header.as_bytes());
            frame.extend_from_slice(payload);
            frame
        }
        Framing::Newline => {
            let mut frame = Vec::with_capacity(payload.len() + 1);
            frame.extend_from_slice(payload);
            frame.push(b'\n');
            frame
        }
    }
}

/// Incremental frame decoder.
///
/// Bytes are pushed as they arrive; complete frames are pulled out one at a
/// time. Partial frames stay buffered until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    max_frame_bytes: usize,
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            framing,
            max_frame_bytes,
            buf: Vec::new(),
            scanned: 0,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.framing {
            Framing::ContentLength => self.next_content_length_frame(),
            Framing::Newline => self.next_line_frame(),
        }
    }

    fn next_line_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let found = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(pos) = found.map(|offset| self.scanned + offset) else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_frame_bytes {
                    return Err(TransportError::Decode(format!(
                        "line exceeds {} bytes without a newline",
                        self.max_frame_bytes
                    )));
                }
                return Ok(None);
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scanned = 0;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            if line.len() > self.max_frame_bytes {
                return Err(TransportError::Decode(format!(
                    "frame of {} bytes exceeds limit of {}",
                    line.len(),
                    self.max_frame_bytes
                )));
            }
            return Ok(Some(line));
        }
    }

    fn next_content_length_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let leading = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        if leading > 0 {
            self.buf.drain(..leading);
        }

        let Some(header_end) = find_subslice(&self.buf, b"\r\n\r\n") else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(TransportError::Decode(format!(
                    "no header terminator within {} bytes",
                    MAX_HEADER_BYTES
                )));
            }
            return Ok(None);
        };

        let content_length = parse_content_length(&self.buf[..header_end])?;
        if content_length > self.max_frame_bytes {
            return Err(TransportError::Decode(format!(
                "frame of {} bytes exceeds limit of {}",
                content_length, self.max_frame_bytes
            )));
        }

        let body_start = header_end + 4;
        let body_end = body_start + content_length;
        if self.buf.len() < body_end {
            return Ok(None);
        }

        let frame = self.buf[body_start..body_end].to_vec();
        self.buf.drain(..body_end);
        Ok(Some(frame))
    }
}

fn parse_content_length(header: &[u8]) -> Result<usize, TransportError> {
    let header = std::str::from_utf8(header)
        .map_err(|_| TransportError::Decode("header is not valid UTF-8".to_string()))?;

    let mut content_length = None;
    for line in header.split("\r\n") {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            TransportError::Decode(format!("malformed header line: {:?}", line))
        })?;
        // Other headers (e.g. Content-Type) are ignored
        if name.trim().eq_ignore_ascii_case("content-length") {
            let length = value.trim().parse::<usize>().map_err(|_| {
                TransportError::Decode(format!("invalid Content-Length: {:?}", value.trim()))
            })?;
            content_length = Some(length);
        }
    }

    content_length.ok_or_else(|| TransportError::Decode("missing Content-Length header".to_string()))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
