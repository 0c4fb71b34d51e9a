use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Command, Frame};
use crate::parser::{FrameLimits, parse_frame_slice, unescape_header_value};

/// Errors produced while decoding or encoding frames.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The header section or the body exceeds the configured ceiling.
    #[error("frame too large: {section} exceeds {limit} bytes")]
    TooLarge { section: &'static str, limit: usize },
    /// Unknown command, unparsable header line, bad escape, content-length
    /// mismatch and friends.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// I/O-level error from the underlying transport
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Escape a STOMP 1.2 header name or value for wire transmission.
///
/// - backslash (0x5c) → `\\`
/// - carriage return (0x0d) → `\r`
/// - line feed (0x0a) → `\n`
/// - colon (0x3a) → `\c`
fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a single EOL received outside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF)
    Heartbeat,
}

/// Per-connection header escaping switch.
///
/// Shared between a connection's codec and its session; escaping is on until
/// the session negotiates STOMP 1.0, which has none.
#[derive(Debug, Clone)]
pub struct HeaderEscaping(Arc<AtomicBool>);

impl HeaderEscaping {
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for HeaderEscaping {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Decoding enforces the header and body ceilings from [`FrameLimits`];
/// both NUL-terminated frames and frames with a `content-length` header are
/// supported.
#[derive(Debug, Clone, Default)]
pub struct StompCodec {
    limits: FrameLimits,
    escaping: HeaderEscaping,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            limits: FrameLimits {
                max_header_bytes,
                max_body_bytes,
            },
            escaping: HeaderEscaping::default(),
        }
    }

    /// Use `escaping` to decide whether headers are escaped.
    pub fn with_header_escaping(mut self, escaping: HeaderEscaping) -> Self {
        self.escaping = escaping;
        self
    }

    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }

    fn escapes(&self, command: Command) -> bool {
        self.escaping.is_enabled() && !command.skips_header_escaping()
    }
}

fn header_text(raw: Vec<u8>, unescape: bool, what: &str) -> Result<String, FrameError> {
    let bytes = if unescape {
        unescape_header_value(&raw)
            .map_err(|e| FrameError::Malformed(format!("invalid escape in header {}: {}", what, e)))?
    } else {
        raw
    };
    String::from_utf8(bytes)
        .map_err(|e| FrameError::Malformed(format!("invalid utf8 in header {}: {}", what, e)))
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = FrameError;

    /// Decode bytes from `src` into a `StompItem`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when more bytes are
    /// required. A lone LF (or CR LF) outside a frame is a heartbeat.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match (src.first().copied(), src.get(1).copied()) {
            (None, _) | (Some(b'\r'), None) => return Ok(None),
            (Some(b'\n'), _) => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            (Some(b'\r'), Some(b'\n')) => {
                src.advance(2);
                return Ok(Some(StompItem::Heartbeat));
            }
            _ => {}
        }

        let Some(raw) = parse_frame_slice(src.chunk(), &self.limits)? else {
            return Ok(None);
        };
        src.advance(raw.consumed);

        let command_text = String::from_utf8(raw.command)
            .map_err(|e| FrameError::Malformed(format!("invalid utf8 in command: {}", e)))?;
        let command: Command = command_text.parse().map_err(FrameError::Malformed)?;

        let unescape = self.escapes(command);
        let mut headers: Vec<(String, String)> = Vec::with_capacity(raw.headers.len());
        for (k, v) in raw.headers {
            headers.push((
                header_text(k, unescape, "key")?,
                header_text(v, unescape, "value")?,
            ));
        }

        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body: raw.body,
            suppress_content_length: false,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = FrameError;

    /// Encode a `StompItem` into the provided destination buffer.
    ///
    /// A `content-length` header is emitted whenever the frame has a body,
    /// unless the frame already declares one or asks for it to be
    /// suppressed. Every frame is terminated by a NUL byte.
    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
            }
            StompItem::Frame(frame) => {
                dst.extend_from_slice(frame.command.as_str().as_bytes());
                dst.put_u8(b'\n');

                let escape = self.escapes(frame.command);
                let mut headers = frame.headers;
                let has_cl = headers.iter().any(|(k, _)| k == "content-length");
                if !has_cl && !frame.body.is_empty() && !frame.suppress_content_length {
                    headers.push(("content-length".to_string(), frame.body.len().to_string()));
                }

                for (k, v) in headers {
                    if escape {
                        dst.extend_from_slice(escape_header_value(&k).as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(escape_header_value(&v).as_bytes());
                    } else {
                        dst.extend_from_slice(k.as_bytes());
                        dst.put_u8(b':');
                        dst.extend_from_slice(v.as_bytes());
                    }
                    dst.put_u8(b'\n');
                }

                dst.put_u8(b'\n');
                dst.extend_from_slice(&frame.body);
                dst.put_u8(0);
            }
        }

        Ok(())
    }
}
