// Slice-based STOMP frame parser (produces owned Vecs from input slices)
use crate::codec::FrameError;

/// Upper bounds applied while parsing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Maximum bytes of the command line plus header lines plus blank line.
    pub max_header_bytes: usize,
    /// Maximum body bytes (declared or NUL-terminated).
    pub max_body_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: crate::config::DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: crate::config::DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// A frame as it appeared on the wire: raw command, still-escaped headers
/// and body, plus how many input bytes it occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    pub consumed: usize,
}

type ParseResult = Result<Option<RawFrame>, FrameError>;

/// Extract the optional content-length header value from a header list.
///
/// Only the first occurrence is considered.
fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, FrameError> {
    let Some((_, v)) = headers.iter().find(|(k, _)| k.as_slice() == b"content-length") else {
        return Ok(None);
    };
    let s = std::str::from_utf8(v)
        .map_err(|e| FrameError::Malformed(format!("content-length not utf8: {}", e)))?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(FrameError::Malformed("empty content-length".to_string()));
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|e| FrameError::Malformed(format!("invalid content-length '{}': {}", trimmed, e)))
}

/// Reverse STOMP 1.2 header escaping (`\\`, `\n`, `\r`, `\c`).
///
/// Any other escape sequence, or a trailing lone backslash, is an error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(other) => return Err(format!("invalid escape sequence '\\{}'", *other as char)),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

/// Strip one trailing CR from a line.
fn trim_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

/// Parse a single STOMP frame from a raw byte slice.
///
/// Returns `Ok(Some(RawFrame))` when a full frame was parsed, `Ok(None)` when
/// more bytes are required, and `Err` on protocol errors. Size ceilings are
/// checked against the bytes seen so far, so an oversized header section or
/// body is rejected before it has been fully received.
pub fn parse_frame_slice(input: &[u8], limits: &FrameLimits) -> ParseResult {
    let len = input.len();
    let header_too_large = || FrameError::TooLarge {
        section: "header",
        limit: limits.max_header_bytes,
    };

    // command line
    let Some(cmd_end) = input.iter().position(|&b| b == b'\n') else {
        if len > limits.max_header_bytes {
            return Err(header_too_large());
        }
        return Ok(None);
    };
    let command = trim_cr(&input[..cmd_end]).to_vec();
    let mut pos = cmd_end + 1;

    // headers until an empty line is found
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos > limits.max_header_bytes {
            return Err(header_too_large());
        }
        if pos >= len {
            return Ok(None);
        }
        if input[pos] == b'\n' {
            pos += 1;
            break;
        }
        if input[pos] == b'\r' && pos + 1 < len && input[pos + 1] == b'\n' {
            pos += 2;
            break;
        }
        let Some(line_end_rel) = input[pos..].iter().position(|&b| b == b'\n') else {
            if len > limits.max_header_bytes {
                return Err(header_too_large());
            }
            return Ok(None);
        };
        let line = trim_cr(&input[pos..pos + line_end_rel]);
        match line.iter().position(|&b| b == b':') {
            Some(colon) => headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec())),
            None => {
                return Err(FrameError::Malformed(format!(
                    "malformed header line: {:?}",
                    String::from_utf8_lossy(line)
                )));
            }
        }
        pos += line_end_rel + 1;
    }
    if pos > limits.max_header_bytes {
        return Err(header_too_large());
    }

    let body_too_large = || FrameError::TooLarge {
        section: "body",
        limit: limits.max_body_bytes,
    };

    let body_len = match get_content_length(&headers)? {
        Some(content_len) => {
            if content_len > limits.max_body_bytes {
                return Err(body_too_large());
            }
            if pos + content_len + 1 > len {
                return Ok(None);
            }
            if input[pos + content_len] != 0 {
                return Err(FrameError::Malformed(
                    "content-length does not match body: missing NUL terminator".to_string(),
                ));
            }
            content_len
        }
        None => match input[pos..].iter().position(|&b| b == 0) {
            Some(nul_rel) if nul_rel > limits.max_body_bytes => return Err(body_too_large()),
            Some(nul_rel) => nul_rel,
            None if len - pos > limits.max_body_bytes => return Err(body_too_large()),
            None => return Ok(None),
        },
    };

    let body = input[pos..pos + body_len].to_vec();
    pos += body_len + 1;
    // optional trailing EOL
    if pos < len && input[pos] == b'\n' {
        pos += 1;
    } else if pos + 1 < len && input[pos] == b'\r' && input[pos + 1] == b'\n' {
        pos += 2;
    }

    Ok(Some(RawFrame {
        command,
        headers,
        body,
        consumed: pos,
    }))
}
