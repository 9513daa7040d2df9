//! STOMP 1.2 frame codec for `tokio_util::codec::Framed`
//!
//! Decoding accepts both `\n` and `\r\n` line endings, skips heart-beat EOLs
//! between frames and honours `content-length` for bodies containing NUL
//! octets. The `content-length` header is consumed by the decoder and always
//! regenerated by the encoder, so it never appears in a decoded [`Frame`].

use super::frame::{command, header, Frame};
use crate::transport::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Header block larger than this without a terminating blank line is rejected
const DEFAULT_MAX_HEADER_LEN: usize = 64 * 1024;

/// Largest accepted frame body
const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StompCodec {
    max_header_len: usize,
    max_body_len: usize,
}

impl StompCodec {
    pub fn new() -> Self {
        Self {
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }

    pub fn with_max_header_len(mut self, max_header_len: usize) -> Self {
        self.max_header_len = max_header_len;
        self
    }

    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len;
        self
    }

    fn body_too_large(&self, len: usize) -> TransportError {
        TransportError::Protocol(format!(
            "frame body of {len} bytes exceeds {} bytes",
            self.max_body_len
        ))
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// CONNECT and CONNECTED frames are exempt from header escaping
fn escapes_headers(command: &str) -> bool {
    command != command::CONNECT && command != command::CONNECTED
}

pub fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape_header(value: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(TransportError::Protocol(format!(
                    "undefined header escape sequence \\{other}"
                )))
            }
            None => {
                return Err(TransportError::Protocol(
                    "header value ends with a bare backslash".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

/// Strip a single trailing `\r` left over from a `\r\n` line ending
fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Locate the blank line terminating the header block.
/// Returns `(header_block_len, body_start)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    while let Some(offset) = buf[line_start..].iter().position(|&b| b == b'\n') {
        let newline = line_start + offset;
        if line_start > 0 && trim_cr(&buf[line_start..newline]).is_empty() {
            return Some((line_start, newline + 1));
        }
        line_start = newline + 1;
    }
    None
}

fn parse_head(head: &[u8]) -> Result<(String, Vec<(String, String)>), TransportError> {
    let text = std::str::from_utf8(head)
        .map_err(|e| TransportError::Protocol(format!("frame head is not UTF-8: {e}")))?;
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command = lines
        .next()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TransportError::Protocol("missing frame command".to_string()))?
        .to_string();
    let escaped = escapes_headers(&command);

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once(':').ok_or_else(|| {
            TransportError::Protocol(format!("malformed header line in {command} frame"))
        })?;
        if escaped {
            headers.push((unescape_header(key)?, unescape_header(value)?));
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }

    Ok((command, headers))
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        // heart-beats
        loop {
            match src.first() {
                Some(b'\n') => src.advance(1),
                Some(b'\r') if src.len() == 1 => return Ok(None),
                Some(b'\r') if src[1] == b'\n' => src.advance(2),
                _ => break,
            }
        }
        if src.is_empty() {
            return Ok(None);
        }

        let Some((head_len, body_start)) = find_header_end(src) else {
            if src.len() > self.max_header_len {
                return Err(TransportError::Protocol(format!(
                    "frame header exceeds {} bytes",
                    self.max_header_len
                )));
            }
            return Ok(None);
        };

        let (command, mut headers) = parse_head(&src[..head_len])?;

        let content_length = headers
            .iter()
            .find(|(k, _)| k == header::CONTENT_LENGTH)
            .map(|(_, v)| {
                v.trim().parse::<usize>().map_err(|_| {
                    TransportError::Protocol(format!("invalid content-length '{v}'"))
                })
            })
            .transpose()?;

        let body_len = match content_length {
            Some(len) => {
                if len > self.max_body_len {
                    return Err(self.body_too_large(len));
                }
                let frame_len = body_start
                    .checked_add(len)
                    .and_then(|n| n.checked_add(1))
                    .ok_or_else(|| self.body_too_large(len))?;
                if src.len() < frame_len {
                    src.reserve(frame_len - src.len());
                    return Ok(None);
                }
                if src[body_start + len] != 0 {
                    return Err(TransportError::Protocol(
                        "frame body is not NUL-terminated after content-length octets"
                            .to_string(),
                    ));
                }
                len
            }
            None => match src[body_start..].iter().position(|&b| b == 0) {
                Some(len) => len,
                None if src.len() - body_start > self.max_body_len => {
                    return Err(self.body_too_large(src.len() - body_start));
                }
                None => return Ok(None),
            },
        };

        let raw = src.split_to(body_start + body_len + 1).freeze();
        headers.retain(|(k, _)| k != header::CONTENT_LENGTH);

        Ok(Some(Frame {
            command,
            headers,
            body: raw.slice(body_start..body_start + body_len),
        }))
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let escaped = escapes_headers(&frame.command);

        dst.reserve(frame.command.len() + frame.body.len() + 64);
        dst.put_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        for (key, value) in frame
            .headers
            .iter()
            .filter(|(k, _)| k != header::CONTENT_LENGTH)
        {
            if escaped {
                dst.put_slice(escape_header(key).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape_header(value).as_bytes());
            } else {
                dst.put_slice(key.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }

        if !frame.body.is_empty() {
            dst.put_slice(format!("{}:{}\n", header::CONTENT_LENGTH, frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
