//! RESP wire codec.
//!
//! Input is parsed into [`Frame`]s: typed frames (`+`, `-`, `:`, `$`, `*`)
//! or inline commands split on whitespace. Output is produced from
//! [`Reply`], the typed reply model used throughout the command layer.

use bytes::{Buf, BytesMut};
use std::collections::BTreeSet;

/// One RESP frame as read from or written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:1000\r\n`
    Integer(i64),
    /// `$3\r\nfoo\r\n` or `$-1\r\n`
    Bulk(Option<String>),
    /// `*2\r\n...` or `*-1\r\n`
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Serialize this frame back to RESP bytes.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(Some(s)) => {
                buf.push(b'$');
                buf.extend_from_slice(s.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Frame::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(items)) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf);
                }
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    /// Flatten a command frame into its string tokens. Inline commands and
    /// `*`-arrays of bulk strings both end up here.
    pub fn into_tokens(self) -> Vec<String> {
        match self {
            Frame::Array(Some(items)) => items
                .into_iter()
                .filter_map(|f| match f {
                    Frame::Bulk(Some(s)) => Some(s),
                    Frame::Simple(s) => Some(s),
                    Frame::Integer(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Frame::Bulk(Some(s)) | Frame::Simple(s) => vec![s],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Protocol error: invalid byte '{}'", *.0 as char)]
    InvalidByte(u8),

    #[error("Protocol error: {0}")]
    Invalid(String),
}

const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: i64 = 1024 * 1024;
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Streaming frame parser. Call [`parse`](Self::parse) repeatedly as bytes
/// arrive; a partial frame leaves the buffer untouched and yields `None`.
pub struct FrameParser;

impl FrameParser {
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.is_empty() {
            return Ok(None);
        }
        match buf[0] {
            b'+' | b'-' | b':' | b'$' | b'*' => Self::parse_typed(buf),
            _ => Self::parse_inline(buf),
        }
    }

    fn parse_typed(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.is_empty() {
            return Ok(None);
        }
        match buf[0] {
            b'+' => Ok(Self::take_line(buf).map(Frame::Simple)),
            b'-' => Ok(Self::take_line(buf).map(Frame::Error)),
            b':' => match Self::take_line(buf) {
                None => Ok(None),
                Some(line) => {
                    let n = line
                        .parse()
                        .map_err(|_| FrameError::Invalid(format!("invalid integer: {line}")))?;
                    Ok(Some(Frame::Integer(n)))
                }
            },
            b'$' => Self::parse_bulk(buf),
            b'*' => Self::parse_array(buf),
            other => Err(FrameError::InvalidByte(other)),
        }
    }

    /// A bare text line becomes an array of bulk strings, one per
    /// whitespace-separated token.
    fn parse_inline(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let end = match find_crlf(buf, 0) {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_INLINE_LEN {
                    return Err(FrameError::Invalid("inline command too long".into()));
                }
                return Ok(None);
            }
        };

        let line = String::from_utf8_lossy(&buf[..end]).into_owned();
        buf.advance(end + 2);

        let items = line
            .split_whitespace()
            .map(|t| Frame::Bulk(Some(t.to_string())))
            .collect();
        Ok(Some(Frame::Array(Some(items))))
    }

    fn parse_bulk(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let header = match find_crlf(buf, 1) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let len = parse_len(&buf[1..header])?;

        if len == -1 {
            buf.advance(header + 2);
            return Ok(Some(Frame::Bulk(None)));
        }
        if len < -1 || len > MAX_BULK_LEN {
            return Err(FrameError::Invalid("invalid bulk length".into()));
        }

        let len = len as usize;
        let total = header + 2 + len + 2;
        if buf.len() < total {
            return Ok(None);
        }
        if buf[header + 2 + len] != b'\r' || buf[header + 2 + len + 1] != b'\n' {
            return Err(FrameError::Invalid("missing bulk terminator".into()));
        }

        let data = String::from_utf8_lossy(&buf[header + 2..header + 2 + len]).into_owned();
        buf.advance(total);
        Ok(Some(Frame::Bulk(Some(data))))
    }

    fn parse_array(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let header = match find_crlf(buf, 1) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let len = parse_len(&buf[1..header])?;

        if len < 0 {
            buf.advance(header + 2);
            return Ok(Some(Frame::Array(None)));
        }
        if len > MAX_ARRAY_LEN {
            return Err(FrameError::Invalid("invalid multibulk length".into()));
        }

        // Elements may be incomplete; keep a copy so the buffer can be
        // restored and the whole array retried on the next read.
        let saved = buf.clone();
        buf.advance(header + 2);

        let mut items = Vec::with_capacity(len as usize);
        for _ in 0..len {
            match Self::parse_typed(buf) {
                Ok(Some(frame)) => items.push(frame),
                Ok(None) => {
                    *buf = saved;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(Frame::Array(Some(items))))
    }

    /// Consume one CRLF-terminated line after the type byte.
    fn take_line(buf: &mut BytesMut) -> Option<String> {
        let end = find_crlf(buf, 1)?;
        let line = String::from_utf8_lossy(&buf[1..end]).into_owned();
        buf.advance(end + 2);
        Some(line)
    }
}

fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if buf.len() < start + 2 {
        return None;
    }
    (start..buf.len() - 1).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}

fn parse_len(bytes: &[u8]) -> Result<i64, FrameError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::Invalid("invalid length header".into()))
}

/// A typed reply from the command layer.
///
/// The first group of variants maps directly onto the wire. `Scores`,
/// `Bits` and `Sketch` only travel between value nodes and aggregators;
/// they are never produced for a client, but encode defensively anyway.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Simple(String),
    Error(String),
    Int(i64),
    Bool(bool),
    Bulk(String),
    Nil,
    Array(Vec<Reply>),
    Scores(Vec<(i64, String)>),
    Bits(BTreeSet<u64>),
    Sketch(Vec<u8>),
}

impl Reply {
    pub fn err(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Encode this reply as RESP bytes.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Ok => buf.extend_from_slice(b"+OK\r\n"),
            Reply::Simple(s) => Frame::Simple(s.clone()).write_to(buf),
            Reply::Error(s) => Frame::Error(s.clone()).write_to(buf),
            Reply::Int(n) => Frame::Integer(*n).write_to(buf),
            Reply::Bool(b) => Frame::Integer(i64::from(*b)).write_to(buf),
            Reply::Bulk(s) => Frame::Bulk(Some(s.clone())).write_to(buf),
            Reply::Nil => buf.extend_from_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf);
                }
            }
            Reply::Scores(pairs) => {
                let items: Vec<Reply> = pairs
                    .iter()
                    .flat_map(|(score, member)| {
                        [Reply::Bulk(member.clone()), Reply::Bulk(score.to_string())]
                    })
                    .collect();
                Reply::Array(items).write_to(buf);
            }
            Reply::Bits(bits) => {
                let items: Vec<Reply> = bits.iter().map(|b| Reply::Int(*b as i64)).collect();
                Reply::Array(items).write_to(buf);
            }
            Reply::Sketch(bytes) => {
                Reply::Bulk(crate::nodes::hyperloglog::to_hex(bytes)).write_to(buf);
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }
}
