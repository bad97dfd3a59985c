//! RESP reply parser
//!
//! Decodes the reply a store command wrote for the script's fake session.
//! Length fields are parsed strictly: a malformed integer is reported as a
//! [`ProtocolError`] instead of being read as zero.

use std::sync::Arc;
use crate::error::ProtocolError;
use super::resp::RespFrame;

type ParseResult<T> = std::result::Result<T, ProtocolError>;

/// Decode one complete reply from `data`
///
/// Returns the frame and the number of bytes it occupied. A truncated reply
/// is an error here: the caller always hands over a fully written reply.
pub fn decode_reply(data: &[u8]) -> ParseResult<(RespFrame, usize)> {
    parse_frame(data)?.ok_or_else(|| ProtocolError("Incomplete reply".into()))
}

fn parse_frame(data: &[u8]) -> ParseResult<Option<(RespFrame, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }

    match data[0] {
        b'+' => parse_simple_string(data),
        b'-' => parse_error(data),
        b':' => parse_integer(data),
        b'$' => parse_bulk_string(data),
        b'*' => parse_array(data),
        other => Err(ProtocolError(format!(
            "Invalid RESP type byte: {}", other as char
        ))),
    }
}

/// Parse a simple string: +OK\r\n
fn parse_simple_string(data: &[u8]) -> ParseResult<Option<(RespFrame, usize)>> {
    Ok(parse_line(data, 1).map(|(line, consumed)| {
        (RespFrame::SimpleString(Arc::new(line.to_vec())), consumed)
    }))
}

/// Parse an error: -Error message\r\n
fn parse_error(data: &[u8]) -> ParseResult<Option<(RespFrame, usize)>> {
    Ok(parse_line(data, 1).map(|(line, consumed)| {
        (RespFrame::Error(Arc::new(line.to_vec())), consumed)
    }))
}

/// Parse an integer: :1000\r\n
fn parse_integer(data: &[u8]) -> ParseResult<Option<(RespFrame, usize)>> {
    parse_line(data, 1)
        .map(|(line, consumed)| Ok((RespFrame::Integer(parse_i64(line, "integer")?), consumed)))
        .transpose()
}

/// Parse a bulk string: $6\r\nfoobar\r\n or $-1\r\n (null)
fn parse_bulk_string(data: &[u8]) -> ParseResult<Option<(RespFrame, usize)>> {
    let (len_line, header_consumed) = match parse_line(data, 1) {
        Some(v) => v,
        None => return Ok(None),
    };

    let len = parse_i64(len_line, "bulk length")?;
    if len == -1 {
        return Ok(Some((RespFrame::BulkString(None), header_consumed)));
    }
    if len < 0 {
        return Err(ProtocolError("Invalid negative bulk string length".into()));
    }

    let len = len as usize;
    let total_needed = header_consumed + len + 2; // +2 for \r\n
    if data.len() < total_needed {
        return Ok(None);
    }

    if data[header_consumed + len] != b'\r' || data[header_consumed + len + 1] != b'\n' {
        return Err(ProtocolError("Missing CRLF after bulk string".into()));
    }

    let content = data[header_consumed..header_consumed + len].to_vec();
    Ok(Some((RespFrame::BulkString(Some(Arc::new(content))), total_needed)))
}

/// Parse an array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
fn parse_array(data: &[u8]) -> ParseResult<Option<(RespFrame, usize)>> {
    let (len_line, header_consumed) = match parse_line(data, 1) {
        Some(v) => v,
        None => return Ok(None),
    };

    let len = parse_i64(len_line, "array length")?;
    if len == -1 {
        return Ok(Some((RespFrame::Array(None), header_consumed)));
    }
    if len < 0 {
        return Err(ProtocolError("Invalid negative array length".into()));
    }

    // every element needs at least 3 bytes, so a huge count cannot preallocate
    let len = len as usize;
    let mut elements = Vec::with_capacity(len.min(data.len() / 3 + 1));
    let mut total_consumed = header_consumed;

    for _ in 0..len {
        match parse_frame(&data[total_consumed..])? {
            Some((frame, consumed)) => {
                elements.push(frame);
                total_consumed += consumed;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespFrame::Array(Some(elements)), total_consumed)))
}

fn parse_i64(line: &[u8], what: &str) -> ParseResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError(format!("Invalid {} '{}'", what, String::from_utf8_lossy(line))))
}

/// Parse a line ending with \r\n
fn parse_line(data: &[u8], skip_prefix: usize) -> Option<(&[u8], usize)> {
    if data.len() < skip_prefix + 2 {
        return None;
    }

    (skip_prefix..data.len() - 1)
        .find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
        .map(|i| (&data[skip_prefix..i], i + 2))
}
