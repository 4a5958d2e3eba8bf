//! # RESP2 Encoding and Parsing (blocking side)
//!
//! Purpose: Encode commands and parse replies over a buffered reader,
//! keeping allocations under the caller's control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies parse top-down with no parser state.
//! 2. **Buffer Reuse**: The caller owns the line buffer.
//! 3. **Binary-Safe**: Bulk strings are raw bytes.

use std::io::BufRead;

use crate::client::{ClientError, ClientResult};

/// One server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `+OK` style replies.
    Simple(Vec<u8>),
    /// `-ERR ...` replies.
    Error(Vec<u8>),
    /// `:123` replies.
    Integer(i64),
    /// `$...` bulk strings; `None` is the null bulk.
    Bulk(Option<Vec<u8>>),
    /// `*...` arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Server errors become `ClientError::Server`; everything else passes.
    pub fn into_result(self) -> ClientResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            other => Ok(other),
        }
    }

    pub fn into_integer(self) -> ClientResult<i64> {
        match self.into_result()? {
            RespValue::Integer(value) => Ok(value),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn into_bulk(self) -> ClientResult<Option<Vec<u8>>> {
        match self.into_result()? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn into_simple(self) -> ClientResult<Vec<u8>> {
        match self.into_result()? {
            RespValue::Simple(text) => Ok(text),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn into_array(self) -> ClientResult<Vec<RespValue>> {
        match self.into_result()? {
            RespValue::Array(items) => Ok(items),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Bulk payload parsed as an f64 (scores come back as bulk strings).
    pub fn into_score(self) -> ClientResult<f64> {
        let bulk = self.into_bulk()?.ok_or(ClientError::UnexpectedResponse)?;
        parse_f64(&bulk)
    }
}

/// Encodes a command as a RESP array into `out`.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one reply from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            read_bulk(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            read_array(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn read_bulk<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn read_array<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len <= 0 {
        return Ok(RespValue::Array(Vec::new()));
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ClientError::Protocol)
}

pub(crate) fn parse_f64(data: &[u8]) -> ClientResult<f64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ClientError::Protocol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(input: &[u8]) -> RespValue {
        let mut reader = Cursor::new(input.to_vec());
        let mut line = Vec::new();
        read_response(&mut reader, &mut line).unwrap()
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"ZADD", b"board", b"10", b"alice"], &mut buf);
        assert_eq!(
            &buf,
            b"*4\r\n$4\r\nZADD\r\n$5\r\nboard\r\n$2\r\n10\r\n$5\r\nalice\r\n"
        );
    }

    #[test]
    fn parses_each_reply_kind() {
        assert_eq!(parse(b"+OK\r\n"), RespValue::Simple(b"OK".to_vec()));
        assert_eq!(parse(b"-ERR bad\r\n"), RespValue::Error(b"ERR bad".to_vec()));
        assert_eq!(parse(b":42\r\n"), RespValue::Integer(42));
        assert_eq!(parse(b"$5\r\nhello\r\n"), RespValue::Bulk(Some(b"hello".to_vec())));
        assert_eq!(parse(b"$-1\r\n"), RespValue::Bulk(None));
    }

    #[test]
    fn parses_nested_array() {
        let value = parse(b"*2\r\n$1\r\na\r\n:7\r\n");
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Bulk(Some(b"a".to_vec())),
                RespValue::Integer(7)
            ])
        );
    }

    #[test]
    fn conversions_enforce_reply_shape() {
        assert_eq!(parse(b":1\r\n").into_integer().unwrap(), 1);
        assert!(parse(b":1\r\n").into_bulk().is_err());
        assert!(matches!(
            parse(b"-ERR nope\r\n").into_integer(),
            Err(ClientError::Server { .. })
        ));
        assert_eq!(parse(b"$3\r\n2.5\r\n").into_score().unwrap(), 2.5);
    }

    #[test]
    fn malformed_lines_are_protocol_errors() {
        let mut reader = Cursor::new(b"+OK\n".to_vec());
        let mut line = Vec::new();
        assert!(matches!(
            read_response(&mut reader, &mut line),
            Err(ClientError::Protocol)
        ));
    }
}
