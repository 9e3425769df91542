//! Minimal RESP2 codec: commands are encoded as arrays of bulk strings and
//! replies are parsed incrementally from a read buffer.

use crate::StoreError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound for a single bulk string reply. Larger lengths are treated as
/// a corrupt stream.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted in a reply. None of the commands sent
/// here get back more than one level.
const MAX_DEPTH: usize = 8;

/// A parsed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Value>>),
}

impl Value {
    /// Interprets an `INCRBY` reply.
    pub(crate) fn into_counter(self) -> Result<u64, StoreError> {
        match self {
            Self::Integer(n) => u64::try_from(n)
                .map_err(|_| StoreError::Protocol(format!("negative counter value {n}"))),
            Self::Error(msg) => Err(StoreError::Server(msg)),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Interprets a `+OK`/`+PONG` style status reply.
    pub(crate) fn into_status(self) -> Result<String, StoreError> {
        match self {
            Self::Simple(s) => Ok(s),
            Self::Error(msg) => Err(StoreError::Server(msg)),
            other => Err(unexpected("status", &other)),
        }
    }

    /// Interprets a `SENTINEL get-master-addr-by-name` reply. `None` when the
    /// sentinel does not know the service.
    pub(crate) fn into_address(self) -> Result<Option<(String, u16)>, StoreError> {
        match self {
            Self::Array(None) | Self::Bulk(None) => Ok(None),
            Self::Array(Some(items)) if items.len() == 2 => {
                let mut items = items.into_iter();
                let host = items.next().map(bulk_to_string).transpose()?;
                let port = items.next().map(bulk_to_string).transpose()?;
                match (host, port) {
                    (Some(host), Some(port)) => {
                        let port = port
                            .parse()
                            .map_err(|_| StoreError::Protocol(format!("invalid port `{port}`")))?;
                        Ok(Some((host, port)))
                    }
                    _ => Ok(None),
                }
            }
            Self::Error(msg) => Err(StoreError::Server(msg)),
            other => Err(unexpected("address array", &other)),
        }
    }
}

fn bulk_to_string(value: Value) -> Result<String, StoreError> {
    match value {
        Value::Bulk(Some(bytes)) => String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::Protocol("non UTF-8 bulk string".to_owned())),
        Value::Simple(s) => Ok(s),
        other => Err(unexpected("bulk string", &other)),
    }
}

fn unexpected(expected: &str, got: &Value) -> StoreError {
    StoreError::Protocol(format!("expected {expected} reply, got {got:?}"))
}

/// Appends `args` to `buf` as a RESP array of bulk strings.
pub(crate) fn encode_command(buf: &mut BytesMut, args: &[&[u8]]) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Parses one complete reply from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` and leaves `buf` untouched when more bytes are needed.
pub(crate) fn decode(buf: &mut BytesMut) -> Result<Option<Value>, StoreError> {
    match parse(&buf[..], 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse(src: &[u8], depth: usize) -> Result<Option<(Value, usize)>, StoreError> {
    let Some((&tag, rest)) = src.split_first() else {
        return Ok(None);
    };
    let Some((line, line_len)) = read_line(rest) else {
        return Ok(None);
    };
    let header = 1 + line_len;

    match tag {
        b'+' => Ok(Some((Value::Simple(utf8(line)?), header))),
        b'-' => Ok(Some((Value::Error(utf8(line)?), header))),
        b':' => Ok(Some((Value::Integer(integer(line)?), header))),
        b'$' => {
            let len = integer(line)?;
            if len < 0 {
                return Ok(Some((Value::Bulk(None), header)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(StoreError::Protocol(format!("bulk length {len} too large")));
            }
            let body = &src[header..];
            if body.len() < len + 2 {
                return Ok(None);
            }
            if &body[len..len + 2] != b"\r\n" {
                return Err(StoreError::Protocol("bulk string not CRLF terminated".to_owned()));
            }
            let data = Bytes::copy_from_slice(&body[..len]);
            Ok(Some((Value::Bulk(Some(data)), header + len + 2)))
        }
        b'*' => {
            let count = integer(line)?;
            if count < 0 {
                return Ok(Some((Value::Array(None), header)));
            }
            if depth >= MAX_DEPTH {
                return Err(StoreError::Protocol(format!(
                    "arrays nested deeper than {MAX_DEPTH} levels"
                )));
            }
            let mut items = Vec::with_capacity((count as usize).min(64));
            let mut offset = header;
            for _ in 0..count {
                match parse(&src[offset..], depth + 1)? {
                    Some((item, used)) => {
                        items.push(item);
                        offset += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(Some(items)), offset)))
        }
        other => Err(StoreError::Protocol(format!(
            "unknown reply type byte 0x{other:02x}"
        ))),
    }
}

/// Splits off one CRLF terminated line. Returns the line without the CRLF
/// and the number of bytes consumed including it.
fn read_line(src: &[u8]) -> Option<(&[u8], usize)> {
    let end = src.windows(2).position(|w| w == b"\r\n")?;
    Some((&src[..end], end + 2))
}

fn utf8(line: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(line.to_vec())
        .map_err(|_| StoreError::Protocol("non UTF-8 status line".to_owned()))
}

fn integer(line: &[u8]) -> Result<i64, StoreError> {
    core::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            StoreError::Protocol(format!(
                "invalid integer `{}`",
                String::from_utf8_lossy(line)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Value {
        let mut buf = BytesMut::from(input);
        let value = decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "trailing bytes: {buf:?}");
        value
    }

    #[test]
    fn encodes_incrby_as_bulk_array() {
        let mut buf = BytesMut::new();
        encode_command(&mut buf, &[b"INCRBY", b"shard:1:seq", b"100"]);
        assert_eq!(
            &buf[..],
            b"*3\r\n$6\r\nINCRBY\r\n$11\r\nshard:1:seq\r\n$3\r\n100\r\n"
        );
    }

    #[test]
    fn decodes_scalar_replies() {
        assert_eq!(decode_all(b"+PONG\r\n"), Value::Simple("PONG".into()));
        assert_eq!(decode_all(b":1024\r\n"), Value::Integer(1024));
        assert_eq!(
            decode_all(b"-ERR wrong number\r\n"),
            Value::Error("ERR wrong number".into())
        );
        assert_eq!(decode_all(b"$-1\r\n"), Value::Bulk(None));
        assert_eq!(decode_all(b"*-1\r\n"), Value::Array(None));
    }

    #[test]
    fn decodes_sentinel_address_reply() {
        let value = decode_all(b"*2\r\n$9\r\n10.0.0.12\r\n$4\r\n6380\r\n");
        assert_eq!(
            value.into_address().unwrap(),
            Some(("10.0.0.12".to_owned(), 6380))
        );
        assert_eq!(decode_all(b"*-1\r\n").into_address().unwrap(), None);
    }

    #[test]
    fn incomplete_input_is_left_in_buffer() {
        let full: &[u8] = b"*2\r\n$5\r\nhello\r\n:42\r\n";
        for cut in 0..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(decode(&mut buf).unwrap(), None, "cut at {cut}");
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn pipelined_replies_decode_one_at_a_time() {
        let mut buf = BytesMut::from(&b"+OK\r\n:7\r\n"[..]);
        assert_eq!(decode(&mut buf).unwrap(), Some(Value::Simple("OK".into())));
        assert_eq!(decode(&mut buf).unwrap(), Some(Value::Integer(7)));
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(matches!(decode(&mut buf), Err(StoreError::Protocol(_))));
        let mut buf = BytesMut::from(&b":12x\r\n"[..]);
        assert!(matches!(decode(&mut buf), Err(StoreError::Protocol(_))));
    }

    #[test]
    fn deeply_nested_arrays_are_rejected() {
        let mut nested = b"*1\r\n".repeat(10_000);
        nested.extend_from_slice(b":1\r\n");
        let mut buf = BytesMut::from(&nested[..]);
        assert!(matches!(decode(&mut buf), Err(StoreError::Protocol(_))));

        let mut shallow = b"*1\r\n".repeat(MAX_DEPTH);
        shallow.extend_from_slice(b":1\r\n");
        let mut value = decode_all(&shallow);
        for _ in 0..MAX_DEPTH {
            let Value::Array(Some(mut items)) = value else {
                panic!("expected an array, got {value:?}");
            };
            value = items.remove(0);
        }
        assert_eq!(value, Value::Integer(1));
    }

    #[test]
    fn counter_reply_conversions() {
        assert_eq!(Value::Integer(5).into_counter().unwrap(), 5);
        assert!(matches!(
            Value::Error("WRONGTYPE Operation".into()).into_counter(),
            Err(StoreError::Server(_))
        ));
        assert!(matches!(
            Value::Integer(-1).into_counter(),
            Err(StoreError::Protocol(_))
        ));
    }
}
