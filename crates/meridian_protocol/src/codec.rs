//! Encode/decode for the RESP wire format.
//!
//! Frames are CRLF-delimited: `+simple`, `-error`, `:integer`, `$bulk`,
//! `*array`. Floats ride in bulk strings. The decoder is incremental — fed a
//! partial buffer it reports `Truncated` so the connection loop can read
//! more bytes and try again.

use bytes::{BufMut, BytesMut};

use meridian_common::error::ProtocolError;

use crate::value::{format_float, Value};

type Result<T> = std::result::Result<T, ProtocolError>;

/// Decode result: the value plus how many input bytes it consumed.
pub type DecodeOutcome = (Value, usize);

pub fn encode_value(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Null => out.put_slice(b"$-1\r\n"),
        Value::SimpleString(s) => {
            out.put_u8(b'+');
            out.put_slice(s.as_bytes());
            out.put_slice(b"\r\n");
        }
        Value::Error(msg) => {
            out.put_u8(b'-');
            out.put_slice(msg.as_bytes());
            out.put_slice(b"\r\n");
        }
        Value::Integer(n) => {
            out.put_u8(b':');
            out.put_slice(n.to_string().as_bytes());
            out.put_slice(b"\r\n");
        }
        Value::Float(f) => encode_bulk(&format_float(*f), out),
        Value::BulkString(s) => encode_bulk(s, out),
        Value::Array(items) => {
            out.put_u8(b'*');
            out.put_slice(items.len().to_string().as_bytes());
            out.put_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

fn encode_bulk(s: &str, out: &mut BytesMut) {
    out.put_u8(b'$');
    out.put_slice(s.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(s.as_bytes());
    out.put_slice(b"\r\n");
}

/// Decode a single value from the front of `buf`.
pub fn decode_value(buf: &[u8]) -> Result<DecodeOutcome> {
    let mut pos = 0;
    let value = decode_at(buf, &mut pos)?;
    Ok((value, pos))
}

fn decode_at(buf: &[u8], pos: &mut usize) -> Result<Value> {
    if *pos >= buf.len() {
        return Err(truncated(buf, *pos + 1));
    }
    let marker = buf[*pos];
    *pos += 1;
    match marker {
        b'+' => Ok(Value::SimpleString(read_line(buf, pos)?)),
        b'-' => Ok(Value::Error(read_line(buf, pos)?)),
        b':' => {
            let line = read_line(buf, pos)?;
            line.parse()
                .map(Value::Integer)
                .map_err(|_| ProtocolError::Invalid(format!("bad integer '{}'", line)))
        }
        b'$' => {
            let line = read_line(buf, pos)?;
            let len: i64 = line
                .parse()
                .map_err(|_| ProtocolError::Invalid(format!("bad bulk length '{}'", line)))?;
            if len < 0 {
                return Ok(Value::Null);
            }
            let len = len as usize;
            if buf.len() < *pos + len + 2 {
                return Err(truncated(buf, *pos + len + 2));
            }
            let body = &buf[*pos..*pos + len];
            if &buf[*pos + len..*pos + len + 2] != b"\r\n" {
                return Err(ProtocolError::Invalid("bulk missing terminator".into()));
            }
            *pos += len + 2;
            String::from_utf8(body.to_vec())
                .map(Value::BulkString)
                .map_err(|_| ProtocolError::InvalidUtf8 { field: "bulk" })
        }
        b'*' => {
            let line = read_line(buf, pos)?;
            let len: i64 = line
                .parse()
                .map_err(|_| ProtocolError::Invalid(format!("bad array length '{}'", line)))?;
            if len < 0 {
                return Ok(Value::Null);
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(decode_at(buf, pos)?);
            }
            Ok(Value::Array(items))
        }
        other => Err(ProtocolError::Invalid(format!(
            "unexpected marker byte 0x{:02x}",
            other
        ))),
    }
}

fn read_line(buf: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            let line = String::from_utf8(buf[start..i].to_vec())
                .map_err(|_| ProtocolError::InvalidUtf8 { field: "line" })?;
            *pos = i + 2;
            return Ok(line);
        }
        i += 1;
    }
    Err(truncated(buf, buf.len() + 1))
}

fn truncated(buf: &[u8], expected: usize) -> ProtocolError {
    ProtocolError::Truncated {
        expected,
        actual: buf.len(),
    }
}

/// Split an inline (telnet-style) command line into arguments. Double quotes
/// group words and accept `\"`, `\\`, `\n`, `\t`, `\r` escapes.
pub fn parse_inline(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut arg = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some('n') => arg.push('\n'),
                        Some('t') => arg.push('\t'),
                        Some('r') => arg.push('\r'),
                        Some(other) => arg.push(other),
                        None => return Err(ProtocolError::Invalid("dangling escape".into())),
                    },
                    other => arg.push(other),
                }
            }
            if !closed {
                return Err(ProtocolError::Invalid("unbalanced quotes".into()));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let mut buf = BytesMut::new();
        encode_value(&value, &mut buf);
        let (decoded, consumed) = decode_value(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        // Floats come back as bulk strings; compare through the flat form.
        assert_eq!(decoded.flat(), value.flat());
    }

    #[test]
    fn test_roundtrip_scalars() {
        roundtrip(Value::Null);
        roundtrip(Value::ok());
        roundtrip(Value::Integer(-42));
        roundtrip(Value::bulk("hello world"));
        roundtrip(Value::error("ERR read only"));
        roundtrip(Value::Float(961.0));
    }

    #[test]
    fn test_roundtrip_nested_array() {
        roundtrip(Value::Array(vec![
            Value::Integer(1),
            Value::Array(vec![Value::bulk("poly9"), Value::Null]),
        ]));
    }

    #[test]
    fn test_truncated_input_reports_truncated() {
        let mut buf = BytesMut::new();
        encode_value(&Value::bulk("hello"), &mut buf);
        for cut in 0..buf.len() {
            match decode_value(&buf[..cut]) {
                Err(ProtocolError::Truncated { .. }) => {}
                other => panic!("cut={} gave {:?}", cut, other),
            }
        }
    }

    #[test]
    fn test_decode_consumes_one_frame() {
        let mut buf = BytesMut::new();
        encode_value(&Value::Integer(1), &mut buf);
        let first_len = buf.len();
        encode_value(&Value::Integer(2), &mut buf);
        let (v, consumed) = decode_value(&buf).unwrap();
        assert_eq!(v, Value::Integer(1));
        assert_eq!(consumed, first_len);
        let (v, _) = decode_value(&buf[consumed..]).unwrap();
        assert_eq!(v, Value::Integer(2));
    }

    #[test]
    fn test_parse_inline_plain_and_quoted() {
        let args = parse_inline(r#"SET fleet truck1 "a quoted value" 33 -115"#).unwrap();
        assert_eq!(
            args,
            vec!["SET", "fleet", "truck1", "a quoted value", "33", "-115"]
        );
    }

    #[test]
    fn test_parse_inline_escapes() {
        let args = parse_inline(r#"ECHO "line\none \"two\"""#).unwrap();
        assert_eq!(args, vec!["ECHO", "line\none \"two\""]);
    }

    #[test]
    fn test_parse_inline_unbalanced_quote_rejected() {
        assert!(parse_inline(r#"SET "oops"#).is_err());
    }
}
