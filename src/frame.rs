use crate::{Error, LResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io::Cursor;

/// A frame in Redis Serialization Protocol (RESP).
///
/// Every encoded frame is self delimiting: a decoder handed only the byte
/// stream always knows where the frame ends.
///
/// See: <https://redis.io/docs/latest/develop/reference/protocol-spec/>
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SimpleString(String),
    SimpleError(String),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<Frame>),
    NullBulkString,
    NullArray,
}

impl Frame {
    /// Checks if an entire frame can be decoded from `src`.
    ///
    /// On success the cursor is left right after the frame, so its position is
    /// the exact number of bytes the frame occupies on the wire.
    pub fn check(src: &mut Cursor<&[u8]>) -> LResult<()> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_decimal_signed(src)?;
                Ok(())
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    let line = get_line(src)?;
                    if line != b"-1" {
                        return Err(invalid_null(line));
                    }
                    Ok(())
                } else {
                    let len: usize = get_decimal_unsigned(src)?.try_into()?;
                    skip(src, len)?;
                    expect_crlf(src)
                }
            }
            b'*' => {
                let len = get_decimal_signed(src)?;
                if len < -1 {
                    return Err(Error::Protocol(format!("invalid array length `{len}`")));
                }
                for _ in 0..len {
                    Frame::check(src)?;
                }
                Ok(())
            }
            actual => Err(Error::Protocol(format!("invalid frame byte `{actual}`"))),
        }
    }

    pub fn parse(src: &mut Cursor<&[u8]>) -> LResult<Frame> {
        // The first byte of the frame indicates the data type.
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::SimpleString(string))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                let string = String::from_utf8(line)?;
                Ok(Frame::SimpleError(string))
            }
            b':' => Ok(Frame::Integer(get_decimal_signed(src)?)),
            b'$' => {
                if b'-' == peek_u8(src)? {
                    let line = get_line(src)?;
                    if line != b"-1" {
                        return Err(invalid_null(line));
                    }
                    Ok(Frame::NullBulkString)
                } else {
                    // RESP does not allow a leading '+' on lengths
                    // but some clients send one
                    let len = get_decimal_unsigned(src)?.try_into()?;
                    if src.remaining() < len {
                        return Err(Error::IncompleteFrame);
                    }
                    let data = Bytes::copy_from_slice(&src.chunk()[..len]);
                    src.advance(len);
                    expect_crlf(src)?;
                    Ok(Frame::BulkString(data))
                }
            }
            b'*' => {
                let decimal = get_decimal_signed(src)?;
                if decimal == -1 {
                    return Ok(Frame::NullArray);
                }
                let len: usize = decimal.try_into()?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }
                Ok(Frame::Array(out))
            }
            first_byte => Err(Error::Protocol(format!(
                "first byte was not a valid RESP data type `{first_byte}`"
            ))),
        }
    }

    /// Decodes one frame from the start of `src`, returning it together with
    /// the number of bytes it occupied.
    pub fn decode(src: &[u8]) -> LResult<(Frame, usize)> {
        let mut buf = Cursor::new(src);
        Frame::check(&mut buf)?;
        let len = buf.position() as usize;
        buf.set_position(0);
        let frame = Frame::parse(&mut buf)?;
        Ok((frame, len))
    }

    /// Appends the wire representation of the frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::SimpleString(val) => {
                dst.put_u8(b'+');
                dst.put_slice(val.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::SimpleError(val) => {
                dst.put_u8(b'-');
                dst.put_slice(val.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(val) => {
                dst.put_u8(b':');
                put_decimal(dst, *val);
            }
            Frame::BulkString(val) => {
                dst.put_u8(b'$');
                put_decimal(dst, val.len() as i64);
                dst.put_slice(val);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(val) => {
                dst.put_u8(b'*');
                put_decimal(dst, val.len() as i64);
                for entry in val {
                    entry.encode(dst);
                }
            }
            Frame::NullBulkString => dst.put_slice(b"$-1\r\n"),
            Frame::NullArray => dst.put_slice(b"*-1\r\n"),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Number of bytes `encode` will produce.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::SimpleString(val) | Frame::SimpleError(val) => 1 + val.len() + 2,
            Frame::Integer(val) => 1 + decimal_len(*val) + 2,
            Frame::BulkString(val) => 1 + decimal_len(val.len() as i64) + 2 + val.len() + 2,
            Frame::Array(val) => {
                1 + decimal_len(val.len() as i64)
                    + 2
                    + val.iter().map(Frame::encoded_len).sum::<usize>()
            }
            Frame::NullBulkString | Frame::NullArray => 5,
        }
    }

    /// A bulk string holding the decimal form of `value`.
    pub fn bulk_int(value: i64) -> Frame {
        Frame::BulkString(Bytes::from(value.to_string()))
    }

    /// Resolves the "bulk string or integer" ambiguity into a single string.
    pub fn into_string(self) -> LResult<String> {
        match self {
            Frame::SimpleString(s) => Ok(s),
            Frame::BulkString(data) => Ok(String::from_utf8(data.to_vec())?),
            Frame::Integer(value) => Ok(value.to_string()),
            frame => Err(Error::WrongFrameType(format!(
                "expected string or integer, got {frame:?}"
            ))),
        }
    }

    pub(crate) fn array() -> Self {
        Frame::Array(vec![])
    }

    pub(crate) fn push_bulk(&mut self, bytes: Bytes) -> LResult<()> {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::BulkString(bytes));
                Ok(())
            }
            ty => Err(Error::WrongFrameType(format!(
                "cannot push to non-array frame type, type was {:?}",
                ty
            ))),
        }
    }

    pub(crate) fn push_int(&mut self, value: i64) -> LResult<()> {
        match self {
            Frame::Array(vec) => {
                vec.push(Frame::bulk_int(value));
                Ok(())
            }
            ty => Err(Error::WrongFrameType(format!(
                "cannot push to non-array frame type, type was {:?}",
                ty
            ))),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::SimpleString(val) => write!(fmt, "{val}"),
            Frame::SimpleError(val) => write!(fmt, "error: {val}"),
            Frame::Integer(val) => write!(fmt, "{val}"),
            Frame::BulkString(val) => match std::str::from_utf8(val) {
                Ok(string) => write!(fmt, "{string}"),
                Err(_) => write!(fmt, "{val:?}"),
            },
            Frame::NullBulkString | Frame::NullArray => write!(fmt, "(nil)"),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }
                    write!(fmt, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

fn invalid_null(line: &[u8]) -> Error {
    Error::Protocol(format!(
        "invalid frame format, only valid negative length is -1, got `{line:?}`"
    ))
}

fn get_u8(src: &mut Cursor<&[u8]>) -> LResult<u8> {
    if !src.has_remaining() {
        return Err(Error::IncompleteFrame);
    }
    Ok(src.get_u8())
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> LResult<u8> {
    if !src.has_remaining() {
        return Err(Error::IncompleteFrame);
    }
    Ok(src.chunk()[0])
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> LResult<()> {
    if src.remaining() < n {
        return Err(Error::IncompleteFrame);
    }
    src.advance(n);
    Ok(())
}

/// Bulk payloads must be followed by a CRLF, never by stray bytes.
fn expect_crlf(src: &mut Cursor<&[u8]>) -> LResult<()> {
    if src.remaining() < 2 {
        return Err(Error::IncompleteFrame);
    }
    if &src.chunk()[..2] != b"\r\n" {
        return Err(Error::Protocol(
            "bulk string length does not match its payload".into(),
        ));
    }
    src.advance(2);
    Ok(())
}

fn get_decimal_signed(src: &mut Cursor<&[u8]>) -> LResult<i64> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi(line).ok_or(Error::Protocol("invalid frame format".into()))
}

fn get_decimal_unsigned(src: &mut Cursor<&[u8]>) -> LResult<u64> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi(line).ok_or(Error::Protocol("invalid frame format".into()))
}

fn get_line<'a>(src: &'a mut Cursor<&[u8]>) -> LResult<&'a [u8]> {
    let start = src.position() as usize;
    let end = src.get_ref().len().saturating_sub(1);

    for i in start..end {
        if src.get_ref()[i] == b'\r' && src.get_ref()[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&src.get_ref()[start..i]);
        }
    }
    Err(Error::IncompleteFrame)
}

fn put_decimal(dst: &mut BytesMut, val: i64) {
    dst.put_slice(val.to_string().as_bytes());
    dst.put_slice(b"\r\n");
}

fn decimal_len(val: i64) -> usize {
    let sign = usize::from(val < 0);
    let mut n = val.unsigned_abs();
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    sign + digits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_data_types() {
        let frames: &[&[u8]] = &[
            b"+OK\r\n",
            b"-ERR unknown command 'foobar'\r\n",
            b":1000\r\n",
            b"$6\r\nfoobar\r\n",
            b"$0\r\n\r\n",
            b"$-1\r\n",
            b"*2\r\n+OK\r\n$6\r\nfoobar\r\n",
            b"*1\r\n+OK\r\n",
            b"*-1\r\n",
            b"*0\r\n",
        ];
        for frame in frames {
            match_frame(frame);
        }
    }

    /// This function is used to ensure that parse contains every variant of [`Frame`].
    fn match_frame(src: &[u8]) {
        let mut buf = Cursor::new(src);
        let frame = Frame::parse(&mut buf).unwrap();
        // A match statement without a catch-all arm will fail to compile if a variant is missing.
        match frame {
            Frame::SimpleString(_) => (),
            Frame::SimpleError(_) => (),
            Frame::Integer(_) => (),
            Frame::BulkString(_) => (),
            Frame::Array(_) => (),
            Frame::NullBulkString => (),
            Frame::NullArray => (),
        }
    }

    #[test]
    fn test_simple_string() {
        let mut buf = Cursor::new(b"+OK\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(frame, Frame::SimpleString("OK".to_string()));
    }

    #[test]
    fn test_long_simple_string() {
        let mut buf = Cursor::new(b"+FULLRESYNC 8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb 0\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(
            frame,
            Frame::SimpleString("FULLRESYNC 8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb 0".to_string())
        );
    }

    #[test]
    fn test_simple_error() {
        let mut buf = Cursor::new(b"-ERR unknown command 'foobar'\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(
            frame,
            Frame::SimpleError("ERR unknown command 'foobar'".to_string())
        );
    }

    #[test]
    fn test_integer() {
        let mut buf = Cursor::new(b":1000\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(frame, Frame::Integer(1000));

        let mut buf = Cursor::new(b":-1\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(frame, Frame::Integer(-1));

        let mut buf = Cursor::new(b":+9223372036854775807\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(frame, Frame::Integer(i64::MAX));

        let mut buf = Cursor::new(b":-9223372036854775808\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(frame, Frame::Integer(i64::MIN));
    }

    #[test]
    fn test_bulk_string() {
        let mut buf = Cursor::new(b"$6\r\nfoobar\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(frame, Frame::BulkString(Bytes::from("foobar")));

        let mut buf = Cursor::new(b"$+2\r\nOK\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(frame, Frame::BulkString(Bytes::from("OK")));
    }

    #[test]
    fn test_null_bulk_string_is_not_empty() {
        let (null, _) = Frame::decode(b"$-1\r\n").unwrap();
        let (empty, _) = Frame::decode(b"$0\r\n\r\n").unwrap();
        assert_eq!(null, Frame::NullBulkString);
        assert_eq!(empty, Frame::BulkString(Bytes::new()));
        assert_ne!(null, empty);
    }

    #[test]
    fn test_null_array_is_not_empty() {
        let (null, _) = Frame::decode(b"*-1\r\n").unwrap();
        let (empty, _) = Frame::decode(b"*0\r\n").unwrap();
        assert_eq!(null, Frame::NullArray);
        assert_eq!(empty, Frame::array());
        assert_ne!(null, empty);
    }

    #[test]
    fn test_array() {
        let mut buf = Cursor::new(b"*2\r\n+OK\r\n$6\r\nfoobar\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::SimpleString("OK".to_string()),
                Frame::BulkString(Bytes::from("foobar")),
            ])
        );

        let mut buf = Cursor::new(b"*3\r\n+OK\r\n".as_slice());
        assert!(matches!(Frame::check(&mut buf), Err(Error::IncompleteFrame)));
    }

    #[test]
    fn test_recursive_array() {
        let mut buf = Cursor::new(b"*2\r\n*2\r\n+OK\r\n$6\r\nfoobar\r\n$3\r\nbaz\r\n".as_slice());
        let frame = Frame::parse(&mut buf).unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Array(vec![
                    Frame::SimpleString("OK".to_string()),
                    Frame::BulkString(Bytes::from("foobar")),
                ]),
                Frame::BulkString(Bytes::from("baz")),
            ])
        );
    }

    #[test]
    fn test_invalid_frame() {
        for src in [&b"invalid frame\r\n"[..], b"_\r\n", b"#t\r\n", b"%1\r\n"] {
            let mut buf = Cursor::new(src);
            assert!(matches!(Frame::check(&mut buf), Err(Error::Protocol(_))));
            let mut buf = Cursor::new(src);
            assert!(matches!(Frame::parse(&mut buf), Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn test_bulk_string_without_trailing_crlf() {
        let err = Frame::decode(b"$3\r\nfoobar\r\n").unwrap_err();
        assert!(err.is_framing());

        // Not a protocol error yet, the rest of the payload may still arrive.
        let err = Frame::decode(b"$10\r\nfoo").unwrap_err();
        assert!(matches!(err, Error::IncompleteFrame));
    }

    #[test]
    fn test_encode_nested() {
        let frame = Frame::Array(vec![
            Frame::Array(vec![Frame::Integer(-5), Frame::NullBulkString]),
            Frame::SimpleError("ERR boom".into()),
            Frame::NullArray,
        ]);
        assert_eq!(
            frame.to_bytes(),
            Bytes::from_static(b"*3\r\n*2\r\n:-5\r\n$-1\r\n-ERR boom\r\n*-1\r\n")
        );
    }

    #[test]
    fn test_round_trip_reports_encoded_length() {
        let frames = [
            Frame::SimpleString("PONG".into()),
            Frame::SimpleError("ERR".into()),
            Frame::Integer(i64::MIN),
            Frame::BulkString(Bytes::from(vec![b'x'; 100])),
            Frame::NullBulkString,
            Frame::NullArray,
            Frame::Array(vec![]),
            Frame::Array(vec![
                Frame::BulkString(Bytes::from("SET")),
                Frame::Array(vec![Frame::bulk_int(1234567890)]),
            ]),
        ];
        for frame in frames {
            let encoded = frame.to_bytes();
            assert_eq!(frame.encoded_len(), encoded.len());
            let (decoded, len) = Frame::decode(&encoded).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(len, encoded.len());
        }
    }

    #[test]
    fn test_byte_count_matches_transmitted_frame() {
        let mut src = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$100\r\n".to_vec();
        src.extend_from_slice(&[b'v'; 100]);
        src.extend_from_slice(b"\r\n");
        let frame_len = src.len();
        // trailing bytes of the next frame are not counted
        src.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");

        let (_, len) = Frame::decode(&src).unwrap();
        assert_eq!(len, frame_len);
    }

    #[test]
    fn test_into_string() {
        assert_eq!(Frame::Integer(42).into_string().unwrap(), "42");
        assert_eq!(Frame::bulk_int(7).into_string().unwrap(), "7");
        assert_eq!(
            Frame::SimpleString("OK".into()).into_string().unwrap(),
            "OK"
        );
        assert!(Frame::NullArray.into_string().is_err());
    }
}
