//! A binary-safe bencode codec.
//!
//! Bencoding (http://bittorrent.org/beps/bep_0003.html) has four types:
//! integers (`i42e`), byte strings (`4:spam`), lists (`l...e`), and
//! dictionaries with byte string keys in lexicographical order (`d...e`).
//!
//! Strings are opaque byte sequences, never coerced to UTF-8: torrent files
//! routinely carry raw hashes and compact peer lists in them. Dictionary keys
//! are kept in a `BTreeMap` so that encoding always emits them in
//! lexicographical byte order, which is what makes the info-hash stable.

use std::{collections::BTreeMap, fmt, ops::Range};

/// A single bencoded value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a string slice, if it is a valid UTF-8 byte
    /// string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up an entry of a dictionary value.
    pub fn dict_get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Self::List(l)
    }
}

impl From<BTreeMap<Vec<u8>, Value>> for Value {
    fn from(d: BTreeMap<Vec<u8>, Value>) -> Self {
        Self::Dict(d)
    }
}

/// The reason a buffer failed to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input ended in the middle of a value.
    UnexpectedEof,
    /// A byte that doesn't begin any bencoded value.
    InvalidToken,
    /// A malformed integer: empty, leading zeros, `-0`, or out of the i64
    /// range.
    InvalidInteger,
    /// A byte string length that overflows or runs past the end of the input.
    LengthOverflow,
    /// Dictionary keys that are not in strictly ascending byte order.
    NonLexKeys,
    /// Valid value followed by garbage.
    TrailingBytes,
}

/// A decode failure, with the byte position at which it was detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeError {
    pub pos: usize,
    pub kind: ErrorKind,
}

impl DecodeError {
    fn new(pos: usize, kind: ErrorKind) -> Self {
        Self { pos, kind }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::UnexpectedEof => "unexpected end of input",
            ErrorKind::InvalidToken => "invalid token",
            ErrorKind::InvalidInteger => "invalid integer",
            ErrorKind::LengthOverflow => "string length overflow",
            ErrorKind::NonLexKeys => "dictionary keys out of order",
            ErrorKind::TrailingBytes => "trailing bytes after value",
        };
        write!(f, "{} at position {}", kind, self.pos)
    }
}

impl std::error::Error for DecodeError {}

/// Decodes a complete bencoded value. Trailing bytes after the value are an
/// error.
pub fn decode(buf: &[u8]) -> Result<Value, DecodeError> {
    let mut parser = Parser { buf, pos: 0 };
    let value = parser.parse_value()?;
    if parser.pos != buf.len() {
        return Err(DecodeError::new(parser.pos, ErrorKind::TrailingBytes));
    }
    Ok(value)
}

/// Decodes a single value from the front of the buffer, returning it along
/// with the number of bytes consumed. Used for formats that append raw bytes
/// after a bencoded header (e.g. ut_metadata data messages).
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut parser = Parser { buf, pos: 0 };
    let value = parser.parse_value()?;
    Ok((value, parser.pos))
}

/// Encodes a value to its canonical bencoded form.
///
/// Encoding a value returned by [`decode`] reproduces the original canonical
/// input byte for byte; dictionary keys are always written in lexicographical
/// byte order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Encodes a value, appending to the given buffer.
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            buf.push(b'i');
            buf.extend_from_slice(n.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => {
            buf.extend_from_slice(b.len().to_string().as_bytes());
            buf.push(b':');
            buf.extend_from_slice(b);
        }
        Value::List(l) => {
            buf.push(b'l');
            for item in l {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(d) => {
            buf.push(b'd');
            // BTreeMap iterates keys in ascending byte order
            for (key, val) in d {
                buf.extend_from_slice(key.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(key);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}

/// Returns the byte range the value of the given top-level dictionary key
/// occupies in the buffer, or `None` if the key is not present.
///
/// This is what makes the info-hash stable: the `info` dictionary must be
/// hashed over the verbatim input bytes, as re-encoding a parsed value can
/// shift the digest whenever the original encoder deviated from canonical
/// form.
pub fn raw_value_range(
    buf: &[u8],
    key: &[u8],
) -> Result<Option<Range<usize>>, DecodeError> {
    let mut parser = Parser { buf, pos: 0 };
    if parser.peek()? != b'd' {
        return Err(DecodeError::new(parser.pos, ErrorKind::InvalidToken));
    }
    parser.pos += 1;
    loop {
        if parser.peek()? == b'e' {
            return Ok(None);
        }
        let entry_key = parser.parse_bytes()?;
        let start = parser.pos;
        parser.parse_value()?;
        if entry_key == key {
            return Ok(Some(start..parser.pos));
        }
    }
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| DecodeError::new(self.pos, ErrorKind::UnexpectedEof))
    }

    fn parse_value(&mut self) -> Result<Value, DecodeError> {
        match self.peek()? {
            b'i' => self.parse_int().map(Value::Int),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.parse_value()?);
                }
                self.pos += 1;
                Ok(Value::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                let mut prev_key: Option<Vec<u8>> = None;
                while self.peek()? != b'e' {
                    let key_pos = self.pos;
                    let key = self.parse_bytes()?;
                    // keys must be unique and strictly ascending
                    if let Some(prev) = &prev_key {
                        if *prev >= key {
                            return Err(DecodeError::new(
                                key_pos,
                                ErrorKind::NonLexKeys,
                            ));
                        }
                    }
                    let value = self.parse_value()?;
                    prev_key = Some(key.clone());
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            _ => Err(DecodeError::new(self.pos, ErrorKind::InvalidToken)),
        }
    }

    fn parse_int(&mut self) -> Result<i64, DecodeError> {
        let start = self.pos;
        debug_assert_eq!(self.buf[self.pos], b'i');
        self.pos += 1;

        let negative = if self.peek()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };

        let digits_start = self.pos;
        let mut value: i64 = 0;
        loop {
            match self.peek()? {
                d @ b'0'..=b'9' => {
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add((d - b'0') as i64))
                        .ok_or_else(|| {
                            DecodeError::new(start, ErrorKind::InvalidInteger)
                        })?;
                    self.pos += 1;
                }
                b'e' => break,
                _ => {
                    return Err(DecodeError::new(
                        self.pos,
                        ErrorKind::InvalidInteger,
                    ))
                }
            }
        }

        let digits = &self.buf[digits_start..self.pos];
        // no empty integers, no leading zeros except the literal `0`, no `-0`
        if digits.is_empty()
            || (digits.len() > 1 && digits[0] == b'0')
            || (negative && value == 0)
        {
            return Err(DecodeError::new(start, ErrorKind::InvalidInteger));
        }
        // consume the 'e'
        self.pos += 1;

        Ok(if negative { -value } else { value })
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            match self.peek()? {
                d @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((d - b'0') as usize))
                        .ok_or_else(|| {
                            DecodeError::new(start, ErrorKind::LengthOverflow)
                        })?;
                    self.pos += 1;
                }
                b':' => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    return Err(DecodeError::new(
                        self.pos,
                        ErrorKind::InvalidToken,
                    ))
                }
            }
        }
        if self.pos == start + 1 {
            // there was no length digit at all, just a ':'
            return Err(DecodeError::new(start, ErrorKind::InvalidToken));
        }
        let end = self.pos.checked_add(len).ok_or_else(|| {
            DecodeError::new(start, ErrorKind::LengthOverflow)
        })?;
        if end > self.buf.len() {
            return Err(DecodeError::new(start, ErrorKind::LengthOverflow));
        }
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn dict(entries: Vec<(&[u8], Value)>) -> Value {
        Value::Dict(
            entries.into_iter().map(|(k, v)| (k.to_vec(), v)).collect(),
        )
    }

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-13e").unwrap(), Value::Int(-13));
        assert_eq!(
            decode(b"i9223372036854775807e").unwrap(),
            Value::Int(i64::MAX)
        );
    }

    #[test]
    fn test_decode_invalid_integers() {
        for input in
            [&b"ie"[..], b"i-e", b"i-0e", b"i03e", b"i00e", b"i4x2e"].iter()
        {
            assert_eq!(
                decode(input).unwrap_err().kind,
                ErrorKind::InvalidInteger,
                "{:?}",
                input
            );
        }
        // one past i64::MAX
        assert_eq!(
            decode(b"i9223372036854775808e").unwrap_err().kind,
            ErrorKind::InvalidInteger
        );
    }

    #[test]
    fn test_decode_strings() {
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(vec![]));
        assert_eq!(
            decode(b"4:spam").unwrap(),
            Value::Bytes(b"spam".to_vec())
        );
        // binary safe
        assert_eq!(
            decode(b"3:\x00\xff\x7f").unwrap(),
            Value::Bytes(vec![0, 255, 127])
        );
    }

    #[test]
    fn test_decode_string_length_overflow() {
        assert_eq!(
            decode(b"5:spam").unwrap_err().kind,
            ErrorKind::LengthOverflow
        );
        assert_eq!(
            decode(b"99999999999999999999999:x").unwrap_err().kind,
            ErrorKind::LengthOverflow
        );
    }

    #[test]
    fn test_decode_lists() {
        assert_eq!(decode(b"le").unwrap(), Value::List(vec![]));
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Int(42)
            ])
        );
        // nested
        assert_eq!(
            decode(b"ll4:spamee").unwrap(),
            Value::List(vec![Value::List(vec![Value::Bytes(
                b"spam".to_vec()
            )])])
        );
    }

    #[test]
    fn test_decode_dicts() {
        assert_eq!(decode(b"de").unwrap(), dict(vec![]));
        assert_eq!(
            decode(b"d3:bar4:spam3:fooi42ee").unwrap(),
            dict(vec![
                (b"bar", Value::Bytes(b"spam".to_vec())),
                (b"foo", Value::Int(42)),
            ])
        );
    }

    #[test]
    fn test_decode_dict_key_order() {
        // "foo" sorts after "bar", so this is out of order
        assert_eq!(
            decode(b"d3:fooi42e3:bar4:spame").unwrap_err().kind,
            ErrorKind::NonLexKeys
        );
        // duplicate keys are not allowed either
        assert_eq!(
            decode(b"d3:fooi1e3:fooi2ee").unwrap_err().kind,
            ErrorKind::NonLexKeys
        );
    }

    #[test]
    fn test_decode_eof() {
        for input in [&b""[..], b"i42", b"l4:spam", b"d3:foo", b"12"].iter() {
            assert_eq!(
                decode(input).unwrap_err().kind,
                ErrorKind::UnexpectedEof,
                "{:?}",
                input
            );
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let err = decode(b"i42etrailing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TrailingBytes);
        assert_eq!(err.pos, 4);
    }

    #[test]
    fn test_decode_invalid_token() {
        assert_eq!(
            decode(b"x").unwrap_err().kind,
            ErrorKind::InvalidToken
        );
    }

    #[test]
    fn test_round_trip() {
        // decode(encode(v)) == v
        let value = dict(vec![
            (b"announce", Value::from("http://tracker.example/announce")),
            (
                b"info",
                dict(vec![
                    (b"length", Value::Int(150000)),
                    (b"name", Value::from("data.bin")),
                    (b"piece length", Value::Int(65536)),
                    (b"pieces", Value::Bytes(vec![0xab; 60])),
                ]),
            ),
        ]);
        assert_eq!(decode(&encode(&value)).unwrap(), value);

        // encode(decode(b)) == b for canonical input
        let canonical = b"d3:bar4:spam3:fooi42e4:listli1ei2eee".to_vec();
        assert_eq!(encode(&decode(&canonical).unwrap()), canonical);
    }

    #[test]
    fn test_raw_value_range() {
        let buf = b"d8:announce3:url4:infod6:lengthi42eee";
        let range = raw_value_range(buf, b"info").unwrap().unwrap();
        assert_eq!(&buf[range], b"d6:lengthi42ee");

        assert_eq!(raw_value_range(buf, b"nonexistent").unwrap(), None);
    }

    #[test]
    fn test_decode_prefix() {
        let (value, consumed) = decode_prefix(b"i42etrailing").unwrap();
        assert_eq!(value, Value::Int(42));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_raw_value_range_non_dict() {
        assert_eq!(
            raw_value_range(b"i42e", b"info").unwrap_err().kind,
            ErrorKind::InvalidToken
        );
    }
}
