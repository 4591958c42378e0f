//! Minimal bencode value model (BEP-3) used to carry BEP-5 DHT dictionaries.

use std::collections::BTreeMap;
use std::fmt;

/// A decoded (or to-be-encoded) bencode value.
///
/// Dictionaries are `BTreeMap` so that encoding always produces the
/// lexicographically sorted key order the bencode spec requires, without a
/// separate sort pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BValue>),
    Dict(BTreeMap<Vec<u8>, BValue>),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    Eof,
    #[error("invalid bencode at offset {0}")]
    Invalid(usize),
    #[error("trailing data after top-level value")]
    TrailingData,
    #[error("integer out of range or malformed at offset {0}")]
    BadInt(usize),
}

impl BValue {
    pub fn dict() -> BValue {
        BValue::Dict(BTreeMap::new())
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BValue>> {
        match self {
            BValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BValue]> {
        match self {
            BValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Looks up a dictionary key if `self` is a dict.
    pub fn get(&self, key: &[u8]) -> Option<&BValue> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn insert(&mut self, key: &[u8], value: BValue) {
        if let BValue::Dict(d) = self {
            d.insert(key.to_vec(), value);
        }
    }

    /// Encodes this value, appending to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            BValue::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            BValue::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            BValue::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode(out);
                }
                out.push(b'e');
            }
            BValue::Dict(entries) => {
                out.push(b'd');
                for (k, v) in entries {
                    BValue::Bytes(k.clone()).encode(out);
                    v.encode(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decodes exactly one top-level value, erroring if trailing bytes remain.
    pub fn decode(input: &[u8]) -> Result<BValue, BencodeError> {
        let (value, consumed) = Self::decode_prefix(input)?;
        if consumed != input.len() {
            return Err(BencodeError::TrailingData);
        }
        Ok(value)
    }

    /// Decodes one value from the start of `input`, returning it along with
    /// the number of bytes consumed. Used internally for recursive descent;
    /// exposed for callers that frame multiple values back to back.
    pub fn decode_prefix(input: &[u8]) -> Result<(BValue, usize), BencodeError> {
        decode_value(input, 0).map(|(value, end)| (value, end))
    }
}

fn decode_value(input: &[u8], pos: usize) -> Result<(BValue, usize), BencodeError> {
    match input.get(pos) {
        None => Err(BencodeError::Eof),
        Some(b'i') => decode_int(input, pos),
        Some(b'l') => decode_list(input, pos),
        Some(b'd') => decode_dict(input, pos),
        Some(c) if c.is_ascii_digit() => decode_bytes(input, pos),
        Some(_) => Err(BencodeError::Invalid(pos)),
    }
}

fn decode_int(input: &[u8], pos: usize) -> Result<(BValue, usize), BencodeError> {
    debug_assert_eq!(input[pos], b'i');
    let start = pos + 1;
    let end = find(input, start, b'e').ok_or(BencodeError::Eof)?;
    let text = std::str::from_utf8(&input[start..end]).map_err(|_| BencodeError::BadInt(pos))?;
    if text.is_empty() || text == "-" || (text.starts_with('0') && text != "0") {
        return Err(BencodeError::BadInt(pos));
    }
    let value: i64 = text.parse().map_err(|_| BencodeError::BadInt(pos))?;
    Ok((BValue::Int(value), end + 1))
}

fn decode_bytes(input: &[u8], pos: usize) -> Result<(BValue, usize), BencodeError> {
    let colon = find(input, pos, b':').ok_or(BencodeError::Eof)?;
    let len_text =
        std::str::from_utf8(&input[pos..colon]).map_err(|_| BencodeError::Invalid(pos))?;
    let len: usize = len_text.parse().map_err(|_| BencodeError::Invalid(pos))?;
    let start = colon + 1;
    let end = start.checked_add(len).ok_or(BencodeError::Invalid(pos))?;
    if end > input.len() {
        return Err(BencodeError::Eof);
    }
    Ok((BValue::Bytes(input[start..end].to_vec()), end))
}

fn decode_list(input: &[u8], pos: usize) -> Result<(BValue, usize), BencodeError> {
    debug_assert_eq!(input[pos], b'l');
    let mut items = Vec::new();
    let mut cursor = pos + 1;
    loop {
        match input.get(cursor) {
            None => return Err(BencodeError::Eof),
            Some(b'e') => return Ok((BValue::List(items), cursor + 1)),
            _ => {
                let (value, next) = decode_value(input, cursor)?;
                items.push(value);
                cursor = next;
            }
        }
    }
}

fn decode_dict(input: &[u8], pos: usize) -> Result<(BValue, usize), BencodeError> {
    debug_assert_eq!(input[pos], b'd');
    let mut entries = BTreeMap::new();
    let mut cursor = pos + 1;
    loop {
        match input.get(cursor) {
            None => return Err(BencodeError::Eof),
            Some(b'e') => return Ok((BValue::Dict(entries), cursor + 1)),
            _ => {
                let (key, next) = decode_bytes(input, cursor)?;
                let key = match key {
                    BValue::Bytes(b) => b,
                    _ => unreachable!(),
                };
                let (value, next) = decode_value(input, next)?;
                entries.insert(key, value);
                cursor = next;
            }
        }
    }
}

fn find(input: &[u8], from: usize, needle: u8) -> Option<usize> {
    input[from..].iter().position(|&b| b == needle).map(|i| from + i)
}

impl fmt::Display for BValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BValue::Int(i) => write!(f, "{}", i),
            BValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            BValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            BValue::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", String::from_utf8_lossy(k), v)?;
                }
                write!(f, "}}")
            }
        }
    }
}
