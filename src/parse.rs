use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::{map, map_opt, opt, recognize, verify},
    error::{ErrorKind, ParseError},
    multi::many_till,
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};

use crate::error::{Error, Result};

/// Decoded bencode value
#[derive(Debug, Clone, PartialEq)]
pub enum BencodeType {
    ByteString(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeType>),
    Dict(BencodeDict),
}

impl BencodeType {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeType::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeType::Integer(int) => Some(*int),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeType]> {
        match self {
            BencodeType::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BencodeDict> {
        match self {
            BencodeType::Dict(dict) => Some(dict),
            _ => None,
        }
    }
}

/// Write `bytes` as a JSON string, decoding as lossy UTF-8
fn write_json_string(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    let text = serde_json::to_string(&String::from_utf8_lossy(bytes)).map_err(|_| fmt::Error)?;
    f.write_str(&text)
}

/// Renders the value as JSON, byte strings shown as lossy UTF-8
impl fmt::Display for BencodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BencodeType::ByteString(bytes) => write_json_string(f, bytes),
            BencodeType::Integer(int) => write!(f, "{}", int),
            BencodeType::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            BencodeType::Dict(dict) => {
                write!(f, "{{")?;
                for (idx, (key, value)) in dict.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write_json_string(f, key)?;
                    write!(f, ":{}", value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Bencode dictionary keeping keys in the order they were decoded/inserted
///
/// Keys are unique. Equality ignores key order.
#[derive(Debug, Clone, Default)]
pub struct BencodeDict(Vec<(Vec<u8>, BencodeType)>);

impl BencodeDict {
    pub fn new() -> BencodeDict {
        BencodeDict(Vec::new())
    }

    pub fn get(&self, key: &[u8]) -> Option<&BencodeType> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert an entry, replacing (in place) the value of an existing key
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: BencodeType) -> Option<BencodeType> {
        let key = key.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &BencodeType)> {
        self.0.iter().map(|(key, value)| (key.as_slice(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for BencodeDict {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(key, value)| other.get(key).is_some_and(|val| val == value))
    }
}

impl<K: Into<Vec<u8>>> FromIterator<(K, BencodeType)> for BencodeDict {
    fn from_iter<I: IntoIterator<Item = (K, BencodeType)>>(iter: I) -> Self {
        let mut dict = BencodeDict::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}

/// Parser error carrying the position and a readable reason
#[derive(Debug)]
struct DecodeError<'a> {
    input: &'a [u8],
    reason: String,
}

impl<'a> DecodeError<'a> {
    fn new(input: &'a [u8], reason: &str) -> DecodeError<'a> {
        DecodeError {
            input,
            reason: reason.to_string(),
        }
    }
}

impl<'a> ParseError<&'a [u8]> for DecodeError<'a> {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        let reason = match kind {
            ErrorKind::Digit => "expected ascii digits",
            ErrorKind::Eof => "byte string length exceeds remaining input",
            ErrorKind::Verify => "integer has a leading zero or is negative zero",
            ErrorKind::MapOpt => "number out of range",
            _ => kind.description(),
        };
        DecodeError::new(input, reason)
    }

    fn append(_: &'a [u8], _: ErrorKind, other: Self) -> Self {
        other
    }

    fn from_char(input: &'a [u8], c: char) -> Self {
        match input.is_empty() {
            true => DecodeError::new(input, "unexpected end of input"),
            false => DecodeError::new(input, &format!("expected '{}'", c)),
        }
    }
}

type ParseResult<'a, T> = IResult<&'a [u8], T, DecodeError<'a>>;

fn parse_ascii<T: FromStr>(digits: &[u8]) -> Option<T> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Deepest list/dict nesting accepted; the outermost value is depth 0
pub const MAX_DEPTH: usize = 128;

/// Reject `-0` and zero-padded integers
fn is_canonical_integer(digits: &[u8]) -> bool {
    !matches!(digits, [b'-', b'0', ..] | [b'0', _, ..])
}

fn byte_string(input: &[u8]) -> ParseResult<'_, &[u8]> {
    let (rest, length) = terminated(
        map_opt(digit1, parse_ascii::<usize>),
        char::<_, DecodeError>(':'),
    )
    .parse(input)?;
    take(length).parse(rest)
}

fn integer(input: &[u8]) -> ParseResult<'_, i64> {
    map_opt(
        delimited(
            char('i'),
            verify(
                recognize(pair(opt(char('-')), digit1)),
                is_canonical_integer,
            ),
            char('e'),
        ),
        parse_ascii::<i64>,
    )
    .parse(input)
}

fn list<'a>(input: &'a [u8], depth: usize) -> ParseResult<'a, BencodeType> {
    map(
        preceded(
            char('l'),
            many_till(|i: &'a [u8]| value(i, depth + 1), char('e')),
        ),
        |(items, _)| BencodeType::List(items),
    )
    .parse(input)
}

fn dict(input: &[u8], depth: usize) -> ParseResult<'_, BencodeType> {
    let (rest, _) = char::<_, DecodeError>('d').parse(input)?;
    let mut dict = BencodeDict::new();
    let mut remaining = rest;
    loop {
        if let Ok((rest, _)) = char::<_, DecodeError>('e').parse(remaining) {
            return Ok((rest, BencodeType::Dict(dict)));
        }
        let (rest, key) = match remaining.first() {
            Some(b'0'..=b'9') => byte_string(remaining)?,
            Some(_) => {
                return Err(nom::Err::Error(DecodeError::new(
                    remaining,
                    "dictionary key must be a byte string",
                )))
            }
            None => {
                return Err(nom::Err::Error(DecodeError::new(
                    remaining,
                    "unexpected end of input",
                )))
            }
        };
        if dict.contains_key(key) {
            return Err(nom::Err::Error(DecodeError::new(
                remaining,
                "duplicate dictionary key",
            )));
        }
        let (rest, val) = value(rest, depth + 1)?;
        dict.0.push((key.to_vec(), val));
        remaining = rest;
    }
}

fn value(input: &[u8], depth: usize) -> ParseResult<'_, BencodeType> {
    if depth > MAX_DEPTH && matches!(input.first(), Some(b'l' | b'd')) {
        return Err(nom::Err::Failure(DecodeError::new(
            input,
            "nesting exceeds maximum depth",
        )));
    }
    match input.first() {
        Some(b'0'..=b'9') => map(byte_string, |bytes: &[u8]| {
            BencodeType::ByteString(bytes.to_vec())
        })
        .parse(input),
        Some(b'i') => map(integer, BencodeType::Integer).parse(input),
        Some(b'l') => list(input, depth),
        Some(b'd') => dict(input, depth),
        Some(_) => Err(nom::Err::Error(DecodeError::new(input, "invalid value tag"))),
        None => Err(nom::Err::Error(DecodeError::new(
            input,
            "unexpected end of input",
        ))),
    }
}

/// Decode a single bencoded value starting at `offset`
///
/// Returns the value and the offset of the first byte after it.
pub fn decode(input: &[u8], offset: usize) -> Result<(BencodeType, usize)> {
    let start = input.get(offset..).ok_or_else(|| Error::MalformedEncoding {
        offset,
        reason: "offset beyond end of input".to_string(),
    })?;
    match value(start, 0) {
        Ok((rest, value)) => Ok((value, input.len() - rest.len())),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(Error::MalformedEncoding {
            offset: input.len() - e.input.len(),
            reason: e.reason,
        }),
        Err(nom::Err::Incomplete(_)) => Err(Error::MalformedEncoding {
            offset: input.len(),
            reason: "unexpected end of input".to_string(),
        }),
    }
}

/// Decode a complete bencoded document, rejecting trailing bytes
pub fn parse(input: &[u8]) -> Result<BencodeType> {
    let (value, end) = decode(input, 0)?;
    if end != input.len() {
        return Err(Error::MalformedEncoding {
            offset: end,
            reason: "trailing data after value".to_string(),
        });
    }
    Ok(value)
}
