//! Bencode codec used by bundle descriptors
//!
//! - Integers: i<number>e
//! - Byte strings: <length>:<bytes>
//! - Lists: l<items>e
//! - Dictionaries: d<key><value>...e, keys are byte strings in sorted order
//!
//! Dictionaries are held in a `BTreeMap`, so encoding is canonical and the
//! info hash of a re-encoded `info` dictionary matches the original bytes.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug, Error, PartialEq)]
pub enum BencodeError {
    #[error("Unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("Invalid integer at byte {0}")]
    InvalidInteger(usize),
    #[error("Invalid string length at byte {0}")]
    InvalidLength(usize),
    #[error("Unexpected byte {byte:#04x} at {pos}")]
    UnexpectedByte { byte: u8, pos: usize },
    #[error("Trailing data after byte {0}")]
    TrailingData(usize),
}

impl Value {
    /// Decode a complete buffer; anything after the first value is an error
    pub fn decode(data: &[u8]) -> Result<Self, BencodeError> {
        let mut decoder = Decoder { data, pos: 0 };
        let value = decoder.value()?;
        if decoder.pos != data.len() {
            return Err(BencodeError::TrailingData(decoder.pos));
        }
        Ok(value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => encode_bytes(b, out),
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(dict) => {
                out.push(b'd');
                for (key, value) in dict {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn str(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Builder for dictionaries with `&str` keys
#[derive(Debug, Default)]
pub struct DictBuilder(BTreeMap<Vec<u8>, Value>);

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.as_bytes().to_vec(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Dict(self.0)
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value()?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let byte = self.peek()?;
                    if !byte.is_ascii_digit() {
                        return Err(BencodeError::UnexpectedByte {
                            byte,
                            pos: self.pos,
                        });
                    }
                    let key = self.bytes()?;
                    let value = self.value()?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    /// Digits up to (not including) `terminator`, advancing past it
    fn digits(&mut self, terminator: u8) -> Result<&'a str, BencodeError> {
        let data: &'a [u8] = self.data;
        let start = self.pos;
        let len = data[start..]
            .iter()
            .position(|&b| b == terminator)
            .ok_or(BencodeError::UnexpectedEof(data.len()))?;
        self.pos = start + len + 1;
        std::str::from_utf8(&data[start..start + len])
            .map_err(|_| BencodeError::InvalidInteger(start))
    }

    fn int(&mut self) -> Result<Value, BencodeError> {
        let start = self.pos;
        self.pos += 1;
        let text = self.digits(b'e')?;
        let canonical = !text.is_empty()
            && text != "-0"
            && !(text.len() > 1 && text.starts_with('0'))
            && !text.starts_with("-0");
        if !canonical {
            return Err(BencodeError::InvalidInteger(start));
        }
        text.parse()
            .map(Value::Int)
            .map_err(|_| BencodeError::InvalidInteger(start))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let len: usize = self
            .digits(b':')?
            .parse()
            .map_err(|_| BencodeError::InvalidLength(start))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;
        let out = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }
}
