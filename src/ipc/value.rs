//! Typed value codec.
//!
//! Every argument, return value and notification payload is a
//! [`TypedValue`]: a `u32` type tag followed by a tag-specific payload.
//! All integers are big-endian.
//!
//! ```text
//! None    [0]
//! UInt32  [1][u32]
//! Int32   [2][i32]
//! String  [3][u32 len][utf-8 bytes]
//! Dict    [4][u32 count]{[u32 len][key bytes][value]}*
//! List    [5][u32 count]{[value]}*
//! Binary  [6][u32 len][bytes]
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{IpcError, Result};
use super::message::MAX_PAYLOAD_LEN;

/// Maximum nesting of List/Dict values.
pub const MAX_DEPTH: usize = 32;

/// Type tag of a [`TypedValue`], also used to declare command signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueType {
    /// No value.
    None = 0,
    /// Unsigned 32-bit integer.
    UInt32 = 1,
    /// Signed 32-bit integer.
    Int32 = 2,
    /// UTF-8 string.
    String = 3,
    /// String-keyed map.
    Dict = 4,
    /// Ordered sequence.
    List = 5,
    /// Raw bytes.
    Binary = 6,
}

impl ValueType {
    /// Parse a wire tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::None,
            1 => Self::UInt32,
            2 => Self::Int32,
            3 => Self::String,
            4 => Self::Dict,
            5 => Self::List,
            6 => Self::Binary,
            _ => return None,
        })
    }

    /// Wire tag.
    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Tagged, self-describing unit of serialized data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypedValue {
    /// No value (also fills unused argument slots).
    #[default]
    None,
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Signed 32-bit integer.
    Int32(i32),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// Ordered sequence.
    List(Vec<TypedValue>),
    /// String-keyed map; keys are unique, order carries no meaning.
    Dict(BTreeMap<String, TypedValue>),
}

impl TypedValue {
    /// Type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::None => ValueType::None,
            Self::UInt32(_) => ValueType::UInt32,
            Self::Int32(_) => ValueType::Int32,
            Self::String(_) => ValueType::String,
            Self::Binary(_) => ValueType::Binary,
            Self::List(_) => ValueType::List,
            Self::Dict(_) => ValueType::Dict,
        }
    }

    /// Append the tagged encoding of this value to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.value_type().tag());
        match self {
            Self::None => {}
            Self::UInt32(v) => buf.put_u32(*v),
            Self::Int32(v) => buf.put_i32(*v),
            Self::String(s) => put_blob(buf, s.as_bytes()),
            Self::Binary(b) => put_blob(buf, b),
            Self::List(items) => {
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
            Self::Dict(map) => {
                buf.put_u32(map.len() as u32);
                for (key, value) in map {
                    put_blob(buf, key.as_bytes());
                    value.encode(buf);
                }
            }
        }
    }

    /// Encode into a fresh, cheaply cloneable buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Encode after checking that a peer will be able to decode the result.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::LimitExceeded`] if the value nests deeper than
    /// [`MAX_DEPTH`] or encodes to more than [`MAX_PAYLOAD_LEN`] bytes.
    pub fn to_wire_bytes(&self) -> Result<Bytes> {
        if self.nesting() > MAX_DEPTH {
            return Err(IpcError::LimitExceeded(format!(
                "nesting deeper than {MAX_DEPTH}"
            )));
        }
        let len = self.encoded_len();
        if len > MAX_PAYLOAD_LEN as usize {
            return Err(IpcError::LimitExceeded(format!(
                "{len} bytes encoded (max {MAX_PAYLOAD_LEN})"
            )));
        }
        Ok(self.to_bytes())
    }

    /// Size of the tagged encoding in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Self::None => 0,
            Self::UInt32(_) | Self::Int32(_) => 4,
            Self::String(s) => 4 + s.len(),
            Self::Binary(b) => 4 + b.len(),
            Self::List(items) => 4 + items.iter().map(Self::encoded_len).sum::<usize>(),
            Self::Dict(map) => {
                4 + map
                    .iter()
                    .map(|(key, value)| 4 + key.len() + value.encoded_len())
                    .sum::<usize>()
            }
        }
    }

    /// Number of nested List/Dict levels; scalars are 0.
    fn nesting(&self) -> usize {
        match self {
            Self::List(items) => 1 + items.iter().map(Self::nesting).max().unwrap_or(0),
            Self::Dict(map) => 1 + map.values().map(Self::nesting).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Decode one tagged value from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Malformed`] on truncation, unknown tags,
    /// oversized counts, invalid UTF-8, duplicate dict keys or excessive
    /// nesting.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        decode_value(buf, 0)
    }

    /// Borrow the integer if this is a `UInt32`.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the integer if this is an `Int32`.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the string if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the bytes if this is a `Binary`.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the elements if this is a `List`.
    pub fn as_list(&self) -> Option<&[TypedValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the map if this is a `Dict`.
    pub fn as_dict(&self) -> Option<&BTreeMap<String, TypedValue>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// `true` for `TypedValue::None`.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

fn put_blob<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_u32<B: Buf>(buf: &mut B, what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(IpcError::Malformed(format!(
            "truncated {what}: need 4 bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(buf.get_u32())
}

fn get_blob<B: Buf>(buf: &mut B, what: &str) -> Result<Vec<u8>> {
    let len = get_u32(buf, what)?;
    if len > MAX_PAYLOAD_LEN {
        return Err(IpcError::Malformed(format!("{what} length {len} too large")));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(IpcError::Malformed(format!(
            "truncated {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_string<B: Buf>(buf: &mut B, what: &str) -> Result<String> {
    let raw = get_blob(buf, what)?;
    String::from_utf8(raw).map_err(|e| IpcError::Malformed(format!("{what} is not UTF-8: {e}")))
}

/// Read an element count and reject counts that cannot fit in what is left.
fn get_count<B: Buf>(buf: &mut B, what: &str, min_element_len: usize) -> Result<usize> {
    let count = get_u32(buf, what)? as usize;
    if count.saturating_mul(min_element_len) > buf.remaining() {
        return Err(IpcError::Malformed(format!(
            "{what} count {count} larger than remaining payload"
        )));
    }
    Ok(count)
}

fn decode_value<B: Buf>(buf: &mut B, depth: usize) -> Result<TypedValue> {
    let tag = get_u32(buf, "type tag")?;
    let value_type = ValueType::from_tag(tag)
        .ok_or_else(|| IpcError::Malformed(format!("unknown type tag {tag}")))?;

    Ok(match value_type {
        ValueType::None => TypedValue::None,
        ValueType::UInt32 => TypedValue::UInt32(get_u32(buf, "uint32")?),
        ValueType::Int32 => TypedValue::Int32(get_u32(buf, "int32")? as i32),
        ValueType::String => TypedValue::String(get_string(buf, "string")?),
        ValueType::Binary => TypedValue::Binary(get_blob(buf, "binary")?),
        ValueType::List => {
            if depth >= MAX_DEPTH {
                return Err(IpcError::Malformed("list nested too deeply".to_string()));
            }
            let count = get_count(buf, "list", 4)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(buf, depth + 1)?);
            }
            TypedValue::List(items)
        }
        ValueType::Dict => {
            if depth >= MAX_DEPTH {
                return Err(IpcError::Malformed("dict nested too deeply".to_string()));
            }
            let count = get_count(buf, "dict", 8)?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = get_string(buf, "dict key")?;
                let value = decode_value(buf, depth + 1)?;
                if map.contains_key(&key) {
                    return Err(IpcError::Malformed(format!("duplicate dict key '{key}'")));
                }
                map.insert(key, value);
            }
            TypedValue::Dict(map)
        }
    })
}

impl From<u32> for TypedValue {
    fn from(v: u32) -> Self {
        Self::UInt32(v)
    }
}

impl From<i32> for TypedValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<&str> for TypedValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for TypedValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for TypedValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<Vec<TypedValue>> for TypedValue {
    fn from(v: Vec<TypedValue>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, TypedValue>> for TypedValue {
    fn from(v: BTreeMap<String, TypedValue>) -> Self {
        Self::Dict(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &TypedValue) -> TypedValue {
        let bytes = value.to_bytes();
        let mut slice = &bytes[..];
        let decoded = TypedValue::decode(&mut slice).unwrap();
        assert!(slice.is_empty(), "decoder left {} bytes", slice.len());
        decoded
    }

    #[test]
    fn test_scalars_round_trip() {
        for value in [
            TypedValue::None,
            TypedValue::UInt32(0),
            TypedValue::UInt32(u32::MAX),
            TypedValue::Int32(-1),
            TypedValue::Int32(i32::MIN),
        ] {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn test_string_and_binary_are_byte_exact() {
        let s = TypedValue::from("héllo\u{0}wörld");
        assert_eq!(round_trip(&s), s);

        let bin = TypedValue::Binary((0..=255u8).collect());
        assert_eq!(round_trip(&bin), bin);

        assert_eq!(round_trip(&TypedValue::from("")), TypedValue::from(""));
        assert_eq!(round_trip(&TypedValue::Binary(vec![])), TypedValue::Binary(vec![]));
    }

    #[test]
    fn test_nested_list_and_dict_round_trip() {
        let mut inner = BTreeMap::new();
        inner.insert("artist".to_string(), TypedValue::from("Nina"));
        inner.insert("duration".to_string(), TypedValue::UInt32(215_000));
        let value = TypedValue::List(vec![
            TypedValue::UInt32(3),
            TypedValue::Dict(inner),
            TypedValue::List(vec![TypedValue::None, TypedValue::Int32(-7)]),
        ]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_known_encoding_of_uint32() {
        let bytes = TypedValue::UInt32(14).to_bytes();
        assert_eq!(&bytes[..], &[0, 0, 0, 1, 0, 0, 0, 14]);
    }

    #[test]
    fn test_truncated_value_is_malformed() {
        let bytes = TypedValue::from("hello").to_bytes();
        for cut in 0..bytes.len() {
            let mut slice = &bytes[..cut];
            assert!(
                matches!(TypedValue::decode(&mut slice), Err(IpcError::Malformed(_))),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let mut slice: &[u8] = &[0, 0, 0, 99];
        assert!(matches!(TypedValue::decode(&mut slice), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_oversized_count_is_malformed() {
        let mut buf = Vec::new();
        buf.put_u32(ValueType::List.tag());
        buf.put_u32(u32::MAX);
        let mut slice = &buf[..];
        assert!(matches!(TypedValue::decode(&mut slice), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_large_collections_round_trip() {
        let list = TypedValue::List((0..70_000u32).map(TypedValue::UInt32).collect());
        let bytes = list.to_wire_bytes().unwrap();
        assert_eq!(bytes.len(), list.encoded_len());
        let mut slice = &bytes[..];
        assert_eq!(TypedValue::decode(&mut slice).unwrap(), list);

        let dict: BTreeMap<String, TypedValue> = (0..70_000u32)
            .map(|i| (format!("id{i}"), TypedValue::None))
            .collect();
        let dict = TypedValue::Dict(dict);
        assert_eq!(round_trip(&dict), dict);
    }

    #[test]
    fn test_wire_limits_checked_before_encoding() {
        let at_limit = TypedValue::Binary(vec![0; MAX_PAYLOAD_LEN as usize - 8]);
        let bytes = at_limit.to_wire_bytes().unwrap();
        assert_eq!(bytes.len(), MAX_PAYLOAD_LEN as usize);
        let mut slice = &bytes[..];
        assert_eq!(TypedValue::decode(&mut slice).unwrap(), at_limit);

        let too_big = TypedValue::Binary(vec![0; MAX_PAYLOAD_LEN as usize - 7]);
        assert!(matches!(too_big.to_wire_bytes(), Err(IpcError::LimitExceeded(_))));

        let mut deepest = TypedValue::None;
        for _ in 0..MAX_DEPTH {
            deepest = TypedValue::List(vec![deepest]);
        }
        let bytes = deepest.to_wire_bytes().unwrap();
        let mut slice = &bytes[..];
        assert_eq!(TypedValue::decode(&mut slice).unwrap(), deepest);

        let too_deep = TypedValue::List(vec![deepest]);
        assert!(matches!(too_deep.to_wire_bytes(), Err(IpcError::LimitExceeded(_))));
    }

    #[test]
    fn test_count_larger_than_payload_is_malformed() {
        let mut buf = Vec::new();
        buf.put_u32(ValueType::List.tag());
        buf.put_u32(1000);
        buf.put_u32(ValueType::None.tag());
        let mut slice = &buf[..];
        assert!(matches!(TypedValue::decode(&mut slice), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_duplicate_dict_key_is_malformed() {
        let mut buf = Vec::new();
        buf.put_u32(ValueType::Dict.tag());
        buf.put_u32(2);
        for _ in 0..2 {
            put_blob(&mut buf, b"k");
            TypedValue::UInt32(1).encode(&mut buf);
        }
        let mut slice = &buf[..];
        assert!(matches!(TypedValue::decode(&mut slice), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_invalid_utf8_string_is_malformed() {
        let mut buf = Vec::new();
        buf.put_u32(ValueType::String.tag());
        put_blob(&mut buf, &[0xff, 0xfe]);
        let mut slice = &buf[..];
        assert!(matches!(TypedValue::decode(&mut slice), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_excessive_nesting_is_malformed() {
        let mut value = TypedValue::None;
        for _ in 0..=MAX_DEPTH {
            value = TypedValue::List(vec![value]);
        }
        let bytes = value.to_bytes();
        let mut slice = &bytes[..];
        assert!(matches!(TypedValue::decode(&mut slice), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_accessors_match_variant() {
        assert_eq!(TypedValue::UInt32(4).as_u32(), Some(4));
        assert_eq!(TypedValue::Int32(4).as_u32(), None);
        assert_eq!(TypedValue::from("x").as_str(), Some("x"));
        assert!(TypedValue::default().is_none());
    }
}
