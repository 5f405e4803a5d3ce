//! Packet Model
//!
//! Tagged-variant application messages. Every packet carries a string key
//! naming the message plus exactly one of eight payload kinds.
//!
//! ## Body Encoding
//!
//! ```text
//! (PacketKind tag, key, value)   -- bincode tuple
//! ```
//!
//! Composite values travel as one explicit-length string:
//!
//! ```text
//! "<count>:<len1>:<len2>:...:<lenN>:<element1><element2>...<elementN>"
//! ```
//!
//! Lengths are UTF-8 byte counts, so element contents may contain any
//! character (including `:`) without colliding with the header.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Payload discriminator.
///
/// Declaration order is the wire tag order and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// `bool` payload.
    Boolean,
    /// Ordered list of primitives.
    Composite,
    /// `f64` payload.
    Double,
    /// No value, the key is the whole message.
    Empty,
    /// Enum variant carried by name.
    Enum,
    /// `f32` payload.
    Float,
    /// `i32` payload.
    Integer,
    /// UTF-8 string payload.
    String,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Packet payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Boolean value.
    Boolean(bool),
    /// Heterogeneous primitive list.
    Composite(Composite),
    /// Double-precision float.
    Double(f64),
    /// No value.
    Empty,
    /// Enum variant name.
    Enum(String),
    /// Single-precision float.
    Float(f32),
    /// Signed 32-bit integer.
    Integer(i32),
    /// String value.
    String(String),
}

impl Payload {
    /// Discriminator of this payload.
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::Boolean(_) => PacketKind::Boolean,
            Payload::Composite(_) => PacketKind::Composite,
            Payload::Double(_) => PacketKind::Double,
            Payload::Empty => PacketKind::Empty,
            Payload::Enum(_) => PacketKind::Enum,
            Payload::Float(_) => PacketKind::Float,
            Payload::Integer(_) => PacketKind::Integer,
            Payload::String(_) => PacketKind::String,
        }
    }
}

/// Packet model errors.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// Body could not be encoded or decoded.
    #[error("packet body error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Composite header or element section is inconsistent.
    #[error("malformed composite value: {0}")]
    MalformedComposite(&'static str),

    /// Requested composite index is out of range.
    #[error("composite element {0} is missing")]
    MissingElement(usize),

    /// Composite element does not parse as the requested type.
    #[error("composite element {index} is not a valid {expected}")]
    InvalidElement {
        /// Element position.
        index: usize,
        /// Requested type name.
        expected: &'static str,
    },
}

// =============================================================================
// COMPOSITE
// =============================================================================

/// Ordered list of primitive values sent under a single key.
///
/// Elements are kept in their textual wire form. Typed constructors and
/// getters decide how each position is interpreted; the receiver knows the
/// shape from the packet key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composite {
    elements: Vec<String>,
}

impl Composite {
    /// Empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a boolean (builder form).
    pub fn with_bool(mut self, value: bool) -> Self {
        self.push_bool(value);
        self
    }

    /// Append an integer (builder form).
    pub fn with_int(mut self, value: i32) -> Self {
        self.push_int(value);
        self
    }

    /// Append a float (builder form).
    pub fn with_float(mut self, value: f32) -> Self {
        self.push_float(value);
        self
    }

    /// Append a double (builder form).
    pub fn with_double(mut self, value: f64) -> Self {
        self.push_double(value);
        self
    }

    /// Append an enum variant by name (builder form).
    pub fn with_enum<E: fmt::Display>(mut self, value: E) -> Self {
        self.push_enum(value);
        self
    }

    /// Append a string (builder form).
    pub fn with_string(mut self, value: impl Into<String>) -> Self {
        self.push_string(value);
        self
    }

    /// Append a boolean.
    pub fn push_bool(&mut self, value: bool) {
        self.elements.push(value.to_string());
    }

    /// Append an integer.
    pub fn push_int(&mut self, value: i32) {
        self.elements.push(value.to_string());
    }

    /// Append a float. `Display` for floats is the shortest exact form.
    pub fn push_float(&mut self, value: f32) {
        self.elements.push(value.to_string());
    }

    /// Append a double.
    pub fn push_double(&mut self, value: f64) {
        self.elements.push(value.to_string());
    }

    /// Append an enum variant by name.
    pub fn push_enum<E: fmt::Display>(&mut self, value: E) {
        self.elements.push(value.to_string());
    }

    /// Append a string.
    pub fn push_string(&mut self, value: impl Into<String>) {
        self.elements.push(value.into());
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True when there are no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Raw element strings.
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// Element at `index` as a string.
    pub fn get_str(&self, index: usize) -> Result<&str, PacketError> {
        self.elements
            .get(index)
            .map(String::as_str)
            .ok_or(PacketError::MissingElement(index))
    }

    /// Element at `index` as a boolean.
    pub fn get_bool(&self, index: usize) -> Result<bool, PacketError> {
        self.parse_at(index, "bool")
    }

    /// Element at `index` as an integer.
    pub fn get_int(&self, index: usize) -> Result<i32, PacketError> {
        self.parse_at(index, "integer")
    }

    /// Element at `index` as a float.
    pub fn get_float(&self, index: usize) -> Result<f32, PacketError> {
        self.parse_at(index, "float")
    }

    /// Element at `index` as a double.
    pub fn get_double(&self, index: usize) -> Result<f64, PacketError> {
        self.parse_at(index, "double")
    }

    /// Element at `index` as an enum variant.
    pub fn get_enum<E: FromStr>(&self, index: usize) -> Result<E, PacketError> {
        self.parse_at(index, "enum variant")
    }

    fn parse_at<T: FromStr>(&self, index: usize, expected: &'static str) -> Result<T, PacketError> {
        self.get_str(index)?
            .parse()
            .map_err(|_| PacketError::InvalidElement { index, expected })
    }

    /// Encode into the explicit-length wire string.
    pub fn encode(&self) -> String {
        let body_len: usize = self.elements.iter().map(String::len).sum();
        let mut out = String::with_capacity(body_len + 4 * (self.elements.len() + 1));

        out.push_str(&self.elements.len().to_string());
        out.push(':');
        for element in &self.elements {
            out.push_str(&element.len().to_string());
            out.push(':');
        }
        for element in &self.elements {
            out.push_str(element);
        }
        out
    }

    /// Decode an explicit-length wire string.
    pub fn decode(raw: &str) -> Result<Self, PacketError> {
        let (count, mut rest) = split_header_field(raw)?;
        let count: usize = count
            .parse()
            .map_err(|_| PacketError::MalformedComposite("element count is not a number"))?;

        // every declared element needs at least "0:" in the header
        if count > raw.len() / 2 {
            return Err(PacketError::MalformedComposite("element count exceeds value size"));
        }

        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            let (len, tail) = split_header_field(rest)?;
            let len: usize = len
                .parse()
                .map_err(|_| PacketError::MalformedComposite("element length is not a number"))?;
            lengths.push(len);
            rest = tail;
        }

        let mut elements = Vec::with_capacity(count);
        for len in lengths {
            let element = rest
                .get(..len)
                .ok_or(PacketError::MalformedComposite("element length out of bounds"))?;
            elements.push(element.to_owned());
            rest = &rest[len..];
        }

        if !rest.is_empty() {
            return Err(PacketError::MalformedComposite("trailing data after elements"));
        }

        Ok(Self { elements })
    }
}

fn split_header_field(raw: &str) -> Result<(&str, &str), PacketError> {
    raw.split_once(':')
        .ok_or(PacketError::MalformedComposite("missing ':' separator"))
}

// =============================================================================
// PACKET
// =============================================================================

/// One application message: key plus typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    key: String,
    payload: Payload,
}

impl Packet {
    /// Create a packet from key and payload.
    pub fn new(key: impl Into<String>, payload: Payload) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Packet whose key is the whole message.
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, Payload::Empty)
    }

    /// Boolean packet.
    pub fn boolean(key: impl Into<String>, value: bool) -> Self {
        Self::new(key, Payload::Boolean(value))
    }

    /// Integer packet.
    pub fn integer(key: impl Into<String>, value: i32) -> Self {
        Self::new(key, Payload::Integer(value))
    }

    /// Float packet.
    pub fn float(key: impl Into<String>, value: f32) -> Self {
        Self::new(key, Payload::Float(value))
    }

    /// Double packet.
    pub fn double(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, Payload::Double(value))
    }

    /// String packet.
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, Payload::String(value.into()))
    }

    /// Enum packet, carrying the variant name.
    pub fn enumeration<E: fmt::Display>(key: impl Into<String>, value: E) -> Self {
        Self::new(key, Payload::Enum(value.to_string()))
    }

    /// Composite packet.
    pub fn composite(key: impl Into<String>, value: Composite) -> Self {
        Self::new(key, Payload::Composite(value))
    }

    /// Message key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Payload discriminator.
    pub fn kind(&self) -> PacketKind {
        self.payload.kind()
    }

    /// Split into key and payload.
    pub fn into_parts(self) -> (String, Payload) {
        (self.key, self.payload)
    }

    /// Boolean value, if this is a boolean packet.
    pub fn as_bool(&self) -> Option<bool> {
        match self.payload {
            Payload::Boolean(v) => Some(v),
            _ => None,
        }
    }

    /// Integer value, if this is an integer packet.
    pub fn as_int(&self) -> Option<i32> {
        match self.payload {
            Payload::Integer(v) => Some(v),
            _ => None,
        }
    }

    /// Float value, if this is a float packet.
    pub fn as_float(&self) -> Option<f32> {
        match self.payload {
            Payload::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Double value, if this is a double packet.
    pub fn as_double(&self) -> Option<f64> {
        match self.payload {
            Payload::Double(v) => Some(v),
            _ => None,
        }
    }

    /// String value, if this is a string packet.
    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::String(v) => Some(v),
            _ => None,
        }
    }

    /// Enum variant name, if this is an enum packet.
    pub fn as_enum_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Enum(v) => Some(v),
            _ => None,
        }
    }

    /// Parse the enum variant name into `E`.
    pub fn as_enum<E: FromStr>(&self) -> Option<E> {
        self.as_enum_name()?.parse().ok()
    }

    /// Composite value, if this is a composite packet.
    pub fn as_composite(&self) -> Option<&Composite> {
        match &self.payload {
            Payload::Composite(v) => Some(v),
            _ => None,
        }
    }

    /// Serialize the packet body (pre-compression, pre-encryption).
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a packet body.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        Ok(bincode::deserialize(data)?)
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.payload.kind())?;
        tuple.serialize_element(&self.key)?;
        match &self.payload {
            Payload::Boolean(v) => tuple.serialize_element(v)?,
            Payload::Composite(v) => tuple.serialize_element(&v.encode())?,
            Payload::Double(v) => tuple.serialize_element(v)?,
            Payload::Empty => tuple.serialize_element(&())?,
            Payload::Enum(v) | Payload::String(v) => tuple.serialize_element(v)?,
            Payload::Float(v) => tuple.serialize_element(v)?,
            Payload::Integer(v) => tuple.serialize_element(v)?,
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Packet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_tuple(3, PacketVisitor)
    }
}

struct PacketVisitor;

impl<'de> Visitor<'de> for PacketVisitor {
    type Value = Packet;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a (kind, key, value) packet tuple")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Packet, A::Error> {
        let kind: PacketKind = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let key: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

        let payload = match kind {
            PacketKind::Boolean => Payload::Boolean(next_value(&mut seq)?),
            PacketKind::Composite => {
                let raw: String = next_value(&mut seq)?;
                Payload::Composite(Composite::decode(&raw).map_err(de::Error::custom)?)
            }
            PacketKind::Double => Payload::Double(next_value(&mut seq)?),
            PacketKind::Empty => {
                next_value::<A, ()>(&mut seq)?;
                Payload::Empty
            }
            PacketKind::Enum => Payload::Enum(next_value(&mut seq)?),
            PacketKind::Float => Payload::Float(next_value(&mut seq)?),
            PacketKind::Integer => Payload::Integer(next_value(&mut seq)?),
            PacketKind::String => Payload::String(next_value(&mut seq)?),
        };

        Ok(Packet { key, payload })
    }
}

fn next_value<'de, A, T>(seq: &mut A) -> Result<T, A::Error>
where
    A: SeqAccess<'de>,
    T: Deserialize<'de>,
{
    seq.next_element()?
        .ok_or_else(|| de::Error::invalid_length(2, &"a packet value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_wire_format() {
        let composite = Composite::new()
            .with_int(7)
            .with_string("alice")
            .with_bool(true);

        assert_eq!(composite.encode(), "3:1:5:4:7alicetrue");
    }

    #[test]
    fn test_empty_composite() {
        let composite = Composite::new();
        assert_eq!(composite.encode(), "0:");
        assert_eq!(Composite::decode("0:").unwrap(), composite);
    }

    #[test]
    fn test_composite_elements_may_contain_separator() {
        let composite = Composite::new()
            .with_string("a:b:c")
            .with_string("")
            .with_string("12:");

        let decoded = Composite::decode(&composite.encode()).unwrap();
        assert_eq!(decoded.get_str(0).unwrap(), "a:b:c");
        assert_eq!(decoded.get_str(1).unwrap(), "");
        assert_eq!(decoded.get_str(2).unwrap(), "12:");
    }

    #[test]
    fn test_composite_multibyte_lengths() {
        let composite = Composite::new().with_string("żółw").with_string("🐢");
        let decoded = Composite::decode(&composite.encode()).unwrap();
        assert_eq!(decoded, composite);
    }

    #[test]
    fn test_composite_typed_getters() {
        let composite = Composite::new()
            .with_float(1.5)
            .with_double(-0.1)
            .with_int(-42)
            .with_enum(PacketKind::Float)
            .with_bool(false);

        assert_eq!(composite.get_float(0).unwrap(), 1.5);
        assert_eq!(composite.get_double(1).unwrap(), -0.1);
        assert_eq!(composite.get_int(2).unwrap(), -42);
        assert_eq!(composite.get_str(3).unwrap(), "Float");
        assert!(!composite.get_bool(4).unwrap());

        assert!(matches!(composite.get_int(0), Err(PacketError::InvalidElement { index: 0, .. })));
        assert!(matches!(composite.get_str(9), Err(PacketError::MissingElement(9))));
    }

    #[test]
    fn test_composite_rejects_malformed() {
        for raw in ["", "x:", "2:1:", "1:5:abc", "1:1:ab", "99999999:"] {
            assert!(
                matches!(Composite::decode(raw), Err(PacketError::MalformedComposite(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn test_composite_rejects_split_char() {
        // length 1 lands inside the two-byte 'ł'
        assert!(Composite::decode("1:1:ł").is_err());
    }

    #[test]
    fn test_packet_body_roundtrip_all_kinds() {
        let packets = vec![
            Packet::boolean("B", true),
            Packet::composite("C", Composite::new().with_int(1).with_string("two")),
            Packet::double("D", 2.5),
            Packet::empty("E"),
            Packet::enumeration("N", PacketKind::Integer),
            Packet::float("F", -3.25),
            Packet::integer("I", i32::MIN),
            Packet::string("S", ""),
        ];

        for packet in packets {
            let bytes = packet.to_bytes().unwrap();
            let parsed = Packet::from_bytes(&bytes).unwrap();
            assert_eq!(parsed, packet);
        }
    }

    #[test]
    fn test_packet_body_starts_with_tag() {
        let bytes = Packet::empty("K").to_bytes().unwrap();
        // bincode encodes the unit variant index as a u32
        assert_eq!(&bytes[..4], &3u32.to_le_bytes());
    }

    #[test]
    fn test_packet_json_shape() {
        let json = serde_json::to_string(&Packet::integer("EmailVerifyFail", 4)).unwrap();
        assert_eq!(json, r#"["Integer","EmailVerifyFail",4]"#);

        let parsed: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_int(), Some(4));
    }

    #[test]
    fn test_packet_rejects_truncated_body() {
        let bytes = Packet::string("S", "hello").to_bytes().unwrap();
        assert!(Packet::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_accessors_match_kind() {
        let packet = Packet::float("TransformRotation", 90.0);
        assert_eq!(packet.kind(), PacketKind::Float);
        assert_eq!(packet.as_float(), Some(90.0));
        assert_eq!(packet.as_int(), None);
        assert!(packet.as_composite().is_none());
        assert_eq!(packet.as_enum_name(), None);
    }
}
