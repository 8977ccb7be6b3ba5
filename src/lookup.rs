//! Canonical byte-encoding for parameter lookup tuples.
//!
//! Lookup values are length-prefixed concatenations of canonically-typed
//! primitive values such that equality of encoded bytes implies equality of
//! logical tuples. The encoding is part of the persisted schema (it's the
//! `bucket_parameters` secondary index key) and must be stable across
//! process restarts and platforms, so every multi-byte integer is written
//! big-endian rather than native-endian.

use crate::types::SqliteValue;

/// Type tags for the canonical encoding. Values are never reordered or
/// reused across releases: changing this would require a schema version
/// bump per the external interface contract.
#[repr(u8)]
enum Tag {
    Null = 0,
    Integer = 1,
    Real = 2,
    Text = 3,
    BigInt = 4,
}

/// A canonically encoded lookup tuple, used as a `bucket_parameters`
/// secondary index key.
pub type LookupBytes = Vec<u8>;

/// One element of a lookup tuple. `BigInt` is distinct from `Integer` so
/// that a parameter derived from a 64-bit source column round-trips
/// without precision loss through a JSON intermediate representation.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupValue {
    Null,
    Number(f64),
    String(String),
    BigInt(i64),
}

impl From<&SqliteValue> for LookupValue {
    fn from(v: &SqliteValue) -> Self {
        match v {
            SqliteValue::Null => LookupValue::Null,
            SqliteValue::Integer(i) => LookupValue::BigInt(*i),
            SqliteValue::Real(f) => LookupValue::Number(*f),
            SqliteValue::Text(s) => LookupValue::String(s.clone()),
            SqliteValue::Blob(b) => LookupValue::String(hex(b)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Encode a tuple of lookup values as length-prefixed canonical bytes.
///
/// Format per value: `[tag: u8][len: u32 BE][payload]`, except `Null` which
/// has no payload. Integers and floats are written as their fixed-width
/// big-endian bit patterns (no length prefix needed since the width is
/// implied by the tag), so two distinct numeric types never alias.
pub fn encode_lookup(values: &[LookupValue]) -> LookupBytes {
    let mut out = Vec::new();
    out.extend_from_slice(&(values.len() as u32).to_be_bytes());
    for value in values {
        match value {
            LookupValue::Null => {
                out.push(Tag::Null as u8);
            }
            LookupValue::Number(n) => {
                out.push(Tag::Real as u8);
                out.extend_from_slice(&n.to_bits().to_be_bytes());
            }
            LookupValue::BigInt(i) => {
                out.push(Tag::BigInt as u8);
                out.extend_from_slice(&i.to_be_bytes());
            }
            LookupValue::String(s) => {
                out.push(Tag::Text as u8);
                let bytes = s.as_bytes();
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }
    out
}

/// Build the lookup key for a single bucket-definition name plus its
/// parameter values, e.g. `lookup("by_region", &[LookupValue::String("eu".into())])`.
/// The definition name is folded into the encoding so that two different
/// parameter queries with coincidentally equal argument tuples never alias.
pub fn encode_named_lookup(name: &str, values: &[LookupValue]) -> LookupBytes {
    let mut out = Vec::new();
    let name_bytes = name.as_bytes();
    out.push(Tag::Integer as u8); // marks start of name segment, distinct tag space
    out.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(name_bytes);
    out.extend_from_slice(&encode_lookup(values));
    out
}
