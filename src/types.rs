//! Core value and identifier types shared across the bucket storage core.
//!
//! Mirrors the teacher's `Value` enum (tagged sum over SQL primitives) but
//! generalized for CDC rows: a `Blob` variant carries raw replica-identity
//! bytes, and `Boolean`/`Json` are dropped as column-level variants since
//! this domain represents whole rows as `serde_json::Value` at the
//! `EvaluatedRow` boundary rather than as a SQL column type.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A sync-rule group identifier. Every entity in the store is scoped to one.
pub type GroupId = i64;

/// A bucket name, e.g. `by_region["eu"]`. Opaque to the core.
pub type Bucket = String;

/// Strictly monotonic 64-bit operation identifier, assigned from a
/// per-group counter at flush time. Rendered as a decimal string on the
/// wire per the external interface contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

impl OpId {
    pub const ZERO: OpId = OpId(0);

    pub fn next(self) -> OpId {
        OpId(self.0 + 1)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for OpId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Op-ids are rendered as decimal strings on the wire: JS clients
        // cannot represent a full u64 as a JSON number without precision
        // loss.
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for OpId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>().map(OpId).map_err(serde::de::Error::custom)
    }
}

/// A 32-bit fingerprint of an op's canonical bytes, stable across replays.
/// Rendered on the wire as a signed 32-bit integer (two's-complement
/// reinterpretation of the underlying `u32`), per the external interface
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checksum(pub u32);

impl Checksum {
    pub fn zero() -> Self {
        Checksum(0)
    }

    /// Modular sum of two checksums, per invariant I5.
    pub fn add(self, other: Checksum) -> Checksum {
        Checksum(self.0.wrapping_add(other.0))
    }

    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = i32::deserialize(deserializer)?;
        Ok(Checksum(v as u32))
    }
}

/// A row value as seen by the core: replica-identity columns and stored
/// op data both reduce to this sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SqliteValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl PartialEq for SqliteValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SqliteValue::Null, SqliteValue::Null) => true,
            (SqliteValue::Integer(a), SqliteValue::Integer(b)) => a == b,
            (SqliteValue::Real(a), SqliteValue::Real(b)) => a == b,
            (SqliteValue::Text(a), SqliteValue::Text(b)) => a == b,
            (SqliteValue::Blob(a), SqliteValue::Blob(b)) => a == b,
            (SqliteValue::Integer(a), SqliteValue::Real(b))
            | (SqliteValue::Real(b), SqliteValue::Integer(a)) => (*a as f64) == *b,
            _ => false,
        }
    }
}

impl PartialOrd for SqliteValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (SqliteValue::Null, SqliteValue::Null) => Some(Ordering::Equal),
            (SqliteValue::Null, _) => Some(Ordering::Less),
            (_, SqliteValue::Null) => Some(Ordering::Greater),
            (SqliteValue::Integer(a), SqliteValue::Integer(b)) => a.partial_cmp(b),
            (SqliteValue::Real(a), SqliteValue::Real(b)) => a.partial_cmp(b),
            (SqliteValue::Text(a), SqliteValue::Text(b)) => a.partial_cmp(b),
            (SqliteValue::Blob(a), SqliteValue::Blob(b)) => a.partial_cmp(b),
            (SqliteValue::Integer(a), SqliteValue::Real(b)) => (*a as f64).partial_cmp(b),
            (SqliteValue::Real(a), SqliteValue::Integer(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for SqliteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqliteValue::Null => write!(f, "NULL"),
            SqliteValue::Integer(v) => write!(f, "{}", v),
            SqliteValue::Real(v) => write!(f, "{}", v),
            SqliteValue::Text(v) => write!(f, "{}", v),
            SqliteValue::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl SqliteValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqliteValue::Null)
    }

    /// Convert to the JSON-compatible subset of values. Blobs have no JSON
    /// representation and are base64-encoded as a fallback so that an
    /// `EvaluatedRow`'s `data` (a `serde_json::Value`) can still embed one
    /// if a sync rule surfaces a replica-identity blob column verbatim.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqliteValue::Null => serde_json::Value::Null,
            SqliteValue::Integer(v) => serde_json::Value::from(*v),
            SqliteValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqliteValue::Text(v) => serde_json::Value::String(v.clone()),
            SqliteValue::Blob(v) => serde_json::Value::String(hex_encode(v)),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
