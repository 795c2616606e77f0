//! Ticket class descriptions and their wire encoding.
//!
//! A [`TicketSpec`] is immutable once built. Construction goes through
//! [`TicketSpecParams`], which lists every recognized option with its default,
//! or through [`TicketSpec::from_json`] for loosely typed key/value input. Both
//! paths validate every field once and fail with a [`ValidationError`] naming
//! the offending field.
//!
//! # Wire layout
//!
//! ```text
//! version:u16 | descKind:u8 | descLen:u16 | desc | unitLen:u8 | unit
//!   | value:i64 | book_of:u16 | time_to_begin:u64 | time_to_end:u64
//!   | expire_after:u64 | optionBits:u16
//! ```
//!
//! # Example
//!
//! ```
//! use ticket_ledger_core::spec::{Description, TicketSpec, TicketSpecParams};
//!
//! let spec = TicketSpec::new(TicketSpecParams {
//!     value: 270,
//!     unit: "yen".to_string(),
//!     book_of: 12,
//!     ..TicketSpecParams::new(Description::text("Subway Off-Peak Multiple"))
//! })
//! .unwrap();
//!
//! let bytes = spec.serialize();
//! let (end, decoded) = TicketSpec::deserialize(&bytes, 0).unwrap();
//! assert_eq!(end, bytes.len());
//! assert_eq!(decoded, spec);
//! ```

use crate::codec::{DecodeError, Reader, Writer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Cursor;
use thiserror::Error;

/// Current spec format version.
pub const VERSION_CURRENT: u16 = 0;

/// Largest time value accepted for any time field (signed 64-bit maximum).
pub const MAX_TIME: u64 = i64::MAX as u64;

/// Largest encoded description, bounded by its `u16` length prefix.
pub const MAX_DESCRIPTION_LEN: usize = u16::MAX as usize;

/// Largest encoded unit, bounded by its `u8` length prefix.
pub const MAX_UNIT_LEN: usize = u8::MAX as usize;

const DESC_BINARY: u8 = 0;
const DESC_STRUCTURED: u8 = 1;
const DESC_STRING: u8 = 2;

const O_BIT_DIVISIBLE: u16 = 0b001;
const O_BIT_TRANSFERABLE: u16 = 0b010;
const O_BIT_RELATIVE_TIME: u16 = 0b100;

/// A `TicketSpec` field failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field}: {reason}")]
pub struct ValidationError {
    /// Name of the offending field.
    pub field: &'static str,
    /// What was wrong with it.
    pub reason: String,
}

impl ValidationError {
    /// Create a validation error for `field`.
    #[must_use]
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Human or machine readable description of a ticket class.
#[derive(Clone, Debug, PartialEq)]
pub enum Description {
    /// Opaque bytes.
    Binary(Vec<u8>),
    /// Key/value document, carried as `MessagePack` on the wire.
    Structured(Map<String, Value>),
    /// UTF-8 text.
    Text(String),
}

impl Description {
    /// Text description.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    const fn kind(&self) -> u8 {
        match self {
            Self::Binary(_) => DESC_BINARY,
            Self::Structured(_) => DESC_STRUCTURED,
            Self::Text(_) => DESC_STRING,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, ValidationError> {
        match self {
            Self::Binary(bytes) => Ok(bytes.clone()),
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Structured(map) => rmp_serde::to_vec(map)
                .map_err(|e| ValidationError::new("description", e.to_string())),
        }
    }

    fn decode(kind: u8, raw: &[u8]) -> Result<Self, DecodeError> {
        match kind {
            DESC_BINARY => Ok(Self::Binary(raw.to_vec())),
            DESC_STRING => std::str::from_utf8(raw)
                .map(|s| Self::Text(s.to_string()))
                .map_err(|_| DecodeError::InvalidUtf8("description")),
            DESC_STRUCTURED => {
                let mut cursor = Cursor::new(raw);
                let map = Map::<String, Value>::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor))
                    .map_err(|e| DecodeError::InvalidStructure(e.to_string()))?;
                // the document must fill the declared length exactly
                let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
                if consumed != raw.len() {
                    return Err(DecodeError::InconsistentLength {
                        what: "description",
                        expected: consumed,
                        actual: raw.len(),
                    });
                }
                Ok(Self::Structured(map))
            }
            value => Err(DecodeError::UnknownDiscriminant {
                what: "description kind",
                value,
            }),
        }
    }
}

/// Every option recognized by [`TicketSpec::new`], with its default.
///
/// Start from [`TicketSpecParams::new`] and override fields with struct update
/// syntax.
#[derive(Clone, Debug, PartialEq)]
pub struct TicketSpecParams {
    /// Format version. Default [`VERSION_CURRENT`].
    pub version: u16,
    /// Description of the ticket class. Required.
    pub description: Description,
    /// Nominal worth. Default 0.
    pub value: i64,
    /// Unit of `value`, at most 255 bytes encoded. Default empty.
    pub unit: String,
    /// "One of N" grouping, at least 1. Default 1.
    pub book_of: u16,
    /// Start of the validity window, epoch seconds. Default 0.
    pub time_to_begin: u64,
    /// End of the validity window, epoch seconds, greater than 0. Default [`MAX_TIME`].
    pub time_to_end: u64,
    /// Relative expiry in seconds. Default 0.
    pub expire_after: u64,
    /// Default false.
    pub divisible: bool,
    /// Default false.
    pub transferable: bool,
    /// Default false.
    pub relative_time: bool,
}

impl TicketSpecParams {
    /// Defaults for everything except the description.
    #[must_use]
    pub const fn new(description: Description) -> Self {
        Self {
            version: VERSION_CURRENT,
            description,
            value: 0,
            unit: String::new(),
            book_of: 1,
            time_to_begin: 0,
            time_to_end: MAX_TIME,
            expire_after: 0,
            divisible: false,
            transferable: false,
            relative_time: false,
        }
    }
}

/// Immutable, validated description of a ticket class.
///
/// Two specs are equal iff every field is equal.
#[derive(Clone, Debug, PartialEq)]
pub struct TicketSpec {
    version: u16,
    description: Description,
    raw_description: Vec<u8>,
    value: i64,
    unit: String,
    book_of: u16,
    time_to_begin: u64,
    time_to_end: u64,
    expire_after: u64,
    divisible: bool,
    transferable: bool,
    relative_time: bool,
}

impl TicketSpec {
    /// Validate `params` and build a spec.
    ///
    /// # Errors
    ///
    /// [`ValidationError`] naming the first field that violates its bounds.
    pub fn new(params: TicketSpecParams) -> Result<Self, ValidationError> {
        let raw_description = params.description.encode()?;
        if raw_description.len() > MAX_DESCRIPTION_LEN {
            return Err(ValidationError::new("description", "is too long"));
        }
        if params.unit.len() > MAX_UNIT_LEN {
            return Err(ValidationError::new("unit", "is too long"));
        }
        if params.book_of == 0 {
            return Err(ValidationError::new("book_of", "must be at least 1"));
        }
        if params.time_to_begin > MAX_TIME {
            return Err(ValidationError::new("time_to_begin", "out of range"));
        }
        if params.time_to_end == 0 || params.time_to_end > MAX_TIME {
            return Err(ValidationError::new("time_to_end", "out of range"));
        }
        if params.expire_after > MAX_TIME {
            return Err(ValidationError::new("expire_after", "out of range"));
        }

        Ok(Self {
            version: params.version,
            description: params.description,
            raw_description,
            value: params.value,
            unit: params.unit,
            book_of: params.book_of,
            time_to_begin: params.time_to_begin,
            time_to_end: params.time_to_end,
            expire_after: params.expire_after,
            divisible: params.divisible,
            transferable: params.transferable,
            relative_time: params.relative_time,
        })
    }

    /// Build a spec from a loosely typed key/value document.
    ///
    /// Recognized keys are `description` (required), `value`, `unit`,
    /// `book_of`, `time_to_begin`, `time_to_end`, `expire_after`,
    /// `option_divisible`, `option_transferable`, `option_relative_time` and
    /// `version`. Missing keys take the [`TicketSpecParams`] defaults.
    ///
    /// # Errors
    ///
    /// [`ValidationError`] when a key holds the wrong type or an out-of-range value.
    pub fn from_json(doc: &Value) -> Result<Self, ValidationError> {
        let obj = doc
            .as_object()
            .ok_or_else(|| ValidationError::new("description", "spec must be a key/value map"))?;

        let description = match obj.get("description") {
            Some(Value::String(s)) => Description::Text(s.clone()),
            Some(Value::Object(map)) => Description::Structured(map.clone()),
            Some(Value::Array(items)) => Description::Binary(
                items
                    .iter()
                    .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| ValidationError::new("description", "byte array holds a non-byte"))?,
            ),
            Some(_) => {
                return Err(ValidationError::new(
                    "description",
                    "must be a string, map or bytes",
                ));
            }
            None => return Err(ValidationError::new("description", "is required")),
        };

        let defaults = TicketSpecParams::new(description);
        let params = TicketSpecParams {
            version: opt_int(obj, "version")?
                .map(|v| u16::try_from(v).map_err(|_| ValidationError::new("version", "out of range")))
                .transpose()?
                .unwrap_or(defaults.version),
            value: match obj.get("value") {
                None => defaults.value,
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| ValidationError::new("value", "must be a signed 64-bit integer"))?,
            },
            unit: match obj.get("unit") {
                None => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(_) => return Err(ValidationError::new("unit", "must be a string")),
            },
            book_of: opt_int(obj, "book_of")?
                .map(|v| {
                    u16::try_from(v)
                        .ok()
                        .filter(|&b| b > 0)
                        .ok_or_else(|| ValidationError::new("book_of", "out of range"))
                })
                .transpose()?
                .unwrap_or(defaults.book_of),
            time_to_begin: opt_time(obj, "time_to_begin")?.unwrap_or(defaults.time_to_begin),
            time_to_end: opt_time(obj, "time_to_end")?.unwrap_or(defaults.time_to_end),
            expire_after: opt_time(obj, "expire_after")?.unwrap_or(defaults.expire_after),
            divisible: opt_bool(obj, "option_divisible")?.unwrap_or(defaults.divisible),
            transferable: opt_bool(obj, "option_transferable")?.unwrap_or(defaults.transferable),
            relative_time: opt_bool(obj, "option_relative_time")?.unwrap_or(defaults.relative_time),
            ..defaults
        };

        Self::new(params)
    }

    /// Format version.
    #[must_use]
    pub const fn version(&self) -> u16 {
        self.version
    }

    /// Description of the ticket class.
    #[must_use]
    pub const fn description(&self) -> &Description {
        &self.description
    }

    /// Nominal worth.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.value
    }

    /// Unit of [`value`](Self::value).
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// "One of N" grouping.
    #[must_use]
    pub const fn book_of(&self) -> u16 {
        self.book_of
    }

    /// Start of the validity window.
    #[must_use]
    pub const fn time_to_begin(&self) -> u64 {
        self.time_to_begin
    }

    /// End of the validity window.
    #[must_use]
    pub const fn time_to_end(&self) -> u64 {
        self.time_to_end
    }

    /// Relative expiry in seconds.
    #[must_use]
    pub const fn expire_after(&self) -> u64 {
        self.expire_after
    }

    /// Whether the ticket may be split.
    #[must_use]
    pub const fn is_divisible(&self) -> bool {
        self.divisible
    }

    /// Whether the ticket may change holders.
    #[must_use]
    pub const fn is_transferable(&self) -> bool {
        self.transferable
    }

    /// Whether the validity window is relative to the time of origin.
    #[must_use]
    pub const fn is_relative_time(&self) -> bool {
        self.relative_time
    }

    const fn option_bits(&self) -> u16 {
        let mut bits = 0;
        if self.divisible {
            bits |= O_BIT_DIVISIBLE;
        }
        if self.transferable {
            bits |= O_BIT_TRANSFERABLE;
        }
        if self.relative_time {
            bits |= O_BIT_RELATIVE_TIME;
        }
        bits
    }

    /// Encode into a fresh buffer.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write_to(&mut w);
        w.into_bytes()
    }

    // Lengths fit their prefixes: both are bounded in `new`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn write_to(&self, w: &mut Writer) {
        w.put_u16(self.version);
        w.put_u8(self.description.kind());
        w.put_u16(self.raw_description.len() as u16);
        w.put_bytes(&self.raw_description);
        w.put_u8(self.unit.len() as u8);
        w.put_bytes(self.unit.as_bytes());
        w.put_i64(self.value);
        w.put_u16(self.book_of);
        w.put_u64(self.time_to_begin);
        w.put_u64(self.time_to_end);
        w.put_u64(self.expire_after);
        w.put_u16(self.option_bits());
    }

    /// Decode a spec starting at `offset`, returning the offset just past it.
    ///
    /// # Errors
    ///
    /// [`DecodeError`] on truncated input, an unknown description kind,
    /// malformed text or structured payloads, or fields that fail validation.
    pub fn deserialize(data: &[u8], offset: usize) -> Result<(usize, Self), DecodeError> {
        let mut r = Reader::at(data, offset);
        let spec = Self::read_from(&mut r)?;
        Ok((r.position(), spec))
    }

    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.u16()?;
        let kind = r.u8()?;
        let desc_len = usize::from(r.u16()?);
        let description = Description::decode(kind, r.take(desc_len)?)?;
        let unit_len = usize::from(r.u8()?);
        let unit = std::str::from_utf8(r.take(unit_len)?)
            .map_err(|_| DecodeError::InvalidUtf8("unit"))?
            .to_string();
        let value = r.i64()?;
        let book_of = r.u16()?;
        let time_to_begin = r.u64()?;
        let time_to_end = r.u64()?;
        let expire_after = r.u64()?;
        let bits = r.u16()?;

        Ok(Self::new(TicketSpecParams {
            version,
            description,
            value,
            unit,
            book_of,
            time_to_begin,
            time_to_end,
            expire_after,
            divisible: bits & O_BIT_DIVISIBLE != 0,
            transferable: bits & O_BIT_TRANSFERABLE != 0,
            relative_time: bits & O_BIT_RELATIVE_TIME != 0,
        })?)
    }
}

fn opt_int(obj: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, ValidationError> {
    match obj.get(field) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ValidationError::new(field, "must be an integer")),
    }
}

fn opt_time(obj: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, ValidationError> {
    opt_int(obj, field)?
        .map(|v| u64::try_from(v).map_err(|_| ValidationError::new(field, "out of range")))
        .transpose()
}

fn opt_bool(obj: &Map<String, Value>, field: &'static str) -> Result<Option<bool>, ValidationError> {
    match obj.get(field) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ValidationError::new(field, "must be a boolean")),
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::strategy::arb_params;
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn subway() -> Value {
        json!({
            "description": "Yokohama Municipal Subway Off-Peak Multiple",
            "value": 270,
            "unit": "yen",
            "book_of": 12,
            "time_to_begin": 3600,
            "time_to_end": 31_536_000,
            "expire_after": 7_776_000,
            "option_divisible": true,
            "option_transferable": false,
            "option_relative_time": true,
        })
    }

    #[test]
    fn from_json_reads_every_field() {
        let spec = TicketSpec::from_json(&subway()).unwrap();
        assert_eq!(
            spec.description(),
            &Description::text("Yokohama Municipal Subway Off-Peak Multiple")
        );
        assert_eq!(spec.value(), 270);
        assert_eq!(spec.unit(), "yen");
        assert_eq!(spec.book_of(), 12);
        assert_eq!(spec.time_to_begin(), 3600);
        assert_eq!(spec.time_to_end(), 31_536_000);
        assert_eq!(spec.expire_after(), 7_776_000);
        assert!(spec.is_divisible());
        assert!(!spec.is_transferable());
        assert!(spec.is_relative_time());
        assert_eq!(spec, TicketSpec::from_json(&subway()).unwrap());
    }

    #[test]
    fn omitted_fields_take_defaults() {
        let spec = TicketSpec::from_json(&json!({ "description": "Whatever" })).unwrap();
        assert_eq!(spec.value(), 0);
        assert_eq!(spec.unit(), "");
        assert_eq!(spec.book_of(), 1);
        assert_eq!(spec.time_to_begin(), 0);
        assert_eq!(spec.time_to_end(), MAX_TIME);
        assert_eq!(spec.expire_after(), 0);
        assert!(!spec.is_divisible());
        assert!(!spec.is_transferable());
        assert!(!spec.is_relative_time());
        assert_ne!(spec, TicketSpec::from_json(&subway()).unwrap());
    }

    #[test]
    fn rejects_bad_fields_by_name() {
        let cases = [
            (json!({ "description": 123 }), "description"),
            (json!({ "value": 1 }), "description"),
            (json!({ "description": "x", "unit": 1 }), "unit"),
            (json!({ "description": "x", "value": "12" }), "value"),
            (json!({ "description": "x", "value": 0x8000_0000_0000_0000_u64 }), "value"),
            (json!({ "description": "x", "book_of": "3" }), "book_of"),
            (json!({ "description": "x", "book_of": 0 }), "book_of"),
            (json!({ "description": "x", "book_of": 70_000 }), "book_of"),
            (json!({ "description": "x", "time_to_begin": "now" }), "time_to_begin"),
            (json!({ "description": "x", "time_to_begin": -1 }), "time_to_begin"),
            (json!({ "description": "x", "time_to_end": "never" }), "time_to_end"),
            (json!({ "description": "x", "time_to_end": 0 }), "time_to_end"),
            (json!({ "description": "x", "expire_after": "never" }), "expire_after"),
            (json!({ "description": "x", "expire_after": -1 }), "expire_after"),
            (json!({ "description": "x", "option_divisible": "yes" }), "option_divisible"),
            (json!({ "description": "x", "option_transferable": 1 }), "option_transferable"),
            (json!({ "description": "x", "option_relative_time": "yes" }), "option_relative_time"),
        ];
        for (doc, field) in cases {
            let err = TicketSpec::from_json(&doc).unwrap_err();
            assert_eq!(err.field, field, "for {doc}");
        }
    }

    #[test]
    fn typed_params_are_bounded() {
        let base = TicketSpecParams::new(Description::text("x"));
        let long_unit = TicketSpecParams {
            unit: "u".repeat(256),
            ..base.clone()
        };
        assert_eq!(TicketSpec::new(long_unit).unwrap_err().field, "unit");

        let zero_end = TicketSpecParams {
            time_to_end: 0,
            ..base.clone()
        };
        assert_eq!(TicketSpec::new(zero_end).unwrap_err().field, "time_to_end");

        let huge_begin = TicketSpecParams {
            time_to_begin: MAX_TIME + 1,
            ..base
        };
        assert_eq!(TicketSpec::new(huge_begin).unwrap_err().field, "time_to_begin");
    }

    #[test]
    fn structured_description_round_trips() {
        let doc = json!({
            "description": { "event": "Denki Groove", "seat": "S3-16", "open": 1_552_640_400 },
            "value": 1,
            "unit": "person",
        });
        let spec = TicketSpec::from_json(&doc).unwrap();
        assert!(matches!(spec.description(), Description::Structured(_)));

        let bytes = spec.serialize();
        assert_eq!(bytes[2], DESC_STRUCTURED);
        let (_, decoded) = TicketSpec::deserialize(&bytes, 0).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn structured_description_must_fill_its_length() {
        let spec = TicketSpec::from_json(&json!({ "description": { "a": 1 } })).unwrap();
        let mut bytes = spec.serialize();
        let desc_len = usize::from(u16::from_be_bytes([bytes[3], bytes[4]]));
        let grown = u16::try_from(desc_len + 1).unwrap().to_be_bytes();
        bytes[3..5].copy_from_slice(&grown);
        bytes.insert(5 + desc_len, 0xc1);

        assert_eq!(
            TicketSpec::deserialize(&bytes, 0).unwrap_err(),
            DecodeError::InconsistentLength {
                what: "description",
                expected: desc_len,
                actual: desc_len + 1,
            }
        );
    }

    #[test]
    fn encodes_fixed_layout() {
        let spec = TicketSpec::new(TicketSpecParams {
            value: -5,
            unit: "yen".to_string(),
            transferable: true,
            ..TicketSpecParams::new(Description::Binary(vec![9, 9]))
        })
        .unwrap();
        let bytes = spec.serialize();
        // version, kind, desc len, desc
        assert_eq!(&bytes[..7], &[0, 0, DESC_BINARY, 0, 2, 9, 9]);
        // unit
        assert_eq!(&bytes[7..11], &[3, b'y', b'e', b'n']);
        assert_eq!(&bytes[11..19], &(-5_i64).to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 2..], &[0, O_BIT_TRANSFERABLE as u8]);
        assert_eq!(bytes.len(), 2 + 1 + 2 + 2 + 1 + 3 + 8 + 2 + 8 * 3 + 2);
    }

    #[test]
    fn decode_rejects_unknown_description_kind() {
        let mut bytes = TicketSpec::from_json(&json!({ "description": "x" }))
            .unwrap()
            .serialize();
        bytes[2] = 7;
        assert_eq!(
            TicketSpec::deserialize(&bytes, 0).unwrap_err(),
            DecodeError::UnknownDiscriminant {
                what: "description kind",
                value: 7
            }
        );
    }

    #[test]
    fn decode_rejects_truncation_and_invalid_fields() {
        let bytes = TicketSpec::from_json(&json!({ "description": "x" }))
            .unwrap()
            .serialize();
        for cut in [0, 3, bytes.len() - 1] {
            assert!(matches!(
                TicketSpec::deserialize(&bytes[..cut], 0),
                Err(DecodeError::Truncated { .. })
            ));
        }

        // book_of sits right after value
        let book_of_at = 2 + 1 + 2 + 1 + 1 + 8;
        let mut zeroed = bytes.clone();
        zeroed[book_of_at] = 0;
        zeroed[book_of_at + 1] = 0;
        assert!(matches!(
            TicketSpec::deserialize(&zeroed, 0),
            Err(DecodeError::InvalidField(ValidationError { field: "book_of", .. }))
        ));
    }

    proptest! {
        #[test]
        fn prop_spec_round_trips(params in arb_params()) {
            let spec = TicketSpec::new(params).unwrap();
            let mut buf = vec![0xee; 3];
            buf.extend(spec.serialize());
            let (end, decoded) = TicketSpec::deserialize(&buf, 3).unwrap();
            prop_assert_eq!(end, buf.len());
            prop_assert_eq!(decoded, spec);
        }
    }
}
