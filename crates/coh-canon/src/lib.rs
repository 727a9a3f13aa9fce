//! RFC-8785-style deterministic JSON canonicalization.
//!
//! Two profiles coexist. The *consensus* profile rejects any floating-point
//! number outright (callers are expected to carry fixed-point values as
//! integers); the *permissive* profile allows finite floats in a lossless
//! decimal form. Both profiles reject NaN and infinities. Object keys are
//! sorted by their UTF-8 byte value, which is equivalent to UTF-16
//! code-unit order for the strings this crate ever sees.

use serde::Serialize;
use thiserror::Error;

/// Canonicalization failures. Every variant is local to this crate; callers
/// that need a combined error surface wrap this with `#[from]`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CanonError {
    #[error("consensus profile rejects floating-point numbers")]
    NonIntegerNumber,
    #[error("non-finite number (NaN or infinity) cannot be canonicalized")]
    NonFiniteNumber,
    #[error("value could not be converted to JSON: {0}")]
    SerializationFailed(String),
    #[error("input bytes are not valid JSON: {0}")]
    InvalidJson(String),
    #[error("unrepresentable number literal")]
    UnrepresentableNumber,
}

/// Which canonicalization profile a call site uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Rejects all floating-point numbers; integers only.
    Consensus,
    /// Accepts finite floats in lossless decimal form.
    Permissive,
}

/// A JSON-like value with the numeric distinction (integer vs float) kept
/// explicit, because canonicalization rules differ between the two.
///
/// Map entries are an ordered `Vec` rather than a `BTreeMap` so duplicate
/// keys in malformed input are visible to the caller instead of silently
/// overwritten; `canonicalize` sorts them by key before emitting bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonValue {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Seq(Vec<CanonValue>),
    Map(Vec<(String, CanonValue)>),
}

impl CanonValue {
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, CanonError> {
        let json = serde_json::to_value(value)
            .map_err(|e| CanonError::SerializationFailed(e.to_string()))?;
        CanonValue::try_from(json)
    }
}

impl TryFrom<serde_json::Value> for CanonValue {
    type Error = CanonError;

    fn try_from(value: serde_json::Value) -> Result<Self, CanonError> {
        use serde_json::Value;
        Ok(match value {
            Value::Null => CanonValue::Null,
            Value::Bool(b) => CanonValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CanonValue::Int(i as i128)
                } else if let Some(u) = n.as_u64() {
                    CanonValue::Int(u as i128)
                } else if let Some(f) = n.as_f64() {
                    CanonValue::Float(f)
                } else {
                    return Err(CanonError::UnrepresentableNumber);
                }
            }
            Value::String(s) => CanonValue::Str(s),
            Value::Array(items) => {
                let mut seq = Vec::with_capacity(items.len());
                for item in items {
                    seq.push(CanonValue::try_from(item)?);
                }
                CanonValue::Seq(seq)
            }
            Value::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (k, v) in map {
                    entries.push((k, CanonValue::try_from(v)?));
                }
                CanonValue::Map(entries)
            }
        })
    }
}

/// Canonicalize a JSON-serializable value directly; the common entry point
/// for hashing and signing call sites.
pub fn to_canonical_bytes<T: Serialize>(value: &T, profile: Profile) -> Result<Vec<u8>, CanonError> {
    canonicalize(&CanonValue::from_serialize(value)?, profile)
}

/// Canonicalize an already-constructed value to its canonical UTF-8 bytes.
pub fn canonicalize(value: &CanonValue, profile: Profile) -> Result<Vec<u8>, CanonError> {
    let mut out = String::new();
    encode_value(value, profile, &mut out)?;
    Ok(out.into_bytes())
}

/// Parse canonical (or any valid) JSON bytes back into a `CanonValue`, for
/// round-trip testing (`canonicalize(parse(canonicalize(v))) == canonicalize(v)`).
pub fn parse(bytes: &[u8]) -> Result<CanonValue, CanonError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| CanonError::InvalidJson(e.to_string()))?;
    CanonValue::try_from(value)
}

fn encode_value(value: &CanonValue, profile: Profile, out: &mut String) -> Result<(), CanonError> {
    match value {
        CanonValue::Null => out.push_str("null"),
        CanonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        CanonValue::Int(i) => out.push_str(&i.to_string()),
        CanonValue::Float(f) => {
            if profile == Profile::Consensus {
                return Err(CanonError::NonIntegerNumber);
            }
            if !f.is_finite() {
                return Err(CanonError::NonFiniteNumber);
            }
            out.push_str(&encode_float(*f));
        }
        CanonValue::Str(s) => encode_string(s, out),
        CanonValue::Seq(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_value(item, profile, out)?;
            }
            out.push(']');
        }
        CanonValue::Map(entries) => {
            let mut sorted: Vec<&(String, CanonValue)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_string(k, out);
                out.push(':');
                encode_value(v, profile, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn encode_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Shortest lossless decimal form: no exponent, no trailing zeros, no `.0`
/// suffix for integral values (Rust's `f64` `Display` already produces the
/// shortest round-tripping digit sequence; this just trims the suffix).
fn encode_float(f: f64) -> String {
    let s = format!("{}", f);
    match s.strip_suffix(".0") {
        Some(stripped) => stripped.to_string(),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn obj(entries: Vec<(&str, CanonValue)>) -> CanonValue {
        CanonValue::Map(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn sorts_object_keys() {
        let v = obj(vec![
            ("b", CanonValue::Int(1)),
            ("a", CanonValue::Seq(vec![CanonValue::Int(2), CanonValue::Int(0), CanonValue::Int(3)])),
        ]);
        let bytes = canonicalize(&v, Profile::Consensus).unwrap();
        assert_eq!(bytes, br#"{"a":[2,0,3],"b":1}"#.to_vec());
    }

    #[test]
    fn negative_zero_integer_collapses_to_zero() {
        let v = CanonValue::Int(-0i128);
        assert_eq!(canonicalize(&v, Profile::Consensus).unwrap(), b"0".to_vec());
    }

    #[test]
    fn consensus_profile_rejects_floats() {
        let v = CanonValue::Float(1.5);
        assert_eq!(canonicalize(&v, Profile::Consensus), Err(CanonError::NonIntegerNumber));
    }

    #[test]
    fn nan_and_infinity_always_fail() {
        assert_eq!(
            canonicalize(&CanonValue::Float(f64::NAN), Profile::Permissive),
            Err(CanonError::NonFiniteNumber)
        );
        assert_eq!(
            canonicalize(&CanonValue::Float(f64::INFINITY), Profile::Permissive),
            Err(CanonError::NonFiniteNumber)
        );
    }

    #[test]
    fn permissive_profile_strips_trailing_zero() {
        let v = CanonValue::Float(3.0);
        assert_eq!(canonicalize(&v, Profile::Permissive).unwrap(), b"3".to_vec());
        let v = CanonValue::Float(3.5);
        assert_eq!(canonicalize(&v, Profile::Permissive).unwrap(), b"3.5".to_vec());
    }

    #[test]
    fn string_escaping_covers_control_chars() {
        let v = CanonValue::Str("a\"b\\c\nd\u{1}".to_string());
        let bytes = canonicalize(&v, Profile::Consensus).unwrap();
        assert_eq!(bytes, br#""a\"b\\c\nd""#.to_vec());
    }

    #[test]
    fn round_trip_is_idempotent() {
        let v = obj(vec![
            ("z", CanonValue::Bool(true)),
            ("m", CanonValue::Null),
            ("a", CanonValue::Str("hi".to_string())),
        ]);
        let once = canonicalize(&v, Profile::Consensus).unwrap();
        let reparsed = parse(&once).unwrap();
        let twice = canonicalize(&reparsed, Profile::Consensus).unwrap();
        assert_eq!(once, twice);
    }

    proptest! {
        #[test]
        fn canonicalize_parse_canonicalize_is_stable(
            ints in prop::collection::vec(any::<i64>(), 0..8),
            s in "[a-zA-Z0-9 ]{0,16}",
        ) {
            let v = obj(vec![
                ("ints", CanonValue::Seq(ints.into_iter().map(|i| CanonValue::Int(i as i128)).collect())),
                ("s", CanonValue::Str(s)),
            ]);
            let once = canonicalize(&v, Profile::Consensus).unwrap();
            let reparsed = parse(&once).unwrap();
            let twice = canonicalize(&reparsed, Profile::Consensus).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
