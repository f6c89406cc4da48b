//! Canonical serialization for deterministic hashing.
//!
//! Two encodings live here:
//!
//! - **Checksum encoding** ([`checksum_serialize`]): the order-insensitive form
//!   hashed into resource checksums. It is byte-compatible with the checksum
//!   generators shipped by other OCL clients, so digests can be compared
//!   across implementations.
//! - **Fingerprints** ([`canonical_hash_hex`]): xxh64 over plain JSON, used for
//!   option hashes where cross-client compatibility does not matter.
//!
//! ## Checksum Encoding Rules
//!
//! | input | encoding |
//! |-------|----------|
//! | list of one element | the element itself |
//! | list | `[e1,e2,...]`, elements sorted by a type-stable key |
//! | map | `{` + JSON array of sorted keys + `v1,v2,...,` + `}` |
//! | string | JSON string, non-ASCII escaped as `\uXXXX` |
//! | other scalar | JSON literal, floats in shortest round-trip form |
//!
//! UUIDs are carried as strings and therefore serialize as quoted strings.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt::Write as _;

use md5::Md5;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::xxh64;

use crate::config::DigestAlgorithm;

/// Serialize a value into the checksum encoding.
pub fn checksum_serialize(value: &Value) -> String {
    let mut out = String::new();
    serialize_into(value, &mut out);
    out
}

/// Hash a value's checksum encoding with the given digest, hex encoded.
pub fn generate_checksum(value: &Value, digest: DigestAlgorithm) -> String {
    digest_hex(checksum_serialize(value).as_bytes(), digest)
}

/// Hex digest of raw bytes.
pub fn digest_hex(bytes: &[u8], digest: DigestAlgorithm) -> String {
    match digest {
        DigestAlgorithm::Md5 => hex::encode(Md5::digest(bytes)),
        DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
    }
}

/// Combine several checksums into one.
///
/// Returns `None` for no input, the lone checksum for one input, and the
/// checksum of the (sorted) list otherwise.
pub fn combine_checksums<S: AsRef<str>>(checksums: &[S], digest: DigestAlgorithm) -> Option<String> {
    match checksums {
        [] => None,
        [single] => Some(single.as_ref().to_string()),
        many => {
            let list = Value::Array(
                many.iter()
                    .map(|c| Value::String(c.as_ref().to_string()))
                    .collect(),
            );
            Some(generate_checksum(&list, digest))
        }
    }
}

fn serialize_into(value: &Value, out: &mut String) {
    // One level of collapsing only: [[x]] encodes as [x].
    let value = match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    };

    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in generic_sort(items).into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                serialize_into(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            out.push('[');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                push_json_string(key, out);
            }
            out.push(']');
            for key in keys {
                if let Some(v) = map.get(key) {
                    serialize_into(v, out);
                }
                out.push(',');
            }
            out.push('}');
        }
        scalar => push_json_scalar(scalar, out),
    }
}

/// Sort key: numbers and strings compare as themselves, anything else by its
/// textual representation.
enum SortKey<'a> {
    Number(f64),
    Text(Cow<'a, str>),
}

fn sort_key(value: &Value) -> SortKey<'_> {
    match value {
        Value::Bool(b) => SortKey::Number(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => SortKey::Number(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => SortKey::Text(Cow::Borrowed(s.as_str())),
        other => SortKey::Text(Cow::Owned(display_repr(other))),
    }
}

fn compare_keys(a: &SortKey<'_>, b: &SortKey<'_>) -> Ordering {
    match (a, b) {
        (SortKey::Number(x), SortKey::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (SortKey::Text(x), SortKey::Text(y)) => x.cmp(y),
        (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
        (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
    }
}

fn generic_sort(items: &[Value]) -> Vec<&Value> {
    let mut keyed: Vec<(SortKey<'_>, &Value)> = items.iter().map(|v| (sort_key(v), v)).collect();
    // Stable, so equal keys keep input order.
    keyed.sort_by(|a, b| compare_keys(&a.0, &b.0));
    keyed.into_iter().map(|(_, v)| v).collect()
}

/// Textual representation used to order non-scalar list elements.
///
/// Maps keep insertion order, strings use single quotes unless they contain
/// one, `null`/`true`/`false` render as `None`/`True`/`False`.
pub(crate) fn display_repr(value: &Value) -> String {
    let mut out = String::new();
    repr_into(value, &mut out);
    out
}

fn repr_into(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(n) => push_number(n, out),
        Value::String(s) => push_repr_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                repr_into(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                push_repr_string(key, out);
                out.push_str(": ");
                repr_into(v, out);
            }
            out.push('}');
        }
    }
}

fn push_repr_string(s: &str, out: &mut String) {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

fn push_json_scalar(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => push_number(n, out),
        Value::String(s) => push_json_string(s, out),
        // Containers never reach here; serialize_into handles them.
        Value::Array(_) | Value::Object(_) => out.push_str(&value.to_string()),
    }
}

fn push_number(n: &serde_json::Number, out: &mut String) {
    if n.is_i64() || n.is_u64() {
        out.push_str(&n.to_string());
    } else if let Some(f) = n.as_f64() {
        out.push_str(&float_repr(f));
    } else {
        out.push_str(&n.to_string());
    }
}

/// Shortest round-trip float text, exponent form outside `1e-4 <= |f| < 1e16`.
pub(crate) fn float_repr(f: f64) -> String {
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0".into() } else { "0.0".into() };
    }
    let sci = format!("{:e}", f);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    }
    let fixed = format!("{}", f);
    if fixed.contains('.') {
        fixed
    } else {
        format!("{fixed}.0")
    }
}

/// JSON string with every non-printable or non-ASCII character escaped.
fn push_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{:04x}", unit);
                }
            }
        }
    }
    out.push('"');
}

/// Serialize a value to canonical JSON bytes for fingerprinting.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Compute the xxh64 fingerprint of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<u64, serde_json::Error> {
    let bytes = to_canonical_bytes(value)?;
    Ok(xxh64(&bytes, 0))
}

/// Compute the xxh64 fingerprint and return it as hex.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(format!("{:016x}", canonical_hash(value)?))
}
