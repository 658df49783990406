//! Boundary to the generic value tree library
//!
//! The store describes schemas and reports deltas through `serde_json`
//! values (ordered maps via the `preserve_order` feature). This module is
//! the only place that knows which conveniences the tree library lacks:
//! case-insensitive map lookup, lenient scalar coercions, and C-style
//! numeric prefix parsing used by the string coercion paths.

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// Parse a JSON document from a file into a value tree.
pub fn parse_json_file(path: impl AsRef<Path>) -> Result<Value> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| StoreError::segment_io(e, "Failed to read schema file"))?;
    serde_json::from_str(&text).map_err(|e| {
        StoreError::schema(format!("{} is not a valid JSON document: {}", path.display(), e))
    })
}

/// Case-insensitive key lookup in an ordered map.
pub fn find_ci<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

/// Lenient integer coercion: integers, truncated floats, booleans, and
/// C-style numeric strings all convert.
pub fn as_i64_lenient(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| u as i64))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Bool(b) => Some(*b as i64),
        Value::String(s) => Some(parse_long_prefix(s)),
        _ => None,
    }
}

/// Lenient float coercion.
pub fn as_f64_lenient(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => Some(parse_double_prefix(s)),
        _ => None,
    }
}

/// Lenient boolean coercion: booleans, non-zero numbers, and the string
/// "true" (case-insensitive).
pub fn as_bool_lenient(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => None,
    }
}

/// `strtoll(s, NULL, 0)` semantics: leading whitespace, optional sign,
/// `0x` hex or `0` octal prefix, longest valid digit run, trailing junk
/// ignored. An empty or non-numeric prefix parses as 0.
pub fn parse_long_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let (neg, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let (radix, digits) = if s.len() > 1 && (s.starts_with("0x") || s.starts_with("0X")) {
        (16, &s[2..])
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };

    let mut value: i64 = 0;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => {
                value = value
                    .saturating_mul(radix as i64)
                    .saturating_add(d as i64);
            }
            None => break,
        }
    }
    if neg {
        -value
    } else {
        value
    }
}

/// `strtod` semantics: longest valid floating-point prefix, trailing junk
/// ignored, 0.0 when nothing parses.
pub fn parse_double_prefix(s: &str) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    // No digits at all in the mantissa means no number
    if !s[int_start..end].bytes().any(|b| b.is_ascii_digit()) {
        return 0.0;
    }
    // Exponent only counts when followed by at least one digit
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let digit_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digit_start {
            end = exp_end;
        }
    }

    s[..end].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_find_ci() {
        let v = json!({ "Type": "int", "defaultValue": 7 });
        let map = v.as_object().unwrap();
        assert_eq!(find_ci(map, "type").unwrap(), "int");
        assert_eq!(find_ci(map, "DEFAULTVALUE").unwrap(), 7);
        assert!(find_ci(map, "size").is_none());
    }

    #[test]
    fn test_parse_long_prefix() {
        assert_eq!(parse_long_prefix("42"), 42);
        assert_eq!(parse_long_prefix("  -17xyz"), -17);
        assert_eq!(parse_long_prefix("0x1F"), 31);
        assert_eq!(parse_long_prefix("017"), 15);
        assert_eq!(parse_long_prefix("junk"), 0);
        assert_eq!(parse_long_prefix(""), 0);
    }

    #[test]
    fn test_parse_double_prefix() {
        assert_eq!(parse_double_prefix("3.5"), 3.5);
        assert_eq!(parse_double_prefix("-2.5e2 trailing"), -250.0);
        assert_eq!(parse_double_prefix("1e"), 1.0);
        assert_eq!(parse_double_prefix(".25"), 0.25);
        assert_eq!(parse_double_prefix("none"), 0.0);
    }

    #[test]
    fn test_lenient_coercions() {
        assert_eq!(as_i64_lenient(&json!(3.9)), Some(3));
        assert_eq!(as_i64_lenient(&json!("0x10")), Some(16));
        assert_eq!(as_f64_lenient(&json!(true)), Some(1.0));
        assert_eq!(as_bool_lenient(&json!("TRUE")), Some(true));
        assert_eq!(as_bool_lenient(&json!(0)), Some(false));
        assert!(as_i64_lenient(&json!([1])).is_none());
    }
}
