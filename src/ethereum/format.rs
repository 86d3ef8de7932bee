//! Display formatting for call results.
//!
//! All functions here are total: anything that fails to parse is shown
//! as the raw string.

use alloy::primitives::{utils::format_ether, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Values above this are millisecond timestamps.
const MILLIS_THRESHOLD: u64 = 10_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Address,
    TransactionHash,
    Bytes,
    Integer,
    TokenAmount,
    Timestamp,
    Boolean,
    Text,
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedValue {
    /// Key path inside the result, e.g. `reserves[0]` or `info.owner`.
    pub path: String,
    pub kind: ValueKind,
    pub raw: String,
    pub display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

fn key_mentions(key: &str, needles: &[&str]) -> bool {
    let key = key.to_ascii_lowercase();
    needles.iter().any(|n| key.contains(n))
}

fn is_amount_key(key: &str) -> bool {
    key_mentions(key, &["balance", "amount", "supply"])
}

fn is_time_key(key: &str) -> bool {
    key_mentions(key, &["time", "date", "deadline"])
}

fn is_hex(s: &str) -> bool {
    s.len() > 2
        && (s.starts_with("0x") || s.starts_with("0X"))
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// `0x1234…abcd`
pub fn shorten_hex(s: &str) -> String {
    if s.len() <= 12 {
        return s.to_string();
    }
    format!("{}…{}", &s[..6], &s[s.len() - 4..])
}

/// Inserts thousands separators into a decimal integer string.
pub fn group_digits(digits: &str) -> String {
    let (sign, digits) = match digits.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", digits),
    };

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}", sign, grouped)
}

/// Inverse of [`group_digits`] for unsigned values.
pub fn parse_grouped(grouped: &str) -> Option<U256> {
    let digits: String = grouped.chars().filter(|c| *c != ',').collect();
    U256::from_str_radix(&digits, 10).ok()
}

/// Token amount with 18 decimals, trailing zeros trimmed.
pub fn format_token_amount(amount: U256) -> String {
    let formatted = format_ether(amount);
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                whole.to_string()
            } else {
                format!("{}.{}", whole, fraction)
            }
        }
        None => formatted,
    }
}

pub fn format_timestamp(value: u64) -> Option<String> {
    let datetime = if value > MILLIS_THRESHOLD {
        DateTime::<Utc>::from_timestamp_millis(i64::try_from(value).ok()?)?
    } else {
        DateTime::<Utc>::from_timestamp(i64::try_from(value).ok()?, 0)?
    };
    Some(datetime.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

fn plain(path: &str, kind: ValueKind, raw: String) -> FormattedValue {
    FormattedValue {
        path: path.to_string(),
        kind,
        display: raw.clone(),
        raw,
        detail: None,
    }
}

fn format_integer(path: &str, key: &str, digits: &str) -> FormattedValue {
    let Ok(number) = U256::from_str_radix(digits, 10) else {
        return plain(path, ValueKind::Integer, digits.to_string());
    };
    let grouped = group_digits(&number.to_string());

    if is_time_key(key) {
        if let Some(date) = u64::try_from(number).ok().and_then(format_timestamp) {
            return FormattedValue {
                path: path.to_string(),
                kind: ValueKind::Timestamp,
                raw: digits.to_string(),
                display: date,
                detail: Some(grouped),
            };
        }
    }

    if is_amount_key(key) {
        return FormattedValue {
            path: path.to_string(),
            kind: ValueKind::TokenAmount,
            raw: digits.to_string(),
            display: format_token_amount(number),
            detail: Some(grouped),
        };
    }

    FormattedValue {
        path: path.to_string(),
        kind: ValueKind::Integer,
        raw: digits.to_string(),
        display: grouped,
        detail: None,
    }
}

fn format_string(path: &str, key: &str, s: &str) -> FormattedValue {
    if is_hex(s) {
        return match s.len() {
            42 => FormattedValue {
                path: path.to_string(),
                kind: ValueKind::Address,
                raw: s.to_string(),
                display: shorten_hex(s),
                detail: Some(s.to_string()),
            },
            66 => FormattedValue {
                path: path.to_string(),
                kind: ValueKind::TransactionHash,
                raw: s.to_string(),
                display: shorten_hex(s),
                detail: Some(s.to_string()),
            },
            len if len > 66 => FormattedValue {
                path: path.to_string(),
                kind: ValueKind::Bytes,
                raw: s.to_string(),
                display: shorten_hex(s),
                detail: Some(format!("{} bytes", (len - 2) / 2)),
            },
            _ => plain(path, ValueKind::Text, s.to_string()),
        };
    }

    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        return format_integer(path, key, s);
    }

    plain(path, ValueKind::Text, s.to_string())
}

/// Formats a single scalar. `key` drives the amount/time heuristics.
pub fn format_value(path: &str, key: &str, value: &Value) -> FormattedValue {
    match value {
        Value::Null => plain(path, ValueKind::Null, "null".to_string()),
        Value::Bool(b) => plain(path, ValueKind::Boolean, b.to_string()),
        Value::Number(n) => match n.as_u64() {
            Some(u) => format_integer(path, key, &u.to_string()),
            None => match n.as_i64() {
                Some(i) => FormattedValue {
                    display: group_digits(&i.to_string()),
                    ..plain(path, ValueKind::Integer, i.to_string())
                },
                None => plain(path, ValueKind::Text, n.to_string()),
            },
        },
        Value::String(s) => format_string(path, key, s),
        Value::Array(_) | Value::Object(_) => plain(path, ValueKind::Text, value.to_string()),
    }
}

/// Flattens a result into formatted leaves, preserving `key.sub` and
/// `key[i]` paths.
pub fn format_result(key: &str, value: &Value) -> Vec<FormattedValue> {
    let mut out = Vec::new();
    walk(key, key, value, &mut out);
    out
}

fn walk(path: &str, key: &str, value: &Value, out: &mut Vec<FormattedValue>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (field, nested) in map {
                let nested_path = if path.is_empty() {
                    field.clone()
                } else {
                    format!("{}.{}", path, field)
                };
                walk(&nested_path, field, nested, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, nested) in items.iter().enumerate() {
                walk(&format!("{}[{}]", path, index), key, nested, out);
            }
        }
        scalar => out.push(format_value(path, key, scalar)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_address_and_hash() {
        let address = "0x742d35cc6634c0532925a3b844bc454e4438f44e";
        let formatted = format_value("owner", "owner", &json!(address));
        assert_eq!(formatted.kind, ValueKind::Address);
        assert_eq!(formatted.display, "0x742d…f44e");

        let hash = format!("0x{}", "ab".repeat(32));
        assert_eq!(format_value("tx", "tx", &json!(hash)).kind, ValueKind::TransactionHash);
    }

    #[test]
    fn test_byte_blob_length() {
        let blob = format!("0x{}", "00".repeat(40));
        let formatted = format_value("data", "data", &json!(blob));
        assert_eq!(formatted.kind, ValueKind::Bytes);
        assert_eq!(formatted.detail.as_deref(), Some("40 bytes"));
    }

    #[test]
    fn test_integer_grouping() {
        let formatted = format_value("count", "count", &json!("1234567"));
        assert_eq!(formatted.kind, ValueKind::Integer);
        assert_eq!(formatted.display, "1,234,567");
        assert_eq!(group_digits("123"), "123");
        assert_eq!(group_digits("-1234"), "-1,234");
    }

    #[test]
    fn test_grouping_roundtrip() {
        for raw in ["0", "999", "1000", "9007199254740993", "115792089237316195423570985008687907853269984665640564039457584007913129639935"] {
            let formatted = format_value("x", "x", &json!(raw));
            let parsed = parse_grouped(&formatted.display).unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn test_overflow_falls_back_to_raw() {
        let huge = "9".repeat(90);
        let formatted = format_value("x", "x", &json!(huge));
        assert_eq!(formatted.display, huge);
        assert_eq!(formatted.raw, huge);
    }

    #[test]
    fn test_token_amount_for_balance_keys() {
        let formatted = format_value("balance", "Balance", &json!("1500000000000000000"));
        assert_eq!(formatted.kind, ValueKind::TokenAmount);
        assert_eq!(formatted.display, "1.5");
        assert_eq!(formatted.detail.as_deref(), Some("1,500,000,000,000,000,000"));

        assert_eq!(format_token_amount(U256::from(10u64).pow(U256::from(18u64))), "1");
    }

    #[test]
    fn test_timestamps_seconds_and_millis() {
        let seconds = format_value("deadline", "deadline", &json!(1704067200u64));
        assert_eq!(seconds.kind, ValueKind::Timestamp);
        assert_eq!(seconds.display, "2024-01-01 00:00:00 UTC");

        let millis = format_value("createdTime", "createdTime", &json!("1704067200000"));
        assert_eq!(millis.display, "2024-01-01 00:00:00 UTC");
    }

    #[test]
    fn test_booleans_and_text() {
        assert_eq!(format_value("ok", "ok", &json!(true)).display, "true");
        assert_eq!(format_value("name", "name", &json!("Wrapped Ether")).kind, ValueKind::Text);
        assert_eq!(format_value("x", "x", &json!("0x12")).kind, ValueKind::Text);
    }

    #[test]
    fn test_nested_paths() {
        let value = json!({
            "info": {"owner": "0x742d35cc6634c0532925a3b844bc454e4438f44e", "paused": false},
            "balances": ["1000000000000000000", "0"]
        });
        let formatted = format_result("", &value);
        let paths: Vec<_> = formatted.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["balances[0]", "balances[1]", "info.owner", "info.paused"]);
        assert_eq!(formatted[0].kind, ValueKind::TokenAmount);
        assert_eq!(formatted[0].display, "1");
    }

    #[test]
    fn test_formatting_does_not_mutate_input() {
        let value = json!({"amount": "5"});
        let before = value.clone();
        let _ = format_result("result", &value);
        assert_eq!(value, before);
    }
}
