//! Named value converters applied to mapped fields
//!
//! Converters are pure `Value -> Value` functions looked up by name. An
//! unknown name is logged and the value passes through unchanged.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::import::Value;
use crate::import::remap::normalize_phone;

pub type ConverterFn = fn(Value) -> Value;

/// Registry of named converters
#[derive(Debug, Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, ConverterFn>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ConverterRegistry {
    /// Registry with no converters
    pub fn empty() -> Self {
        ConverterRegistry {
            converters: HashMap::new(),
        }
    }

    /// Registry with all built-in converters
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("anyToString", any_to_string);
        registry.register("anyToNumber", any_to_number);
        registry.register("anyToFloat", any_to_float);
        registry.register("anyToInt", any_to_int);
        registry.register("anyToBoolean", any_to_boolean);
        registry.register("anyToArray", any_to_array);
        registry.register("anyToDate", any_to_date);
        registry.register("trim", trim);
        registry.register("toLowerCase", to_lower_case);
        registry.register("toUpperCase", to_upper_case);
        registry.register("removeStartEndQuotes", remove_start_end_quotes);
        registry.register("splitByComma", split_by_comma);
        registry.register("joinBySpace", join_by_space);
        registry.register("joinByComma", join_by_comma);
        registry.register("removeNulls", remove_nulls);
        registry.register("first", first);
        registry.register("last", last);
        registry.register("stringifyObject", stringify_object);
        registry.register("emptyToNull", empty_to_null);
        registry.register("normalizePhone", normalize_phone_value);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, converter: ConverterFn) {
        self.converters.insert(name.into(), converter);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.converters.contains_key(name)
    }

    /// Apply named converters in order
    pub fn apply_all(&self, names: &[String], mut value: Value) -> Value {
        for name in names {
            match self.converters.get(name) {
                Some(converter) => value = converter(value),
                None => log::warn!("Unknown converter '{}', passing value through", name),
            }
        }
        value
    }
}

/// Apply `f` to every string, mapping over sequences
fn map_strings(value: Value, f: impl Fn(&str) -> String + Copy) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(|v| map_strings(v, f)).collect())
        }
        other => other,
    }
}

fn any_to_string(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s),
        other => Value::String(other.render()),
    }
}

fn parse_number(s: &str) -> Value {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = s.replace(',', "").parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Null
    }
}

fn any_to_number(value: Value) -> Value {
    match value {
        Value::Int(_) | Value::Float(_) => value,
        Value::Bool(b) => Value::Int(b as i64),
        Value::String(s) => parse_number(&s),
        _ => Value::Null,
    }
}

fn any_to_float(value: Value) -> Value {
    match any_to_number(value) {
        Value::Int(i) => Value::Float(i as f64),
        other => other,
    }
}

fn any_to_int(value: Value) -> Value {
    match any_to_number(value) {
        Value::Float(f) if f.is_finite() => Value::Int(f.trunc() as i64),
        Value::Float(_) => Value::Null,
        other => other,
    }
}

fn any_to_boolean(value: Value) -> Value {
    match value {
        Value::Bool(_) => value,
        Value::Int(i) => Value::Bool(i != 0),
        Value::Float(f) => Value::Bool(f != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" => Value::Bool(true),
            "false" | "no" | "n" | "0" | "off" | "" => Value::Bool(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn any_to_array(value: Value) -> Value {
    match value {
        Value::Sequence(_) => value,
        Value::Null => Value::Sequence(Vec::new()),
        other => Value::Sequence(vec![other]),
    }
}

/// Parse common date encodings into an RFC 3339 string
fn any_to_date(value: Value) -> Value {
    match value {
        Value::Int(ts) => timestamp_to_date(ts),
        Value::Float(ts) => timestamp_to_date(ts as i64),
        Value::String(s) => parse_date(s.trim())
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn timestamp_to_date(ts: i64) -> Value {
    // Values past year 5138 in seconds are treated as milliseconds
    let dt = if ts.abs() > 100_000_000_000 {
        Utc.timestamp_millis_opt(ts).single()
    } else {
        Utc.timestamp_opt(ts, 0).single()
    };
    dt.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null)
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }
    None
}

fn trim(value: Value) -> Value {
    map_strings(value, |s| s.trim().to_string())
}

fn to_lower_case(value: Value) -> Value {
    map_strings(value, |s| s.to_lowercase())
}

fn to_upper_case(value: Value) -> Value {
    map_strings(value, |s| s.to_uppercase())
}

fn remove_start_end_quotes(value: Value) -> Value {
    map_strings(value, |s| {
        let t = s.trim();
        for quote in ['"', '\''] {
            if t.len() >= 2 && t.starts_with(quote) && t.ends_with(quote) {
                return t[1..t.len() - 1].to_string();
            }
        }
        t.to_string()
    })
}

fn split_by_comma(value: Value) -> Value {
    match value {
        Value::String(s) => Value::Sequence(
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(Value::from)
                .collect(),
        ),
        other => other,
    }
}

fn join_with(value: Value, delimiter: &str) -> Value {
    match value {
        Value::Sequence(items) => Value::String(
            items
                .iter()
                .filter(|v| !v.is_empty())
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(delimiter),
        ),
        other => other,
    }
}

fn join_by_space(value: Value) -> Value {
    join_with(value, " ")
}

fn join_by_comma(value: Value) -> Value {
    join_with(value, ",")
}

fn remove_nulls(value: Value) -> Value {
    match value {
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().filter(|v| !v.is_null()).collect())
        }
        Value::Mapping(map) => {
            Value::Mapping(map.into_iter().filter(|(_, v)| !v.is_null()).collect())
        }
        other => other,
    }
}

fn first(value: Value) -> Value {
    match value {
        Value::Sequence(items) => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    }
}

fn last(value: Value) -> Value {
    match value {
        Value::Sequence(items) => items.into_iter().last().unwrap_or(Value::Null),
        other => other,
    }
}

fn stringify_object(value: Value) -> Value {
    match value {
        Value::Mapping(_) | Value::Sequence(_) => Value::String(value.to_json().to_string()),
        other => other,
    }
}

fn empty_to_null(value: Value) -> Value {
    if value.is_empty() { Value::Null } else { value }
}

fn normalize_phone_value(value: Value) -> Value {
    match value {
        Value::String(s) => match normalize_phone(&s) {
            Some(phone) => Value::String(phone),
            None => Value::Null,
        },
        Value::Int(i) => Value::String(i.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(names: &[&str], value: Value) -> Value {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        ConverterRegistry::builtin().apply_all(&names, value)
    }

    #[test]
    fn test_converters_applied_in_order() {
        let result = apply(&["trim", "toUpperCase"], Value::from("  ada  "));
        assert_eq!(result, Value::from("ADA"));
    }

    #[test]
    fn test_unknown_converter_passes_through() {
        let result = apply(&["noSuchConverter"], Value::from("keep"));
        assert_eq!(result, Value::from("keep"));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(apply(&["anyToNumber"], Value::from("42")), Value::Int(42));
        assert_eq!(apply(&["anyToNumber"], Value::from("4.5")), Value::Float(4.5));
        assert_eq!(apply(&["anyToNumber"], Value::from("abc")), Value::Null);
        assert_eq!(apply(&["anyToInt"], Value::Float(3.9)), Value::Int(3));
        assert_eq!(apply(&["anyToFloat"], Value::Int(2)), Value::Float(2.0));
    }

    #[test]
    fn test_booleans() {
        assert_eq!(apply(&["anyToBoolean"], Value::from("Yes")), Value::Bool(true));
        assert_eq!(apply(&["anyToBoolean"], Value::from("off")), Value::Bool(false));
        assert_eq!(apply(&["anyToBoolean"], Value::Int(0)), Value::Bool(false));
    }

    #[test]
    fn test_dates() {
        assert_eq!(
            apply(&["anyToDate"], Value::from("2024-03-01")),
            Value::from("2024-03-01T00:00:00+00:00")
        );
        assert_eq!(
            apply(&["anyToDate"], Value::Int(0)),
            Value::from("1970-01-01T00:00:00+00:00")
        );
        assert_eq!(apply(&["anyToDate"], Value::from("not a date")), Value::Null);
    }

    #[test]
    fn test_split_and_join() {
        let split = apply(&["splitByComma"], Value::from("a, b,,c"));
        assert_eq!(split.to_json(), json!(["a", "b", "c"]));

        let joined = apply(
            &["joinBySpace"],
            Value::from_json(&json!(["Ada", null, "Lovelace"])),
        );
        assert_eq!(joined, Value::from("Ada Lovelace"));
    }

    #[test]
    fn test_quotes_and_arrays() {
        assert_eq!(
            apply(&["removeStartEndQuotes"], Value::from("\"quoted\"")),
            Value::from("quoted")
        );
        assert_eq!(apply(&["anyToArray"], Value::Null).to_json(), json!([]));
        assert_eq!(apply(&["anyToArray"], Value::Int(1)).to_json(), json!([1]));
        assert_eq!(
            apply(&["first"], Value::from_json(&json!([7, 8]))),
            Value::Int(7)
        );
    }

    #[test]
    fn test_phone_normalization() {
        assert_eq!(
            apply(&["normalizePhone"], Value::from("+1 (555) 010-2020")),
            Value::from("+15550102020")
        );
    }
}
