//! Record validation rules
//!
//! A rule checks the mapped field's transformed value, with optional extra
//! arguments whose strings are templates resolved against the record context
//! merged with the transformed record. Presence is only enforced by
//! `isDefined` and `isNonEmpty`; every other rule accepts a null value.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::import::template::resolve_value;
use crate::import::{ValidationRule, Value};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
        .expect("valid email regex")
});

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("valid url regex"));

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9\s().\-]{7,20}$").expect("valid phone regex"));

/// Compiled `matches` patterns; `None` remembers an invalid pattern
static PATTERN_CACHE: Lazy<Mutex<HashMap<String, Option<Regex>>>> = Lazy::new(Default::default);

pub type RuleFn = fn(&Value, &[Value]) -> bool;

/// Failure of a single rule, which rejects the whole record
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: rule '{}' failed ({})", self.field, self.rule, self.message)
    }
}

/// Registry of named validation rules
#[derive(Debug, Clone)]
pub struct ValidatorRegistry {
    rules: HashMap<String, RuleFn>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ValidatorRegistry {
    pub fn builtin() -> Self {
        let mut rules: HashMap<String, RuleFn> = HashMap::new();
        rules.insert("isDefined".into(), is_defined);
        rules.insert("isNonEmpty".into(), is_non_empty);
        rules.insert("isString".into(), is_string);
        rules.insert("isNumber".into(), is_number);
        rules.insert("isInteger".into(), is_integer);
        rules.insert("isBoolean".into(), is_boolean);
        rules.insert("isArray".into(), is_array);
        rules.insert("isEmail".into(), is_email);
        rules.insert("isUrl".into(), is_url);
        rules.insert("isPhoneNumber".into(), is_phone_number);
        rules.insert("matches".into(), matches_pattern);
        rules.insert("isEqual".into(), is_equal);
        rules.insert("isOneOf".into(), is_one_of);
        rules.insert("minLength".into(), min_length);
        rules.insert("maxLength".into(), max_length);
        rules.insert("isInRange".into(), is_in_range);
        ValidatorRegistry { rules }
    }

    pub fn register(&mut self, name: impl Into<String>, rule: RuleFn) {
        self.rules.insert(name.into(), rule);
    }

    /// Run rules in order, stopping at the first failure
    pub fn validate(
        &self,
        field: &str,
        value: &Value,
        rules: &[ValidationRule],
        context: &Value,
    ) -> Result<(), ValidationFailure> {
        for rule in rules {
            let Some(check) = self.rules.get(&rule.rule) else {
                log::warn!("Unknown validation rule '{}' on field '{}', skipping", rule.rule, field);
                continue;
            };

            let params = rule
                .params
                .iter()
                .map(|p| resolve_value(p, context))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ValidationFailure {
                    field: field.to_string(),
                    rule: rule.rule.clone(),
                    message: format!("invalid parameter template {}", e),
                })?;

            if !check(value, &params) {
                return Err(ValidationFailure {
                    field: field.to_string(),
                    rule: rule.rule.clone(),
                    message: format!("value {} does not satisfy rule", value),
                });
            }
        }
        Ok(())
    }
}

/// Check every non-sequence element; null passes
fn each(value: &Value, f: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Null => true,
        Value::Sequence(items) => items.iter().all(|v| v.is_null() || f(v)),
        other => f(other),
    }
}

fn is_defined(value: &Value, _: &[Value]) -> bool {
    !value.is_null()
}

fn is_non_empty(value: &Value, _: &[Value]) -> bool {
    match value {
        Value::String(s) => !s.trim().is_empty(),
        other => !other.is_empty(),
    }
}

fn is_string(value: &Value, _: &[Value]) -> bool {
    value.is_null() || matches!(value, Value::String(_))
}

fn is_number(value: &Value, _: &[Value]) -> bool {
    value.is_null() || matches!(value, Value::Int(_) | Value::Float(_))
}

fn is_integer(value: &Value, _: &[Value]) -> bool {
    value.is_null() || value.as_i64().is_some()
}

fn is_boolean(value: &Value, _: &[Value]) -> bool {
    value.is_null() || matches!(value, Value::Bool(_))
}

fn is_array(value: &Value, _: &[Value]) -> bool {
    value.is_null() || matches!(value, Value::Sequence(_))
}

fn is_email(value: &Value, _: &[Value]) -> bool {
    each(value, |v| v.as_str().is_some_and(|s| EMAIL_RE.is_match(s.trim())))
}

fn is_url(value: &Value, _: &[Value]) -> bool {
    each(value, |v| v.as_str().is_some_and(|s| URL_RE.is_match(s.trim())))
}

fn is_phone_number(value: &Value, _: &[Value]) -> bool {
    each(value, |v| match v {
        Value::String(s) => PHONE_RE.is_match(s.trim()),
        Value::Int(_) => true,
        _ => false,
    })
}

fn matches_pattern(value: &Value, params: &[Value]) -> bool {
    let Some(pattern) = params.first().and_then(|p| p.as_str()) else {
        return false;
    };
    match compiled_pattern(pattern) {
        Some(re) => each(value, |v| re.is_match(&v.render())),
        None => false,
    }
}

fn compiled_pattern(pattern: &str) -> Option<Regex> {
    let mut cache = PATTERN_CACHE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    cache
        .entry(pattern.to_string())
        .or_insert_with(|| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("Invalid regex '{}' in matches rule: {}", pattern, e);
                None
            }
        })
        .clone()
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    a == b || a.render() == b.render()
}

fn is_equal(value: &Value, params: &[Value]) -> bool {
    value.is_null() || params.first().is_some_and(|p| loosely_equal(value, p))
}

fn is_one_of(value: &Value, params: &[Value]) -> bool {
    let allowed: Vec<Value> = params.iter().cloned().flat_map(Value::flatten).collect();
    each(value, |v| allowed.iter().any(|a| loosely_equal(v, a)))
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Sequence(items) => Some(items.len()),
        _ => None,
    }
}

fn param_number(params: &[Value], index: usize) -> Option<f64> {
    params.get(index).and_then(|p| match p {
        Value::String(s) => s.trim().parse().ok(),
        other => other.as_f64(),
    })
}

fn min_length(value: &Value, params: &[Value]) -> bool {
    let Some(min) = param_number(params, 0) else {
        return false;
    };
    value.is_null() || length_of(value).is_some_and(|len| len as f64 >= min)
}

fn max_length(value: &Value, params: &[Value]) -> bool {
    let Some(max) = param_number(params, 0) else {
        return false;
    };
    value.is_null() || length_of(value).is_some_and(|len| len as f64 <= max)
}

fn is_in_range(value: &Value, params: &[Value]) -> bool {
    let (Some(min), Some(max)) = (param_number(params, 0), param_number(params, 1)) else {
        return false;
    };
    each(value, |v| v.as_f64().is_some_and(|n| n >= min && n <= max))
}
