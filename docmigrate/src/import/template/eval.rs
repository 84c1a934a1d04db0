//! Evaluator for templates

use super::ast::*;
use super::parser::{ParseError, parse_template};
use crate::import::Value;

/// Evaluate a parsed template against a context
///
/// A template consisting of exactly one field reference yields the raw
/// resolved value. Anything else renders to a string, with sequences joined
/// by `", "` and nulls rendering as empty text.
pub fn resolve(template: &Template, context: &Value) -> Value {
    if let Some(path) = template.as_single_field() {
        return path.resolve(context);
    }

    let mut result = String::new();
    for part in &template.parts {
        match part {
            TemplatePart::Literal(s) => result.push_str(s),
            TemplatePart::Field(path) => result.push_str(&path.resolve(context).render()),
        }
    }
    Value::String(result)
}

/// Parse and evaluate a template string
pub fn resolve_str(template: &str, context: &Value) -> Result<Value, ParseError> {
    if !template.contains('{') && !template.contains('}') {
        return Ok(Value::String(template.to_string()));
    }
    let parsed = parse_template(template)?;
    Ok(resolve(&parsed, context))
}

/// Recursively resolve every string inside a (possibly nested) template value
///
/// Mapping keys are kept literal; only values are resolved.
pub fn resolve_value(template: &Value, context: &Value) -> Result<Value, ParseError> {
    match template {
        Value::String(s) => resolve_str(s, context),
        Value::Sequence(items) => items
            .iter()
            .map(|item| resolve_value(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut resolved = std::collections::BTreeMap::new();
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_value(value, context)?);
            }
            Ok(Value::Mapping(resolved))
        }
        other => Ok(other.clone()),
    }
}
