//! Field path parsing and resolution against record values
//!
//! Paths are dot-separated (`author.name`). A wildcard segment (`[any]` or
//! `*`) fans the rest of the path out over every element of a sequence or
//! every value of a mapping, and the results are flattened.

use serde::{Deserialize, Serialize};

use crate::import::Value;

/// A single segment of a field path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Named key (or numeric index into a sequence)
    Key(String),
    /// Fan out over all elements/values
    Wildcard,
}

/// A parsed dot-separated path into a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

/// Error when parsing a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPathError {
    /// Path is empty
    Empty,
    /// Segment is empty (e.g. `a..b`)
    EmptySegment { position: usize },
}

impl std::fmt::Display for FieldPathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldPathError::Empty => write!(f, "field path cannot be empty"),
            FieldPathError::EmptySegment { position } => {
                write!(f, "field path contains empty segment at position {}", position)
            }
        }
    }
}

impl std::error::Error for FieldPathError {}

impl FieldPath {
    /// Parse a field path from a string
    pub fn parse(path: &str) -> Result<Self, FieldPathError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(FieldPathError::Empty);
        }

        let mut segments = Vec::new();
        for (position, raw) in path.split('.').enumerate() {
            let raw = raw.trim();
            match raw {
                "" => return Err(FieldPathError::EmptySegment { position }),
                "[any]" | "*" => segments.push(PathSegment::Wildcard),
                key => segments.push(PathSegment::Key(key.to_string())),
            }
        }

        Ok(FieldPath { segments })
    }

    /// Create a single-key path (no validation needed)
    pub fn simple(field: impl Into<String>) -> Self {
        FieldPath {
            segments: vec![PathSegment::Key(field.into())],
        }
    }

    /// Get all segments
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Whether any segment fans out
    pub fn has_wildcard(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, PathSegment::Wildcard))
    }

    /// Resolve this path against a value
    ///
    /// Missing keys resolve to `Null`. A path with a wildcard always resolves
    /// to a (possibly empty) flattened sequence.
    pub fn resolve(&self, value: &Value) -> Value {
        let mut results = Vec::new();
        collect(value, &self.segments, &mut results);

        if self.has_wildcard() {
            Value::Sequence(results.into_iter().flat_map(Value::flatten).collect())
        } else {
            results.into_iter().next().unwrap_or(Value::Null)
        }
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                PathSegment::Key(k) => k.as_str(),
                PathSegment::Wildcard => "[any]",
            })
            .collect();
        write!(f, "{}", parts.join("."))
    }
}

impl std::str::FromStr for FieldPath {
    type Err = FieldPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldPath::parse(s)
    }
}

/// Resolve a dotted path string against a value, treating parse errors as missing
pub fn resolve_path(value: &Value, path: &str) -> Value {
    match FieldPath::parse(path) {
        Ok(path) => path.resolve(value),
        Err(_) => Value::Null,
    }
}

fn collect(current: &Value, segments: &[PathSegment], out: &mut Vec<Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(current.clone());
        return;
    };

    match head {
        PathSegment::Key(key) => match current {
            Value::Mapping(map) => match map.get(key) {
                Some(next) => collect(next, rest, out),
                None => out.push(Value::Null),
            },
            Value::Sequence(items) => match key.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => collect(next, rest, out),
                None => out.push(Value::Null),
            },
            _ => out.push(Value::Null),
        },
        PathSegment::Wildcard => match current {
            Value::Sequence(items) => {
                for item in items {
                    collect(item, rest, out);
                }
            }
            Value::Mapping(map) => {
                for item in map.values() {
                    collect(item, rest, out);
                }
            }
            // Nothing to fan out over
            _ => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(json: serde_json::Value) -> Value {
        Value::from_json(&json)
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(FieldPath::parse(""), Err(FieldPathError::Empty));
        assert_eq!(
            FieldPath::parse("a..b"),
            Err(FieldPathError::EmptySegment { position: 1 })
        );
    }

    #[test]
    fn test_resolve_simple_and_nested() {
        let record = value(json!({"name": "Contoso", "owner": {"email": "a@b.c"}}));
        assert_eq!(resolve_path(&record, "name"), Value::from("Contoso"));
        assert_eq!(resolve_path(&record, "owner.email"), Value::from("a@b.c"));
    }

    #[test]
    fn test_resolve_missing_is_null() {
        let record = value(json!({"owner": null}));
        assert_eq!(resolve_path(&record, "missing"), Value::Null);
        assert_eq!(resolve_path(&record, "owner.email"), Value::Null);
    }

    #[test]
    fn test_wildcard_over_sequence() {
        let record = value(json!({"a": [{"b": 1}, {"b": 2}]}));
        assert_eq!(
            resolve_path(&record, "a.[any].b"),
            Value::Sequence(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_wildcard_over_mapping_values_flattens() {
        let record = value(json!({"groups": {"x": {"ids": [1, 2]}, "y": {"ids": [3]}}}));
        assert_eq!(
            resolve_path(&record, "groups.*.ids"),
            Value::Sequence(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_numeric_index_into_sequence() {
        let record = value(json!({"phones": ["+1", "+2"]}));
        assert_eq!(resolve_path(&record, "phones.1"), Value::from("+2"));
    }

    #[test]
    fn test_display_roundtrip() {
        let path = FieldPath::parse("a.*.b").unwrap();
        assert_eq!(path.to_string(), "a.[any].b");
    }
}
