//! Document list queries
//!
//! Queries serialize to the JSON form the REST backend accepts in
//! `queries[]` parameters, and are evaluated directly by the in-memory
//! backend.

use serde_json::{Value, json};

/// A single list-documents query clause
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Attribute equals any of the values (array attributes: contains any)
    Equal { attribute: String, values: Vec<Value> },
    /// String attribute contains the substring, or array attribute contains the value
    Contains { attribute: String, value: Value },
    /// Only documents after this id
    CursorAfter(String),
    /// Page size
    Limit(usize),
}

impl Query {
    pub fn equal(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Equal {
            attribute: attribute.into(),
            values: vec![value.into()],
        }
    }

    pub fn contains(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Contains {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn cursor_after(id: impl Into<String>) -> Self {
        Query::CursorAfter(id.into())
    }

    pub fn limit(limit: usize) -> Self {
        Query::Limit(limit)
    }

    /// Build a page query: optional cursor plus limit
    pub fn page(cursor: Option<&str>, limit: usize) -> Vec<Query> {
        let mut queries = vec![Query::Limit(limit)];
        if let Some(cursor) = cursor {
            queries.push(Query::cursor_after(cursor));
        }
        queries
    }

    pub fn to_json(&self) -> Value {
        match self {
            Query::Equal { attribute, values } => {
                json!({"method": "equal", "attribute": attribute, "values": values})
            }
            Query::Contains { attribute, value } => {
                json!({"method": "contains", "attribute": attribute, "values": [value]})
            }
            Query::CursorAfter(id) => json!({"method": "cursorAfter", "values": [id]}),
            Query::Limit(limit) => json!({"method": "limit", "values": [limit]}),
        }
    }

    /// Whether a document's data satisfies this clause; paging clauses always match
    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Query::Equal { attribute, values } => match data.get(attribute) {
                Some(Value::Array(items)) => items.iter().any(|i| values.contains(i)),
                Some(field) => values.contains(field),
                None => values.iter().any(Value::is_null),
            },
            Query::Contains { attribute, value } => match (data.get(attribute), value) {
                (Some(Value::Array(items)), v) => items.contains(v),
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                _ => false,
            },
            Query::CursorAfter(_) | Query::Limit(_) => true,
        }
    }
}

/// Extract the limit clause, if any
pub fn limit_of(queries: &[Query]) -> Option<usize> {
    queries.iter().find_map(|q| match q {
        Query::Limit(n) => Some(*n),
        _ => None,
    })
}

/// Extract the cursor clause, if any
pub fn cursor_of(queries: &[Query]) -> Option<&str> {
    queries.iter().find_map(|q| match q {
        Query::CursorAfter(id) => Some(id.as_str()),
        _ => None,
    })
}
