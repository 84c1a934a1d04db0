//! AST types for templates

use crate::import::FieldPath;

/// A parsed template containing literal text and field references
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    /// The parts of the template (literals and fields)
    pub parts: Vec<TemplatePart>,
    /// The original template string (for display/debugging)
    pub source: String,
}

impl Template {
    pub fn new(parts: Vec<TemplatePart>, source: String) -> Self {
        Self { parts, source }
    }

    /// The single field path when the whole template is one `{path}` token
    pub fn as_single_field(&self) -> Option<&FieldPath> {
        match self.parts.as_slice() {
            [TemplatePart::Field(path)] => Some(path),
            _ => None,
        }
    }

    /// Whether the template references any fields
    pub fn has_fields(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, TemplatePart::Field(_)))
    }

    /// All field paths referenced in this template
    pub fn field_paths(&self) -> Vec<&FieldPath> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                TemplatePart::Field(path) => Some(path),
                TemplatePart::Literal(_) => None,
            })
            .collect()
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// A part of a template
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    /// Literal text
    Literal(String),
    /// A field reference: `{path}`
    Field(FieldPath),
}
