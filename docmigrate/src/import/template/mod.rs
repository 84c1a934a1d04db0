//! Template resolution - `{path}` interpolation against a record context
//!
//! Supports:
//! - Field interpolation: `{field}`, `{author.name}`
//! - Wildcard fan-out: `{tags.[any].label}` (joined with `", "` inside text)
//! - Brace escapes: `{{` and `}}`
//! - Whole-value templates: a template that is exactly `{path}` yields the
//!   resolved value itself rather than its text rendering
//! - Recursive resolution over nested mapping/sequence templates

mod ast;
mod eval;
mod parser;

pub use ast::{Template, TemplatePart};
pub use eval::{resolve, resolve_str, resolve_value};
pub use parser::{ParseError, parse_template};
