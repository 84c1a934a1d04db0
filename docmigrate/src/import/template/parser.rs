//! Parser for `{path}` templates

use super::ast::*;
use crate::import::FieldPath;

/// Parse error with position information
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
    pub context: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parse a template string into a Template AST
pub fn parse_template(input: &str) -> Result<Template, ParseError> {
    let mut parts = Vec::new();
    let mut current_literal = String::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            '{' => {
                // Escaped brace
                if let Some(&(_, '{')) = chars.peek() {
                    chars.next();
                    current_literal.push('{');
                    continue;
                }

                let expr_start = pos + 1;
                let mut expr_end = None;
                for (i, c) in chars.by_ref() {
                    if c == '}' {
                        expr_end = Some(i);
                        break;
                    }
                    if c == '{' {
                        return Err(error("nested '{' inside field reference", i, input));
                    }
                }

                let Some(expr_end) = expr_end else {
                    return Err(error("unclosed field reference, expected '}'", pos, input));
                };

                let path_str = &input[expr_start..expr_end];
                let path = FieldPath::parse(path_str)
                    .map_err(|e| error(&e.to_string(), expr_start, input))?;

                if !current_literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut current_literal)));
                }
                parts.push(TemplatePart::Field(path));
            }
            '}' => {
                if let Some(&(_, '}')) = chars.peek() {
                    chars.next();
                }
                current_literal.push('}');
            }
            _ => current_literal.push(ch),
        }
    }

    if !current_literal.is_empty() {
        parts.push(TemplatePart::Literal(current_literal));
    }

    Ok(Template::new(parts, input.to_string()))
}

fn error(message: &str, position: usize, input: &str) -> ParseError {
    ParseError {
        message: message.to_string(),
        position,
        context: input[position.min(input.len())..].chars().take(20).collect(),
    }
}
