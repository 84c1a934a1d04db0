//! Import definition types: where records come from and how fields map

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::Value;

/// Whether an import creates new documents or updates existing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    /// Create new documents with freshly assigned ids (default)
    #[default]
    Create,
    /// Patch existing documents matched through `update_mapping`
    Update,
}

impl ImportKind {
    pub fn label(&self) -> &'static str {
        match self {
            ImportKind::Create => "create",
            ImportKind::Update => "update",
        }
    }
}

/// One data source imported into one target collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDefinition {
    /// Target collection name
    pub collection: String,
    /// Create or update
    #[serde(default)]
    pub kind: ImportKind,
    /// Data file (JSON array of records), relative to the data directory
    pub file: PathBuf,
    /// Optional dotted path to the array inside the file
    #[serde(default)]
    pub base_path: Option<String>,
    /// Source field holding the record's identity in the source system
    #[serde(default)]
    pub primary_key_field: Option<String>,
    /// How to find the document to patch (required for `kind = "update"`)
    #[serde(default)]
    pub update_mapping: Option<UpdateMapping>,
    /// How relationship fields are resolved after creation
    #[serde(default)]
    pub id_mappings: Vec<IdMapping>,
    /// Identity settings; present when records represent end-user identities
    #[serde(default)]
    pub identity: Option<IdentitySettings>,
    /// Ordered field mappings
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
}

impl ImportDefinition {
    pub fn new(collection: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        ImportDefinition {
            collection: collection.into(),
            kind: ImportKind::Create,
            file: file.into(),
            base_path: None,
            primary_key_field: None,
            update_mapping: None,
            id_mappings: Vec::new(),
            identity: None,
            mappings: Vec::new(),
        }
    }

    /// Records of this definition collapse into identities by contact fields
    pub fn is_identity(&self) -> bool {
        self.identity.is_some()
    }

    /// The target keys that are filled in later by the reconciler
    pub fn deferred_reference_keys(&self) -> impl Iterator<Item = &str> {
        self.id_mappings.iter().map(|m| m.field_to_set())
    }

    /// Add a field mapping
    pub fn add_mapping(&mut self, mapping: FieldMapping) {
        self.mappings.push(mapping);
    }

    /// Human-readable label for logs
    pub fn label(&self) -> String {
        format!("{} <- {}", self.collection, self.file.display())
    }
}

/// Matching rule for update imports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMapping {
    /// Source field holding the original id
    pub original_id_field: String,
    /// Backend document field the original id is matched against
    pub target_field: String,
}

/// Describes how a source-system reference becomes a backend reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// Source field (path) holding the referenced record's original id(s)
    pub source_field: String,
    /// Key this mapping describes on the importing collection
    pub target_field: String,
    /// Collection the referenced documents live in
    pub target_collection: String,
    /// Document field to write; defaults to `target_field`
    #[serde(default)]
    pub field_to_set: Option<String>,
    /// Match by a field on the target collection instead of the run's id map
    #[serde(default)]
    pub target_field_to_match: Option<String>,
}

impl IdMapping {
    pub fn field_to_set(&self) -> &str {
        self.field_to_set.as_deref().unwrap_or(&self.target_field)
    }
}

/// Which transformed fields carry identity contact data
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentitySettings {
    #[serde(default)]
    pub email_field: Option<String>,
    #[serde(default)]
    pub phone_field: Option<String>,
    #[serde(default)]
    pub name_field: Option<String>,
}

/// One or more source paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourcePaths {
    One(String),
    Many(Vec<String>),
}

impl SourcePaths {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            SourcePaths::One(p) => vec![p.as_str()],
            SourcePaths::Many(ps) => ps.iter().map(|p| p.as_str()).collect(),
        }
    }
}

/// Mapping for a single target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Source path(s); ignored when `constant` is set
    #[serde(default)]
    pub source: Option<SourcePaths>,
    /// Constant value used instead of a source
    #[serde(default)]
    pub constant: Option<Value>,
    /// Target field key; keys starting with `$` stay in the extension bag
    pub target: String,
    /// Named converters applied in order
    #[serde(default)]
    pub converters: Vec<String>,
    /// Validation rules; the first failure rejects the whole record
    #[serde(default)]
    pub validation: Vec<ValidationRule>,
    /// File upload performed after the document is created
    #[serde(default)]
    pub file: Option<FileDescriptor>,
}

impl FieldMapping {
    /// Create a simple copy mapping
    pub fn copy(source: impl Into<String>, target: impl Into<String>) -> Self {
        FieldMapping {
            source: Some(SourcePaths::One(source.into())),
            constant: None,
            target: target.into(),
            converters: Vec::new(),
            validation: Vec::new(),
            file: None,
        }
    }

    /// Create a constant mapping
    pub fn constant(value: Value, target: impl Into<String>) -> Self {
        FieldMapping {
            source: None,
            constant: Some(value),
            target: target.into(),
            converters: Vec::new(),
            validation: Vec::new(),
            file: None,
        }
    }

    pub fn with_converters(mut self, converters: &[&str]) -> Self {
        self.converters = converters.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation.push(rule);
        self
    }

    /// Whether the target is passthrough data rather than a document field
    pub fn is_extension(&self) -> bool {
        self.target.starts_with('$')
    }
}

/// A validation rule with templated parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Rule name, e.g. `isEmail`
    pub rule: String,
    /// Extra arguments; strings are templates resolved against context + record
    #[serde(default)]
    pub params: Vec<Value>,
}

impl ValidationRule {
    pub fn new(rule: impl Into<String>, params: Vec<Value>) -> Self {
        ValidationRule {
            rule: rule.into(),
            params,
        }
    }
}

/// File to upload once the document id is known
///
/// Every string is a template resolved against the created document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub bucket_id: String,
    /// Local path (relative to the data directory) or http(s) URL
    pub path: String,
    /// Uploaded file name
    pub name: String,
    /// Append the file id to an array field instead of setting a scalar
    #[serde(default)]
    pub array: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_definition_from_toml() {
        let src = r#"
            collection = "articles"
            file = "articles.json"
            base_path = "data.items"
            primary_key_field = "id"

            [[id_mappings]]
            source_field = "authorId"
            target_field = "author"
            target_collection = "authors"

            [[mappings]]
            source = ["first", "last"]
            target = "title"
            converters = ["joinBySpace"]

            [[mappings.validation]]
            rule = "isEqual"
            params = ["{expectedTitle}"]

            [[mappings]]
            source = "cover"
            target = "cover"
            file = { bucket_id = "covers", path = "img/{cover}", name = "{docId}.png" }
        "#;

        let def: ImportDefinition = toml::from_str(src).unwrap();
        assert_eq!(def.kind, ImportKind::Create);
        assert_eq!(def.mappings.len(), 2);
        assert_eq!(
            def.mappings[0].source,
            Some(SourcePaths::Many(vec!["first".into(), "last".into()]))
        );
        assert_eq!(
            def.mappings[0].validation[0].params[0],
            Value::from("{expectedTitle}")
        );
        assert!(def.mappings[1].file.is_some());
        assert_eq!(def.id_mappings[0].field_to_set(), "author");
    }

    #[test]
    fn test_extension_target() {
        let mapping = FieldMapping::copy("legacy", "$legacy");
        assert!(mapping.is_extension());
    }
}
