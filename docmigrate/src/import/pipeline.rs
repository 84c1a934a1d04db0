//! Transformation pipeline: raw source records to target-ready documents
//!
//! For every raw record the pipeline maps fields (paths, constants,
//! converters), validates the result, assigns the new id through the
//! remapper and builds the record context used later by templates.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};

use super::converters::ConverterRegistry;
use super::path::resolve_path;
use super::remap::{Contact, IdRemapper, RemapError};
use super::validators::{ValidationFailure, ValidatorRegistry};
use super::{
    FieldMapping, ImportDefinition, ImportKind, ImportedRecord, MATCH_VALUE_KEY, ORIGINAL_ID_KEY,
    PostCreateAction, SourcePaths, TransformedRecord, ValidationRule, Value,
};

/// Why a record was skipped
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// A validation rule failed
    Validation(ValidationFailure),
    /// The primary key was already imported into this collection in this run
    DuplicateKey(String),
    /// The record could not be transformed at all
    Transform(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Validation(failure) => write!(f, "validation failed: {}", failure),
            RejectReason::DuplicateKey(key) => write!(f, "duplicate primary key '{}'", key),
            RejectReason::Transform(msg) => write!(f, "{}", msg),
        }
    }
}

/// A skipped source record
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// Position in the source array
    pub index: usize,
    pub reason: RejectReason,
}

/// Result of transforming one definition's records
#[derive(Debug, Default)]
pub struct TransformOutcome {
    pub accepted: Vec<ImportedRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl TransformOutcome {
    pub fn duplicates(&self) -> usize {
        self.count(|r| matches!(r, RejectReason::DuplicateKey(_)))
    }

    pub fn invalid(&self) -> usize {
        self.count(|r| matches!(r, RejectReason::Validation(_)))
    }

    fn count(&self, pred: impl Fn(&RejectReason) -> bool) -> usize {
        self.rejected.iter().filter(|r| pred(&r.reason)).count()
    }
}

/// A mapped field waiting for validation
struct PendingCheck<'a> {
    target: &'a str,
    value: Value,
    rules: &'a [ValidationRule],
}

pub struct Pipeline<'a> {
    converters: &'a ConverterRegistry,
    validators: &'a ValidatorRegistry,
}

impl<'a> Pipeline<'a> {
    pub fn new(converters: &'a ConverterRegistry, validators: &'a ValidatorRegistry) -> Self {
        Self {
            converters,
            validators,
        }
    }

    /// Transform every raw record of `definition`
    pub fn transform(
        &self,
        definition: &Arc<ImportDefinition>,
        raws: Vec<Value>,
        remapper: &mut IdRemapper,
    ) -> TransformOutcome {
        let mut outcome = TransformOutcome::default();

        for (index, raw) in raws.into_iter().enumerate() {
            match self.transform_one(definition, raw, remapper) {
                Ok(record) => outcome.accepted.push(record),
                Err(reason) => {
                    warn!(
                        "Skipping record {} of {}: {}",
                        index,
                        definition.label(),
                        reason
                    );
                    outcome.rejected.push(RejectedRecord { index, reason });
                }
            }
        }

        debug!(
            "Transformed {}: {} accepted, {} rejected",
            definition.label(),
            outcome.accepted.len(),
            outcome.rejected.len()
        );
        outcome
    }

    fn transform_one(
        &self,
        definition: &Arc<ImportDefinition>,
        raw: Value,
        remapper: &mut IdRemapper,
    ) -> Result<ImportedRecord, RejectReason> {
        if raw.as_mapping().is_none() {
            return Err(RejectReason::Transform(format!(
                "record is {} rather than an object",
                raw.type_name()
            )));
        }

        let collection = definition.collection.as_str();
        let original_id = definition
            .primary_key_field
            .as_deref()
            .map(|field| resolve_path(&raw, field).render())
            .filter(|key| !key.is_empty());

        if definition.kind == ImportKind::Create
            && !definition.is_identity()
            && let Some(key) = &original_id
            && remapper.is_assigned(collection, key)
        {
            return Err(RejectReason::DuplicateKey(key.clone()));
        }

        let (mut record, checks) = self.map_fields(definition, &raw);

        let validation_context = raw.merged_with(&record.as_value());
        for check in &checks {
            self.validators
                .validate(check.target, &check.value, check.rules, &validation_context)
                .map_err(RejectReason::Validation)?;
        }

        if let Some(key) = &original_id {
            record
                .extension
                .insert(ORIGINAL_ID_KEY.to_string(), Value::String(key.clone()));
        }

        match definition.kind {
            ImportKind::Update => {
                let mapping = definition.update_mapping.as_ref().ok_or_else(|| {
                    RejectReason::Transform("update import without update_mapping".into())
                })?;
                let match_value = resolve_path(&raw, &mapping.original_id_field);
                if match_value.is_empty() {
                    return Err(RejectReason::Transform(format!(
                        "missing '{}' to match the document to update",
                        mapping.original_id_field
                    )));
                }
                record
                    .extension
                    .insert(MATCH_VALUE_KEY.to_string(), match_value);
            }
            ImportKind::Create if definition.is_identity() => {
                let contact = identity_contact(definition, &record);
                let binding = remapper.bind_identity(
                    collection,
                    original_id.as_deref(),
                    original_id.as_deref(),
                    &contact,
                );
                record.id = Some(binding.id);
                record.identity = Some(binding.outcome);
            }
            ImportKind::Create => {
                let id = remapper
                    .assign(collection, original_id.as_deref(), original_id.as_deref())
                    .map_err(|e| match e {
                        RemapError::DuplicateOriginalId { original_id, .. } => {
                            RejectReason::DuplicateKey(original_id)
                        }
                    })?;
                record.id = Some(id);
            }
        }

        let context = build_context(&raw, &record, collection);
        Ok(ImportedRecord {
            raw,
            context,
            record,
            definition: Arc::clone(definition),
        })
    }

    fn map_fields<'d>(
        &self,
        definition: &'d ImportDefinition,
        raw: &Value,
    ) -> (TransformedRecord, Vec<PendingCheck<'d>>) {
        let deferred: Vec<&str> = definition.deferred_reference_keys().collect();
        let mut record = TransformedRecord::default();
        let mut checks = Vec::new();

        for mapping in &definition.mappings {
            let value = self
                .converters
                .apply_all(&mapping.converters, source_value(mapping, raw));

            if !mapping.validation.is_empty() {
                checks.push(PendingCheck {
                    target: &mapping.target,
                    value: value.clone(),
                    rules: &mapping.validation,
                });
            }

            if let Some(file) = &mapping.file {
                let mut params = BTreeMap::new();
                params.insert("bucket_id".to_string(), Value::from(file.bucket_id.as_str()));
                params.insert("path".to_string(), Value::from(file.path.as_str()));
                params.insert("name".to_string(), Value::from(file.name.as_str()));
                record.post_actions.push(PostCreateAction::UploadFile {
                    target_field: mapping.target.clone(),
                    params: Value::Mapping(params),
                    array: file.array,
                });
                continue;
            }

            if mapping.is_extension() || deferred.contains(&mapping.target.as_str()) {
                record.extension.insert(mapping.target.clone(), value);
            } else {
                record.fields.insert(mapping.target.clone(), value);
            }
        }

        (record, checks)
    }
}

/// Value of a mapping before converters run
fn source_value(mapping: &FieldMapping, raw: &Value) -> Value {
    if let Some(constant) = &mapping.constant {
        return constant.clone();
    }
    match &mapping.source {
        Some(SourcePaths::One(path)) => resolve_path(raw, path),
        Some(SourcePaths::Many(paths)) => {
            let values: Vec<Value> = paths
                .iter()
                .map(|p| resolve_path(raw, p))
                .filter(|v| !v.is_null())
                .collect();
            if values.is_empty() {
                Value::Null
            } else {
                Value::Sequence(values)
            }
        }
        None => Value::Null,
    }
}

fn identity_contact(definition: &ImportDefinition, record: &TransformedRecord) -> Contact {
    let settings = definition.identity.clone().unwrap_or_default();
    let field = |name: Option<&String>| {
        name.and_then(|n| record.fields.get(n).or_else(|| record.extension.get(n)))
            .map(Value::render)
    };
    let email = field(settings.email_field.as_ref());
    let phone = field(settings.phone_field.as_ref());
    Contact::new(email.as_deref(), phone.as_deref())
}

fn build_context(raw: &Value, record: &TransformedRecord, collection: &str) -> Value {
    let mut extra = Value::mapping();
    if let Some(id) = &record.id {
        extra.insert("docId", Value::String(id.clone()));
    }
    if let Some(original) = record.original_id() {
        extra.insert("originalId", Value::from(original));
    }
    extra.insert("collection", Value::from(collection));
    raw.merged_with(&extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{FileDescriptor, IdMapping, IdentityOutcome, IdentitySettings};
    use serde_json::json;

    fn run(definition: ImportDefinition, raws: serde_json::Value) -> (TransformOutcome, IdRemapper) {
        let converters = ConverterRegistry::builtin();
        let validators = ValidatorRegistry::builtin();
        let pipeline = Pipeline::new(&converters, &validators);
        let mut remapper = IdRemapper::new();
        let raws = match Value::from_json(&raws) {
            Value::Sequence(items) => items,
            other => vec![other],
        };
        let outcome = pipeline.transform(&Arc::new(definition), raws, &mut remapper);
        (outcome, remapper)
    }

    fn books() -> ImportDefinition {
        let mut def = ImportDefinition::new("books", "books.json");
        def.primary_key_field = Some("id".into());
        def.add_mapping(FieldMapping::copy("title", "title").with_converters(&["trim"]));
        def.add_mapping(FieldMapping::copy("missing", "subtitle"));
        def
    }

    #[test]
    fn test_maps_fields_and_assigns_pk_id() {
        let (outcome, remapper) = run(books(), json!([{"id": "b1", "title": "  Dune "}]));
        let imported = &outcome.accepted[0];

        assert_eq!(imported.record.id.as_deref(), Some("b1"));
        assert_eq!(imported.record.fields["title"], Value::from("Dune"));
        assert_eq!(imported.record.fields["subtitle"], Value::Null);
        assert_eq!(imported.record.original_id(), Some("b1"));
        assert_eq!(imported.context.get("docId"), Some(&Value::from("b1")));
        assert_eq!(remapper.lookup("books", "b1"), Some("b1"));
    }

    #[test]
    fn test_duplicate_primary_key_rejected() {
        let (outcome, _) = run(
            books(),
            json!([{"id": "b1", "title": "Dune"}, {"id": "b1", "title": "Dune again"}]),
        );
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.duplicates(), 1);
        assert_eq!(outcome.rejected[0].index, 1);
    }

    #[test]
    fn test_validation_failure_rejects_record() {
        let mut def = books();
        def.add_mapping(
            FieldMapping::copy("email", "email").with_rule(ValidationRule::new("isEmail", vec![])),
        );
        let (outcome, remapper) = run(
            def,
            json!([{"id": "b1", "email": "bad"}, {"id": "b2", "email": "ok@example.com"}]),
        );
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.invalid(), 1);
        // Rejected records never receive an id
        assert_eq!(remapper.lookup("books", "b1"), None);
    }

    #[test]
    fn test_extension_and_deferred_fields_leave_payload() {
        let mut def = books();
        def.add_mapping(FieldMapping::copy("legacy", "$legacy"));
        def.add_mapping(FieldMapping::copy("authorId", "author"));
        def.id_mappings.push(IdMapping {
            source_field: "authorId".into(),
            target_field: "author".into(),
            target_collection: "authors".into(),
            field_to_set: None,
            target_field_to_match: None,
        });

        let (outcome, _) = run(def, json!([{"id": "b1", "legacy": 7, "authorId": "a1"}]));
        let record = &outcome.accepted[0].record;
        assert!(!record.fields.contains_key("$legacy"));
        assert!(!record.fields.contains_key("author"));
        assert_eq!(record.extension["$legacy"], Value::Int(7));
    }

    #[test]
    fn test_file_mapping_becomes_post_action() {
        let mut def = books();
        let mut cover = FieldMapping::copy("cover", "cover");
        cover.file = Some(FileDescriptor {
            bucket_id: "covers".into(),
            path: "img/{cover}".into(),
            name: "{docId}.png".into(),
            array: false,
        });
        def.add_mapping(cover);

        let (outcome, _) = run(def, json!([{"id": "b1", "cover": "dune.png"}]));
        let record = &outcome.accepted[0].record;
        assert!(!record.fields.contains_key("cover"));
        assert_eq!(record.post_actions.len(), 1);
        assert_eq!(record.post_actions[0].target_field(), "cover");
    }

    #[test]
    fn test_multiple_sources_and_constant() {
        let mut def = ImportDefinition::new("people", "people.json");
        def.add_mapping(
            FieldMapping::copy("first", "name").with_converters(&["joinBySpace"]),
        );
        def.mappings[0].source = Some(SourcePaths::Many(vec!["first".into(), "last".into()]));
        def.add_mapping(FieldMapping::constant(Value::from("imported"), "origin"));

        let (outcome, _) = run(def, json!([{"first": "Ada", "last": "Lovelace"}]));
        let record = &outcome.accepted[0].record;
        assert_eq!(record.fields["name"], Value::from("Ada Lovelace"));
        assert_eq!(record.fields["origin"], Value::from("imported"));
        assert!(record.id.is_some());
    }

    #[test]
    fn test_identity_records_merge_by_email() {
        let mut def = ImportDefinition::new("members", "members.json");
        def.primary_key_field = Some("id".into());
        def.identity = Some(IdentitySettings {
            email_field: Some("email".into()),
            ..Default::default()
        });
        def.add_mapping(FieldMapping::copy("email", "email"));

        let (outcome, remapper) = run(
            def,
            json!([
                {"id": "u1", "email": "ada@example.com"},
                {"id": "u2", "email": "ADA@example.com"}
            ]),
        );
        assert_eq!(outcome.accepted.len(), 2);
        let first = &outcome.accepted[0].record;
        let second = &outcome.accepted[1].record;
        assert_eq!(first.id, second.id);
        assert_eq!(first.identity, Some(IdentityOutcome::New));
        assert_eq!(second.identity, Some(IdentityOutcome::Merged));
        assert!(!second.needs_create());

        let canonical = first.id.as_deref().unwrap();
        assert_eq!(remapper.merges("members").unwrap().merged(canonical), &["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn test_update_kind_stores_match_value() {
        let mut def = ImportDefinition::new("books", "books.json");
        def.kind = ImportKind::Update;
        def.update_mapping = Some(crate::import::UpdateMapping {
            original_id_field: "legacy_id".into(),
            target_field: "legacyId".into(),
        });
        def.add_mapping(FieldMapping::copy("price", "price"));

        let (outcome, _) = run(def, json!([{"legacy_id": 42, "price": 9}, {"price": 1}]));
        assert_eq!(outcome.accepted.len(), 1);
        let record = &outcome.accepted[0].record;
        assert_eq!(record.id, None);
        assert_eq!(record.extension[MATCH_VALUE_KEY], Value::Int(42));
    }

    #[test]
    fn test_non_object_record_rejected() {
        let (outcome, _) = run(books(), json!([1, {"id": "b2"}]));
        assert_eq!(outcome.accepted.len(), 1);
        assert!(matches!(outcome.rejected[0].reason, RejectReason::Transform(_)));
    }
}
