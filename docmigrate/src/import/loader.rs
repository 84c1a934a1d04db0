//! Loading source records for an import definition

use std::path::{Path, PathBuf};

use super::error::ImportError;
use super::path::resolve_path;
use super::{CollectionDescriptor, ImportDefinition, ImportKind, Value};

/// Resolve the data file of `definition` against `data_dir`
pub fn data_file_path(data_dir: &Path, definition: &ImportDefinition) -> PathBuf {
    if definition.file.is_absolute() {
        definition.file.clone()
    } else {
        data_dir.join(&definition.file)
    }
}

/// Read the records of one definition
///
/// The file must contain JSON; with `base_path` set, the array is taken from
/// that path inside the document.
pub fn load_records(data_dir: &Path, definition: &ImportDefinition) -> Result<Vec<Value>, ImportError> {
    let path = data_file_path(data_dir, definition);
    let text = std::fs::read_to_string(&path).map_err(|source| ImportError::Read {
        path: path.clone(),
        source,
    })?;
    let json: serde_json::Value = serde_json::from_str(&text).map_err(|source| ImportError::Parse {
        path: path.clone(),
        source,
    })?;

    let root = Value::from_json(&json);
    let records = match definition.base_path.as_deref() {
        Some(base) if !base.trim().is_empty() => resolve_path(&root, base),
        _ => root,
    };

    match records {
        Value::Sequence(items) => {
            log::debug!("Loaded {} records from {}", items.len(), path.display());
            Ok(items)
        }
        other => Err(ImportError::NotAnArray {
            path,
            found: other.type_name(),
        }),
    }
}

/// Check that a definition is internally consistent
pub fn check_definition(definition: &ImportDefinition) -> Result<(), ImportError> {
    let invalid = |message: &str| ImportError::InvalidDefinition {
        collection: definition.collection.clone(),
        message: message.to_string(),
    };

    if definition.collection.trim().is_empty() {
        return Err(invalid("collection name is empty"));
    }
    if definition.kind == ImportKind::Update && definition.update_mapping.is_none() {
        return Err(invalid("update imports require update_mapping"));
    }
    for mapping in &definition.mappings {
        if mapping.source.is_none() && mapping.constant.is_none() {
            return Err(invalid(&format!(
                "mapping for '{}' has neither source nor constant",
                mapping.target
            )));
        }
    }
    Ok(())
}

/// Check that every id mapping writes a relationship the reconciler fills in
///
/// Deferred reference keys are left out of the created document, so a key
/// with no reconciled relationship on the collection would never be written.
pub fn check_references(
    definition: &ImportDefinition,
    collections: &[CollectionDescriptor],
) -> Result<(), ImportError> {
    let descriptor = collections.iter().find(|c| c.name == definition.collection);
    for mapping in &definition.id_mappings {
        let key = mapping.field_to_set();
        let reconciled = descriptor
            .is_some_and(|d| d.reconciled_relationships().any(|r| r.key == key));
        if !reconciled {
            return Err(ImportError::InvalidDefinition {
                collection: definition.collection.clone(),
                message: format!(
                    "id mapping for '{}' has no reconciled relationship '{}' on the collection",
                    mapping.source_field, key
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{IdMapping, RelationSide, RelationType, RelationshipAttribute, UpdateMapping};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_loads_top_level_array() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("books.json"), r#"[{"id": 1}, {"id": 2}]"#).unwrap();

        let def = ImportDefinition::new("books", "books.json");
        let records = load_records(dir.path(), &def).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_loads_from_base_path() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("export.json"),
            r#"{"data": {"items": [{"id": "a"}]}}"#,
        )
        .unwrap();

        let mut def = ImportDefinition::new("books", "export.json");
        def.base_path = Some("data.items".into());
        assert_eq!(load_records(dir.path(), &def).unwrap().len(), 1);
    }

    #[test]
    fn test_non_array_root_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("one.json"), r#"{"id": 1}"#).unwrap();

        let def = ImportDefinition::new("books", "one.json");
        let err = load_records(dir.path(), &def).unwrap_err();
        assert!(matches!(err, ImportError::NotAnArray { .. }));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = TempDir::new().unwrap();
        let def = ImportDefinition::new("books", "missing.json");
        assert!(matches!(
            load_records(dir.path(), &def),
            Err(ImportError::Read { .. })
        ));
    }

    #[test]
    fn test_update_requires_mapping() {
        let mut def = ImportDefinition::new("books", "books.json");
        def.kind = ImportKind::Update;
        assert!(check_definition(&def).is_err());

        def.update_mapping = Some(UpdateMapping {
            original_id_field: "id".into(),
            target_field: "legacyId".into(),
        });
        assert!(check_definition(&def).is_ok());
    }

    #[test]
    fn test_id_mapping_needs_reconciled_relationship() {
        let mut def = ImportDefinition::new("books", "books.json");
        def.id_mappings.push(IdMapping {
            source_field: "authorId".into(),
            target_field: "author".into(),
            target_collection: "authors".into(),
            field_to_set: None,
            target_field_to_match: None,
        });

        assert!(check_references(&def, &[]).is_err());

        let child = CollectionDescriptor::new("books").with_relationship(
            RelationshipAttribute::new("author", "authors", RelationType::ManyToOne)
                .two_way("books", RelationSide::Child),
        );
        assert!(check_references(&def, &[child]).is_err());

        let parent = CollectionDescriptor::new("books")
            .with_relationship(RelationshipAttribute::new("author", "authors", RelationType::ManyToOne));
        assert!(check_references(&def, &[parent.clone()]).is_ok());

        def.id_mappings[0].field_to_set = Some("writer".into());
        assert!(check_references(&def, &[parent]).is_err());
    }
}
