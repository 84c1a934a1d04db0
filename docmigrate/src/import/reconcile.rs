//! Relationship reconciliation after bulk creation
//!
//! Documents are created without their references. Once every definition has
//! run, each reconciled relationship attribute is filled in from the source
//! ids recorded during the run, translated to the new ids.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use serde_json::{Value as JsonValue, json};

use super::executor::{BatchExecutor, Job};
use super::path::resolve_path;
use super::remap::IdRemapper;
use super::{CollectionDescriptor, CollectionImportState, IdMapping, ImportedRecord, RelationType};
use crate::api::{BackendError, Document, Operation, Query};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Merge newly resolved ids into an attribute's current value
///
/// Single-valued relations take the first resolved id; multi-valued
/// relations become the duplicate-free union, existing entries first.
/// Returns `None` when the value would not change.
pub fn merge_references(
    existing: Option<&JsonValue>,
    resolved: &[String],
    relation_type: RelationType,
) -> Option<JsonValue> {
    if resolved.is_empty() {
        return None;
    }
    let current = existing.map(reference_ids).unwrap_or_default();

    if relation_type.is_single() {
        let first = &resolved[0];
        if current.first() == Some(first) && current.len() == 1 {
            return None;
        }
        return Some(JsonValue::String(first.clone()));
    }

    let mut merged = current.clone();
    for id in resolved {
        if !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    let changed = merged.len() != current.len()
        || !matches!(existing, Some(JsonValue::Array(_)));
    changed.then(|| json!(merged))
}

/// Ids referenced by a stored attribute value: strings or objects with `$id`
fn reference_ids(value: &JsonValue) -> Vec<String> {
    let one = |v: &JsonValue| match v {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Object(map) => map.get("$id").and_then(JsonValue::as_str).map(str::to_string),
        _ => None,
    };
    match value {
        JsonValue::Array(items) => items.iter().filter_map(one).collect(),
        other => one(other).into_iter().collect(),
    }
}

/// A patch for one document
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationUpdate {
    pub collection: String,
    pub document_id: String,
    pub patch: JsonValue,
}

impl ReconciliationUpdate {
    pub fn into_operation(self) -> Operation {
        Operation::update(self.collection, self.document_id, self.patch)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Documents read from the backend
    pub scanned: usize,
    pub updated: usize,
    pub failed: usize,
    /// Source ids with no counterpart in this run
    pub unresolved: usize,
}

pub struct Reconciler<'a> {
    executor: &'a BatchExecutor,
    remapper: &'a IdRemapper,
    states: &'a HashMap<String, CollectionImportState>,
    /// Collection name -> backend id
    collection_ids: &'a HashMap<String, String>,
    identity_collections: HashSet<String>,
    page_size: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        executor: &'a BatchExecutor,
        remapper: &'a IdRemapper,
        states: &'a HashMap<String, CollectionImportState>,
        collection_ids: &'a HashMap<String, String>,
    ) -> Self {
        let identity_collections = states
            .values()
            .filter(|s| s.records().iter().any(|r| r.definition.is_identity()))
            .map(|s| s.collection.clone())
            .collect();
        Self {
            executor,
            remapper,
            states,
            collection_ids,
            identity_collections,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn id_of<'n>(&'n self, name: &'n str) -> &'n str {
        self.collection_ids.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Fill in the references of every described collection
    pub async fn reconcile(&self, descriptors: &[CollectionDescriptor]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut updates = Vec::new();

        for descriptor in descriptors {
            if descriptor.reconciled_relationships().next().is_none() {
                continue;
            }
            let Some(state) = self.states.get(&descriptor.name) else {
                debug!("Nothing imported into {}; no references to reconcile", descriptor.name);
                continue;
            };
            match self.collect_updates(descriptor, state, &mut report).await {
                Ok(found) => updates.extend(found),
                Err(e) => warn!("Reconciliation of {} stopped: {}", descriptor.name, e),
            }
        }

        if !updates.is_empty() {
            let jobs = updates
                .into_iter()
                .enumerate()
                .map(|(index, update)| Job::new(index, vec![update.into_operation()]))
                .collect();
            let execution = self.executor.execute(jobs, None).await;
            report.updated = execution.succeeded;
            report.failed = execution.failed;
        }

        info!(
            "Reconciled references: {} documents scanned, {} updated, {} failed, {} unresolved ids",
            report.scanned, report.updated, report.failed, report.unresolved
        );
        report
    }

    async fn collect_updates(
        &self,
        descriptor: &CollectionDescriptor,
        state: &CollectionImportState,
        report: &mut ReconcileReport,
    ) -> Result<Vec<ReconciliationUpdate>, BackendError> {
        let collection_id = self.id_of(&descriptor.name).to_string();
        let documents = self.executor.backends().documents.clone();
        let mut updates = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let queries = Query::page(cursor.as_deref(), self.page_size);
            let page = documents.list_documents(&collection_id, &queries).await?;
            let page_len = page.len();

            for document in &page {
                report.scanned += 1;
                if state.get(&document.id).is_none() {
                    continue;
                }
                if let Some(patch) = self.patch_for(descriptor, state, document, report).await {
                    updates.push(ReconciliationUpdate {
                        collection: collection_id.clone(),
                        document_id: document.id.clone(),
                        patch,
                    });
                }
            }

            match page.last() {
                Some(last) if page_len >= self.page_size => cursor = Some(last.id.clone()),
                _ => break,
            }
        }

        debug!("{}: {} documents need reference updates", descriptor.name, updates.len());
        Ok(updates)
    }

    async fn patch_for(
        &self,
        descriptor: &CollectionDescriptor,
        state: &CollectionImportState,
        document: &Document,
        report: &mut ReconcileReport,
    ) -> Option<JsonValue> {
        let mut patch = serde_json::Map::new();

        for attribute in descriptor.reconciled_relationships() {
            let mut resolved: Vec<String> = Vec::new();
            for record in state.all_for(&document.id) {
                for mapping in record
                    .definition
                    .id_mappings
                    .iter()
                    .filter(|m| m.field_to_set() == attribute.key)
                {
                    for old_id in source_ids(record, mapping) {
                        match self.translate(mapping, &old_id).await {
                            Some(new_id) if !resolved.contains(&new_id) => resolved.push(new_id),
                            Some(_) => {}
                            None => {
                                debug!(
                                    "{}.{}: no {} document for source id '{}'",
                                    descriptor.name, attribute.key, mapping.target_collection, old_id
                                );
                                report.unresolved += 1;
                            }
                        }
                    }
                }
            }

            if let Some(value) =
                merge_references(document.get(&attribute.key), &resolved, attribute.relation_type)
            {
                patch.insert(attribute.key.clone(), value);
            }
        }

        (!patch.is_empty()).then_some(JsonValue::Object(patch))
    }

    /// New id for a source id, through the run's maps or a backend match
    async fn translate(&self, mapping: &IdMapping, old_id: &str) -> Option<String> {
        if let Some(field) = &mapping.target_field_to_match {
            let queries = [Query::equal(field.as_str(), old_id), Query::limit(1)];
            let target = self.id_of(&mapping.target_collection);
            return match self
                .executor
                .backends()
                .documents
                .list_documents(target, &queries)
                .await
            {
                Ok(found) => found.into_iter().next().map(|d| d.id),
                Err(e) => {
                    warn!("Matching {}.{} = '{}' failed: {}", mapping.target_collection, field, old_id, e);
                    None
                }
            };
        }

        let target = mapping.target_collection.as_str();
        let found = if self.identity_collections.contains(target) {
            self.remapper.lookup_identity(target, old_id)
        } else {
            self.remapper.lookup(target, old_id)
        };
        found.map(str::to_string)
    }
}

/// Source ids referenced by a record through `mapping`
///
/// The mapped deferred field is used when present, else the raw source field.
fn source_ids(record: &ImportedRecord, mapping: &IdMapping) -> Vec<String> {
    let value = record
        .record
        .extension
        .get(mapping.field_to_set())
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| resolve_path(&record.raw, &mapping.source_field));
    value
        .flatten()
        .iter()
        .map(|v| v.render())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Backends, MemoryBackend, ResilienceConfig};
    use crate::import::executor::BatchSettings;
    use crate::import::{
        IdentitySettings, ImportDefinition, RelationSide, RelationshipAttribute, TransformedRecord,
        Value,
    };
    use std::sync::Arc;

    #[test]
    fn test_scalar_takes_first_resolved() {
        let ids = vec!["a2".to_string(), "a3".to_string()];
        assert_eq!(
            merge_references(Some(&json!("a1")), &ids, RelationType::ManyToOne),
            Some(json!("a2"))
        );
        assert_eq!(merge_references(None, &ids, RelationType::OneToOne), Some(json!("a2")));
        assert_eq!(merge_references(Some(&json!("a2")), &ids, RelationType::ManyToOne), None);
        assert_eq!(merge_references(Some(&json!("a1")), &[], RelationType::ManyToOne), None);
    }

    #[test]
    fn test_array_union_without_duplicates() {
        let existing = json!(["b1", {"$id": "b2"}]);
        let ids = vec!["b2".to_string(), "b3".to_string()];
        assert_eq!(
            merge_references(Some(&existing), &ids, RelationType::OneToMany),
            Some(json!(["b1", "b2", "b3"]))
        );
        let same = vec!["b1".to_string()];
        assert_eq!(merge_references(Some(&json!(["b1"])), &same, RelationType::ManyToMany), None);
        assert_eq!(
            merge_references(Some(&JsonValue::Null), &same, RelationType::ManyToMany),
            Some(json!(["b1"]))
        );
    }

    fn imported(definition: &Arc<ImportDefinition>, id: &str, raw: serde_json::Value) -> ImportedRecord {
        ImportedRecord {
            raw: Value::from_json(&raw),
            context: Value::mapping(),
            record: TransformedRecord {
                id: Some(id.to_string()),
                ..Default::default()
            },
            definition: Arc::clone(definition),
        }
    }

    fn author_mapping() -> IdMapping {
        IdMapping {
            source_field: "authorIds".into(),
            target_field: "authors".into(),
            target_collection: "authors".into(),
            field_to_set: None,
            target_field_to_match: None,
        }
    }

    fn executor(backend: &Arc<MemoryBackend>) -> BatchExecutor {
        let resilience = ResilienceConfig::builder().batch_delay(std::time::Duration::ZERO).build();
        BatchExecutor::new(Backends::from_shared(backend.clone()), &resilience, BatchSettings::default())
    }

    #[tokio::test]
    async fn test_reconciles_parent_side_with_new_ids() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_collection("books");
        backend.insert_document("books", "nb1", json!({"title": "Dune", "authors": ["x0"]}));
        backend.insert_document("books", "nb2", json!({"title": "Emma"}));

        let mut remapper = IdRemapper::new();
        let a1 = remapper.assign("authors", Some("a1"), None).unwrap();
        let a2 = remapper.assign("authors", Some("a2"), None).unwrap();

        let mut definition = ImportDefinition::new("books", "books.json");
        definition.id_mappings.push(author_mapping());
        let definition = Arc::new(definition);

        let mut state = CollectionImportState::new("books");
        state.push(imported(&definition, "nb1", json!({"authorIds": ["a1", "a2", "zz"]})));
        state.push(imported(&definition, "nb2", json!({"authorIds": "a2"})));
        let states = HashMap::from([("books".to_string(), state)]);
        let ids = HashMap::new();

        let descriptor = CollectionDescriptor::new("books").with_relationship(
            RelationshipAttribute::new("authors", "authors", RelationType::ManyToMany)
                .two_way("books", RelationSide::Parent),
        );

        let executor = executor(&backend);
        let report = Reconciler::new(&executor, &remapper, &states, &ids)
            .with_page_size(1)
            .reconcile(&[descriptor])
            .await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.updated, 2);
        assert_eq!(report.unresolved, 1);
        assert_eq!(backend.document("books", "nb1").unwrap()["authors"], json!(["x0", a1, a2.clone()]));
        assert_eq!(backend.document("books", "nb2").unwrap()["authors"], json!([a2]));
    }

    #[tokio::test]
    async fn test_child_side_is_left_alone() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_collection("books");
        backend.insert_document("books", "nb1", json!({}));

        let mut remapper = IdRemapper::new();
        remapper.assign("authors", Some("a1"), None).unwrap();
        let mut definition = ImportDefinition::new("books", "books.json");
        definition.id_mappings.push(IdMapping {
            target_field: "author".into(),
            ..author_mapping()
        });
        let definition = Arc::new(definition);
        let mut state = CollectionImportState::new("books");
        state.push(imported(&definition, "nb1", json!({"authorIds": "a1"})));
        let states = HashMap::from([("books".to_string(), state)]);
        let ids = HashMap::new();

        let descriptor = CollectionDescriptor::new("books").with_relationship(
            RelationshipAttribute::new("author", "authors", RelationType::ManyToOne)
                .two_way("books", RelationSide::Child),
        );
        let executor = executor(&backend);
        let report = Reconciler::new(&executor, &remapper, &states, &ids)
            .reconcile(&[descriptor])
            .await;
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(backend.call_count("update_document"), 0);
    }

    #[tokio::test]
    async fn test_identity_targets_use_merge_map() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_collection("orders");
        backend.insert_document("orders", "o1", json!({}));

        let mut remapper = IdRemapper::new();
        let contact = crate::import::remap::Contact::new(Some("ada@example.com"), None);
        let first = remapper.bind_identity("customers", Some("c1"), None, &contact);
        let second = remapper.bind_identity("customers", Some("c2"), None, &contact);
        assert_eq!(first.id, second.id);

        let mut customers = ImportDefinition::new("customers", "customers.json");
        customers.identity = Some(IdentitySettings::default());
        let customers = Arc::new(customers);
        let mut customer_state = CollectionImportState::new("customers");
        customer_state.push(imported(&customers, &first.id, json!({})));

        let mut orders = ImportDefinition::new("orders", "orders.json");
        orders.id_mappings.push(IdMapping {
            source_field: "customerId".into(),
            target_field: "customer".into(),
            target_collection: "customers".into(),
            field_to_set: None,
            target_field_to_match: None,
        });
        let orders = Arc::new(orders);
        let mut order_state = CollectionImportState::new("orders");
        order_state.push(imported(&orders, "o1", json!({"customerId": "c2"})));

        let states = HashMap::from([
            ("customers".to_string(), customer_state),
            ("orders".to_string(), order_state),
        ]);
        let ids = HashMap::new();
        let descriptor = CollectionDescriptor::new("orders").with_relationship(
            RelationshipAttribute::new("customer", "customers", RelationType::ManyToOne),
        );

        let executor = executor(&backend);
        let report = Reconciler::new(&executor, &remapper, &states, &ids)
            .reconcile(&[descriptor])
            .await;
        assert_eq!(report.updated, 1);
        assert_eq!(backend.document("orders", "o1").unwrap()["customer"], json!(first.id));
    }

    #[tokio::test]
    async fn test_match_by_target_field() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_collection("books");
        backend.add_collection("authors");
        backend.insert_document("authors", "existing-author", json!({"legacyId": "L7"}));
        backend.insert_document("books", "nb1", json!({}));

        let mut definition = ImportDefinition::new("books", "books.json");
        definition.id_mappings.push(IdMapping {
            source_field: "legacyAuthor".into(),
            target_field: "author".into(),
            target_collection: "authors".into(),
            field_to_set: None,
            target_field_to_match: Some("legacyId".into()),
        });
        let definition = Arc::new(definition);
        let mut state = CollectionImportState::new("books");
        state.push(imported(&definition, "nb1", json!({"legacyAuthor": "L7"})));
        let states = HashMap::from([("books".to_string(), state)]);
        let ids = HashMap::new();
        let remapper = IdRemapper::new();

        let descriptor = CollectionDescriptor::new("books").with_relationship(
            RelationshipAttribute::new("author", "authors", RelationType::ManyToOne),
        );
        let executor = executor(&backend);
        Reconciler::new(&executor, &remapper, &states, &ids)
            .reconcile(&[descriptor])
            .await;
        assert_eq!(backend.document("books", "nb1").unwrap()["author"], json!("existing-author"));
    }
}
