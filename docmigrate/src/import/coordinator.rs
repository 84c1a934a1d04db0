//! A complete migration run
//!
//! Order of work:
//! 1. relationship attributes are queued and applied where possible
//! 2. the identity index is seeded from the identity store
//! 3. every import definition is loaded, transformed and written
//! 4. relationship values are reconciled
//! 5. abandoned attribute operations get one final pass

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};

use super::converters::ConverterRegistry;
use super::dependency_queue::{AttributeDependencyQueue, BackendSchema, QueueReport, QueuedAttributeOperation};
use super::executor::{BatchExecutor, BatchSettings, Job};
use super::loader::{check_definition, check_references, load_records};
use super::pipeline::Pipeline;
use super::post_actions::{PostActionReport, PostActionRunner};
use super::progress::ProgressTracker;
use super::reconcile::{ReconcileReport, Reconciler};
use super::remap::{IdRemapper, RemapStats};
use super::validators::ValidatorRegistry;
use super::{CollectionDescriptor, CollectionImportState, IdentityOutcome, ImportDefinition};
use crate::api::{Backends, ResilienceConfig};

const IDENTITY_PAGE_SIZE: usize = 100;

/// Everything a run needs to know about the source and target
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    pub collections: Vec<CollectionDescriptor>,
    pub imports: Vec<ImportDefinition>,
    /// Directory data files are resolved against
    pub data_dir: PathBuf,
}

/// Result of one import definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefinitionReport {
    pub label: String,
    pub collection: String,
    pub loaded: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub created: usize,
    pub skipped_existing: usize,
    pub failed: usize,
    /// Identity records folded into another record's identity
    pub merged: usize,
    pub uploads: PostActionReport,
    /// Set when the definition could not be imported at all
    pub error: Option<String>,
}

impl DefinitionReport {
    fn new(definition: &ImportDefinition) -> Self {
        Self {
            label: definition.label(),
            collection: definition.collection.clone(),
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.failed == 0 && self.uploads.failed == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub run_id: String,
    pub definitions: Vec<DefinitionReport>,
    pub attributes_applied: Vec<String>,
    pub abandoned: Vec<QueuedAttributeOperation>,
    pub reconcile: ReconcileReport,
    pub remap: RemapStats,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        !self.abandoned.is_empty()
            || self.reconcile.failed > 0
            || self.definitions.iter().any(|d| !d.is_clean())
    }
}

/// State of one migration run
pub struct MigrationRun {
    run_id: String,
    backends: Backends,
    resilience: ResilienceConfig,
    batch: BatchSettings,
    remapper: IdRemapper,
    queue: AttributeDependencyQueue,
    states: HashMap<String, CollectionImportState>,
    /// Collection name -> backend id
    collection_ids: HashMap<String, String>,
    converters: ConverterRegistry,
    validators: ValidatorRegistry,
}

impl MigrationRun {
    pub fn new(backends: Backends, resilience: ResilienceConfig, batch: BatchSettings) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            backends,
            resilience,
            batch,
            remapper: IdRemapper::new(),
            queue: AttributeDependencyQueue::new(),
            states: HashMap::new(),
            collection_ids: HashMap::new(),
            converters: ConverterRegistry::builtin(),
            validators: ValidatorRegistry::builtin(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn remapper(&self) -> &IdRemapper {
        &self.remapper
    }

    pub fn state(&self, collection: &str) -> Option<&CollectionImportState> {
        self.states.get(collection)
    }

    fn collection_id(&self, name: &str) -> String {
        self.collection_ids
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub async fn run(&mut self, plan: &MigrationPlan) -> Result<RunReport> {
        info!(
            "Starting run {}: {} collections, {} imports",
            self.run_id,
            plan.collections.len(),
            plan.imports.len()
        );
        let mut report = RunReport {
            run_id: self.run_id.clone(),
            ..Default::default()
        };

        for descriptor in &plan.collections {
            let id = descriptor.id.clone().unwrap_or_else(|| descriptor.name.clone());
            self.collection_ids.insert(descriptor.name.clone(), id);
            for attribute in descriptor.reconciled_relationships() {
                self.queue.push(QueuedAttributeOperation::for_relationship(
                    descriptor.name.clone(),
                    attribute.clone(),
                ));
            }
        }
        let first = self.process_queue().await;
        report.attributes_applied.extend(first.applied);

        if plan.imports.iter().any(ImportDefinition::is_identity) {
            let identities = self.backends.identities.clone();
            if let Err(e) = self
                .remapper
                .seed_identities(identities.as_ref(), IDENTITY_PAGE_SIZE)
                .await
            {
                warn!("Could not read existing identities; matching only within this run: {}", e);
            }
        }

        let executor = BatchExecutor::new(self.backends.clone(), &self.resilience, self.batch);
        for definition in &plan.imports {
            let mut definition_report = DefinitionReport::new(definition);
            if let Err(e) = self
                .import_definition(&executor, plan, definition, &mut definition_report)
                .await
            {
                error!("Import {} aborted: {:#}", definition.label(), e);
                definition_report.error = Some(format!("{:#}", e));
            }
            report.definitions.push(definition_report);
        }

        report.reconcile = Reconciler::new(&executor, &self.remapper, &self.states, &self.collection_ids)
            .reconcile(&plan.collections)
            .await;

        if self.queue.requeue_abandoned() > 0 {
            let last = self.process_queue().await;
            report.attributes_applied.extend(last.applied);
            report.abandoned = last.abandoned;
        }

        report.remap = self.remapper.stats();
        info!(
            "Run {} finished: {} definitions, {} abandoned attributes, {} references updated",
            self.run_id,
            report.definitions.len(),
            report.abandoned.len(),
            report.reconcile.updated
        );
        Ok(report)
    }

    async fn process_queue(&mut self) -> QueueReport {
        let documents = self.backends.documents.clone();
        let schema = BackendSchema::new(documents.as_ref(), self.collection_ids.clone());
        self.queue.process(&schema).await
    }

    async fn import_definition(
        &mut self,
        executor: &BatchExecutor,
        plan: &MigrationPlan,
        definition: &ImportDefinition,
        report: &mut DefinitionReport,
    ) -> Result<()> {
        check_definition(definition)?;
        check_references(definition, &plan.collections)?;
        let raws = load_records(&plan.data_dir, definition)
            .with_context(|| format!("loading {}", definition.label()))?;
        report.loaded = raws.len();

        let definition = Arc::new(definition.clone());
        let pipeline = Pipeline::new(&self.converters, &self.validators);
        let outcome = pipeline.transform(&definition, raws, &mut self.remapper);
        report.accepted = outcome.accepted.len();
        report.rejected = outcome.rejected.len();
        report.duplicates = outcome.duplicates();
        report.invalid = outcome.invalid();

        let collection_id = self.collection_id(&definition.collection);
        let mut jobs = Vec::new();
        for (index, imported) in outcome.accepted.iter().enumerate() {
            if imported.record.identity == Some(IdentityOutcome::Merged) {
                report.merged += 1;
            }
            if let Some(job) = Job::for_record(index, imported, &collection_id) {
                jobs.push(job);
            }
        }

        let scope = format!("{}_{}", definition.kind.label(), definition.file.display());
        let mut tracker = ProgressTracker::new(self.backends.progress.clone(), "import", &collection_id, jobs.len())
            .scoped(&scope);
        let execution = executor.execute(jobs, Some(&mut tracker)).await;
        report.created = execution.succeeded;
        report.skipped_existing = execution.skipped_existing;
        report.failed = execution.failed;

        let created: Vec<_> = outcome
            .accepted
            .iter()
            .enumerate()
            .filter_map(|(index, imported)| execution.outcome(index).map(|o| (imported, o)))
            .filter(|(_, o)| o.is_created())
            .collect();
        report.uploads = PostActionRunner::new(executor, &plan.data_dir)
            .run(&collection_id, &created)
            .await;

        let state = self
            .states
            .entry(definition.collection.clone())
            .or_insert_with(|| CollectionImportState::new(definition.collection.clone()));
        for (index, imported) in outcome.accepted.into_iter().enumerate() {
            let kept = match execution.outcome(index) {
                Some(o) => o.is_written(),
                None => imported.record.identity == Some(IdentityOutcome::Merged),
            };
            if kept {
                state.push(imported);
            }
        }

        info!(
            "{}: {} loaded, {} created, {} existing, {} failed, {} rejected",
            definition.label(),
            report.loaded,
            report.created,
            report.skipped_existing,
            report.failed,
            report.rejected
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MemoryBackend, ProgressStatus};
    use crate::import::{
        FieldMapping, FileDescriptor, IdMapping, IdentitySettings, RelationType, RelationshipAttribute,
        ValidationRule,
    };
    use serde_json::json;
    use std::time::Duration;

    fn write(dir: &tempfile::TempDir, name: &str, value: serde_json::Value) {
        std::fs::write(dir.path().join(name), value.to_string()).unwrap();
    }

    fn backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        for collection in ["authors", "books", "customers", "members"] {
            backend.add_collection(collection);
        }
        backend
    }

    fn run_with(backend: &Arc<MemoryBackend>) -> MigrationRun {
        let resilience = ResilienceConfig::builder().batch_delay(Duration::ZERO).build();
        MigrationRun::new(Backends::from_shared(backend.clone()), resilience, BatchSettings::default())
    }

    fn library_plan(dir: &tempfile::TempDir) -> MigrationPlan {
        write(dir, "authors.json", json!([
            {"id": "a1", "name": "Frank Herbert"},
            {"id": "a2", "name": "Jane Austen"}
        ]));
        write(dir, "books.json", json!({"data": {"items": [
            {"id": "b1", "title": "Dune", "author": "a1"},
            {"id": "b2", "title": "Emma", "author": "a2"},
            {"id": "b2", "title": "Emma (duplicate)", "author": "a2"},
            {"id": "b3", "title": "", "author": "a1"}
        ]}}));

        let mut authors = ImportDefinition::new("authors", "authors.json");
        authors.primary_key_field = Some("id".into());
        authors.add_mapping(FieldMapping::copy("name", "name"));

        let mut books = ImportDefinition::new("books", "books.json");
        books.base_path = Some("data.items".into());
        books.primary_key_field = Some("id".into());
        books.add_mapping(
            FieldMapping::copy("title", "title")
                .with_converters(&["trim"])
                .with_rule(ValidationRule::new("isNonEmpty", vec![])),
        );
        books.id_mappings.push(IdMapping {
            source_field: "author".into(),
            target_field: "author".into(),
            target_collection: "authors".into(),
            field_to_set: None,
            target_field_to_match: None,
        });

        MigrationPlan {
            collections: vec![
                CollectionDescriptor::new("authors"),
                CollectionDescriptor::new("books").with_relationship(RelationshipAttribute::new(
                    "author",
                    "authors",
                    RelationType::ManyToOne,
                )),
            ],
            imports: vec![authors, books],
            data_dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_full_run_links_relationships() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let mut run = run_with(&backend);

        let report = run.run(&library_plan(&dir)).await.unwrap();

        assert_eq!(report.attributes_applied, ["books.author"]);
        assert!(report.abandoned.is_empty());
        let books = &report.definitions[1];
        assert_eq!(books.loaded, 4);
        assert_eq!(books.created, 2);
        assert_eq!(books.duplicates, 1);
        assert_eq!(books.invalid, 1);

        let author_id = run.remapper().lookup("authors", "a1").unwrap();
        assert_eq!(backend.document("books", "b1").unwrap()["author"], json!(author_id));
        assert_eq!(report.reconcile.updated, 2);

        let last = backend.progress_history().pop().unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
        assert_eq!(last.target_collection_id, "books");
    }

    #[tokio::test]
    async fn test_rerun_skips_existing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let plan = library_plan(&dir);
        run_with(&backend).run(&plan).await.unwrap();

        let report = run_with(&backend).run(&plan).await.unwrap();
        assert_eq!(report.definitions[0].skipped_existing, 2);
        assert_eq!(report.definitions[0].created, 0);
        assert_eq!(backend.document_count("authors"), 2);
        assert!(!report.has_failures());
    }

    #[tokio::test]
    async fn test_broken_definition_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let mut plan = library_plan(&dir);
        plan.imports.insert(0, ImportDefinition::new("books", "missing.json"));

        let report = run_with(&backend).run(&plan).await.unwrap();
        assert!(report.definitions[0].error.as_deref().unwrap().contains("missing.json"));
        assert_eq!(report.definitions[1].created, 2);
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn test_identities_merge_by_email() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "customers.json", json!([
            {"id": "c1", "email": "Ada@Example.com", "name": "Ada"},
            {"id": "c2", "email": "ada@example.com ", "name": "Ada L."},
            {"id": "c3", "email": "grace@example.com", "name": "Grace"}
        ]));
        let backend = backend();
        backend.insert_identity("known", Some("grace@example.com"), None);

        let mut customers = ImportDefinition::new("customers", "customers.json");
        customers.primary_key_field = Some("id".into());
        customers.identity = Some(IdentitySettings {
            email_field: Some("email".into()),
            phone_field: None,
            name_field: Some("name".into()),
        });
        customers.add_mapping(FieldMapping::copy("email", "email"));
        customers.add_mapping(FieldMapping::copy("name", "name"));

        let plan = MigrationPlan {
            collections: vec![CollectionDescriptor::new("customers")],
            imports: vec![customers],
            data_dir: dir.path().to_path_buf(),
        };
        let mut run = run_with(&backend);
        let report = run.run(&plan).await.unwrap();

        let customers = &report.definitions[0];
        assert_eq!(customers.merged, 1);
        assert_eq!(customers.created, 2);
        // One new identity next to the pre-existing one
        assert_eq!(backend.identity_count(), 2);
        assert!(backend.document("customers", "known").is_some());

        let canonical = run.remapper().lookup_identity("customers", "c1").unwrap();
        assert_eq!(run.remapper().lookup_identity("customers", "c2"), Some(canonical));
        assert_eq!(run.remapper().merges("customers").unwrap().merged(canonical), ["c1", "c2"]);
    }

    fn single_collection_plan(dir: &tempfile::TempDir, definition: ImportDefinition) -> MigrationPlan {
        MigrationPlan {
            collections: vec![CollectionDescriptor::new(definition.collection.clone())],
            imports: vec![definition],
            data_dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_rerun_with_key_that_is_not_an_id() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "books.json", json!([
            {"id": "ISBN 978/1", "title": "Dune"},
            {"id": "a-key-that-is-much-too-long-to-be-used-as-an-id", "title": "Emma"}
        ]));
        let mut books = ImportDefinition::new("books", "books.json");
        books.primary_key_field = Some("id".into());
        books.add_mapping(FieldMapping::copy("title", "title"));
        let plan = single_collection_plan(&dir, books);
        let backend = backend();

        let first = run_with(&backend).run(&plan).await.unwrap();
        assert_eq!(first.definitions[0].created, 2);

        let second = run_with(&backend).run(&plan).await.unwrap();
        assert_eq!(second.definitions[0].created, 0);
        assert_eq!(second.definitions[0].skipped_existing, 2);
        assert_eq!(backend.document_count("books"), 2);
    }

    #[tokio::test]
    async fn test_identity_collections_keep_separate_source_ids() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "customers.json", json!([{"id": "1", "email": "ada@example.com"}]));
        write(&dir, "members.json", json!([{"id": "1", "email": "grace@example.com"}]));

        let identity = |collection: &str, file: &str| {
            let mut definition = ImportDefinition::new(collection, file);
            definition.primary_key_field = Some("id".into());
            definition.identity = Some(IdentitySettings {
                email_field: Some("email".into()),
                ..Default::default()
            });
            definition.add_mapping(FieldMapping::copy("email", "email"));
            definition
        };
        let plan = MigrationPlan {
            collections: vec![CollectionDescriptor::new("customers"), CollectionDescriptor::new("members")],
            imports: vec![identity("customers", "customers.json"), identity("members", "members.json")],
            data_dir: dir.path().to_path_buf(),
        };
        let backend = backend();
        let mut run = run_with(&backend);
        let report = run.run(&plan).await.unwrap();

        let members = &report.definitions[1];
        assert_eq!(members.created, 1);
        assert_eq!(members.merged, 0);
        assert_eq!(backend.document_count("members"), 1);
        assert_eq!(backend.identity_count(), 2);

        let ada = run.remapper().lookup_identity("customers", "1").unwrap();
        let grace = run.remapper().lookup_identity("members", "1").unwrap();
        assert_ne!(ada, grace);
    }

    #[tokio::test]
    async fn test_rerun_does_not_upload_files_again() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dune.txt"), b"cover").unwrap();
        write(&dir, "books.json", json!([{"id": "b1", "title": "Dune", "cover": "dune.txt"}]));

        let mut books = ImportDefinition::new("books", "books.json");
        books.primary_key_field = Some("id".into());
        books.add_mapping(FieldMapping::copy("title", "title"));
        let mut cover = FieldMapping::copy("cover", "covers");
        cover.file = Some(FileDescriptor {
            bucket_id: "covers".into(),
            path: "{cover}".into(),
            name: "{docId}.txt".into(),
            array: true,
        });
        books.add_mapping(cover);
        let plan = single_collection_plan(&dir, books);
        let backend = backend();

        let first = run_with(&backend).run(&plan).await.unwrap();
        assert_eq!(first.definitions[0].uploads.uploaded, 1);

        let second = run_with(&backend).run(&plan).await.unwrap();
        assert_eq!(second.definitions[0].uploads.uploaded, 0);
        assert_eq!(backend.files().len(), 1);
        assert_eq!(backend.document("books", "b1").unwrap()["covers"], json!(["file1"]));
    }

    #[tokio::test]
    async fn test_definitions_sharing_a_collection_track_progress_separately() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir, "books.json", json!([{"id": "b1", "title": "Dune"}]));
        write(&dir, "more.json", json!([{"id": "b2", "title": "Emma"}]));

        let books = |file: &str| {
            let mut definition = ImportDefinition::new("books", file);
            definition.primary_key_field = Some("id".into());
            definition.add_mapping(FieldMapping::copy("title", "title"));
            definition
        };
        let plan = MigrationPlan {
            collections: vec![CollectionDescriptor::new("books")],
            imports: vec![books("books.json"), books("more.json")],
            data_dir: dir.path().to_path_buf(),
        };
        let backend = backend();
        run_with(&backend).run(&plan).await.unwrap();

        let mut finished: Vec<String> = backend
            .progress_history()
            .into_iter()
            .filter(|r| r.status == ProgressStatus::Completed)
            .map(|r| r.id)
            .collect();
        finished.dedup();
        assert_eq!(finished, ["import_books_create_books.json", "import_books_create_more.json"]);
    }
}
