//! Actions run once a document exists, such as file uploads

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use serde_json::Value as JsonValue;

use super::executor::{BatchExecutor, JobOutcome};
use super::template::resolve_value;
use super::{ImportedRecord, PostCreateAction, Value};
use crate::api::Operation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostActionReport {
    pub uploaded: usize,
    pub failed: usize,
}

/// Resolved parameters of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
struct UploadRequest {
    bucket_id: String,
    path: String,
    name: String,
}

impl UploadRequest {
    fn from_params(params: &Value) -> Result<Self> {
        let text = |key: &str| {
            params
                .get(key)
                .map(Value::render)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| anyhow!("upload parameter '{}' resolved to nothing", key))
        };
        Ok(Self {
            bucket_id: text("bucket_id")?,
            path: text("path")?,
            name: text("name")?,
        })
    }

    fn is_remote(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }
}

pub struct PostActionRunner<'a> {
    executor: &'a BatchExecutor,
    data_dir: PathBuf,
    http: reqwest::Client,
}

impl<'a> PostActionRunner<'a> {
    pub fn new(executor: &'a BatchExecutor, data_dir: impl AsRef<Path>) -> Self {
        Self {
            executor,
            data_dir: data_dir.as_ref().to_path_buf(),
            http: reqwest::Client::new(),
        }
    }

    /// Run the post actions of every record this run created.
    ///
    /// Documents that already existed keep the files linked when they were created.
    pub async fn run(&self, collection_id: &str, created: &[(&ImportedRecord, &JobOutcome)]) -> PostActionReport {
        let mut report = PostActionReport::default();

        for (imported, outcome) in created {
            if imported.record.post_actions.is_empty() || !outcome.is_created() {
                continue;
            }
            let Some(document_id) = outcome.document_id.as_deref().or(imported.record.id.as_deref()) else {
                continue;
            };
            let created = outcome.results.last().and_then(|r| r.data.as_ref());

            for action in &imported.record.post_actions {
                match self.run_action(collection_id, document_id, imported, created, action).await {
                    Ok(file_id) => {
                        debug!("Linked file {} into {}.{}", file_id, document_id, action.target_field());
                        report.uploaded += 1;
                    }
                    Err(e) => {
                        warn!(
                            "Post-create action on {}/{} ({}) failed: {:#}",
                            collection_id,
                            document_id,
                            action.target_field(),
                            e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        if report.uploaded + report.failed > 0 {
            info!(
                "Post-create actions on {}: {} uploaded, {} failed",
                collection_id, report.uploaded, report.failed
            );
        }
        report
    }

    async fn run_action(
        &self,
        collection_id: &str,
        document_id: &str,
        imported: &ImportedRecord,
        created: Option<&JsonValue>,
        action: &PostCreateAction,
    ) -> Result<String> {
        let PostCreateAction::UploadFile {
            target_field,
            params,
            array,
        } = action;

        let mut extra = Value::mapping();
        extra.insert("$id", Value::from(document_id));
        if let Some(data) = created {
            extra.insert("createdDoc", Value::from_json(data));
        }
        let context = imported.template_context().merged_with(&extra);
        let resolved = resolve_value(params, &context).context("invalid upload template")?;
        let request = UploadRequest::from_params(&resolved)?;

        let bytes = self.read_bytes(&request).await?;
        let blobs = self.executor.backends().blobs.clone();
        let file_id = self
            .executor
            .policy()
            .execute("upload_file", || {
                blobs.upload_file(&request.bucket_id, &request.name, bytes.clone())
            })
            .await
            .with_context(|| format!("uploading {} to bucket {}", request.name, request.bucket_id))?;

        let value = if *array {
            let documents = self.executor.backends().documents.clone();
            let current = documents
                .get_document(collection_id, document_id)
                .await?
                .and_then(|d| d.get(target_field).cloned());
            let mut ids: Vec<JsonValue> = match current {
                Some(JsonValue::Array(items)) => items,
                Some(JsonValue::Null) | None => Vec::new(),
                Some(other) => vec![other],
            };
            ids.push(JsonValue::String(file_id.clone()));
            JsonValue::Array(ids)
        } else {
            JsonValue::String(file_id.clone())
        };

        let mut patch = serde_json::Map::new();
        patch.insert(target_field.clone(), value);
        let link = Operation::update(collection_id, document_id, JsonValue::Object(patch));
        let result = self.executor.run_operation(link).await;
        if let Some(message) = result.error {
            bail!("linking file {}: {}", file_id, message);
        }
        Ok(file_id)
    }

    async fn read_bytes(&self, request: &UploadRequest) -> Result<Vec<u8>> {
        if request.is_remote() {
            let response = self
                .http
                .get(&request.path)
                .send()
                .await
                .with_context(|| format!("fetching {}", request.path))?;
            let status = response.status();
            if !status.is_success() {
                bail!("fetching {}: HTTP {}", request.path, status);
            }
            let bytes = response.bytes().await.context("reading download body")?;
            return Ok(bytes.to_vec());
        }

        let path = self.data_dir.join(&request.path);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::api::{Backends, Document, MemoryBackend, OperationResult, ResilienceConfig};
    use crate::import::executor::{BatchSettings, JobStatus};
    use crate::import::{ImportDefinition, TransformedRecord};
    use std::sync::Arc;
    use std::time::Duration;

    fn upload(path: &str, array: bool) -> PostCreateAction {
        let mut params = Value::mapping();
        params.insert("bucket_id", Value::from("covers"));
        params.insert("path", Value::from(path));
        params.insert("name", Value::from("{docId}.txt"));
        PostCreateAction::UploadFile {
            target_field: "covers".into(),
            params,
            array,
        }
    }

    fn written(id: &str, raw: serde_json::Value, actions: Vec<PostCreateAction>) -> (ImportedRecord, JobOutcome) {
        let raw = Value::from_json(&raw);
        let mut extra = Value::mapping();
        extra.insert("docId", Value::from(id));
        let imported = ImportedRecord {
            context: raw.merged_with(&extra),
            raw,
            record: TransformedRecord {
                id: Some(id.to_string()),
                post_actions: actions,
                ..Default::default()
            },
            definition: Arc::new(ImportDefinition::new("books", "books.json")),
        };
        let operation = Operation::create("books", id, json!({}));
        let outcome = JobOutcome {
            index: 0,
            status: JobStatus::Succeeded,
            document_id: Some(id.to_string()),
            results: vec![OperationResult::success(operation, Document::new(id, json!({})))],
        };
        (imported, outcome)
    }

    fn executor(backend: &Arc<MemoryBackend>) -> BatchExecutor {
        let resilience = ResilienceConfig::builder().batch_delay(Duration::ZERO).build();
        BatchExecutor::new(Backends::from_shared(backend.clone()), &resilience, BatchSettings::default())
    }

    #[tokio::test]
    async fn test_uploads_local_file_and_appends_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dune.txt"), b"cover").unwrap();

        let backend = Arc::new(MemoryBackend::new());
        backend.add_collection("books");
        backend.insert_document("books", "b1", json!({"covers": ["old"]}));

        let executor = executor(&backend);
        let runner = PostActionRunner::new(&executor, dir.path());
        let (imported, outcome) = written("b1", json!({"slug": "dune"}), vec![upload("{slug}.txt", true)]);

        let report = runner.run("books", &[(&imported, &outcome)]).await;
        assert_eq!(report, PostActionReport { uploaded: 1, failed: 0 });

        let files = backend.files();
        assert_eq!(files[0].name, "b1.txt");
        assert_eq!(files[0].bytes, b"cover");
        assert_eq!(backend.document("books", "b1").unwrap()["covers"], json!(["old", files[0].id]));
    }

    #[tokio::test]
    async fn test_missing_file_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.add_collection("books");
        backend.insert_document("books", "b1", json!({}));

        let executor = executor(&backend);
        let runner = PostActionRunner::new(&executor, dir.path());
        let (imported, outcome) = written("b1", json!({}), vec![upload("nope.txt", false)]);

        let report = runner.run("books", &[(&imported, &outcome)]).await;
        assert_eq!(report.failed, 1);
        assert!(backend.files().is_empty());
    }

    #[tokio::test]
    async fn test_existing_document_gets_no_upload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dune.txt"), b"cover").unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.add_collection("books");
        backend.insert_document("books", "b1", json!({"covers": ["f1"]}));

        let executor = executor(&backend);
        let runner = PostActionRunner::new(&executor, dir.path());
        let (imported, mut outcome) = written("b1", json!({"slug": "dune"}), vec![upload("{slug}.txt", true)]);
        outcome.status = JobStatus::SkippedExisting;

        let report = runner.run("books", &[(&imported, &outcome)]).await;
        assert_eq!(report, PostActionReport::default());
        assert!(backend.files().is_empty());
        assert_eq!(backend.document("books", "b1").unwrap()["covers"], json!(["f1"]));
    }

    #[test]
    fn test_upload_request_requires_every_param() {
        let mut params = Value::mapping();
        params.insert("bucket_id", Value::from("covers"));
        params.insert("path", Value::Null);
        params.insert("name", Value::from("x"));
        assert!(UploadRequest::from_params(&params).is_err());
    }
}
