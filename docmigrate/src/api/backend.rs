//! Backend contracts and the models exchanged through them

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::BackendError;
use super::query::Query;
use crate::import::RelationshipAttribute;

pub type BackendResult<T> = Result<T, BackendError>;

/// A collection as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    #[serde(rename = "$id")]
    pub id: String,
    pub name: String,
}

/// An attribute of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// A stored document: backend id plus its field data
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Document {
            id: id.into(),
            data,
        }
    }

    /// Split a REST document body into id and user data (`$`-prefixed keys dropped)
    pub fn from_json(value: Value) -> BackendResult<Self> {
        let Value::Object(map) = value else {
            return Err(BackendError::Decode("document is not an object".into()));
        };
        let id = map
            .get("$id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Decode("document has no $id".into()))?
            .to_string();
        let data = map.into_iter().filter(|(k, _)| !k.starts_with('$')).collect();
        Ok(Document {
            id,
            data: Value::Object(data),
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// An end-user identity in the identity store
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(rename = "$id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Status of a long-running import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Ready => "ready",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Error => "error",
            ProgressStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Error | ProgressStatus::Cancelled
        )
    }
}

/// External record of an import's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub id: String,
    pub operation: String,
    pub target_collection_id: String,
    pub status: ProgressStatus,
    pub progress: usize,
    pub total: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(
        id: impl Into<String>,
        operation: impl Into<String>,
        target_collection_id: impl Into<String>,
        total: usize,
    ) -> Self {
        ProgressRecord {
            id: id.into(),
            operation: operation.into(),
            target_collection_id: target_collection_id.into(),
            status: ProgressStatus::Pending,
            progress: 0,
            total,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Document database contract
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Look up a collection by id; `None` when it does not exist
    async fn get_collection(&self, collection_id: &str) -> BackendResult<Option<CollectionInfo>>;

    async fn list_collections(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<CollectionInfo>>;

    async fn list_attributes(&self, collection_id: &str) -> BackendResult<Vec<AttributeInfo>>;

    /// Create a relationship attribute; `Conflict` when the key already exists
    async fn create_relationship_attribute(
        &self,
        collection_id: &str,
        related_collection_id: &str,
        attribute: &RelationshipAttribute,
    ) -> BackendResult<AttributeInfo>;

    /// Create a document with a caller-chosen id; `Conflict` when it exists
    async fn create_document(
        &self,
        collection_id: &str,
        document_id: &str,
        data: &Value,
    ) -> BackendResult<Document>;

    /// Patch the given fields of a document
    async fn update_document(
        &self,
        collection_id: &str,
        document_id: &str,
        data: &Value,
    ) -> BackendResult<Document>;

    async fn get_document(
        &self,
        collection_id: &str,
        document_id: &str,
    ) -> BackendResult<Option<Document>>;

    async fn list_documents(
        &self,
        collection_id: &str,
        queries: &[Query],
    ) -> BackendResult<Vec<Document>>;
}

/// End-user identity contract
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Create an identity; `Conflict` when the id, email or phone is taken
    async fn create_identity(&self, identity: &IdentityRecord) -> BackendResult<IdentityRecord>;

    /// List identities ordered by id, after `cursor`
    async fn list_identities(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<IdentityRecord>>;

    async fn find_by_email(&self, email: &str) -> BackendResult<Option<IdentityRecord>>;

    async fn find_by_phone(&self, phone: &str) -> BackendResult<Option<IdentityRecord>>;
}

/// Blob storage contract
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes and return the new file id
    async fn upload_file(&self, bucket_id: &str, name: &str, bytes: Vec<u8>)
    -> BackendResult<String>;
}

/// Progress record persistence
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self, id: &str) -> BackendResult<Option<ProgressRecord>>;

    /// Insert or replace
    async fn save(&self, record: &ProgressRecord) -> BackendResult<()>;
}

/// The four collaborators a run talks to
#[derive(Clone)]
pub struct Backends {
    pub documents: Arc<dyn DocumentBackend>,
    pub identities: Arc<dyn IdentityStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub progress: Arc<dyn ProgressStore>,
}

impl Backends {
    /// Use one implementation for all four contracts
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: DocumentBackend + IdentityStore + BlobStore + ProgressStore + 'static,
    {
        Backends {
            documents: backend.clone(),
            identities: backend.clone(),
            blobs: backend.clone(),
            progress: backend,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
