//! In-process backend
//!
//! Implements every backend contract against plain maps. Used by tests and
//! by `--dry-run`. Transient failures can be injected per operation name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::backend::{
    AttributeInfo, BackendResult, BlobStore, CollectionInfo, Document, DocumentBackend,
    IdentityRecord, IdentityStore, ProgressRecord, ProgressStore,
};
use super::error::BackendError;
use super::query::{Query, cursor_of, limit_of};
use crate::import::RelationshipAttribute;

const DEFAULT_LIST_LIMIT: usize = 25;

#[derive(Debug, Default)]
struct MemoryCollection {
    info: Option<CollectionInfo>,
    attributes: Vec<AttributeInfo>,
    documents: BTreeMap<String, Value>,
}

/// A stored upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: String,
    pub bucket_id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: BTreeMap<String, MemoryCollection>,
    identities: BTreeMap<String, IdentityRecord>,
    files: Vec<StoredFile>,
    progress: HashMap<String, ProgressRecord>,
    progress_history: Vec<ProgressRecord>,
    /// Remaining injected failures per operation name
    failures: HashMap<String, Vec<BackendError>>,
    calls: HashMap<String, usize>,
}

/// Thread-safe in-memory backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means another test thread panicked mid-call
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Count the call and return an injected failure if one is queued
    fn enter(&self, operation: &str) -> BackendResult<()> {
        let mut state = self.state();
        *state.calls.entry(operation.to_string()).or_default() += 1;
        if let Some(queue) = state.failures.get_mut(operation)
            && !queue.is_empty()
        {
            return Err(queue.remove(0));
        }
        Ok(())
    }

    /// Create a collection whose id and name are `id`
    pub fn add_collection(&self, id: &str) {
        let mut state = self.state();
        let collection = state.collections.entry(id.to_string()).or_default();
        collection.info = Some(CollectionInfo {
            id: id.to_string(),
            name: id.to_string(),
        });
    }

    /// Seed a document directly
    pub fn insert_document(&self, collection_id: &str, document_id: &str, data: Value) {
        let mut state = self.state();
        let collection = state.collections.entry(collection_id.to_string()).or_default();
        collection.documents.insert(document_id.to_string(), data);
    }

    /// Seed an identity directly
    pub fn insert_identity(&self, id: &str, email: Option<&str>, phone: Option<&str>) {
        self.state().identities.insert(
            id.to_string(),
            IdentityRecord {
                id: id.to_string(),
                email: email.map(str::to_string),
                phone: phone.map(str::to_string),
                name: None,
            },
        );
    }

    /// Fail the next `times` calls of `operation` with `error`
    ///
    /// Operation names match the trait method names, e.g. `create_document`.
    pub fn fail_next(&self, operation: &str, times: usize, error: BackendError) {
        let mut state = self.state();
        let queue = state.failures.entry(operation.to_string()).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Number of calls made to `operation`, including failed ones
    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn document(&self, collection_id: &str, document_id: &str) -> Option<Value> {
        self.state()
            .collections
            .get(collection_id)
            .and_then(|c| c.documents.get(document_id))
            .cloned()
    }

    pub fn document_count(&self, collection_id: &str) -> usize {
        self.state()
            .collections
            .get(collection_id)
            .map(|c| c.documents.len())
            .unwrap_or(0)
    }

    pub fn identity_count(&self) -> usize {
        self.state().identities.len()
    }

    pub fn attributes(&self, collection_id: &str) -> Vec<AttributeInfo> {
        self.state()
            .collections
            .get(collection_id)
            .map(|c| c.attributes.clone())
            .unwrap_or_default()
    }

    pub fn files(&self) -> Vec<StoredFile> {
        self.state().files.clone()
    }

    /// Every progress record ever saved, in order
    pub fn progress_history(&self) -> Vec<ProgressRecord> {
        self.state().progress_history.clone()
    }
}

fn page<T: Clone>(
    items: impl Iterator<Item = (String, T)>,
    cursor: Option<&str>,
    limit: usize,
) -> Vec<T> {
    items
        .filter(|(id, _)| cursor.is_none_or(|c| id.as_str() > c))
        .take(limit)
        .map(|(_, item)| item)
        .collect()
}

fn contact_matches(stored: Option<&str>, wanted: &str) -> bool {
    stored.is_some_and(|s| s.eq_ignore_ascii_case(wanted))
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn get_collection(&self, collection_id: &str) -> BackendResult<Option<CollectionInfo>> {
        self.enter("get_collection")?;
        Ok(self
            .state()
            .collections
            .get(collection_id)
            .and_then(|c| c.info.clone()))
    }

    async fn list_collections(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<CollectionInfo>> {
        self.enter("list_collections")?;
        let state = self.state();
        let infos = state
            .collections
            .iter()
            .filter_map(|(id, c)| c.info.clone().map(|info| (id.clone(), info)));
        Ok(page(infos, cursor, limit))
    }

    async fn list_attributes(&self, collection_id: &str) -> BackendResult<Vec<AttributeInfo>> {
        self.enter("list_attributes")?;
        let state = self.state();
        match state.collections.get(collection_id) {
            Some(c) if c.info.is_some() => Ok(c.attributes.clone()),
            _ => Err(BackendError::NotFound(format!("collection {}", collection_id))),
        }
    }

    async fn create_relationship_attribute(
        &self,
        collection_id: &str,
        related_collection_id: &str,
        attribute: &RelationshipAttribute,
    ) -> BackendResult<AttributeInfo> {
        self.enter("create_relationship_attribute")?;
        let mut state = self.state();

        for id in [collection_id, related_collection_id] {
            if state.collections.get(id).is_none_or(|c| c.info.is_none()) {
                return Err(BackendError::NotFound(format!("collection {}", id)));
            }
        }

        let info = AttributeInfo {
            key: attribute.key.clone(),
            kind: "relationship".to_string(),
            status: Some("available".to_string()),
        };

        let own = state.collections.entry(collection_id.to_string()).or_default();
        if own.attributes.iter().any(|a| a.key == attribute.key) {
            return Err(BackendError::Conflict(format!(
                "attribute {} on {}",
                attribute.key, collection_id
            )));
        }
        own.attributes.push(info.clone());

        if attribute.two_way
            && let Some(two_way_key) = &attribute.two_way_key
        {
            let related = state
                .collections
                .entry(related_collection_id.to_string())
                .or_default();
            if !related.attributes.iter().any(|a| &a.key == two_way_key) {
                related.attributes.push(AttributeInfo {
                    key: two_way_key.clone(),
                    ..info.clone()
                });
            }
        }

        Ok(info)
    }

    async fn create_document(
        &self,
        collection_id: &str,
        document_id: &str,
        data: &Value,
    ) -> BackendResult<Document> {
        self.enter("create_document")?;
        let mut state = self.state();
        let collection = state
            .collections
            .get_mut(collection_id)
            .filter(|c| c.info.is_some())
            .ok_or_else(|| BackendError::NotFound(format!("collection {}", collection_id)))?;

        if collection.documents.contains_key(document_id) {
            return Err(BackendError::Conflict(format!(
                "document {} in {}",
                document_id, collection_id
            )));
        }
        collection
            .documents
            .insert(document_id.to_string(), data.clone());
        Ok(Document::new(document_id, data.clone()))
    }

    async fn update_document(
        &self,
        collection_id: &str,
        document_id: &str,
        data: &Value,
    ) -> BackendResult<Document> {
        self.enter("update_document")?;
        let mut state = self.state();
        let stored = state
            .collections
            .get_mut(collection_id)
            .and_then(|c| c.documents.get_mut(document_id))
            .ok_or_else(|| {
                BackendError::NotFound(format!("document {} in {}", document_id, collection_id))
            })?;

        match (stored.as_object_mut(), data.as_object()) {
            (Some(target), Some(patch)) => {
                for (k, v) in patch {
                    target.insert(k.clone(), v.clone());
                }
            }
            _ => *stored = data.clone(),
        }
        Ok(Document::new(document_id, stored.clone()))
    }

    async fn get_document(
        &self,
        collection_id: &str,
        document_id: &str,
    ) -> BackendResult<Option<Document>> {
        self.enter("get_document")?;
        Ok(self
            .state()
            .collections
            .get(collection_id)
            .and_then(|c| c.documents.get(document_id))
            .map(|data| Document::new(document_id, data.clone())))
    }

    async fn list_documents(
        &self,
        collection_id: &str,
        queries: &[Query],
    ) -> BackendResult<Vec<Document>> {
        self.enter("list_documents")?;
        let state = self.state();
        let Some(collection) = state.collections.get(collection_id) else {
            return Err(BackendError::NotFound(format!("collection {}", collection_id)));
        };

        let matching = collection
            .documents
            .iter()
            .filter(|(_, data)| queries.iter().all(|q| q.matches(data)))
            .map(|(id, data)| (id.clone(), Document::new(id.clone(), data.clone())));

        Ok(page(
            matching,
            cursor_of(queries),
            limit_of(queries).unwrap_or(DEFAULT_LIST_LIMIT),
        ))
    }
}

#[async_trait]
impl IdentityStore for MemoryBackend {
    async fn create_identity(&self, identity: &IdentityRecord) -> BackendResult<IdentityRecord> {
        self.enter("create_identity")?;
        let mut state = self.state();
        let taken = state.identities.values().any(|existing| {
            existing.id == identity.id
                || identity
                    .email
                    .as_deref()
                    .is_some_and(|e| contact_matches(existing.email.as_deref(), e))
                || identity
                    .phone
                    .as_deref()
                    .is_some_and(|p| contact_matches(existing.phone.as_deref(), p))
        });
        if taken {
            return Err(BackendError::Conflict(format!("identity {}", identity.id)));
        }
        state
            .identities
            .insert(identity.id.clone(), identity.clone());
        Ok(identity.clone())
    }

    async fn list_identities(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<IdentityRecord>> {
        self.enter("list_identities")?;
        let state = self.state();
        let all = state
            .identities
            .iter()
            .map(|(id, identity)| (id.clone(), identity.clone()));
        Ok(page(all, cursor, limit))
    }

    async fn find_by_email(&self, email: &str) -> BackendResult<Option<IdentityRecord>> {
        self.enter("find_by_email")?;
        Ok(self
            .state()
            .identities
            .values()
            .find(|i| contact_matches(i.email.as_deref(), email))
            .cloned())
    }

    async fn find_by_phone(&self, phone: &str) -> BackendResult<Option<IdentityRecord>> {
        self.enter("find_by_phone")?;
        Ok(self
            .state()
            .identities
            .values()
            .find(|i| contact_matches(i.phone.as_deref(), phone))
            .cloned())
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn upload_file(
        &self,
        bucket_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> BackendResult<String> {
        self.enter("upload_file")?;
        let mut state = self.state();
        let id = format!("file{}", state.files.len() + 1);
        state.files.push(StoredFile {
            id: id.clone(),
            bucket_id: bucket_id.to_string(),
            name: name.to_string(),
            bytes,
        });
        Ok(id)
    }
}

#[async_trait]
impl ProgressStore for MemoryBackend {
    async fn load(&self, id: &str) -> BackendResult<Option<ProgressRecord>> {
        self.enter("load_progress")?;
        Ok(self.state().progress.get(id).cloned())
    }

    async fn save(&self, record: &ProgressRecord) -> BackendResult<()> {
        self.enter("save_progress")?;
        let mut state = self.state();
        state.progress.insert(record.id.clone(), record.clone());
        state.progress_history.push(record.clone());
        Ok(())
    }
}
