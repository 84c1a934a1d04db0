//! REST backend client
//!
//! Talks to a document database exposing a JSON REST API with
//! project/key header authentication:
//!
//! - `/databases/{db}/collections[/{id}[/attributes|/documents[/{doc}]]]`
//! - `/users` for identities
//! - `/storage/buckets/{bucket}/files` for blobs
//!
//! Progress records are stored as documents in a dedicated collection.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, multipart};
use serde_json::{Value, json};

use super::backend::{
    AttributeInfo, BackendResult, BlobStore, CollectionInfo, Document, DocumentBackend,
    IdentityRecord, IdentityStore, ProgressRecord, ProgressStore,
};
use super::error::BackendError;
use super::query::Query;
use super::resilience::MonitoringConfig;
use crate::import::RelationshipAttribute;

pub const PROJECT_HEADER: &str = "X-Appwrite-Project";
pub const KEY_HEADER: &str = "X-Appwrite-Key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`HttpBackend`]
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL, e.g. `https://db.example.com/v1`
    pub endpoint: String,
    pub project: String,
    pub api_key: String,
    pub database_id: String,
    /// Collection holding progress records
    pub progress_collection: String,
}

/// reqwest-based implementation of every backend contract
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
    monitoring: MonitoringConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig, monitoring: MonitoringConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("docmigrate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: HttpBackendConfig {
                endpoint: config.endpoint.trim_end_matches('/').to_string(),
                ..config
            },
            monitoring,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint, path)
    }

    fn collection_path(&self, collection_id: &str) -> String {
        format!(
            "/databases/{}/collections/{}",
            self.config.database_id, collection_id
        )
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(PROJECT_HEADER, &self.config.project)
            .header(KEY_HEADER, &self.config.api_key)
    }

    /// Send a request and decode the JSON response, mapping error statuses
    async fn send(&self, label: &str, request: reqwest::RequestBuilder) -> BackendResult<Value> {
        let started = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let elapsed = started.elapsed();

        if self.monitoring.request_logging {
            debug!("{} -> {} in {:?}", label, status.as_u16(), elapsed);
        }
        if elapsed > self.monitoring.slow_request_threshold {
            warn!("Slow request: {} took {:?}", label, elapsed);
        }

        let text = response.text().await?;
        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }

        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(text);
        Err(BackendError::from_status(status.as_u16(), message))
    }

    async fn get_json(&self, path: &str, queries: &[Query]) -> BackendResult<Value> {
        let params: Vec<(&str, String)> = queries
            .iter()
            .map(|q| ("queries[]", q.to_json().to_string()))
            .collect();
        let request = self.request(Method::GET, path).query(&params);
        self.send(&format!("GET {}", path), request).await
    }

    async fn send_json(&self, method: Method, path: &str, body: &Value) -> BackendResult<Value> {
        let label = format!("{} {}", method, path);
        let request = self.request(method, path).json(body);
        self.send(&label, request).await
    }
}

/// Decode `body[key]` as a list of `T`
fn decode_list<T: serde::de::DeserializeOwned>(body: Value, key: &str) -> BackendResult<Vec<T>> {
    match body.get(key) {
        Some(items) => Ok(serde_json::from_value(items.clone())?),
        None => Err(BackendError::Decode(format!("response has no '{}' list", key))),
    }
}

fn decode_documents(body: Value) -> BackendResult<Vec<Document>> {
    let Some(Value::Array(items)) = body.get("documents").cloned() else {
        return Err(BackendError::Decode("response has no 'documents' list".into()));
    };
    items.into_iter().map(Document::from_json).collect()
}

/// Empty strings mean "not set" in identity payloads
fn identity_from_json(value: &Value) -> BackendResult<IdentityRecord> {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Ok(IdentityRecord {
        id: text("$id").ok_or_else(|| BackendError::Decode("identity has no $id".into()))?,
        email: text("email"),
        phone: text("phone"),
        name: text("name"),
    })
}

fn identities_from_json(body: Value) -> BackendResult<Vec<IdentityRecord>> {
    let Some(Value::Array(users)) = body.get("users") else {
        return Err(BackendError::Decode("response has no 'users' list".into()));
    };
    users.iter().map(identity_from_json).collect()
}

#[async_trait]
impl DocumentBackend for HttpBackend {
    async fn get_collection(&self, collection_id: &str) -> BackendResult<Option<CollectionInfo>> {
        match self.get_json(&self.collection_path(collection_id), &[]).await {
            Ok(body) => Ok(Some(serde_json::from_value(body)?)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_collections(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<CollectionInfo>> {
        let path = format!("/databases/{}/collections", self.config.database_id);
        let body = self.get_json(&path, &Query::page(cursor, limit)).await?;
        decode_list(body, "collections")
    }

    async fn list_attributes(&self, collection_id: &str) -> BackendResult<Vec<AttributeInfo>> {
        let path = format!("{}/attributes", self.collection_path(collection_id));
        let body = self.get_json(&path, &[]).await?;
        decode_list(body, "attributes")
    }

    async fn create_relationship_attribute(
        &self,
        collection_id: &str,
        related_collection_id: &str,
        attribute: &RelationshipAttribute,
    ) -> BackendResult<AttributeInfo> {
        let path = format!(
            "{}/attributes/relationship",
            self.collection_path(collection_id)
        );
        let mut body = json!({
            "relatedCollectionId": related_collection_id,
            "type": attribute.relation_type.as_str(),
            "twoWay": attribute.two_way,
            "key": attribute.key,
            "onDelete": attribute.on_delete.as_str(),
        });
        if let Some(two_way_key) = &attribute.two_way_key {
            body["twoWayKey"] = json!(two_way_key);
        }
        let response = self.send_json(Method::POST, &path, &body).await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn create_document(
        &self,
        collection_id: &str,
        document_id: &str,
        data: &Value,
    ) -> BackendResult<Document> {
        let path = format!("{}/documents", self.collection_path(collection_id));
        let body = json!({"documentId": document_id, "data": data});
        Document::from_json(self.send_json(Method::POST, &path, &body).await?)
    }

    async fn update_document(
        &self,
        collection_id: &str,
        document_id: &str,
        data: &Value,
    ) -> BackendResult<Document> {
        let path = format!(
            "{}/documents/{}",
            self.collection_path(collection_id),
            document_id
        );
        let body = json!({ "data": data });
        Document::from_json(self.send_json(Method::PATCH, &path, &body).await?)
    }

    async fn get_document(
        &self,
        collection_id: &str,
        document_id: &str,
    ) -> BackendResult<Option<Document>> {
        let path = format!(
            "{}/documents/{}",
            self.collection_path(collection_id),
            document_id
        );
        match self.get_json(&path, &[]).await {
            Ok(body) => Document::from_json(body).map(Some),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_documents(
        &self,
        collection_id: &str,
        queries: &[Query],
    ) -> BackendResult<Vec<Document>> {
        let path = format!("{}/documents", self.collection_path(collection_id));
        decode_documents(self.get_json(&path, queries).await?)
    }
}

#[async_trait]
impl IdentityStore for HttpBackend {
    async fn create_identity(&self, identity: &IdentityRecord) -> BackendResult<IdentityRecord> {
        let body = json!({
            "userId": identity.id,
            "email": identity.email,
            "phone": identity.phone,
            "name": identity.name,
        });
        identity_from_json(&self.send_json(Method::POST, "/users", &body).await?)
    }

    async fn list_identities(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<IdentityRecord>> {
        identities_from_json(self.get_json("/users", &Query::page(cursor, limit)).await?)
    }

    async fn find_by_email(&self, email: &str) -> BackendResult<Option<IdentityRecord>> {
        let queries = [Query::equal("email", email), Query::limit(1)];
        Ok(identities_from_json(self.get_json("/users", &queries).await?)?
            .into_iter()
            .next())
    }

    async fn find_by_phone(&self, phone: &str) -> BackendResult<Option<IdentityRecord>> {
        let queries = [Query::equal("phone", phone), Query::limit(1)];
        Ok(identities_from_json(self.get_json("/users", &queries).await?)?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl BlobStore for HttpBackend {
    async fn upload_file(
        &self,
        bucket_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> BackendResult<String> {
        let path = format!("/storage/buckets/{}/files", bucket_id);
        let form = multipart::Form::new()
            .text("fileId", "unique()")
            .part("file", multipart::Part::bytes(bytes).file_name(name.to_string()));
        let request = self.request(Method::POST, &path).multipart(form);
        let body = self.send(&format!("POST {}", path), request).await?;
        body.get("$id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Decode("uploaded file has no $id".into()))
    }
}

#[async_trait]
impl ProgressStore for HttpBackend {
    async fn load(&self, id: &str) -> BackendResult<Option<ProgressRecord>> {
        let Some(doc) = self
            .get_document(&self.config.progress_collection, id)
            .await?
        else {
            return Ok(None);
        };
        let mut data = doc.data;
        data["id"] = json!(doc.id);
        Ok(Some(serde_json::from_value(data)?))
    }

    async fn save(&self, record: &ProgressRecord) -> BackendResult<()> {
        let mut data = serde_json::to_value(record)?;
        if let Some(map) = data.as_object_mut() {
            map.remove("id");
        }
        let collection = &self.config.progress_collection;
        match self.update_document(collection, &record.id, &data).await {
            Ok(_) => Ok(()),
            Err(BackendError::NotFound(_)) => {
                self.create_document(collection, &record.id, &data).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
