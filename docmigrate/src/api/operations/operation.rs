//! Single backend write operations and their results

use serde_json::Value;

use crate::api::{BackendError, Backends, Document, IdentityRecord, Query};

/// A write issued against the backends during a run
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Create a document with a pre-assigned id
    CreateDocument {
        collection: String,
        document_id: String,
        data: Value,
    },
    /// Patch fields of an existing document
    UpdateDocument {
        collection: String,
        document_id: String,
        data: Value,
    },
    /// Patch the first document whose `match_field` equals `match_value`
    UpdateMatching {
        collection: String,
        match_field: String,
        match_value: Value,
        data: Value,
    },
    /// Create an end-user identity
    CreateIdentity { identity: IdentityRecord },
}

impl Operation {
    pub fn create(collection: impl Into<String>, document_id: impl Into<String>, data: Value) -> Self {
        Self::CreateDocument {
            collection: collection.into(),
            document_id: document_id.into(),
            data,
        }
    }

    pub fn update(collection: impl Into<String>, document_id: impl Into<String>, data: Value) -> Self {
        Self::UpdateDocument {
            collection: collection.into(),
            document_id: document_id.into(),
            data,
        }
    }

    pub fn update_matching(
        collection: impl Into<String>,
        match_field: impl Into<String>,
        match_value: Value,
        data: Value,
    ) -> Self {
        Self::UpdateMatching {
            collection: collection.into(),
            match_field: match_field.into(),
            match_value,
            data,
        }
    }

    pub fn create_identity(identity: IdentityRecord) -> Self {
        Self::CreateIdentity { identity }
    }

    /// Collection the operation writes to; identities report `"identities"`
    pub fn collection(&self) -> &str {
        match self {
            Self::CreateDocument { collection, .. } => collection,
            Self::UpdateDocument { collection, .. } => collection,
            Self::UpdateMatching { collection, .. } => collection,
            Self::CreateIdentity { .. } => "identities",
        }
    }

    /// Target document id, when known before execution
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::CreateDocument { document_id, .. } => Some(document_id),
            Self::UpdateDocument { document_id, .. } => Some(document_id),
            Self::UpdateMatching { .. } => None,
            Self::CreateIdentity { identity } => Some(&identity.id),
        }
    }

    pub fn operation_type(&self) -> &'static str {
        match self {
            Self::CreateDocument { .. } => "create",
            Self::UpdateDocument { .. } => "update",
            Self::UpdateMatching { .. } => "update_matching",
            Self::CreateIdentity { .. } => "create_identity",
        }
    }

    /// Whether a `Conflict` response means the target already exists
    pub fn is_create(&self) -> bool {
        matches!(self, Self::CreateDocument { .. } | Self::CreateIdentity { .. })
    }

    /// Serialized payload size in bytes
    pub fn payload_size(&self) -> usize {
        let payload = match self {
            Self::CreateDocument { data, .. }
            | Self::UpdateDocument { data, .. }
            | Self::UpdateMatching { data, .. } => serde_json::to_vec(data),
            Self::CreateIdentity { identity } => serde_json::to_vec(identity),
        };
        payload.map(|b| b.len()).unwrap_or(0)
    }

    /// Execute once against the backends, without retry
    pub async fn execute(&self, backends: &Backends) -> Result<Document, BackendError> {
        match self {
            Self::CreateDocument {
                collection,
                document_id,
                data,
            } => {
                backends
                    .documents
                    .create_document(collection, document_id, data)
                    .await
            }
            Self::UpdateDocument {
                collection,
                document_id,
                data,
            } => {
                backends
                    .documents
                    .update_document(collection, document_id, data)
                    .await
            }
            Self::UpdateMatching {
                collection,
                match_field,
                match_value,
                data,
            } => {
                let queries = [
                    Query::equal(match_field.as_str(), match_value.clone()),
                    Query::limit(1),
                ];
                let target = backends
                    .documents
                    .list_documents(collection, &queries)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        BackendError::NotFound(format!(
                            "no document in {} with {} = {}",
                            collection, match_field, match_value
                        ))
                    })?;
                backends
                    .documents
                    .update_document(collection, &target.id, data)
                    .await
            }
            Self::CreateIdentity { identity } => {
                let created = backends.identities.create_identity(identity).await?;
                let id = created.id.clone();
                Ok(Document::new(id, serde_json::to_value(created)?))
            }
        }
    }
}

/// Result of executing an Operation
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub operation: Operation,
    pub success: bool,
    /// The create hit an existing document of the same id
    pub skipped_existing: bool,
    /// Id of the document written
    pub document_id: Option<String>,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub status_code: Option<u16>,
}

impl OperationResult {
    pub fn success(operation: Operation, document: Document) -> Self {
        Self {
            operation,
            success: true,
            skipped_existing: false,
            document_id: Some(document.id),
            data: Some(document.data),
            error: None,
            status_code: None,
        }
    }

    pub fn skipped(operation: Operation) -> Self {
        let document_id = operation.document_id().map(str::to_string);
        Self {
            operation,
            success: true,
            skipped_existing: true,
            document_id,
            data: None,
            error: None,
            status_code: Some(409),
        }
    }

    pub fn error(operation: Operation, error: &BackendError) -> Self {
        Self {
            operation,
            success: false,
            skipped_existing: false,
            document_id: None,
            data: None,
            error: Some(error.to_string()),
            status_code: error.status_code(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_error(&self) -> bool {
        !self.success
    }
}
