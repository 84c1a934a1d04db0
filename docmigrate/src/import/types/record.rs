//! Records produced by the transformation pipeline

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ImportDefinition, Value};

/// Extension key holding the record's source-system id
pub const ORIGINAL_ID_KEY: &str = "$originalId";
/// Extension key holding the value matched by update imports
pub const MATCH_VALUE_KEY: &str = "$matchValue";

/// How an identity-bearing record was bound to a canonical id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityOutcome {
    /// No existing identity matched; identity and document are created
    New,
    /// Bound to an identity that already existed in the identity store
    Existing,
    /// Collapsed into an identity created or bound earlier in this run
    Merged,
}

/// A deferred action executed once the document exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PostCreateAction {
    /// Upload a file and link its id into `target_field`
    UploadFile {
        target_field: String,
        /// Unresolved template parameters: `bucket_id`, `path`, `name`
        params: Value,
        array: bool,
    },
}

impl PostCreateAction {
    pub fn target_field(&self) -> &str {
        match self {
            PostCreateAction::UploadFile { target_field, .. } => target_field,
        }
    }
}

/// A target-ready document
///
/// `fields` are the declared document fields sent to the backend;
/// `extension` carries passthrough data that never leaves the process.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformedRecord {
    /// New id; `None` for update imports until the target is matched
    pub id: Option<String>,
    pub fields: BTreeMap<String, Value>,
    pub extension: BTreeMap<String, Value>,
    pub post_actions: Vec<PostCreateAction>,
    pub identity: Option<IdentityOutcome>,
}

impl TransformedRecord {
    /// The record's source-system id, if one was declared
    pub fn original_id(&self) -> Option<&str> {
        self.extension.get(ORIGINAL_ID_KEY).and_then(|v| v.as_str())
    }

    /// Whether the executor should issue a create for this record
    pub fn needs_create(&self) -> bool {
        !matches!(self.identity, Some(IdentityOutcome::Merged))
    }

    /// JSON payload containing only declared fields
    pub fn payload(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Serialized payload size in bytes
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload()).map(|b| b.len()).unwrap_or(0)
    }

    /// Declared fields and extension merged into one mapping
    pub fn as_value(&self) -> Value {
        let mut map = self.fields.clone();
        for (k, v) in &self.extension {
            map.insert(k.clone(), v.clone());
        }
        if let Some(id) = &self.id {
            map.insert("$id".to_string(), Value::String(id.clone()));
        }
        Value::Mapping(map)
    }
}

/// A transformed record together with where it came from
#[derive(Debug, Clone)]
pub struct ImportedRecord {
    pub raw: Value,
    /// Raw record plus run bookkeeping (`docId`, `originalId`, `collection`)
    pub context: Value,
    pub record: TransformedRecord,
    pub definition: Arc<ImportDefinition>,
}

impl ImportedRecord {
    /// Context merged with the transformed record, as seen by templates
    pub fn template_context(&self) -> Value {
        self.context.merged_with(&self.record.as_value())
    }
}

/// Everything imported into one collection during a run
#[derive(Debug, Clone, Default)]
pub struct CollectionImportState {
    pub collection: String,
    records: Vec<ImportedRecord>,
    by_id: HashMap<String, usize>,
}

impl CollectionImportState {
    pub fn new(collection: impl Into<String>) -> Self {
        CollectionImportState {
            collection: collection.into(),
            records: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn push(&mut self, record: ImportedRecord) {
        if let Some(id) = &record.record.id {
            // Merged identity records share the canonical id; first one wins
            self.by_id.entry(id.clone()).or_insert(self.records.len());
        }
        self.records.push(record);
    }

    pub fn get(&self, document_id: &str) -> Option<&ImportedRecord> {
        self.by_id.get(document_id).map(|&i| &self.records[i])
    }

    /// All records that share `document_id` (merged identities)
    pub fn all_for(&self, document_id: &str) -> impl Iterator<Item = &ImportedRecord> {
        self.records
            .iter()
            .filter(move |r| r.record.id.as_deref() == Some(document_id))
    }

    pub fn records(&self) -> &[ImportedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
