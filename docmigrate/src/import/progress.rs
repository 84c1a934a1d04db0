//! External progress records for long-running imports

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::api::{ProgressRecord, ProgressStatus, ProgressStore};
use crate::import::remap::{MAX_ID_LEN, derive_id};

/// Length of the hash suffix kept when an id has to be shortened
const HASH_SUFFIX_LEN: usize = 12;

/// Deterministic progress record id for an operation on a collection
///
/// Characters outside `[a-zA-Z0-9._-]` become `_`. Ids longer than the
/// backend limit keep a prefix plus a hash of the full key.
pub fn progress_id(operation: &str, collection: &str) -> String {
    let raw = format!("{}_{}", operation, collection);
    let mut id: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if id.len() > MAX_ID_LEN {
        let hash = derive_id("progress", &raw);
        id.truncate(MAX_ID_LEN - HASH_SUFFIX_LEN - 1);
        id.push('_');
        id.push_str(&hash[..HASH_SUFFIX_LEN]);
    }
    if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        id.replace_range(..1, "p");
    }
    id
}

/// Keeps one progress record current; store failures are logged, never fatal
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    record: ProgressRecord,
}

impl ProgressTracker {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        operation: &str,
        target_collection_id: &str,
        total: usize,
    ) -> Self {
        let id = progress_id(operation, target_collection_id);
        Self {
            store,
            record: ProgressRecord::new(id, operation, target_collection_id, total),
        }
    }

    /// Give the record its own id when several runs share a collection
    pub fn scoped(mut self, scope: &str) -> Self {
        let key = format!("{}_{}", self.record.target_collection_id, scope);
        self.record.id = progress_id(&self.record.operation, &key);
        self
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    /// Report a previous unfinished run, then mark this one in progress
    pub async fn start(&mut self) {
        match self.store.load(&self.record.id).await {
            Ok(Some(previous)) if !previous.status.is_terminal() => info!(
                "Previous {} of {} stopped at {}/{} ({}); starting over",
                previous.operation,
                previous.target_collection_id,
                previous.progress,
                previous.total,
                previous.status.as_str()
            ),
            Ok(_) => {}
            Err(e) => warn!("Could not load progress record {}: {}", self.record.id, e),
        }
        self.update(ProgressStatus::InProgress, 0, None).await;
    }

    /// Record the cumulative processed count
    pub async fn advance(&mut self, processed: usize) {
        self.update(ProgressStatus::InProgress, processed, None).await;
    }

    pub async fn complete(&mut self, processed: usize) {
        self.update(ProgressStatus::Completed, processed, None).await;
    }

    pub async fn fail(&mut self, processed: usize, message: impl Into<String>) {
        self.update(ProgressStatus::Error, processed, Some(message.into()))
            .await;
    }

    async fn update(&mut self, status: ProgressStatus, processed: usize, error: Option<String>) {
        self.record.status = status;
        self.record.progress = processed;
        self.record.error = error;
        self.record.updated_at = Utc::now();
        if let Err(e) = self.store.save(&self.record).await {
            warn!("Could not save progress record {}: {}", self.record.id, e);
        }
    }
}
