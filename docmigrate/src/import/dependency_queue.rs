//! Deferred creation of relationship attributes
//!
//! A relationship attribute can only be created once both its own collection
//! and the related collection exist. Operations are queued with the
//! collection names they depend on and processed in full passes until a pass
//! makes no progress; whatever is still queued then is abandoned.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::api::{BackendError, DocumentBackend};
use crate::import::RelationshipAttribute;

/// Lifecycle of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Queued,
    Ready,
    Applied,
    Abandoned,
}

/// A relationship attribute waiting on collections to exist
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAttributeOperation {
    pub collection: String,
    pub attribute: RelationshipAttribute,
    /// Collection names that must exist before applying
    pub dependencies: Vec<String>,
    pub state: OperationState,
    pub error: Option<String>,
}

impl QueuedAttributeOperation {
    /// Queue `attribute` on `collection`; depends on the related and own collection
    pub fn for_relationship(collection: impl Into<String>, attribute: RelationshipAttribute) -> Self {
        let collection = collection.into();
        let mut dependencies = vec![attribute.related_collection.clone()];
        if !dependencies.contains(&collection) {
            dependencies.push(collection.clone());
        }
        Self {
            collection,
            attribute,
            dependencies,
            state: OperationState::Queued,
            error: None,
        }
    }

    /// Queue with an explicit dependency list
    pub fn with_dependencies(
        collection: impl Into<String>,
        attribute: RelationshipAttribute,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            attribute,
            dependencies,
            state: OperationState::Queued,
            error: None,
        }
    }

    pub fn label(&self) -> String {
        format!("{}.{}", self.collection, self.attribute.key)
    }
}

/// Where queued operations are checked and applied
#[async_trait]
pub trait SchemaTarget: Send + Sync {
    /// Backend id of the named collection, or `None` if it does not exist yet
    async fn find_collection(&self, name: &str) -> Result<Option<String>, BackendError>;

    /// Apply the operation; `known` maps collection names to backend ids
    async fn apply(
        &self,
        operation: &QueuedAttributeOperation,
        known: &HashMap<String, String>,
    ) -> Result<(), BackendError>;
}

/// [`SchemaTarget`] over a document backend
///
/// Collection names resolve to ids through `ids`; unlisted names are used as ids.
pub struct BackendSchema<'a> {
    backend: &'a dyn DocumentBackend,
    ids: HashMap<String, String>,
}

impl<'a> BackendSchema<'a> {
    pub fn new(backend: &'a dyn DocumentBackend, ids: HashMap<String, String>) -> Self {
        Self { backend, ids }
    }

    fn id_of<'n>(&'n self, name: &'n str) -> &'n str {
        self.ids.get(name).map(String::as_str).unwrap_or(name)
    }
}

#[async_trait]
impl<'a> SchemaTarget for BackendSchema<'a> {
    async fn find_collection(&self, name: &str) -> Result<Option<String>, BackendError> {
        Ok(self
            .backend
            .get_collection(self.id_of(name))
            .await?
            .map(|info| info.id))
    }

    async fn apply(
        &self,
        operation: &QueuedAttributeOperation,
        known: &HashMap<String, String>,
    ) -> Result<(), BackendError> {
        let lookup = |name: &str| {
            known
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.id_of(name).to_string())
        };
        let collection_id = lookup(&operation.collection);
        let related_id = lookup(&operation.attribute.related_collection);
        self.backend
            .create_relationship_attribute(&collection_id, &related_id, &operation.attribute)
            .await
            .map(|_| ())
    }
}

/// Outcome of processing the queue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueReport {
    pub passes: usize,
    pub applied: Vec<String>,
    pub abandoned: Vec<QueuedAttributeOperation>,
}

/// Queue of relationship attribute operations for one run
#[derive(Debug, Default)]
pub struct AttributeDependencyQueue {
    operations: Vec<QueuedAttributeOperation>,
    /// Collection name -> backend id, for collections known to exist
    known: HashMap<String, String>,
}

impl AttributeDependencyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: QueuedAttributeOperation) {
        debug!(
            "Queued attribute {} (depends on {:?})",
            operation.label(),
            operation.dependencies
        );
        self.operations.push(operation);
    }

    pub fn pending(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op.state, OperationState::Queued | OperationState::Ready))
            .count()
    }

    pub fn operations(&self) -> &[QueuedAttributeOperation] {
        &self.operations
    }

    /// Record a collection as existing
    pub fn mark_known(&mut self, name: impl Into<String>, id: impl Into<String>) {
        self.known.insert(name.into(), id.into());
    }

    pub fn known(&self) -> &HashMap<String, String> {
        &self.known
    }

    /// Put abandoned operations back in the queue for another attempt
    pub fn requeue_abandoned(&mut self) -> usize {
        let mut count = 0;
        for op in &mut self.operations {
            if op.state == OperationState::Abandoned {
                op.state = OperationState::Queued;
                op.error = None;
                count += 1;
            }
        }
        count
    }

    async fn is_known(&mut self, target: &dyn SchemaTarget, name: &str) -> Result<bool, BackendError> {
        if self.known.contains_key(name) {
            return Ok(true);
        }
        match target.find_collection(name).await? {
            Some(id) => {
                self.known.insert(name.to_string(), id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run passes until one applies nothing
    ///
    /// Readiness is decided for the whole pass before anything is applied, so
    /// an operation waiting on another one lands in a later pass whatever the
    /// push order. Operations still waiting after the final pass are abandoned.
    /// Operations abandoned in earlier calls are not retried.
    pub async fn process(&mut self, target: &dyn SchemaTarget) -> QueueReport {
        let mut report = QueueReport::default();

        loop {
            report.passes += 1;
            let mut progressed = 0;

            let mut ready_now = Vec::new();
            for index in 0..self.operations.len() {
                if self.operations[index].state != OperationState::Queued {
                    continue;
                }

                let dependencies = self.operations[index].dependencies.clone();
                let mut ready = true;
                for dependency in &dependencies {
                    match self.is_known(target, dependency).await {
                        Ok(true) => {}
                        Ok(false) => {
                            ready = false;
                            break;
                        }
                        Err(e) => {
                            warn!("Existence check for '{}' failed: {}", dependency, e);
                            ready = false;
                            break;
                        }
                    }
                }
                if ready {
                    ready_now.push(index);
                }
            }

            let mut touched = Vec::new();
            for index in ready_now {
                self.operations[index].state = OperationState::Ready;
                let result = target.apply(&self.operations[index], &self.known).await;
                let op = &mut self.operations[index];
                match result {
                    Ok(()) => {
                        debug!("Applied attribute {}", op.label());
                        op.state = OperationState::Applied;
                    }
                    Err(e) if e.is_conflict() => {
                        debug!("Attribute {} already exists", op.label());
                        op.state = OperationState::Applied;
                    }
                    Err(e) => {
                        warn!("Attribute {} failed: {}", op.label(), e);
                        op.state = OperationState::Abandoned;
                        op.error = Some(e.to_string());
                        report.abandoned.push(op.clone());
                        continue;
                    }
                }

                report.applied.push(op.label());
                touched.push(op.collection.clone());
                progressed += 1;
            }

            for collection in touched {
                self.known.entry(collection.clone()).or_insert(collection);
            }

            if progressed == 0 {
                break;
            }
        }

        for op in &mut self.operations {
            if op.state == OperationState::Queued {
                op.state = OperationState::Abandoned;
                op.error = Some(format!("unresolved dependencies {:?}", op.dependencies));
                warn!("Abandoned attribute {}: dependencies never became available", op.label());
                report.abandoned.push(op.clone());
            }
        }

        info!(
            "Attribute queue: {} applied, {} abandoned after {} passes",
            report.applied.len(),
            report.abandoned.len(),
            report.passes
        );
        report
    }
}
