//! Batched execution of backend writes
//!
//! Jobs are split into batches bounded by item count and serialized size.
//! Batches run strictly one after another; the jobs inside a batch run
//! concurrently under the concurrency limiter, and every job settles before
//! the next batch starts. Each backend call goes through the retry policy.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};

use super::progress::ProgressTracker;
use super::{IdentityOutcome, ImportKind, ImportedRecord, MATCH_VALUE_KEY};
use crate::api::{
    BackendError, Backends, ConcurrencyLimiter, IdentityRecord, Operation, OperationResult,
    ResilienceConfig, RetryPolicy,
};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 2 * 1024 * 1024;

/// Batch ceilings; whichever is reached first closes a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_BATCH_SIZE,
            max_bytes: DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

/// Split `items` into batches under both ceilings
///
/// An item larger than `max_bytes` on its own still forms a batch of one.
pub fn partition<T>(items: Vec<T>, settings: &BatchSettings, size_of: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let max_items = settings.max_items.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_bytes = 0;

    for item in items {
        let size = size_of(&item);
        if size > settings.max_bytes {
            warn!(
                "Item of {} bytes exceeds the {} byte batch ceiling; sending it alone",
                size, settings.max_bytes
            );
        }

        let would_overflow = current.len() >= max_items
            || (!current.is_empty() && current_bytes + size > settings.max_bytes);
        if would_overflow {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += size;
        current.push(item);

        if size > settings.max_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Writes for one record, executed in order
#[derive(Debug, Clone)]
pub struct Job {
    /// Position of the record in its source list
    pub index: usize,
    pub operations: Vec<Operation>,
}

impl Job {
    pub fn new(index: usize, operations: Vec<Operation>) -> Self {
        Self { index, operations }
    }

    pub fn payload_size(&self) -> usize {
        self.operations.iter().map(Operation::payload_size).sum()
    }

    /// Build the writes for an imported record; `None` when nothing is sent
    ///
    /// Merged identities produce no job: their canonical document is written
    /// by the first record bound to it.
    pub fn for_record(index: usize, imported: &ImportedRecord, collection_id: &str) -> Option<Self> {
        let definition = &imported.definition;
        let record = &imported.record;
        let payload = record.payload();

        let operations = match definition.kind {
            ImportKind::Update => {
                let mapping = definition.update_mapping.as_ref()?;
                let match_value = record.extension.get(MATCH_VALUE_KEY)?.to_json();
                vec![Operation::update_matching(
                    collection_id,
                    mapping.target_field.as_str(),
                    match_value,
                    payload,
                )]
            }
            ImportKind::Create => {
                if !record.needs_create() {
                    return None;
                }
                let id = record.id.clone()?;
                let mut operations = Vec::new();
                if record.identity == Some(IdentityOutcome::New) {
                    let settings = definition.identity.clone().unwrap_or_default();
                    let text = |field: Option<&String>| {
                        field
                            .and_then(|f| record.fields.get(f))
                            .map(|v| v.render())
                            .filter(|s| !s.is_empty())
                    };
                    operations.push(Operation::create_identity(IdentityRecord {
                        id: id.clone(),
                        email: text(settings.email_field.as_ref()),
                        phone: text(settings.phone_field.as_ref()),
                        name: text(settings.name_field.as_ref()),
                    }));
                }
                operations.push(Operation::create(collection_id, id, payload));
                operations
            }
        };
        Some(Job::new(index, operations))
    }
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    /// The document already existed
    SkippedExisting,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub index: usize,
    pub status: JobStatus,
    /// Id of the document the job's last write touched
    pub document_id: Option<String>,
    pub results: Vec<OperationResult>,
}

impl JobOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::SkippedExisting)
    }

    /// Whether this run created the job's documents
    pub fn is_created(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Summary of executing a job list
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_existing: usize,
    pub batch_sizes: Vec<usize>,
    pub outcomes: Vec<JobOutcome>,
    pub last_error: Option<String>,
    /// Job index -> position in `outcomes`
    by_index: HashMap<usize, usize>,
}

impl ExecutionReport {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.skipped_existing
    }

    pub fn outcome(&self, index: usize) -> Option<&JobOutcome> {
        self.by_index.get(&index).map(|&position| &self.outcomes[position])
    }

    fn record(&mut self, outcome: JobOutcome) {
        match &outcome.status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::SkippedExisting => self.skipped_existing += 1,
            JobStatus::Failed(message) => {
                self.failed += 1;
                self.last_error = Some(message.clone());
            }
        }
        self.by_index.insert(outcome.index, self.outcomes.len());
        self.outcomes.push(outcome);
    }
}

/// Runs jobs in paced, size-bounded, concurrency-limited batches
pub struct BatchExecutor {
    backends: Backends,
    policy: RetryPolicy,
    limiter: ConcurrencyLimiter,
    batch: BatchSettings,
    batch_delay: Duration,
}

impl BatchExecutor {
    pub fn new(backends: Backends, resilience: &ResilienceConfig, batch: BatchSettings) -> Self {
        Self {
            backends,
            policy: RetryPolicy::new(resilience.retry.clone()),
            limiter: ConcurrencyLimiter::new(resilience.concurrency.clone()),
            batch,
            batch_delay: resilience.rate_limit.effective_batch_delay(),
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute all jobs; progress is saved after every batch
    pub async fn execute(&self, jobs: Vec<Job>, mut progress: Option<&mut ProgressTracker>) -> ExecutionReport {
        let mut report = ExecutionReport {
            total: jobs.len(),
            ..Default::default()
        };

        if let Some(tracker) = progress.as_deref_mut() {
            tracker.start().await;
        }

        let batches = partition(jobs, &self.batch, Job::payload_size);
        let batch_count = batches.len();

        for (number, batch) in batches.into_iter().enumerate() {
            if number > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }

            report.batch_sizes.push(batch.len());
            debug!("Executing batch {}/{} ({} jobs)", number + 1, batch_count, batch.len());

            let outcomes = join_all(batch.into_iter().map(|job| self.run_limited(job))).await;
            for outcome in outcomes {
                report.record(outcome);
            }

            if let Some(tracker) = progress.as_deref_mut() {
                tracker.advance(report.processed()).await;
            }
        }

        if let Some(tracker) = progress.as_deref_mut() {
            match &report.last_error {
                Some(message) => {
                    let summary = format!("{} of {} failed; last error: {}", report.failed, report.total, message);
                    tracker.fail(report.processed(), summary).await;
                }
                None => tracker.complete(report.processed()).await,
            }
        }

        info!(
            "Executed {} jobs in {} batches: {} succeeded, {} already existed, {} failed",
            report.total,
            report.batch_sizes.len(),
            report.succeeded,
            report.skipped_existing,
            report.failed
        );
        report
    }

    async fn run_limited(&self, job: Job) -> JobOutcome {
        match self.limiter.acquire().await {
            Ok(_permit) => self.run_job(job).await,
            Err(e) => JobOutcome {
                index: job.index,
                status: JobStatus::Failed(format!("concurrency limiter closed: {}", e)),
                document_id: None,
                results: Vec::new(),
            },
        }
    }

    /// Run a job's operations in order, stopping at the first failure
    async fn run_job(&self, job: Job) -> JobOutcome {
        let mut results = Vec::with_capacity(job.operations.len());
        let mut status = JobStatus::Succeeded;
        let mut document_id = None;

        for operation in job.operations {
            let result = self.run_operation(operation).await;
            if result.document_id.is_some() {
                document_id = result.document_id.clone();
            }

            if result.is_error() {
                let message = result.error.clone().unwrap_or_default();
                error!(
                    "{} on {} failed for record {}: {}",
                    result.operation.operation_type(),
                    result.operation.collection(),
                    job.index,
                    message
                );
                status = JobStatus::Failed(message);
                results.push(result);
                break;
            }

            if result.skipped_existing && matches!(result.operation, Operation::CreateDocument { .. }) {
                status = JobStatus::SkippedExisting;
            }
            results.push(result);
        }

        JobOutcome {
            index: job.index,
            status,
            document_id,
            results,
        }
    }

    /// Execute one operation with retry; a conflicting create counts as existing
    pub async fn run_operation(&self, operation: Operation) -> OperationResult {
        let label = format!("{} {}", operation.operation_type(), operation.collection());
        let outcome: Result<_, BackendError> = self
            .policy
            .execute(&label, || operation.execute(&self.backends))
            .await;

        match outcome {
            Ok(document) => OperationResult::success(operation, document),
            Err(e) if e.is_conflict() && operation.is_create() => {
                debug!(
                    "{} {:?} already exists, keeping its id",
                    label,
                    operation.document_id()
                );
                OperationResult::skipped(operation)
            }
            Err(e) => OperationResult::error(operation, &e),
        }
    }
}
