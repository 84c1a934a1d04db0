//! Backend access: contracts, HTTP and in-memory implementations,
//! write operations and call resilience.

pub mod backend;
pub mod client;
pub mod error;
pub mod memory;
pub mod operations;
pub mod query;
pub mod resilience;

pub use backend::{
    AttributeInfo, BackendResult, Backends, BlobStore, CollectionInfo, Document, DocumentBackend,
    IdentityRecord, IdentityStore, ProgressRecord, ProgressStatus, ProgressStore,
};
pub use client::{HttpBackend, HttpBackendConfig};
pub use error::BackendError;
pub use memory::MemoryBackend;
pub use operations::{Operation, OperationResult};
pub use query::Query;
pub use resilience::{
    ConcurrencyConfig, ConcurrencyLimiter, MonitoringConfig, RateLimitConfig, ResilienceConfig,
    RetryConfig, RetryPolicy, RetryableError,
};
