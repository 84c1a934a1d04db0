//! Data import: definitions, transformation, execution and reconciliation

pub mod converters;
pub mod coordinator;
pub mod dependency_queue;
pub mod error;
pub mod executor;
pub mod loader;
pub mod path;
pub mod pipeline;
pub mod post_actions;
pub mod progress;
pub mod reconcile;
pub mod remap;
pub mod template;
pub mod types;
pub mod validators;

pub use types::*;

pub use coordinator::{DefinitionReport, MigrationPlan, MigrationRun, RunReport};
pub use dependency_queue::{AttributeDependencyQueue, OperationState, QueuedAttributeOperation};
pub use error::ImportError;
pub use executor::{BatchExecutor, BatchSettings, ExecutionReport, Job, JobStatus};
pub use path::{FieldPath, FieldPathError, PathSegment, resolve_path};
pub use pipeline::{Pipeline, RejectReason, TransformOutcome};
pub use reconcile::{ReconcileReport, Reconciler};
pub use remap::{AmbiguityPolicy, IdRemapper, RemapStats};
