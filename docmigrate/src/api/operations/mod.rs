//! Backend write operations executed by the batched executor

pub mod operation;

pub use operation::{Operation, OperationResult};
