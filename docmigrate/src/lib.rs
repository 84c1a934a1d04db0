//! Bulk import of JSON data into a document backend, with id remapping,
//! identity merging and relationship reconciliation.

pub mod api;
pub mod cli;
pub mod config;
pub mod import;
