//! Command handlers

pub mod run;
pub mod validate;

pub use run::handle_run_command;
pub use validate::handle_validate_command;
