//! Core types for data import

mod definition;
mod record;
mod schema;
mod value;

pub use definition::*;
pub use record::*;
pub use schema::*;
pub use value::*;
