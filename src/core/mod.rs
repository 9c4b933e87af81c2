//! Core reconciliation logic: types, parsing, resolution, planning, execution.

pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod retry;
pub mod schema;
pub mod settings;
pub mod state;
pub mod types;
pub mod value;
