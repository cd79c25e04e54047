//! LLM collaborator port. Provider clients live in adapter crates.

pub mod client;
pub mod types;
