//! Message processing core for a multi-platform chat bot.
//!
//! Platforms and LLM providers live behind ports (traits) implemented in
//! adapter crates. This crate owns the event model, the handler registry,
//! the per-session rate limiter, the built-in stages and the onion-model
//! scheduler that runs them.

pub mod builtin;
pub mod bus;
pub mod config;
pub mod conversation;
pub mod domain;
pub mod errors;
pub mod event;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod pipeline;
pub mod plugin;
pub mod ratelimit;
pub mod registry;
pub mod safety;
pub mod session;
pub mod stages;

pub use errors::{Error, Result};
