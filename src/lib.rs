//! Audited execution of parameterized command templates.
//!
//! Callers never get a shell: they name a template, supply typed parameters,
//! and the pipeline validates, authorizes, builds an argument vector, and runs
//! it in a sandboxed worker. Every attempt lands in an append-only audit log.

pub mod audit;
pub mod auth;
pub mod builder;
pub mod config;
pub mod console;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod sandbox;
pub mod template;
pub mod validate;

pub use error::GateError;
pub use pipeline::{Pipeline, PipelineOptions};
