//! Skypevault - Resumable ETL engine for Skype conversation exports
//!
//! Ingests Skype export documents (bare JSON or TAR archives) and lands
//! them in PostgreSQL as a normalized relational dataset, preserving the
//! raw export verbatim alongside the transformed data. Runs are
//! checkpointed per phase and resumable after a crash; a streaming variant
//! bounds memory by processing one conversation at a time.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod load;
pub mod models;
pub mod pipeline;
pub mod reader;
pub mod transform;

// Re-export main types
pub use config::{DatabaseConfig, PipelineConfig};
pub use context::{EtlContext, Phase};
pub use error::{Error, Result};
pub use pipeline::{EtlPipeline, RunSummary};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
