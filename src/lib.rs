//! # Saiten: Document Evaluation Orchestrator
//!
//! Saiten ingests documents split into content units and evaluates each
//! unit against a project-defined tree of questions through an external
//! LLM batch service. Evaluations form a forest: a child question only
//! runs on units whose parent question decoded to its trigger value.
//!
//! ## Architecture
//!
//! - Data model and wire types ([`model`])
//! - Pure answer decoding by evaluation type ([`decoder`])
//! - Batch dispatch with correlation metadata ([`dispatch`])
//! - Catalog and result-store seams ([`catalog`], [`store`])
//! - Durable-execution facade: retries, signal routing, run journal
//!   ([`durable`])
//! - The recursive frontier orchestrator ([`frontier`])
//! - Affected-file selection on definition changes ([`selector`])
//! - Wiring and trigger surface ([`system`])

pub mod catalog;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod durable;
pub mod error;
pub mod frontier;
pub mod model;
pub mod selector;
pub mod store;
pub mod system;

// Re-exports
pub use error::*;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the default tracing subscriber, filtered by `RUST_LOG`. Call
/// once at process start; embedders with their own subscriber skip this.
pub fn init_logging() -> SaitenResult<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(e.to_string()))
}
