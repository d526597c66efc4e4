//! Per-pipeline replication-controller master.
//!
//! One replica at a time holds the master lease and drives the orchestrator
//! toward the desired set of worker controllers: one controller per
//! non-stopped pipeline record in the store.

mod master;
mod pipeline;

pub use master::{MasterError, PipelineMaster, PIPELINES_PREFIX};
pub use pipeline::{synthesize_legacy_input, AtomInput, Input, PipelineRecord, Transform};
