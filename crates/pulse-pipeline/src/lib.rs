//! Weekly app-review pulse: ingestion through archive as ten idempotent,
//! file-backed phases.

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod normalize;
pub mod parse;
pub mod phases;
pub mod prompts;
pub mod render;
pub mod sample;
pub mod scheduler;
pub mod score;
pub mod service;
pub mod snapshot;

pub use config::PipelineConfig;
pub use dispatcher::{Dispatcher, PhaseOutcome, RunPlan, RunReport};
pub use error::{MalformedReason, PipelineError};
pub use phases::{standard_phases, Collaborators, Phase, PhaseContext, PhaseSettings};
pub use scheduler::build_weekly_scheduler;
pub use service::PulseService;

pub const CRATE_NAME: &str = "pulse-pipeline";
