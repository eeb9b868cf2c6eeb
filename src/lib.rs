//! Transactional self-modification pipeline for autonomous agents.
//!
//! Every batch of proposed file changes runs through the same gauntlet:
//! policy guard, pre-flight validation, snapshot capture, ordered apply,
//! health verification, and automatic rollback when verification fails.
//! [`service::PipelineService`] is the embedding surface; everything else
//! is the machinery behind it.

pub mod applier;
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod fsio;
pub mod health;
pub mod jobs;
pub mod orchestrator;
pub mod policy;
pub mod rollback;
pub mod service;
pub mod store;
pub mod validator;

pub use batch::{FileAction, ModificationRequest};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use fsio::{MemFs, OsFs, ProjectFs};
pub use health::{HealthCheckOptions, HealthReport};
pub use jobs::{JobStatus, JobView};
pub use orchestrator::{RunDisposition, RunOutcome};
pub use rollback::RollbackOutcome;
pub use service::{PipelineService, PolicySummary, ProposeReceipt, RequestContext, RestartAck};
pub use store::{ModificationLogEntry, Snapshot};
