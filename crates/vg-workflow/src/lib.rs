//! # vg-workflow
//!
//! The Vendorgate approval workflow engine.
//!
//! This crate provides the workflow registry, the pure step quorum
//! evaluator, the request lifecycle engine, the timeout escalation
//! scheduler, and the audit recorder that ties the append-only trail
//! together. Persistence, authorization, and notification delivery are
//! injected collaborators defined in `vg-core`.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod registry;
pub mod scheduler;

pub use audit::{AuditEntry, AuditRecorder, RequestSummary};
pub use config::{load_engine_config, load_engine_config_from_env, ConfigError, EngineConfig};
pub use engine::ApprovalRequestEngine;
pub use error::EngineError;
pub use evaluator::{evaluate, StepOutcome};
pub use registry::WorkflowRegistry;
pub use scheduler::{EscalationScheduler, SweepReport};
