//! # Flowpilot Core Library
//!
//! Workflow routing engine with checkpointed execution state, a
//! human-in-the-loop coordinator that suspends and resumes executions, and a
//! trigger scheduler (cron, interval, webhook, event and manual).

pub mod error;
pub mod models;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod workflow;

pub use error::{FlowError, FlowResult};
pub use runtime::FlowRuntime;
pub use scheduler::Scheduler;
pub use server::FlowServer;
pub use workflow::{ExecutionEngine, HilCoordinator};
