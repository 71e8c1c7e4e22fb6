//! Workflow execution: handlers, routing, checkpoints and the engine

pub mod builtin;
pub mod checkpoint;
pub mod classifier;
pub mod engine;
pub mod handler;
pub mod hil;
pub mod registry;
pub mod router;
pub mod validator;

pub use checkpoint::*;
pub use classifier::*;
pub use engine::*;
pub use handler::*;
pub use hil::*;
pub use registry::*;
pub use router::*;
pub use validator::*;
