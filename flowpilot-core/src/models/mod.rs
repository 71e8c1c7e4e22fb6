//! Data models for flowpilot

pub mod configuration;
pub mod hil;
pub mod schedule;
pub mod workflow;

pub use configuration::*;
pub use hil::*;
pub use schedule::*;
pub use workflow::*;
