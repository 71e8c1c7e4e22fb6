//! CLI command handling

pub mod client;
pub mod handlers;
