//! Trigger scheduling

pub mod cron;
pub mod service;
pub mod trigger;

pub use cron::CronExpression;
pub use service::Scheduler;
pub use trigger::{next_execution, parse_trigger};
