//! Data models

pub mod deployment;
pub mod log_event;
