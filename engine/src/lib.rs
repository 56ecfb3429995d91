//! Deployment Engine Library
//!
//! Turns deployment requests into sequenced, observable and cancellable runs
//! of external provisioning and configuration tools.

pub mod app;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod filesys;
pub mod hub;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;
