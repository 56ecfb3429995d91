//! Local HTTP server exposing the engine

pub mod error;
pub mod handlers;
pub mod serve;
pub mod state;
