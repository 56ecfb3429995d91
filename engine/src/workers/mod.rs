//! Background workers

pub mod runner;
