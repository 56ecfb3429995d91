//! Deployment execution: state machine, stages and subprocesses

pub mod credentials;
pub mod fsm;
pub mod pipeline;
pub mod process;
pub mod stage;
pub mod tools;
