//! Agent Runner Library
//!
//! Orchestration core for a single coding agent: task lifecycle, priority
//! queue, recovery policy, runner supervision and event broadcast.

pub mod agent;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod recovery;
pub mod store;
pub mod supervisor;
pub mod types;
