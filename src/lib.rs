//! Evalwatch library
//!
//! Orchestration and monitoring of model-evaluation jobs on a remote
//! compute cluster: a five-stage workflow, a resumable polling monitor and
//! throttled progress notifications.

pub mod app;
pub mod cluster;
pub mod config;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod state;
pub mod store;
pub mod workflow;
