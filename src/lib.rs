//! `clustercore`: the coordination core for a distributed file system's
//! metadata tier.
//!
//! This crate owns cluster-wide agreement (a replicated log with leader
//! election, [`consensus`]), liveness tracking (a heartbeat-based failure
//! detector, [`failure_detector`]), leadership bookkeeping on top of the log
//! ([`election`]), shard-placement rebalancing ([`planner`]), and the
//! bounded-concurrency executor that carries out the moves the planner
//! decides on ([`executor`]). [`cluster_manager`] wires all of it together
//! behind one handle and the external API described by spec.md §6.
//!
//! None of these components own storage for file or shard *data* — they
//! coordinate which node is responsible for what and keep that agreement
//! alive under churn. Moving bytes is someone else's problem, reached
//! through the [`executor::DataClient`] seam.

pub mod cluster_manager;
pub mod config;
pub mod consensus;
pub mod election;
pub mod error;
pub mod executor;
pub mod failure_detector;
pub mod planner;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};
