#![deny(unsafe_code)]

//! # Overview
//!
//! `engine` is the partitioned worker pipeline: given a [`RunConfig`], it
//! partitions the source address space among disjoint workers, has each
//! one read/compare/write its share, and aggregates the result into
//! [`stats::RunStats`]. This crate owns the one `std::thread::scope` call
//! in the workspace; every other crate here is single-threaded by
//! construction.
//!
//! Configuration is a single immutable value built once at entry (see
//! [`config::RunConfig`]) and threaded through explicitly, rather than the
//! module-level globals a from-scratch C port would reach for.

pub mod config;
pub mod dirty;
pub mod driver;
pub mod error;
pub mod stats;
pub mod throttle;
pub mod worker;

pub use config::{RunConfig, RunMode};
pub use driver::{RunOutcome, run};
pub use error::EngineError;
pub use stats::{RunStats, WorkerStats, append_sidecar};
