//! # audit-worker
//!
//! Page-audit worker with an idempotent, at-least-once processing protocol.
//!
//! Consumes audit requests from a pgmq topic, runs Lighthouse for the page,
//! uploads the reports, and records one run per message id against the
//! parent job's counters. Messages that exhaust their deliveries are moved
//! to a dead-letter topic and recorded as failed runs.

pub mod artifacts;
pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod worker;
