//! # relay-rs
//!
//! Message bridge between an HTTP ingress, a durable partitioned log, and a
//! keyed cache, plus a bounded worker pool for background jobs.
//!
//! Records published to the log are drained by a subscriber into the cache;
//! cached values can be read back or re-published. Postgres backs both the
//! log and the cache in production; in-process backends serve tests and
//! local runs.

pub mod bridge;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod log;
pub mod model;
pub mod store;
pub mod telemetry;
