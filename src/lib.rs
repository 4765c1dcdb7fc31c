//! MetricHub - DORA metrics aggregation engine.
//!
//! # Overview
//!
//! MetricHub records deployments and incidents per (service, environment)
//! partition and computes the four DORA metrics over arbitrary windows:
//! deployment frequency, lead time for changes, mean time to recovery, and
//! change failure rate. Each metric is classified as elite, high, medium, or
//! low against configurable benchmark bands.
//!
//! Writes are serialized per partition and persisted before they become
//! visible. Reads never block on writes to other partitions, and metric
//! windows are cached until a partition they cover changes.
//!
//! # Modules
//!
//! - [`model`]: Events, windows, classifications, and response envelopes
//! - [`store`]: Partitioned append-only event store
//! - [`storage`]: Durable event log (SQLite, or in memory for tests)
//! - [`aggregation`]: Metric computation and window cache
//! - [`classifier`]: Benchmark bands and tiering
//! - [`lifecycle`]: Incident and deployment state transitions
//! - [`engine`]: The facade tying it all together
//! - [`fixtures`]: Seeded synthetic histories
//! - [`api`]: HTTP API handlers

pub mod aggregation;
pub mod api;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fixtures;
pub mod lifecycle;
pub mod model;
pub mod storage;
pub mod store;
