//! # taskcast
//!
//! Lane-routed task orchestration with live status fan-out.
//!
//! Producers enqueue work items by kind; the routing table assigns each kind
//! a priority lane and a retry policy. Worker pools claim from pgmq lanes in
//! strict priority order, run callbacks under a hard timeout, and record
//! outcomes in a TTL-bounded result store. Lifecycle events fan out through
//! an in-process bus (relayed across processes with Postgres NOTIFY) to
//! WebSocket clients of the gateway.

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod hooks;
pub mod model;
pub mod queue;
pub mod routing;
pub mod store;
pub mod telemetry;
pub mod worker;
