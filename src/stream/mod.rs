//! Streaming ingress: connection management, bounded inbound queue,
//! de-duplication and per-stream health.

pub mod dedup;
pub mod health;
pub mod manager;
pub mod queue;
