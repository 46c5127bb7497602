//! Event-stream subscription modules.
//!
//! - `client`: async handle that runs a subscription on a background worker.
//! - `subscription`: connection-state machine with backoff and lifecycle
//!   handling.
//! - `lifecycle`: host lifecycle signals and the backgrounding policy.
//! - `transport`: transport primitive traits and the HTTP implementation.
//! - `sse`: incremental `text/event-stream` decoder.
//! - `proto`: stream messages, payload helpers, and endpoint selection.

/// Background worker and command sender.
pub mod client;
/// Caller callbacks.
pub mod handlers;
/// Lifecycle signals and policy.
pub mod lifecycle;
/// Stream message types.
pub mod proto;
/// Event-stream decoder.
pub mod sse;
/// Subscription state machine.
pub mod subscription;
/// Transport traits and HTTP transport.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
