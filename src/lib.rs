//! Reconnecting event-stream subscription client.
//!
//! The crate keeps one server-sent event subscription alive across network
//! failures, backgrounding, OS freeze/resume, and history-cache restores,
//! without opening duplicate connections or reconnecting in a tight loop.
//!
//! - `stream`: subscription state machine, async client, lifecycle policy,
//!   and the HTTP event-stream transport.
//! - `retry`: backoff policy and timeout helpers.

/// Backoff and timeout helpers.
pub mod retry;
/// Event-stream client, transport, and lifecycle handling.
pub mod stream;

pub use stream::client::{LifecycleSender, StreamClient};
pub use stream::handlers::{EventHandlers, TransportFault};
pub use stream::lifecycle::{BackgroundingPolicy, LifecycleCapabilities, Visibility};
pub use stream::proto::{FragmentUpdate, StreamMessage, StreamSelector};
pub use stream::subscription::{SubscriptionOptions, SubscriptionState};
pub use stream::transport::HttpSseTransport;
