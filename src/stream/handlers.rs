//! Caller-supplied callbacks invoked by a subscription.
//!
//! All handlers are optional and default to no-ops. They run on the
//! subscription's worker, one at a time, in delivery order.
//!
//! ```rust
//! use berak_live::stream::handlers::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_message(|message| println!("{}: {}", message.event, message.data))
//!     .on_error(|fault| eprintln!("stream error: {fault}"));
//! ```

use std::fmt;
use std::sync::Arc;

use crate::stream::proto::StreamMessage;
use crate::stream::transport::{HandleId, ReadyState};

/// Transport failure reported to `on_error`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportFault {
    /// Handle that failed.
    pub handle: HandleId,
    /// Ready state observed when the error was handled. `Closed` means the
    /// subscription will schedule its own reconnect.
    pub ready_state: ReadyState,
    pub reason: Option<String>,
}

impl TransportFault {
    pub fn is_terminal(&self) -> bool {
        self.ready_state == ReadyState::Closed
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_terminal() {
            "terminal"
        } else {
            "transient"
        };
        match &self.reason {
            Some(reason) => write!(f, "{kind} error on handle {}: {reason}", self.handle),
            None => write!(f, "{kind} error on handle {}", self.handle),
        }
    }
}

pub type OnMessageCallback = Arc<dyn Fn(&StreamMessage) + Send + Sync>;

pub type OnErrorCallback = Arc<dyn Fn(&TransportFault) + Send + Sync>;

/// Receives the number of scheduled reconnects that were spent.
pub type OnExhaustedCallback = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventHandlers {
    on_message: Option<OnMessageCallback>,
    on_error: Option<OnErrorCallback>,
    on_exhausted: Option<OnExhaustedCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_exhausted", &self.on_exhausted.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the callback for the subscription's named update event.
    pub fn on_message(mut self, f: impl Fn(&StreamMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Registers the callback for transport errors, transient or terminal.
    pub fn on_error(mut self, f: impl Fn(&TransportFault) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Registers the callback fired once when automatic reconnection gives up.
    ///
    /// The subscription stays locked out until an explicit reconnect.
    pub fn on_exhausted(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_exhausted = Some(Arc::new(f));
        self
    }

    pub(crate) fn message(&self, message: &StreamMessage) {
        if let Some(callback) = &self.on_message {
            callback(message);
        }
    }

    pub(crate) fn error(&self, fault: &TransportFault) {
        if let Some(callback) = &self.on_error {
            callback(fault);
        }
    }

    pub(crate) fn exhausted(&self, attempts: u32) {
        if let Some(callback) = &self.on_exhausted {
            callback(attempts);
        }
    }
}
