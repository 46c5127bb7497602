//! Connection-state machine for one event-stream subscription.
//!
//! `Subscription` is synchronous: it reacts to caller operations, transport
//! notifications, reconnect timers, and lifecycle signals, and it never
//! blocks. Timers are armed through a [`ReconnectScheduler`]; when one fires,
//! the owner hands it back via [`Subscription::fire_reconnect_timer`].
//! Deferred work re-validates state before acting, so stale timers and
//! notifications from released handles are harmless.
//!
//! [`StreamClient`](crate::stream::client::StreamClient) runs a subscription on
//! a tokio worker; tests drive it directly.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::retry::BackoffPolicy;
use crate::stream::handlers::{EventHandlers, TransportFault};
use crate::stream::lifecycle::{
    lifecycle_action, BackgroundingPolicy, LifecycleAction, LifecycleCapabilities, LifecycleKind,
    LifecycleObservers, LifecycleSignal,
};
use crate::stream::transport::{
    EventSink, HandleId, ReadyState, Transport, TransportEvent, TransportHandle,
    TransportNotification,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Named event forwarded to `on_message`.
    pub const EVENT_NAME: &'static str = "update";
}

#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    pub backoff: BackoffPolicy,
    /// Only events with this name reach `on_message`.
    pub event_name: String,
    pub backgrounding: BackgroundingPolicy,
    pub capabilities: LifecycleCapabilities,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::standard(),
            event_name: StreamDefaults::EVENT_NAME.to_string(),
            backgrounding: BackgroundingPolicy::default(),
            capabilities: LifecycleCapabilities::default(),
        }
    }
}

impl SubscriptionOptions {
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_event_name(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = event_name.into();
        self
    }

    pub fn with_backgrounding(mut self, backgrounding: BackgroundingPolicy) -> Self {
        self.backgrounding = backgrounding;
        self
    }

    pub fn with_capabilities(mut self, capabilities: LifecycleCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Reconnect timer armed after a terminal failure.
///
/// Carries the handle generation current when it was armed; if a newer handle
/// has been opened by the time it fires, it does nothing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconnectTimer {
    pub generation: u64,
}

/// Arms reconnect timers on behalf of a subscription.
pub trait ReconnectScheduler: Send + 'static {
    fn schedule(&mut self, delay: Duration, timer: ReconnectTimer);
}

/// Observable state of a subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Connected,
    /// Transport lost; a reconnect timer is pending.
    ErrorBackoff,
    /// Reconnect budget spent; only an explicit reconnect recovers.
    LockedOut,
    Paused,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ErrorBackoff => "error_backoff",
            Self::LockedOut => "locked_out",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a subscription.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionSnapshot {
    pub state: SubscriptionState,
    pub connected: bool,
    pub paused: bool,
    pub reconnect_attempts: u32,
    pub live_handle: Option<HandleId>,
}

pub struct Subscription<T: Transport, S: ReconnectScheduler> {
    endpoint: Url,
    options: SubscriptionOptions,
    handlers: EventHandlers,
    observers: LifecycleObservers,
    transport: T,
    scheduler: S,
    notifications: mpsc::UnboundedSender<TransportNotification>,
    handle: Option<(HandleId, T::Handle)>,
    connected: bool,
    paused: bool,
    reconnect_attempts: u32,
    generation: u64,
    pending_timer: Option<u64>,
    exhausted: bool,
}

impl<T: Transport, S: ReconnectScheduler> Subscription<T, S> {
    /// Creates an idle subscription. Transport notifications for handles it
    /// opens are sent to `notifications`.
    pub fn new(
        endpoint: Url,
        options: SubscriptionOptions,
        handlers: EventHandlers,
        transport: T,
        scheduler: S,
        notifications: mpsc::UnboundedSender<TransportNotification>,
    ) -> Self {
        let observers = LifecycleObservers::all(options.capabilities);
        Self {
            endpoint,
            options,
            handlers,
            observers,
            transport,
            scheduler,
            notifications,
            handle: None,
            connected: false,
            paused: false,
            reconnect_attempts: 0,
            generation: 0,
            pending_timer: None,
            exhausted: false,
        }
    }

    /// Opens a transport unless one exists or the subscription is paused.
    pub fn connect(&mut self) {
        if self.handle.is_some() || self.paused {
            return;
        }

        // Any armed timer now belongs to an older generation and will be skipped.
        self.generation += 1;
        self.pending_timer = None;
        let id = HandleId(self.generation);
        let sink = EventSink::new(id, self.notifications.clone());
        match self.transport.open(&self.endpoint, sink) {
            Ok(handle) => {
                debug!(event = "transport_opening", handle = %id, endpoint = %self.endpoint);
                self.handle = Some((id, handle));
            }
            Err(err) => {
                warn!(event = "transport_open_failed", handle = %id, error = %err);
                self.handlers.error(&TransportFault {
                    handle: id,
                    ready_state: ReadyState::Closed,
                    reason: Some(err.to_string()),
                });
                self.schedule_reconnect();
            }
        }
    }

    /// Closes and releases the live handle, if any.
    pub fn disconnect(&mut self) {
        if let Some((id, mut handle)) = self.handle.take() {
            handle.close();
            debug!(event = "transport_closed", handle = %id);
        }
        self.connected = false;
    }

    /// Tears down, clears pause and the reconnect budget, and connects again.
    pub fn reconnect(&mut self) {
        self.disconnect();
        self.paused = false;
        self.reset_attempts();
        self.connect();
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.disconnect();
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.connect();
    }

    pub fn handle_notification(&mut self, notification: TransportNotification) {
        let TransportNotification { handle, event } = notification;
        if self.live_handle() != Some(handle) {
            debug!(event = "stale_notification_dropped", handle = %handle);
            return;
        }

        match event {
            TransportEvent::Open => {
                debug!(event = "transport_open", handle = %handle);
                self.connected = true;
                self.reset_attempts();
            }
            TransportEvent::Message(message) => {
                if message.event != self.options.event_name {
                    return;
                }
                self.reset_attempts();
                self.handlers.message(&message);
            }
            TransportEvent::Error { reason } => {
                self.connected = false;
                let ready_state = self
                    .handle
                    .as_ref()
                    .map_or(ReadyState::Closed, |(_, live)| live.ready_state());
                self.handlers.error(&TransportFault {
                    handle,
                    ready_state,
                    reason,
                });
                if ready_state == ReadyState::Closed {
                    self.disconnect();
                    self.schedule_reconnect();
                }
            }
        }
    }

    pub fn fire_reconnect_timer(&mut self, timer: ReconnectTimer) {
        if self.pending_timer == Some(timer.generation) {
            self.pending_timer = None;
        }
        if self.paused || self.connected || timer.generation != self.generation {
            debug!(
                event = "reconnect_timer_skipped",
                generation = timer.generation,
                current = self.generation,
                paused = self.paused,
                connected = self.connected
            );
            return;
        }

        debug!(event = "reconnect_timer_fired", generation = timer.generation);
        self.disconnect();
        self.connect();
    }

    pub fn handle_lifecycle(&mut self, signal: LifecycleSignal) {
        if !self.observers.is_observing(signal.kind()) {
            return;
        }

        let action = lifecycle_action(signal, self.options.backgrounding);
        debug!(event = "lifecycle_signal", signal = ?signal, action = ?action);
        match action {
            LifecycleAction::Ignore => {}
            LifecycleAction::Disconnect => self.disconnect(),
            LifecycleAction::ReconnectIfIdle => {
                if !self.paused && !self.connected {
                    self.reconnect();
                }
            }
            LifecycleAction::ReconnectUnlessPaused => {
                if !self.paused {
                    self.reconnect();
                }
            }
        }
    }

    /// Starts reacting to a lifecycle signal group. Returns false if the host
    /// cannot deliver it.
    pub fn observe(&mut self, kind: LifecycleKind) -> bool {
        self.observers.observe(kind)
    }

    pub fn unobserve(&mut self, kind: LifecycleKind) {
        self.observers.unobserve(kind);
    }

    pub fn state(&self) -> SubscriptionState {
        if self.paused {
            SubscriptionState::Paused
        } else if self.connected {
            SubscriptionState::Connected
        } else if self.handle.is_some() {
            SubscriptionState::Connecting
        } else if self.pending_timer.is_some() {
            SubscriptionState::ErrorBackoff
        } else if self.exhausted {
            SubscriptionState::LockedOut
        } else {
            SubscriptionState::Idle
        }
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            state: self.state(),
            connected: self.connected,
            paused: self.paused,
            reconnect_attempts: self.reconnect_attempts,
            live_handle: self.live_handle(),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn live_handle(&self) -> Option<HandleId> {
        self.handle.as_ref().map(|(id, _)| *id)
    }

    fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
        self.exhausted = false;
    }

    fn schedule_reconnect(&mut self) {
        if self.paused {
            return;
        }
        if self.options.backoff.is_exhausted(self.reconnect_attempts) {
            if !self.exhausted {
                self.exhausted = true;
                warn!(
                    event = "reconnect_limit_reached",
                    attempts = self.reconnect_attempts,
                    endpoint = %self.endpoint
                );
                self.handlers.exhausted(self.reconnect_attempts);
            }
            return;
        }

        let delay = self.options.backoff.delay_for_attempt(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        let timer = ReconnectTimer {
            generation: self.generation,
        };
        self.pending_timer = Some(timer.generation);
        debug!(
            event = "reconnect_scheduled",
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            generation = timer.generation
        );
        self.scheduler.schedule(delay, timer);
    }
}

impl<T: Transport, S: ReconnectScheduler> Drop for Subscription<T, S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<T: Transport, S: ReconnectScheduler> fmt::Debug for Subscription<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("generation", &self.generation)
            .finish()
    }
}
