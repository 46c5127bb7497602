//! Async stream client that owns a subscription on a background worker.
//!
//! The worker is the subscription's only thread of control: caller commands,
//! transport notifications, reconnect timers, and lifecycle signals are queued
//! to it and applied one at a time. Handles are cheap to clone; the worker
//! stops and releases its transport once every handle is dropped.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use url::Url;

use crate::stream::handlers::EventHandlers;
use crate::stream::lifecycle::{LifecycleKind, LifecycleSignal, Visibility};
use crate::stream::subscription::{
    ReconnectScheduler, ReconnectTimer, Subscription, SubscriptionOptions, SubscriptionSnapshot,
};
use crate::stream::transport::{Transport, TransportNotification};

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Pause,
    Resume,
    Lifecycle(LifecycleSignal),
    Observe(LifecycleKind, oneshot::Sender<bool>),
    Unobserve(LifecycleKind),
    Snapshot(oneshot::Sender<SubscriptionSnapshot>),
}

/// Handle to a subscription running on a background worker.
///
/// Every operation is queued and never fails; once the worker has stopped,
/// operations are silently dropped.
#[derive(Clone, Debug)]
pub struct StreamClient {
    tx: mpsc::UnboundedSender<Command>,
}

impl StreamClient {
    /// Spawns the subscription worker for `endpoint`.
    ///
    /// The subscription starts idle; call [`connect`](Self::connect) to open
    /// the stream. Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(
        endpoint: Url,
        transport: T,
        options: SubscriptionOptions,
        handlers: EventHandlers,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let subscription = Subscription::new(
            endpoint,
            options,
            handlers,
            transport,
            TokioScheduler { tx: timer_tx },
            notification_tx,
        );

        tokio::spawn(async move {
            subscription_worker(subscription, command_rx, notification_rx, timer_rx).await;
        });

        Self { tx: command_tx }
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Reconnects from scratch, clearing pause and any reconnect lockout.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Suspends the subscription until [`resume`](Self::resume) or
    /// [`reconnect`](Self::reconnect).
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Returns a sender the host uses to report lifecycle signals.
    pub fn lifecycle(&self) -> LifecycleSender {
        LifecycleSender {
            tx: self.tx.clone(),
        }
    }

    /// Starts reacting to a lifecycle signal group.
    ///
    /// Resolves to false if the host cannot deliver that group or the worker
    /// has stopped.
    pub async fn observe(&self, kind: LifecycleKind) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Observe(kind, reply_tx));
        reply_rx.await.unwrap_or(false)
    }

    pub fn unobserve(&self, kind: LifecycleKind) {
        self.send(Command::Unobserve(kind));
    }

    /// Returns the current subscription state, or `None` if the worker has
    /// stopped.
    pub async fn snapshot(&self) -> Option<SubscriptionSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Snapshot(reply_tx));
        reply_rx.await.ok()
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!(event = "stream_worker_stopped");
        }
    }
}

/// Cloneable sender for host lifecycle signals.
#[derive(Clone, Debug)]
pub struct LifecycleSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl LifecycleSender {
    pub fn signal(&self, signal: LifecycleSignal) {
        if self.tx.send(Command::Lifecycle(signal)).is_err() {
            debug!(event = "stream_worker_stopped", signal = ?signal);
        }
    }

    pub fn visibility_changed(&self, visibility: Visibility) {
        self.signal(LifecycleSignal::VisibilityChanged(visibility));
    }

    /// Reports that the OS froze the page.
    pub fn freeze(&self) {
        self.signal(LifecycleSignal::Freeze);
    }

    /// Reports that the OS resumed a frozen page.
    pub fn thaw(&self) {
        self.signal(LifecycleSignal::Resume);
    }

    pub fn page_hide(&self, persisted: bool) {
        self.signal(LifecycleSignal::PageHide { persisted });
    }

    pub fn page_show(&self, persisted: bool) {
        self.signal(LifecycleSignal::PageShow { persisted });
    }
}

struct TokioScheduler {
    tx: mpsc::UnboundedSender<ReconnectTimer>,
}

impl ReconnectScheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, timer: ReconnectTimer) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        });
    }
}

async fn subscription_worker<T: Transport>(
    mut subscription: Subscription<T, TokioScheduler>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut notifications: mpsc::UnboundedReceiver<TransportNotification>,
    mut timers: mpsc::UnboundedReceiver<ReconnectTimer>,
) {
    loop {
        // Commands are served ahead of stream traffic.
        tokio::select! {
            biased;
            command = commands.recv() => {
                match command {
                    Some(command) => apply_command(&mut subscription, command),
                    None => break,
                }
            }
            Some(notification) = notifications.recv() => {
                subscription.handle_notification(notification);
            }
            Some(timer) = timers.recv() => {
                subscription.fire_reconnect_timer(timer);
            }
        }
    }

    debug!(event = "stream_worker_exit", endpoint = %subscription.endpoint());
    subscription.disconnect();
}

fn apply_command<T: Transport>(
    subscription: &mut Subscription<T, TokioScheduler>,
    command: Command,
) {
    match command {
        Command::Connect => subscription.connect(),
        Command::Disconnect => subscription.disconnect(),
        Command::Reconnect => subscription.reconnect(),
        Command::Pause => subscription.pause(),
        Command::Resume => subscription.resume(),
        Command::Lifecycle(signal) => subscription.handle_lifecycle(signal),
        Command::Observe(kind, reply) => {
            let _ = reply.send(subscription.observe(kind));
        }
        Command::Unobserve(kind) => subscription.unobserve(kind),
        Command::Snapshot(reply) => {
            let _ = reply.send(subscription.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use url::Url;

    use super::StreamClient;
    use crate::stream::handlers::EventHandlers;
    use crate::stream::lifecycle::{BackgroundingPolicy, LifecycleKind, Visibility};
    use crate::stream::subscription::{SubscriptionOptions, SubscriptionState};
    use crate::stream::testing::FakeTransport;

    fn endpoint() -> Url {
        Url::parse("http://localhost:8080/sse?period=daily&year=2024&month=5").expect("url")
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    async fn state_of(client: &StreamClient) -> SubscriptionState {
        settle().await;
        client.snapshot().await.expect("worker running").state
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_update_events_to_handler() {
        let transport = FakeTransport::default();
        let received = Arc::new(Mutex::new(Vec::new()));
        let handlers = EventHandlers::new().on_message({
            let received = Arc::clone(&received);
            move |message| received.lock().expect("received").push(message.data.clone())
        });
        let client = StreamClient::spawn(
            endpoint(),
            transport.clone(),
            SubscriptionOptions::default(),
            handlers,
        );

        client.connect();
        assert_eq!(state_of(&client).await, SubscriptionState::Connecting);

        transport.last().open();
        transport.last().message("update", "{\"poop-table\":\"<table/>\"}");
        assert_eq!(state_of(&client).await, SubscriptionState::Connected);
        assert_eq!(
            received.lock().expect("received").as_slice(),
            ["{\"poop-table\":\"<table/>\"}".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_closure_reconnects_after_backoff() {
        let transport = FakeTransport::default();
        let client = StreamClient::spawn(
            endpoint(),
            transport.clone(),
            SubscriptionOptions::default(),
            EventHandlers::new(),
        );
        client.connect();
        settle().await;

        transport.last().terminal_error();
        assert_eq!(state_of(&client).await, SubscriptionState::ErrorBackoff);

        tokio::time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(transport.open_calls(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(state_of(&client).await, SubscriptionState::Connecting);
        assert_eq!(transport.open_calls(), 2);

        transport.last().terminal_error();
        settle().await;
        tokio::time::advance(Duration::from_millis(1999)).await;
        settle().await;
        assert_eq!(transport.open_calls(), 2);
        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(transport.open_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn os_resume_while_paused_does_not_reconnect() {
        let transport = FakeTransport::default();
        let client = StreamClient::spawn(
            endpoint(),
            transport.clone(),
            SubscriptionOptions::default(),
            EventHandlers::new(),
        );
        client.connect();
        settle().await;
        transport.last().open();

        client.pause();
        client.lifecycle().thaw();
        assert_eq!(state_of(&client).await, SubscriptionState::Paused);
        assert_eq!(transport.open_calls(), 1);
        assert_eq!(transport.live(), 0);

        client.resume();
        assert_eq!(state_of(&client).await, SubscriptionState::Connecting);
        assert_eq!(transport.open_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_takes_effect_ahead_of_queued_stream_events() {
        let transport = FakeTransport::default();
        let received = Arc::new(Mutex::new(0usize));
        let handlers = EventHandlers::new().on_message({
            let received = Arc::clone(&received);
            move |_| *received.lock().expect("received") += 1
        });
        let client = StreamClient::spawn(
            endpoint(),
            transport.clone(),
            SubscriptionOptions::default(),
            handlers,
        );
        client.connect();
        settle().await;
        transport.last().open();
        settle().await;

        for n in 0..100 {
            transport.last().message("update", &n.to_string());
        }
        client.pause();

        assert_eq!(state_of(&client).await, SubscriptionState::Paused);
        assert_eq!(*received.lock().expect("received"), 0);
        assert_eq!(transport.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_timer_is_no_op_after_explicit_reconnect() {
        let transport = FakeTransport::default();
        let client = StreamClient::spawn(
            endpoint(),
            transport.clone(),
            SubscriptionOptions::default(),
            EventHandlers::new(),
        );
        client.connect();
        settle().await;
        transport.last().terminal_error();
        settle().await;

        client.reconnect();
        settle().await;
        let reopened = transport.last().id;

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        let snapshot = client.snapshot().await.expect("worker running");
        assert_eq!(snapshot.live_handle, Some(reopened));
        assert_eq!(transport.open_calls(), 2);
        assert_eq!(transport.max_live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_visibility_respects_backgrounding_policy() {
        let generic = FakeTransport::default();
        let generic_client = StreamClient::spawn(
            endpoint(),
            generic.clone(),
            SubscriptionOptions::default(),
            EventHandlers::new(),
        );
        let touch = FakeTransport::default();
        let touch_client = StreamClient::spawn(
            endpoint(),
            touch.clone(),
            SubscriptionOptions::default().with_backgrounding(BackgroundingPolicy::VisibilityOnly),
            EventHandlers::new(),
        );

        for client in [&generic_client, &touch_client] {
            client.connect();
        }
        settle().await;
        generic.last().open();
        touch.last().open();

        for client in [&generic_client, &touch_client] {
            client.lifecycle().visibility_changed(Visibility::Hidden);
        }
        assert_eq!(state_of(&generic_client).await, SubscriptionState::Connected);
        assert_eq!(state_of(&touch_client).await, SubscriptionState::Idle);

        touch_client.lifecycle().visibility_changed(Visibility::Visible);
        assert_eq!(state_of(&touch_client).await, SubscriptionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn observers_can_be_toggled_through_client() {
        let transport = FakeTransport::default();
        let client = StreamClient::spawn(
            endpoint(),
            transport.clone(),
            SubscriptionOptions::default(),
            EventHandlers::new(),
        );
        client.connect();
        settle().await;
        transport.last().open();

        client.unobserve(LifecycleKind::FreezeResume);
        client.lifecycle().freeze();
        assert_eq!(state_of(&client).await, SubscriptionState::Connected);

        assert!(client.observe(LifecycleKind::FreezeResume).await);
        client.lifecycle().freeze();
        assert_eq!(state_of(&client).await, SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_stops_worker_and_releases_transport() {
        let transport = FakeTransport::default();
        let client = StreamClient::spawn(
            endpoint(),
            transport.clone(),
            SubscriptionOptions::default(),
            EventHandlers::new(),
        );
        let lifecycle = client.lifecycle();
        client.connect();
        settle().await;
        assert_eq!(transport.live(), 1);

        drop(client);
        settle().await;
        assert_eq!(transport.live(), 1);

        drop(lifecycle);
        settle().await;
        assert_eq!(transport.live(), 0);
    }
}
