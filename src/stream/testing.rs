//! In-memory transport and scheduler used by the subscription tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use url::Url;

use crate::stream::proto::StreamMessage;
use crate::stream::subscription::{ReconnectScheduler, ReconnectTimer};
use crate::stream::transport::{
    EventSink, HandleId, ReadyState, SharedReadyState, Transport, TransportError, TransportEvent,
    TransportHandle,
};

/// Handle opened by [`FakeTransport`], kept so tests can drive it.
#[derive(Clone, Debug)]
pub(crate) struct OpenedHandle {
    pub id: HandleId,
    pub sink: EventSink,
    pub state: SharedReadyState,
}

impl OpenedHandle {
    pub fn open(&self) {
        self.state.set(ReadyState::Open);
        self.sink.emit(TransportEvent::Open);
    }

    pub fn message(&self, event: &str, data: &str) {
        self.sink
            .emit(TransportEvent::Message(StreamMessage::new(event, data)));
    }

    pub fn transient_error(&self) {
        self.state.set(ReadyState::Connecting);
        self.sink.emit(TransportEvent::Error {
            reason: Some("network blip".to_string()),
        });
    }

    pub fn terminal_error(&self) {
        self.state.set(ReadyState::Closed);
        self.sink.emit(TransportEvent::Error {
            reason: Some("server closed stream".to_string()),
        });
    }
}

#[derive(Debug, Default)]
struct FakeState {
    opened: Vec<OpenedHandle>,
    fail_next: usize,
    open_calls: usize,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl FakeTransport {
    /// Makes the next `count` open calls fail synchronously.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().expect("fake state").fail_next = count;
    }

    pub fn opened(&self) -> Vec<OpenedHandle> {
        self.state.lock().expect("fake state").opened.clone()
    }

    pub fn last(&self) -> OpenedHandle {
        self.opened().last().cloned().expect("a handle was opened")
    }

    pub fn open_calls(&self) -> usize {
        self.state.lock().expect("fake state").open_calls
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    type Handle = FakeHandle;

    fn open(&mut self, _endpoint: &Url, sink: EventSink) -> Result<FakeHandle, TransportError> {
        let mut state = self.state.lock().expect("fake state");
        state.open_calls += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Refused("fake refusal".to_string()));
        }

        let ready = SharedReadyState::new(ReadyState::Connecting);
        state.opened.push(OpenedHandle {
            id: sink.handle(),
            sink,
            state: ready.clone(),
        });
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(FakeHandle {
            state: ready,
            live: Arc::clone(&self.live),
            released: false,
        })
    }
}

#[derive(Debug)]
pub(crate) struct FakeHandle {
    state: SharedReadyState,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl TransportHandle for FakeHandle {
    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn close(&mut self) {
        self.state.set(ReadyState::Closed);
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Scheduler that records timers instead of arming them.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordingScheduler {
    timers: Arc<Mutex<Vec<(Duration, ReconnectTimer)>>>,
}

impl RecordingScheduler {
    pub fn delays_ms(&self) -> Vec<u64> {
        self.timers
            .lock()
            .expect("timers")
            .iter()
            .map(|(delay, _)| delay.as_millis() as u64)
            .collect()
    }

    pub fn last(&self) -> ReconnectTimer {
        self.timers
            .lock()
            .expect("timers")
            .last()
            .map(|(_, timer)| *timer)
            .expect("a timer was scheduled")
    }

    pub fn count(&self) -> usize {
        self.timers.lock().expect("timers").len()
    }
}

impl ReconnectScheduler for RecordingScheduler {
    fn schedule(&mut self, delay: Duration, timer: ReconnectTimer) {
        self.timers.lock().expect("timers").push((delay, timer));
    }
}
