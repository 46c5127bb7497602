//! Event-stream transport primitive.
//!
//! A [`Transport`] opens one handle per connection attempt. Each handle reports
//! `open`, named messages, and `error` notifications through an [`EventSink`]
//! and exposes its [`ReadyState`] so the subscription can tell a transient
//! error (the transport retries on its own) from a terminal closure.
//!
//! [`HttpSseTransport`] is the reqwest-backed implementation.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::retry::with_timeout;
use crate::stream::proto::StreamMessage;
use crate::stream::sse::{SseDecoder, DEFAULT_MAX_EVENT_BYTES};

const EVENT_STREAM_MIME: &str = "text/event-stream";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Identifies one transport handle within a subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a transport handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadyState {
    /// Connecting, or waiting to reconnect after a transient failure.
    Connecting,
    Open,
    /// Terminally closed; the handle will not recover on its own.
    Closed,
}

impl ReadyState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Ready state shared between a handle and the task driving it.
#[derive(Clone, Debug)]
pub struct SharedReadyState(Arc<AtomicU8>);

impl SharedReadyState {
    pub fn new(state: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ReadyState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Notification emitted by a transport handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(StreamMessage),
    Error { reason: Option<String> },
}

/// Transport event tagged with the handle that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportNotification {
    pub handle: HandleId,
    pub event: TransportEvent,
}

/// Delivery channel handed to a transport when a handle is opened.
#[derive(Clone, Debug)]
pub struct EventSink {
    handle: HandleId,
    tx: mpsc::UnboundedSender<TransportNotification>,
}

impl EventSink {
    pub fn new(handle: HandleId, tx: mpsc::UnboundedSender<TransportNotification>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Delivers an event. Returns false once the subscription has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportNotification {
                handle: self.handle,
                event,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Opens event-stream handles.
pub trait Transport: Send + 'static {
    type Handle: TransportHandle;

    /// Starts connecting to `endpoint`. Connection outcome is reported through
    /// `sink`; an `Err` here means the handle could not even be constructed.
    fn open(&mut self, endpoint: &Url, sink: EventSink) -> Result<Self::Handle, TransportError>;
}

/// One live event-stream connection.
pub trait TransportHandle: Send + 'static {
    fn ready_state(&self) -> ReadyState;

    /// Closes the connection. No further events are delivered afterwards.
    fn close(&mut self);
}

/// Errors raised synchronously while constructing a transport handle.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint scheme cannot carry an event stream.
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    /// No tokio runtime is available to drive the connection.
    #[error("no async runtime available to drive the transport")]
    NoRuntime,

    /// HTTP client could not be built.
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Transport declined to open a handle.
    #[error("transport refused to open: {0}")]
    Refused(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HttpSseDefaults;

impl HttpSseDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RECONNECTION_TIME: Duration = Duration::from_secs(3);
    pub const MAX_EVENT_BYTES: usize = DEFAULT_MAX_EVENT_BYTES;
}

#[derive(Clone, Debug)]
pub struct HttpSseTransportOptions {
    /// Bound on connecting and receiving response headers.
    pub connect_timeout: Duration,
    /// Delay before an internal reconnect, until the server sends `retry:`.
    pub reconnection_time: Duration,
    /// Largest single event buffered before the stream is dropped and
    /// reopened.
    pub max_event_bytes: usize,
}

impl Default for HttpSseTransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: HttpSseDefaults::CONNECT_TIMEOUT,
            reconnection_time: HttpSseDefaults::RECONNECTION_TIME,
            max_event_bytes: HttpSseDefaults::MAX_EVENT_BYTES,
        }
    }
}

/// Event-stream transport over HTTP.
///
/// Each handle runs a background task that keeps the stream alive across
/// network failures and body ends, replaying the last event id. A response
/// with a status other than 200 or a content type other than
/// `text/event-stream` closes the handle terminally.
#[derive(Clone, Debug)]
pub struct HttpSseTransport {
    http: Client,
    options: HttpSseTransportOptions,
}

impl HttpSseTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_options(HttpSseTransportOptions::default())
    }

    pub fn with_options(options: HttpSseTransportOptions) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self { http, options })
    }
}

impl Transport for HttpSseTransport {
    type Handle = HttpSseHandle;

    fn open(&mut self, endpoint: &Url, sink: EventSink) -> Result<HttpSseHandle, TransportError> {
        match endpoint.scheme() {
            "http" | "https" => {}
            other => return Err(TransportError::UnsupportedScheme(other.to_string())),
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let state = SharedReadyState::new(ReadyState::Connecting);
        let task = runtime.spawn(run_event_source(
            self.http.clone(),
            endpoint.clone(),
            self.options.clone(),
            state.clone(),
            sink,
        ));
        Ok(HttpSseHandle { state, task })
    }
}

/// Handle to a connection driven by [`HttpSseTransport`].
#[derive(Debug)]
pub struct HttpSseHandle {
    state: SharedReadyState,
    task: JoinHandle<()>,
}

impl TransportHandle for HttpSseHandle {
    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn close(&mut self) {
        self.state.set(ReadyState::Closed);
        self.task.abort();
    }
}

impl Drop for HttpSseHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Establish {
    Streaming(Response),
    /// Network-level failure; the handle keeps retrying.
    Retry(String),
    /// Server rejected the stream; the handle closes.
    Fatal(String),
}

async fn run_event_source(
    http: Client,
    url: Url,
    options: HttpSseTransportOptions,
    state: SharedReadyState,
    sink: EventSink,
) {
    let mut decoder = SseDecoder::with_limit(options.max_event_bytes);
    let mut reconnection_time = options.reconnection_time;

    loop {
        match establish(&http, &url, options.connect_timeout, decoder.last_event_id()).await {
            Establish::Fatal(reason) => {
                debug!(event = "sse_connection_failed", handle = %sink.handle(), %reason);
                state.set(ReadyState::Closed);
                sink.emit(TransportEvent::Error {
                    reason: Some(reason),
                });
                return;
            }
            Establish::Retry(reason) => {
                debug!(event = "sse_connect_retry", handle = %sink.handle(), %reason);
                state.set(ReadyState::Connecting);
                sink.emit(TransportEvent::Error {
                    reason: Some(reason),
                });
            }
            Establish::Streaming(response) => {
                state.set(ReadyState::Open);
                if !sink.emit(TransportEvent::Open) {
                    return;
                }
                decoder.reset();
                let reason = pump_body(response, &mut decoder, &sink, &mut reconnection_time).await;
                debug!(event = "sse_stream_interrupted", handle = %sink.handle(), reason = ?reason);
                state.set(ReadyState::Connecting);
                sink.emit(TransportEvent::Error { reason });
            }
        }

        if sink.is_closed() {
            return;
        }
        tokio::time::sleep(reconnection_time).await;
    }
}

async fn establish(
    http: &Client,
    url: &Url,
    connect_timeout: Duration,
    last_event_id: Option<&str>,
) -> Establish {
    let mut request = http
        .get(url.clone())
        .header(ACCEPT, EVENT_STREAM_MIME)
        .header(CACHE_CONTROL, "no-cache");
    if let Some(id) = last_event_id {
        request = request.header(LAST_EVENT_ID_HEADER, id);
    }

    let response = match with_timeout(connect_timeout, request.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => return Establish::Retry(err.to_string()),
        Err(_) => return Establish::Retry("connect timed out".to_string()),
    };

    let status = response.status();
    if status != StatusCode::OK {
        return Establish::Fatal(format!("unexpected http status {status}"));
    }
    if !is_event_stream(&response) {
        return Establish::Fatal("response is not text/event-stream".to_string());
    }
    Establish::Streaming(response)
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(EVENT_STREAM_MIME))
}

/// Forwards decoded events until the body ends. Returns why it ended.
async fn pump_body(
    response: Response,
    decoder: &mut SseDecoder,
    sink: &EventSink,
    reconnection_time: &mut Duration,
) -> Option<String> {
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return Some(err.to_string()),
        };
        let messages = match decoder.feed(&chunk) {
            Ok(messages) => messages,
            Err(err) => return Some(err.to_string()),
        };
        for message in messages {
            if !sink.emit(TransportEvent::Message(message)) {
                return None;
            }
        }
        if let Some(retry) = decoder.take_retry() {
            *reconnection_time = retry;
        }
    }
    Some("stream ended".to_string())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use url::Url;

    use super::{
        EventSink, HandleId, HttpSseTransport, ReadyState, SharedReadyState, Transport,
        TransportError, TransportEvent,
    };

    #[test]
    fn shared_ready_state_round_trips() {
        let state = SharedReadyState::new(ReadyState::Connecting);
        let reader = state.clone();
        state.set(ReadyState::Open);
        assert_eq!(reader.get(), ReadyState::Open);
        state.set(ReadyState::Closed);
        assert_eq!(reader.get(), ReadyState::Closed);
    }

    #[test]
    fn sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(HandleId(3), tx);
        assert!(sink.emit(TransportEvent::Open));
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(TransportEvent::Open));
    }

    #[test]
    fn open_rejects_non_http_scheme() {
        let mut transport = HttpSseTransport::new().expect("build transport");
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = Url::parse("ws://localhost:8080/sse").expect("url");
        let result = transport.open(&endpoint, EventSink::new(HandleId(1), tx));
        assert!(matches!(result, Err(TransportError::UnsupportedScheme(scheme)) if scheme == "ws"));
    }

    #[test]
    fn open_outside_runtime_fails_synchronously() {
        let mut transport = HttpSseTransport::new().expect("build transport");
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = Url::parse("http://localhost:8080/sse").expect("url");
        let result = transport.open(&endpoint, EventSink::new(HandleId(1), tx));
        assert!(matches!(result, Err(TransportError::NoRuntime)));
    }
}
