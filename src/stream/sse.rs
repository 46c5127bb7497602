//! Incremental `text/event-stream` decoder.
//!
//! Bytes are fed as they arrive from the network; complete events are returned
//! as soon as their terminating blank line is seen. Line endings may be `\n`,
//! `\r`, or `\r\n`, and may be split across chunks.

use std::time::Duration;

use thiserror::Error;

use crate::stream::proto::{StreamMessage, DEFAULT_EVENT_NAME};

const BOM: char = '\u{feff}';

/// Default bound on the bytes buffered for one event.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SseError {
    /// The server kept sending one event past the buffer bound.
    #[error("event exceeds {limit} buffered bytes")]
    EventTooLarge { limit: usize },
}

/// Event-stream decoder state for one connection lineage.
///
/// The last event id survives [`SseDecoder::reset`] so it can be replayed in
/// the `Last-Event-ID` header when the transport reconnects.
#[derive(Debug)]
pub struct SseDecoder {
    max_event_bytes: usize,
    line: Vec<u8>,
    pending_cr: bool,
    bom_checked: bool,
    event_type: String,
    data: String,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder that buffers at most `max_event_bytes` of one
    /// event's unterminated line and data.
    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            max_event_bytes,
            line: Vec::new(),
            pending_cr: false,
            bom_checked: false,
            event_type: String::new(),
            data: String::new(),
            last_event_id: None,
            retry: None,
        }
    }

    /// Feeds a chunk of body bytes and returns every event it completes.
    ///
    /// Fails once the event being buffered outgrows the limit; the partial
    /// event is discarded and the caller should drop the connection.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamMessage>, SseError> {
        let mut dispatched = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' | b'\r' => {
                    self.pending_cr = byte == b'\r';
                    let line = std::mem::take(&mut self.line);
                    if let Some(message) = self.process_line(&line) {
                        dispatched.push(message);
                    }
                }
                _ => self.line.push(byte),
            }
            if self.line.len() + self.data.len() > self.max_event_bytes {
                self.reset();
                return Err(SseError::EventTooLarge {
                    limit: self.max_event_bytes,
                });
            }
        }
        Ok(dispatched)
    }

    /// Drops any partially received event ahead of a new connection.
    pub fn reset(&mut self) {
        self.line.clear();
        self.pending_cr = false;
        self.bom_checked = false;
        self.event_type.clear();
        self.data.clear();
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Returns the reconnection time announced by the server since the last
    /// call, if any.
    pub fn take_retry(&mut self) -> Option<Duration> {
        self.retry.take()
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<StreamMessage> {
        let decoded = String::from_utf8_lossy(raw);
        let mut line: &str = &decoded;
        if !self.bom_checked {
            self.bom_checked = true;
            line = line.strip_prefix(BOM).unwrap_or(line);
        }

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                self.event_type.clear();
                self.event_type.push_str(value);
            }
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" if !value.contains('\0') => {
                self.last_event_id = (!value.is_empty()).then(|| value.to_string());
            }
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<StreamMessage> {
        let event_type = std::mem::take(&mut self.event_type);
        if self.data.is_empty() {
            return None;
        }

        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        let event = if event_type.is_empty() {
            DEFAULT_EVENT_NAME.to_string()
        } else {
            event_type
        };

        Some(StreamMessage {
            event,
            data,
            last_event_id: self.last_event_id.clone(),
        })
    }
}
