//! Event-stream message types and endpoint selection helpers.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Event name used when an event-stream block carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";
/// Path of the stream endpoint relative to the site root.
pub const STREAM_PATH: &str = "sse";
/// Event name the stream endpoint uses for [`FragmentUpdate`] payloads.
pub const FRAGMENT_UPDATE_EVENT: &str = "poopupdate";

/// One dispatched event-stream event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMessage {
    /// Event name (`event:` field), `"message"` when absent.
    pub event: String,
    /// Data payload with multi-line `data:` fields joined by `\n`.
    pub data: String,
    /// Last event id seen on the stream when this event was dispatched.
    pub last_event_id: Option<String>,
}

impl StreamMessage {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            last_event_id: None,
        }
    }

    /// Decodes the data payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_str(&self.data).map_err(ProtoError::Json)
    }
}

/// Replacement HTML fragments keyed by DOM element id.
///
/// The stream server pushes one of these per update; the embedding page swaps
/// each element's markup for the new fragment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentUpdate {
    pub fragments: BTreeMap<String, String>,
}

impl FragmentUpdate {
    pub fn from_message(message: &StreamMessage) -> Result<Self, ProtoError> {
        message.json()
    }

    pub fn get(&self, element_id: &str) -> Option<&str> {
        self.fragments.get(element_id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Aggregation period of the table a stream feeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Monthly,
    Daily,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Daily => "daily",
        }
    }
}

/// Query selecting which stream to subscribe to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamSelector {
    pub period: Period,
    pub year: u32,
    pub month: Option<u32>,
}

impl StreamSelector {
    /// Selects the per-month table of `year`.
    pub fn monthly(year: u32) -> Self {
        Self {
            period: Period::Monthly,
            year,
            month: None,
        }
    }

    /// Selects the per-day table of `month` (1-based) in `year`.
    pub fn daily(year: u32, month: u32) -> Self {
        Self {
            period: Period::Daily,
            year,
            month: Some(month),
        }
    }

    /// Builds the stream endpoint under `base`, replacing any existing path
    /// and query.
    pub fn endpoint(&self, base: &Url) -> Result<Url, ProtoError> {
        if let Some(month) = self.month {
            if !(1..=12).contains(&month) {
                return Err(ProtoError::InvalidSelector(format!(
                    "month must be in 1..=12, got {month}"
                )));
            }
        }

        let mut url = base.join(&format!("/{STREAM_PATH}"))?;
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair("period", self.period.as_str());
            query.append_pair("year", &self.year.to_string());
            if let Some(month) = self.month {
                query.append_pair("month", &month.to_string());
            }
        }
        Ok(url)
    }
}

/// Errors produced while decoding stream payloads or building endpoints.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// JSON payload could not be decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint could not be joined onto the base URL.
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),

    /// Selector fields are out of range.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
}
