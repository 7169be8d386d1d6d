//! Inbound message envelope.

use std::fmt;
use std::sync::OnceLock;

use promqtt_common::split_topic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::expr::Context;

/// Payload could not be decoded with the configured parser.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a handler decodes message payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    #[default]
    #[serde(alias = "JSON")]
    Json,
}

impl ParserKind {
    /// Decode a raw payload.
    pub fn parse(self, payload: &[u8]) -> Result<Value, ParseError> {
        match self {
            ParserKind::Json => Ok(serde_json::from_slice(payload)?),
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserKind::Json => f.write_str("json"),
        }
    }
}

/// One message received from the broker.
///
/// The payload is parsed at most once, by the first handler whose topic
/// patterns match, and shared by every handler after it.
#[derive(Debug)]
pub struct Message {
    topic: String,
    segments: Vec<String>,
    payload: Vec<u8>,
    data: OnceLock<Value>,
}

impl Message {
    /// Create a message from a topic and raw payload.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let topic = topic.into();
        let segments = split_topic(&topic);
        Self {
            topic,
            segments,
            payload: payload.into(),
            data: OnceLock::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The parsed payload, if a handler has parsed it already.
    pub fn data(&self) -> Option<&Value> {
        self.data.get()
    }

    /// Parse the payload with `parser` unless it was parsed before.
    ///
    /// A failed parse leaves the message unparsed so a later handler may
    /// try again.
    pub fn parse_with(&self, parser: ParserKind) -> Result<&Value, ParseError> {
        if let Some(data) = self.data.get() {
            return Ok(data);
        }
        let value = parser.parse(&self.payload)?;
        Ok(self.data.get_or_init(|| value))
    }

    /// Expression context over this message and its parsed payload.
    pub fn context<'a>(&'a self, data: &'a Value) -> Context<'a> {
        Context {
            topic: &self.topic,
            segments: &self.segments,
            payload: &self.payload,
            data,
        }
    }
}
