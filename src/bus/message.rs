//! The message envelope all services exchange over the bus.
//!
//! A message is `{type, data, context}` serialized as a single JSON object
//! per WebSocket frame (or newline-delimited over raw streams). Messages are
//! immutable once published; `reply`/`forward` build new envelopes rather
//! than mutating.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, SkaldError};

/// Routing/correlation envelope carried alongside every message payload.
///
/// `session_id` and `skill_id` are mandatory on intent/session traffic and
/// absent on infrastructure chatter (heartbeats, registration).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageContext {
    /// Session this message belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Skill that sent or is targeted by this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    /// Optional list of destination service names (advisory routing hint).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destination: Vec<String>,
    /// Correlation id tying a response back to a `request()` call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// The unit of bus traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Dot-namespaced type identifier, e.g. `recognizer_loop:utterance`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Untyped key/value payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    /// Routing and correlation envelope.
    #[serde(default)]
    pub context: MessageContext,
}

impl Message {
    /// Build a message with an empty payload and context.
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: Map::new(),
            context: MessageContext::default(),
        }
    }

    /// Build a message from a type and a JSON object payload.
    ///
    /// Non-object `data` values are rejected: the wire contract requires a
    /// key/value payload.
    pub fn with_data(msg_type: impl Into<String>, data: Value) -> Result<Self> {
        match data {
            Value::Object(map) => Ok(Self {
                msg_type: msg_type.into(),
                data: map,
                context: MessageContext::default(),
            }),
            other => Err(SkaldError::Wire(format!(
                "message data must be an object, got {other}"
            ))),
        }
    }

    /// Attach a session id to the context.
    #[must_use]
    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.context.session_id = Some(session_id.into());
        self
    }

    /// Attach a skill id to the context.
    #[must_use]
    pub fn from_skill(mut self, skill_id: impl Into<String>) -> Self {
        self.context.skill_id = Some(skill_id.into());
        self
    }

    /// Attach a fresh correlation id, returning it alongside the message.
    #[must_use]
    pub fn with_correlation(mut self) -> (Self, String) {
        let correlation_id = Uuid::new_v4().to_string();
        self.context.correlation_id = Some(correlation_id.clone());
        (self, correlation_id)
    }

    /// Build a response to this message: new type and payload, same context.
    ///
    /// The session, skill, and correlation ids are carried over so the
    /// original requester can match the response.
    #[must_use]
    pub fn reply(&self, msg_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data,
            context: self.context.clone(),
        }
    }

    /// Re-emit this message's payload under a different type, keeping context.
    #[must_use]
    pub fn forward(&self, msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: self.data.clone(),
            context: self.context.clone(),
        }
    }

    /// Fetch a string field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Fetch a boolean field from the payload.
    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    /// Serialize to the wire form (one JSON object).
    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SkaldError::Wire(e.to_string()))
    }

    /// Parse a message from its wire form.
    pub fn from_wire(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SkaldError::Wire(e.to_string()))
    }
}
