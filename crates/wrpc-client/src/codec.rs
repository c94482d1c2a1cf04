// ABOUTME: Wire types for the request envelope and response frames.
// ABOUTME: Encodes envelopes to JSON text and decodes frames into keyed mappings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error value that marks the end of a call's frames.
pub const SENTINEL: &str = "EOF";

/// Command used for ordinary service calls.
pub const DEFAULT_COMMAND: &str = "serviceRequest";

/// Outbound request.
///
/// The token is only for correlation in logs and errors; the connection is
/// request/response serial, so nothing on the wire is multiplexed by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub token: String,
    pub command: String,
    pub params: Params,
}

/// Service/method/body triple carried by an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub service: String,
    pub method: String,
    pub body: Value,
}

impl Envelope {
    /// Build a `serviceRequest` envelope with a fresh random token.
    pub fn new(service: impl Into<String>, method: impl Into<String>, body: Value) -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            command: DEFAULT_COMMAND.to_string(),
            params: Params {
                service: service.into(),
                method: method.into(),
                body,
            },
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn request<T: Serialize + ?Sized>(
        service: impl Into<String>,
        method: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(service, method, serde_json::to_value(body)?))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn method(&self) -> &str {
        &self.params.method
    }

    pub fn service(&self) -> &str {
        &self.params.service
    }

    /// `service.method`, the name used in logs.
    pub fn qualified_method(&self) -> String {
        format!("{}.{}", self.params.service, self.params.method)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Short name of a JSON value's type, for error messages.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// How a response frame should be interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// `{"error": "EOF"}`: the call is drained.
    Sentinel,
    /// Any other `error` value: the backend rejected the call.
    Failure(String),
    /// No `error` key. May or may not carry `result`.
    Payload,
}

/// One inbound frame: an open-ended string-keyed mapping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseFrame(Map<String, Value>);

impl ResponseFrame {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Parse frame text. Anything but a JSON object is a decode error.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn result(&self) -> Option<&Value> {
        self.0.get("result")
    }

    /// The `error` value as text. Non-string errors are rendered as JSON.
    pub fn error(&self) -> Option<String> {
        self.0.get("error").map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn kind(&self) -> FrameKind {
        match self.0.get("error") {
            Some(Value::String(s)) if s == SENTINEL => FrameKind::Sentinel,
            Some(_) => FrameKind::Failure(self.error().unwrap_or_default()),
            None => FrameKind::Payload,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.kind() == FrameKind::Sentinel
    }

    /// Take the `result` value out of the frame.
    pub fn take_result(&mut self) -> Option<Value> {
        self.0.remove("result")
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}
