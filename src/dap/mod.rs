//! DAP message surface: envelopes, the seq-stamping outbound channel and
//! (in [`transport`]) Content-Length framing for hosts that want it.
//!
//! The session core works on parsed [`DapRequest`] values and hands fully
//! formed response/event values to an [`Outbound`]; how bytes move is the
//! host's business.

pub mod transport;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::error::Error;
use crate::weak_error;

/// DAP request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl DapRequest {
    /// Deserialize the arguments object into a typed struct, mapping shape
    /// mismatches to a protocol error naming the command. A missing
    /// `arguments` member reads as an empty object.
    pub fn parse_args<'a, T: Deserialize<'a>>(&'a self) -> Result<T, Error> {
        static EMPTY: Lazy<Value> = Lazy::new(|| serde_json::json!({}));
        let arguments = if self.arguments.is_null() {
            &*EMPTY
        } else {
            &self.arguments
        };
        T::deserialize(arguments)
            .map_err(|e| Error::Protocol(format!("`{}` arguments: {e}", self.command)))
    }
}

/// DAP response envelope.
///
/// The specification allows responses with no `body` at all; carrying it as
/// an optional `serde_json::Value` keeps one envelope for every command.
#[derive(Debug, Serialize)]
pub struct DapResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct DapEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Where outbound messages go. Implemented by the transports in
/// [`transport`] and by test sinks.
pub trait MessageSink: Send {
    fn send(&mut self, message: &Value) -> anyhow::Result<()>;
}

/// The single outbound channel of a session.
///
/// Owns the `seq` counter: every response and event of a session is stamped
/// and written here, which is what makes `seq` strictly monotonic across
/// message kinds.
pub struct Outbound {
    seq: i64,
    sink: Box<dyn MessageSink>,
}

impl Outbound {
    pub fn new(sink: Box<dyn MessageSink>) -> Outbound {
        Outbound { seq: 1, sink }
    }

    pub fn respond_success(&mut self, request: &DapRequest, body: Option<Value>) {
        let message = DapResponse {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        };
        self.write(serde_json::to_value(message));
    }

    pub fn respond_error(&mut self, request: &DapRequest, error: &Error) {
        log::debug!(target: "dap", "{} {}: {error:#}", request.command, request.seq);
        let message = DapResponse {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(error.to_string()),
            body: Some(serde_json::json!({
                "error": {"id": error.code(), "format": error.to_string()},
            })),
        };
        self.write(serde_json::to_value(message));
    }

    pub fn send_event(&mut self, event: &'static str, body: Option<Value>) {
        let message = DapEvent {
            seq: self.next_seq(),
            r#type: "event",
            event,
            body,
        };
        self.write(serde_json::to_value(message));
    }

    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn write(&mut self, message: serde_json::Result<Value>) {
        let Some(message) = weak_error!(message, "serialize outbound:") else {
            return;
        };
        weak_error!(self.sink.send(&message), "send outbound:");
    }
}
