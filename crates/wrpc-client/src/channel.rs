// ABOUTME: Single-result RPC calls over the two-frame protocol (payload frame, then sentinel).
// ABOUTME: The sentinel wait is an explicit state machine so the invariant is checked in one place.

use serde_json::{Map, Value};

use crate::codec::{value_kind, Envelope, FrameKind, ResponseFrame};
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::transport::FrameTransport;

/// The `result` mapping of a successful call.
pub type ResultMapping = Map<String, Value>;

/// Where a single-result call stands.
#[derive(Debug)]
enum CallState {
    /// Request written, waiting for the payload frame.
    AwaitingPayload,
    /// Payload frame seen, waiting for the sentinel.
    AwaitingSentinel(PayloadOutcome),
    /// Sentinel seen; the connection is drained.
    Drained(ResponseFrame),
}

/// What the payload frame said.
#[derive(Debug)]
enum PayloadOutcome {
    Result(ResponseFrame),
    Rejected(String),
}

fn describe(frame: &ResponseFrame) -> String {
    match frame.kind() {
        FrameKind::Sentinel => "sentinel".to_string(),
        FrameKind::Failure(message) => format!("error frame '{message}'"),
        FrameKind::Payload => "payload frame".to_string(),
    }
}

/// Send `envelope` and read its reply: one payload frame, then the `"EOF"` sentinel.
///
/// A rejected call still has its sentinel drained, but the application error is
/// what gets returned even if that drain fails.
pub async fn call<T: FrameTransport>(
    conn: &mut Connection<T>,
    envelope: &Envelope,
) -> Result<ResultMapping> {
    conn.send(envelope).await?;

    let mut state = CallState::AwaitingPayload;
    loop {
        state = match state {
            CallState::AwaitingPayload => {
                let frame = conn.receive(envelope).await?;
                match frame.kind() {
                    FrameKind::Payload => CallState::AwaitingSentinel(PayloadOutcome::Result(frame)),
                    FrameKind::Failure(message) => {
                        CallState::AwaitingSentinel(PayloadOutcome::Rejected(message))
                    }
                    FrameKind::Sentinel => {
                        return Err(RpcError::Protocol {
                            method: envelope.qualified_method(),
                            token: envelope.token.clone(),
                            detail: "sentinel arrived before the payload frame".to_string(),
                        });
                    }
                }
            }
            CallState::AwaitingSentinel(PayloadOutcome::Rejected(message)) => {
                match conn.receive(envelope).await {
                    Ok(frame) if frame.is_sentinel() => {}
                    Ok(frame) => tracing::warn!(
                        method = %envelope.qualified_method(),
                        token = %envelope.token,
                        got = %describe(&frame),
                        "expected sentinel after rejected call"
                    ),
                    Err(e) => tracing::debug!(
                        method = %envelope.qualified_method(),
                        token = %envelope.token,
                        error = %e,
                        "sentinel drain after rejected call failed"
                    ),
                }
                tracing::debug!(
                    method = %envelope.qualified_method(),
                    token = %envelope.token,
                    error = %message,
                    "call rejected by backend"
                );
                return Err(RpcError::Application {
                    method: envelope.qualified_method(),
                    token: envelope.token.clone(),
                    message,
                });
            }
            CallState::AwaitingSentinel(PayloadOutcome::Result(frame)) => {
                let sentinel = conn.receive(envelope).await?;
                if !sentinel.is_sentinel() {
                    return Err(RpcError::Protocol {
                        method: envelope.qualified_method(),
                        token: envelope.token.clone(),
                        detail: format!("expected sentinel, got {}", describe(&sentinel)),
                    });
                }
                CallState::Drained(frame)
            }
            CallState::Drained(frame) => return extract_result(frame, envelope),
        };
    }
}

fn extract_result(mut frame: ResponseFrame, envelope: &Envelope) -> Result<ResultMapping> {
    match frame.take_result() {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(RpcError::SchemaMismatch {
            method: envelope.qualified_method(),
            token: envelope.token.clone(),
            detail: format!("'result' is {}, expected object", value_kind(&other)),
        }),
        None => Err(RpcError::SchemaMismatch {
            method: envelope.qualified_method(),
            token: envelope.token.clone(),
            detail: "reply has no 'result'".to_string(),
        }),
    }
}
