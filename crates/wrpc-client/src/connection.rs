// ABOUTME: Exclusively-owned connection wrapping a frame transport with the JSON codec.
// ABOUTME: Consuming helpers run one exchange and close the connection on every exit path.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, ResultMapping};
use crate::codec::{Envelope, ResponseFrame};
use crate::error::{Result, RpcError};
use crate::stream;
use crate::transport::{FrameTransport, TransportError};

/// One open connection to the backend.
///
/// A connection carries exactly one request/response (or request/stream) cycle.
/// The consuming helpers [`Connection::call`] and [`Connection::list`] enforce
/// that and close the transport whatever the outcome.
pub struct Connection<T> {
    transport: T,
    cancel: Option<CancellationToken>,
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: FrameTransport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            cancel: None,
        }
    }

    /// Abort pending writes and reads when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Serialize and write one envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let text = envelope.encode().map_err(|source| RpcError::Encode {
            method: envelope.qualified_method(),
            token: envelope.token.clone(),
            source,
        })?;
        tracing::debug!(
            method = %envelope.qualified_method(),
            token = %envelope.token,
            command = %envelope.command,
            "sending request"
        );
        let write = self.transport.send_text(text);
        let written = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(RpcError::Cancelled {
                        method: envelope.qualified_method(),
                        token: envelope.token.clone(),
                    });
                }
                written = write => written,
            },
            None => write.await,
        };
        written.map_err(|e| RpcError::Send {
            method: envelope.qualified_method(),
            token: envelope.token.clone(),
            message: e.to_string(),
        })
    }

    /// Read and decode exactly one frame belonging to `envelope`'s call.
    pub async fn receive(&mut self, envelope: &Envelope) -> Result<ResponseFrame> {
        let read = self.transport.recv_text();
        let text = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(RpcError::Cancelled {
                        method: envelope.qualified_method(),
                        token: envelope.token.clone(),
                    });
                }
                read = read => read,
            },
            None => read.await,
        };

        let text = text.map_err(|e| match e {
            TransportError::Closed => RpcError::ConnectionClosed {
                method: envelope.qualified_method(),
                token: envelope.token.clone(),
            },
            TransportError::Io(message) => RpcError::Receive {
                method: envelope.qualified_method(),
                token: envelope.token.clone(),
                message,
            },
        })?;

        ResponseFrame::decode(&text).map_err(|source| RpcError::Decode {
            method: envelope.qualified_method(),
            token: envelope.token.clone(),
            source,
        })
    }

    /// Close the transport. Failures are logged, never returned.
    pub async fn close(mut self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "error while closing connection");
        }
    }

    /// Run one single-result call, then close.
    pub async fn call(mut self, envelope: &Envelope) -> Result<ResultMapping> {
        let outcome = channel::call(&mut self, envelope).await;
        self.close().await;
        outcome
    }

    /// Run one list-style call to completion, then close.
    ///
    /// Records gathered before a failure are discarded; iterate a
    /// [`RecordStream`](crate::RecordStream) directly to observe them.
    pub async fn list<R, M, E>(
        mut self,
        envelope: &Envelope,
        matcher: M,
        extract: E,
    ) -> Result<Vec<R>>
    where
        M: FnMut(&str) -> bool,
        E: FnMut(&str, Value) -> std::result::Result<R, serde_json::Error>,
    {
        let outcome = match stream::stream(&mut self, envelope, matcher, extract).await {
            Ok(records) => records.collect().await,
            Err(e) => Err(e),
        };
        self.close().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Scripted, ScriptedTransport};
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new("X.Y", "Get", json!({"id": "a"})).with_token("t1")
    }

    #[tokio::test]
    async fn test_send_writes_encoded_envelope() {
        let transport = ScriptedTransport::new(vec![]);
        let handle = transport.handle();
        let mut conn = Connection::new(transport);

        conn.send(&envelope()).await.unwrap();

        let sent = handle.sent_json();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["Token"], "t1");
        assert_eq!(sent[0]["Params"]["method"], "Get");
    }

    #[tokio::test]
    async fn test_send_failure_names_method() {
        let transport = ScriptedTransport::new(vec![]).failing_send("broken pipe");
        let mut conn = Connection::new(transport);

        let err = conn.send(&envelope()).await.unwrap_err();
        match err {
            RpcError::Send {
                method,
                token,
                message,
            } => {
                assert_eq!(method, "X.Y.Get");
                assert_eq!(token, "t1");
                assert_eq!(message, "broken pipe");
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_decodes_frame() {
        let transport = ScriptedTransport::replying(vec![json!({"result": {"id": "a"}})]);
        let mut conn = Connection::new(transport);

        let frame = conn.receive(&envelope()).await.unwrap();
        assert_eq!(frame.result(), Some(&json!({"id": "a"})));
    }

    #[tokio::test]
    async fn test_receive_malformed_frame_is_decode_error() {
        let transport = ScriptedTransport::new(vec![Scripted::Frame("{oops".to_string())]);
        let mut conn = Connection::new(transport);

        let err = conn.receive(&envelope()).await.unwrap_err();
        assert!(matches!(err, RpcError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_receive_maps_transport_errors() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Fail("reset".to_string()),
            Scripted::Closed,
        ]);
        let mut conn = Connection::new(transport);

        let err = conn.receive(&envelope()).await.unwrap_err();
        assert!(matches!(err, RpcError::Receive { ref message, .. } if message == "reset"));

        let err = conn.receive(&envelope()).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_receive_honours_cancellation() {
        let token = CancellationToken::new();
        let transport = ScriptedTransport::new(vec![Scripted::Stall]);
        let mut conn = Connection::new(transport).with_cancellation(token.clone());

        token.cancel();
        let err = conn.receive(&envelope()).await.unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_send_honours_cancellation() {
        let token = CancellationToken::new();
        let transport = ScriptedTransport::new(vec![]);
        let handle = transport.handle();
        let mut conn = Connection::new(transport).with_cancellation(token.clone());

        token.cancel();
        let err = conn.send(&envelope()).await.unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }));
        assert!(handle.sent().is_empty());
    }

    #[tokio::test]
    async fn test_call_closes_on_success_and_failure() {
        let ok = ScriptedTransport::replying(vec![
            json!({"result": {"id": "a"}}),
            json!({"error": "EOF"}),
        ]);
        let ok_handle = ok.handle();
        Connection::new(ok).call(&envelope()).await.unwrap();
        assert!(ok_handle.is_closed());

        let failing = ScriptedTransport::replying(vec![json!({"error": "denied"})]);
        let failing_handle = failing.handle();
        let err = Connection::new(failing).call(&envelope()).await.unwrap_err();
        assert!(err.is_application());
        assert!(failing_handle.is_closed());

        let broken = ScriptedTransport::new(vec![]).failing_send("broken pipe");
        let broken_handle = broken.handle();
        let err = Connection::new(broken).call(&envelope()).await.unwrap_err();
        assert!(matches!(err, RpcError::Send { .. }));
        assert!(broken_handle.is_closed());
    }

    #[tokio::test]
    async fn test_list_closes_after_stream_failure() {
        let transport = ScriptedTransport::replying(vec![
            json!({"result": {"vpc_1": {"id": "1"}}}),
            json!({"error": "backend exploded"}),
        ]);
        let handle = transport.handle();

        let err = Connection::new(transport)
            .list(&envelope(), |_| true, |_, v| Ok(v))
            .await
            .unwrap_err();

        assert_eq!(err.application_message(), Some("backend exploded"));
        assert!(handle.is_closed());
    }
}
