// ABOUTME: Connection-per-operation client facade over a dialer.
// ABOUTME: Each call dials with backoff, runs one exchange, and always closes the connection.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::channel::ResultMapping;
use crate::codec::Envelope;
use crate::connect::{
    connect, connect_with_cancellation, ConnectConfig, ConnectRetry, Dialer, WsDialer,
};
use crate::connection::Connection;
use crate::error::Result;
use crate::method::{decode_response, envelope_for, ListMethod, RpcMethod};
use crate::stream::typed_record;

/// Backend client. Cheap to clone; clones share the dialer but never a connection.
pub struct Client<D> {
    dialer: Arc<D>,
    retry: ConnectRetry,
    cancel: Option<CancellationToken>,
}

impl<D> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: Arc::clone(&self.dialer),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<D> std::fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("retry", &self.retry)
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

impl Client<WsDialer> {
    /// Client for a WebSocket backend.
    pub fn websocket(config: ConnectConfig) -> Self {
        Self::new(WsDialer::new(config))
    }
}

impl<D: Dialer> Client<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer: Arc::new(dialer),
            retry: ConnectRetry::default(),
            cancel: None,
        }
    }

    pub fn with_retry(mut self, retry: ConnectRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Abort connection attempts, in-flight exchanges and convergence loops when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Dial a fresh connection. The caller owns it and must close it.
    pub async fn open(&self) -> Result<Connection<D::Transport>> {
        Ok(match &self.cancel {
            Some(token) => {
                let transport =
                    connect_with_cancellation(self.dialer.as_ref(), &self.retry, token).await?;
                Connection::new(transport).with_cancellation(token.clone())
            }
            None => Connection::new(connect(self.dialer.as_ref(), &self.retry).await?),
        })
    }

    /// Single-result call on its own connection.
    pub async fn call(&self, envelope: &Envelope) -> Result<ResultMapping> {
        self.open().await?.call(envelope).await
    }

    /// List-style call on its own connection, collected to completion.
    pub async fn list<R, M, E>(&self, envelope: &Envelope, matcher: M, extract: E) -> Result<Vec<R>>
    where
        M: FnMut(&str) -> bool,
        E: FnMut(&str, Value) -> std::result::Result<R, serde_json::Error>,
    {
        self.open().await?.list(envelope, matcher, extract).await
    }

    /// Typed single-result call.
    pub async fn invoke<M: RpcMethod>(&self, request: &M::Request) -> Result<M::Response> {
        let envelope = envelope_for::<M>(request)?;
        let result = self.call(&envelope).await?;
        decode_response::<M>(result, &envelope)
    }

    /// Typed list-style call.
    pub async fn list_typed<M: ListMethod>(&self, request: &M::Request) -> Result<Vec<M::Record>> {
        let envelope = envelope_for::<M>(request)?;
        self.list(&envelope, M::matches, typed_record::<M::Record>)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::DialError;
    use crate::error::RpcError;
    use crate::testing::{ScriptedDialer, ScriptedTransport};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize)]
    struct ListRequest {}

    #[derive(Debug, Deserialize, PartialEq)]
    struct Router {
        id: String,
    }

    struct ListRouters;

    impl RpcMethod for ListRouters {
        const SERVICE: &'static str = "Network.Router";
        const METHOD: &'static str = "List";
        type Request = ListRequest;
        type Response = Value;
    }

    impl ListMethod for ListRouters {
        type Record = Router;

        fn matches(key: &str) -> bool {
            key.starts_with("router")
        }
    }

    #[derive(Serialize)]
    struct GetRequest {
        id: &'static str,
    }

    struct GetRouter;

    impl RpcMethod for GetRouter {
        const SERVICE: &'static str = "Network.Router";
        const METHOD: &'static str = "Get";
        type Request = GetRequest;
        type Response = Router;
    }

    #[tokio::test]
    async fn test_each_operation_uses_its_own_connection() {
        let first = ScriptedTransport::replying(vec![
            json!({"result": {"id": "a"}}),
            json!({"error": "EOF"}),
        ]);
        let second = ScriptedTransport::replying(vec![
            json!({"result": {"id": "b"}}),
            json!({"error": "EOF"}),
        ]);
        let (h1, h2) = (first.handle(), second.handle());
        let client = Client::new(ScriptedDialer::with_transports(vec![first, second]));

        let a = client.call(&Envelope::new("X.Y", "Get", json!({}))).await.unwrap();
        let b = client.call(&Envelope::new("X.Y", "Get", json!({}))).await.unwrap();

        assert_eq!(a["id"], "a");
        assert_eq!(b["id"], "b");
        assert_eq!(client.dialer().attempts(), 2);
        assert!(h1.is_closed());
        assert!(h2.is_closed());
        assert_eq!(h1.sent().len(), 1);
        assert_eq!(h2.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_invoke_decodes_typed_response() {
        let transport = ScriptedTransport::replying(vec![
            json!({"result": {"id": "r1"}}),
            json!({"error": "EOF"}),
        ]);
        let handle = transport.handle();
        let client = Client::new(ScriptedDialer::with_transports(vec![transport]));

        let router = client.invoke::<GetRouter>(&GetRequest { id: "r1" }).await.unwrap();
        assert_eq!(router, Router { id: "r1".to_string() });

        let sent = handle.sent_json();
        assert_eq!(sent[0]["Params"]["service"], "Network.Router");
        assert_eq!(sent[0]["Params"]["body"], json!({"id": "r1"}));
    }

    #[tokio::test]
    async fn test_invoke_shape_mismatch_names_method() {
        let transport = ScriptedTransport::replying(vec![
            json!({"result": {"name": "no id here"}}),
            json!({"error": "EOF"}),
        ]);
        let client = Client::new(ScriptedDialer::with_transports(vec![transport]));

        match client.invoke::<GetRouter>(&GetRequest { id: "r1" }).await.unwrap_err() {
            RpcError::SchemaMismatch { method, .. } => assert_eq!(method, "Network.Router.Get"),
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_typed_filters_by_key() {
        let transport = ScriptedTransport::replying(vec![
            json!({"result": {"router_1": {"id": "1"}, "vpc_1": {"id": "v"}}}),
            json!({"result": {"router_2": {"id": "2"}}}),
            json!({"error": "EOF"}),
        ]);
        let client = Client::new(ScriptedDialer::with_transports(vec![transport]));

        let routers = client.list_typed::<ListRouters>(&ListRequest {}).await.unwrap();
        assert_eq!(
            routers,
            vec![Router { id: "1".to_string() }, Router { id: "2".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_dial_surfaces_without_exchange() {
        let client = Client::new(ScriptedDialer::new(vec![Err(DialError::Unauthorized)]));
        let err = client
            .call(&Envelope::new("X.Y", "Get", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Unauthorized { .. }));
        assert_eq!(client.dialer().attempts(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_dialer() {
        let client = Client::new(ScriptedDialer::with_transports(vec![
            ScriptedTransport::replying(vec![json!({"result": {}}), json!({"error": "EOF"})]),
            ScriptedTransport::replying(vec![json!({"result": {}}), json!({"error": "EOF"})]),
        ]));
        let other = client.clone();

        let first = Envelope::new("X.Y", "Get", json!({}));
        let second = Envelope::new("X.Y", "Get", json!({}));
        let (a, b) = tokio::join!(client.call(&first), other.call(&second));
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(client.dialer().attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_client_stops_retrying_connect() {
        let cancel = CancellationToken::new();
        let client = Client::new(ScriptedDialer::new(vec![])).with_cancellation(cancel.clone());
        cancel.cancel();
        let start = tokio::time::Instant::now();

        let err = client
            .call(&Envelope::new("X.Y", "Get", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::ConnectCancelled { .. }), "got {err:?}");
        assert_eq!(client.dialer().attempts(), 0);
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);
    }
}
