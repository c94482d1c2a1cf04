// ABOUTME: Integration tests for wrpc-client.
// ABOUTME: Drives the public API against scripted transports and a local WebSocket server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::Message;
use wrpc_client::testing::{ScriptedDialer, ScriptedTransport};
use wrpc_client::{
    converge_or_compensate, derive_mask, merge_inner_mask, raw_record, Client, ConnectConfig,
    ConnectRetry, Connection, ConvergenceError, Envelope, ProbeOutcome, RetryPolicy, RpcError,
};

// ============================================================================
// Scripted end-to-end exchanges
// ============================================================================

#[tokio::test]
async fn test_list_call_yields_record_then_sentinel() {
    let transport = ScriptedTransport::replying(vec![
        json!({"result": {"item": {"id": "a"}}}),
        json!({"error": "EOF"}),
    ]);
    let handle = transport.handle();
    let envelope = Envelope::new("X.Y", "List", json!({"filter": "all"})).with_token("t1");

    let records = Connection::new(transport)
        .list(&envelope, |_| true, raw_record)
        .await
        .unwrap();

    assert_eq!(records, vec![json!({"id": "a"})]);
    assert_eq!(
        handle.sent_json(),
        vec![json!({
            "Token": "t1",
            "Command": "serviceRequest",
            "Params": {"service": "X.Y", "method": "List", "body": {"filter": "all"}}
        })]
    );
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_call_application_error_is_not_success() {
    let transport = ScriptedTransport::replying(vec![
        json!({"error": "not found"}),
        json!({"error": "EOF"}),
    ]);
    let envelope = Envelope::new("X.Y", "List", json!({})).with_token("t1");

    let err = Connection::new(transport).call(&envelope).await.unwrap_err();
    assert_eq!(err.application_message(), Some("not found"));
    assert_eq!(err.to_string(), "X.Y.List (token t1) failed: not found");
}

#[tokio::test(start_paused = true)]
async fn test_client_retries_dial_then_runs_exchange() {
    let dialer = ScriptedDialer::new(vec![
        Err(wrpc_client::DialError::Retryable {
            status: Some(503),
            message: "unavailable".to_string(),
        }),
        Ok(ScriptedTransport::replying(vec![
            json!({"result": {"id": "a"}}),
            json!({"error": "EOF"}),
        ])),
    ]);
    let client = Client::new(dialer).with_retry(ConnectRetry::new(3, Duration::from_secs(4)));

    let start = tokio::time::Instant::now();
    let result = client
        .call(&Envelope::new("X.Y", "Get", json!({})))
        .await
        .unwrap();

    assert_eq!(result["id"], "a");
    assert_eq!(client.dialer().attempts(), 2);
    assert!(start.elapsed() >= Duration::from_secs(4));
}

// ============================================================================
// Masks with a nested payload
// ============================================================================

#[derive(Serialize, Default)]
struct RouterUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_detail: Option<CloudDetail>,
}

#[derive(Serialize, Default)]
struct CloudDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    asn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    advertise_mode: Option<String>,
}

#[test]
fn test_nested_payload_mask() {
    let update = RouterUpdate {
        name: Some("edge".to_string()),
        cloud_detail: Some(CloudDetail {
            asn: Some(0),
            ..Default::default()
        }),
    };

    let outer = derive_mask(&update, "").unwrap();
    let detail = update.cloud_detail.as_ref().unwrap();
    let mask = merge_inner_mask(detail, outer, "cloudDetail.").unwrap();

    assert_eq!(mask.paths, vec!["name", "cloudDetail.asn"]);
    assert!(!mask.iter().any(|p| p == "cloudDetail"));
    assert_eq!(
        serde_json::to_value(&mask).unwrap(),
        json!({"paths": ["name", "cloudDetail.asn"]})
    );
}

// ============================================================================
// Convergence with compensation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_wait_and_cleanup_flow() {
    let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(6));

    let result: Result<(), ConvergenceError<RpcError>> = converge_or_compensate(
        &policy,
        || async { ProbeOutcome::Retryable("router not ready".to_string()) },
        || async {
            Err(RpcError::Application {
                method: "Network.Router.Delete".to_string(),
                token: "t7".to_string(),
                message: "in use".to_string(),
            })
        },
    )
    .await;

    let err = result.unwrap_err();
    assert!(err.is_timeout());
    let display = err.to_string();
    assert!(display.contains("router not ready"));
    assert!(display.contains("in use"));
}

// ============================================================================
// Live WebSocket exchanges
// ============================================================================

/// Accept one connection, check the bearer credential, answer the first request.
async fn serve_once<F>(credential: &'static str, reply: F) -> String
where
    F: FnOnce(Value) -> Vec<Value> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let check = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let expected = format!("Bearer {credential}");
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some(expected.as_str());
            if authorized {
                Ok(resp)
            } else {
                Err(http::Response::builder()
                    .status(401)
                    .body(Some("bad credential".to_string()))
                    .unwrap())
            }
        };
        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, check).await else {
            return;
        };

        let Some(Ok(Message::Text(text))) = ws.next().await else {
            return;
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        for frame in reply(request) {
            ws.send(Message::Text(frame.to_string().into())).await.unwrap();
        }
        let _ = ws.close(None).await;
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn test_websocket_call_round_trip() {
    let address = serve_once("good", |request| {
        vec![
            json!({"result": {"echo": request["Params"]["body"], "method": request["Params"]["method"]}}),
            json!({"error": "EOF"}),
        ]
    })
    .await;

    let config = ConnectConfig::new(&address, "good").unwrap();
    assert!(config.url.ends_with("/api/v3/wrpc/"));
    let client = Client::websocket(config);

    let result = client
        .call(&Envelope::new("X.Y", "Get", json!({"id": "a"})))
        .await
        .unwrap();
    assert_eq!(result["echo"], json!({"id": "a"}));
    assert_eq!(result["method"], "Get");
}

#[tokio::test]
async fn test_websocket_stream_round_trip() {
    let address = serve_once("good", |_| {
        vec![
            json!({"result": {"vpc_1": {"id": "1"}, "vpc_2": {"id": "2"}}}),
            json!({"result": {"vpc_3": {"id": "3"}}}),
            json!({"error": "EOF"}),
        ]
    })
    .await;

    let client = Client::websocket(ConnectConfig::new(&address, "good").unwrap());
    let records = client
        .list(
            &Envelope::new("Network.Vpc", "List", json!({})),
            wrpc_client::key_prefix("vpc"),
            raw_record,
        )
        .await
        .unwrap();
    assert_eq!(records.len(), 3);
}

#[tokio::test]
async fn test_websocket_rejected_credential_is_unauthorized() {
    let address = serve_once("good", |_| vec![]).await;

    let client = Client::websocket(ConnectConfig::new(&address, "wrong").unwrap());
    let err = client
        .call(&Envelope::new("X.Y", "Get", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Unauthorized { .. }), "got {err:?}");
}
