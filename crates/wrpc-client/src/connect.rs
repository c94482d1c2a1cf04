// ABOUTME: Connection establishment with bearer auth, TLS mode selection and doubling backoff.
// ABOUTME: Classifies upgrade failures into fatal (401) and retryable (everything else).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::RpcError;
use crate::transport::{FrameTransport, WsTransport};

/// Path the backend serves its message endpoint on.
pub const DEFAULT_RPC_PATH: &str = "/api/v3/wrpc/";

/// Connection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Sleep after the first failed attempt; doubled after each further failure.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(4);

/// How server certificates are checked during the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Verify against the webpki root set.
    #[default]
    Verified,
    /// Accept any certificate. Matches the legacy deployments that run with self-signed certs.
    Insecure,
}

/// Outcome of a single failed dial attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    /// The backend answered 401. Never retried.
    Unauthorized,
    /// The request could not even be built (bad address, bad credential).
    Invalid(String),
    /// Network failure, non-101 status, malformed handshake, timeout.
    Retryable { status: Option<u16>, message: String },
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialError::Unauthorized => write!(f, "unauthorized"),
            DialError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            DialError::Retryable {
                status: Some(status),
                message,
            } => write!(f, "status {status}: {message}"),
            DialError::Retryable {
                status: None,
                message,
            } => write!(f, "{message}"),
        }
    }
}

/// Opens one transport per call. The retry policy lives in [`connect`], not here.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Transport: FrameTransport + 'static;

    /// Address used in logs and errors.
    fn address(&self) -> &str;

    /// Make a single attempt.
    async fn dial(&self) -> Result<Self::Transport, DialError>;
}

/// Retry budget for connection establishment.
#[derive(Debug, Clone)]
pub struct ConnectRetry {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl ConnectRetry {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Sleeps taken between attempts when every attempt fails.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut schedule = Vec::new();
        let mut backoff = self.initial_backoff;
        for _ in 1..self.max_attempts {
            schedule.push(backoff);
            backoff = backoff.saturating_mul(2);
        }
        schedule
    }
}

/// Dial with retry: 401 stops immediately, anything else backs off and tries again.
pub async fn connect<D: Dialer>(dialer: &D, retry: &ConnectRetry) -> Result<D::Transport, RpcError> {
    connect_with_cancellation(dialer, retry, &CancellationToken::new()).await
}

/// [`connect`] that gives up as soon as `cancel` fires, mid-dial or mid-backoff.
pub async fn connect_with_cancellation<D: Dialer>(
    dialer: &D,
    retry: &ConnectRetry,
    cancel: &CancellationToken,
) -> Result<D::Transport, RpcError> {
    let address = dialer.address().to_string();
    let max_attempts = retry.max_attempts.max(1);
    let mut backoff = retry.initial_backoff;
    let mut last = String::from("no attempt made");

    for attempt in 1..=max_attempts {
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(address.clone(), attempt - 1)),
            dialed = dialer.dial() => dialed,
        };
        match dialed {
            Ok(transport) => {
                tracing::debug!(address = %address, attempt, "connected");
                return Ok(transport);
            }
            Err(DialError::Unauthorized) => {
                tracing::error!(address = %address, attempt, "backend rejected credential");
                return Err(RpcError::Unauthorized { address });
            }
            Err(DialError::Invalid(msg)) => {
                return Err(RpcError::InvalidAddress(msg));
            }
            Err(err @ DialError::Retryable { .. }) => {
                last = err.to_string();
                if attempt == max_attempts {
                    break;
                }
                tracing::warn!(
                    address = %address,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "connection attempt failed, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled(address.clone(), attempt)),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = backoff.saturating_mul(2);
            }
        }
    }

    Err(RpcError::ConnectExhausted {
        address,
        attempts: max_attempts,
        last,
    })
}

fn cancelled(address: String, attempts: u32) -> RpcError {
    tracing::info!(address = %address, attempts, "connection cancelled");
    RpcError::ConnectCancelled { address, attempts }
}

/// Where and how to open the WebSocket.
#[derive(Clone)]
pub struct ConnectConfig {
    /// Full `ws://` or `wss://` URL including the RPC path.
    pub url: String,
    /// Bearer credential sent in the `Authorization` header.
    pub credential: String,
    pub tls: TlsMode,
    /// Per-attempt handshake timeout.
    pub connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("url", &self.url)
            .field("credential", &"[REDACTED]")
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectConfig {
    /// Build a config, normalizing the address to a WebSocket URL.
    ///
    /// `https://` becomes `wss://`, `http://` becomes `ws://`, a bare host gets
    /// `wss://`. If the address carries no path, [`DEFAULT_RPC_PATH`] is used.
    pub fn new(address: &str, credential: impl Into<String>) -> Result<Self, RpcError> {
        Ok(Self {
            url: normalize_address(address)?,
            credential: credential.into(),
            tls: TlsMode::default(),
            connect_timeout: Some(Duration::from_secs(30)),
        })
    }

    /// Replace the path component of the URL.
    pub fn with_path(mut self, path: &str) -> Result<Self, RpcError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| RpcError::InvalidAddress(e.to_string()))?;
        url.set_path(path);
        self.url = url.to_string();
        Ok(self)
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn without_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }

    /// Upgrade request with the bearer credential attached.
    pub fn upgrade_request(&self) -> Result<Request, DialError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| DialError::Invalid(e.to_string()))?;
        let value = HeaderValue::from_str(&format!("Bearer {}", self.credential))
            .map_err(|_| DialError::Invalid("credential is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(request)
    }
}

fn normalize_address(address: &str) -> Result<String, RpcError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(RpcError::InvalidAddress("address is empty".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| RpcError::InvalidAddress(e.to_string()))?;

    let scheme = match url.scheme().to_ascii_lowercase().as_str() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RpcError::InvalidAddress(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RpcError::InvalidAddress(format!("cannot use scheme '{scheme}'")))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_RPC_PATH);
    }
    Ok(url.to_string())
}

/// Install the process-wide rustls provider once. Later calls are no-ops.
fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Verifier that accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector(mode: TlsMode) -> Result<Option<Connector>, DialError> {
    match mode {
        // tokio-tungstenite builds a webpki-roots config for wss:// itself
        TlsMode::Verified => Ok(None),
        TlsMode::Insecure => {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            let config = rustls::ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()
                .map_err(|e| DialError::Invalid(format!("TLS config error: {e}")))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
                .with_no_client_auth();
            Ok(Some(Connector::Rustls(Arc::new(config))))
        }
    }
}

fn classify_handshake_error(err: tungstenite::Error) -> DialError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                return DialError::Unauthorized;
            }
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "upgrade rejected");
            DialError::Retryable {
                status: Some(status.as_u16()),
                message: format!("unexpected HTTP status {status}"),
            }
        }
        tungstenite::Error::Url(e) => DialError::Invalid(e.to_string()),
        other => DialError::Retryable {
            status: None,
            message: other.to_string(),
        },
    }
}

/// Dials the backend's WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsDialer {
    config: ConnectConfig,
}

impl WsDialer {
    pub fn new(config: ConnectConfig) -> Self {
        ensure_crypto_provider();
        Self { config }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }
}

#[async_trait]
impl Dialer for WsDialer {
    type Transport = WsTransport;

    fn address(&self) -> &str {
        &self.config.url
    }

    async fn dial(&self) -> Result<WsTransport, DialError> {
        let request = self.config.upgrade_request()?;
        let connector = tls_connector(self.config.tls)?;
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

        let result = match self.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| DialError::Retryable {
                    status: None,
                    message: format!("handshake timed out after {timeout:?}"),
                })?,
            None => handshake.await,
        };

        match result {
            Ok((stream, response)) => {
                tracing::debug!(
                    url = %self.config.url,
                    status = %response.status(),
                    tls = ?self.config.tls,
                    "websocket upgraded"
                );
                Ok(WsTransport::new(stream))
            }
            Err(e) => Err(classify_handshake_error(e)),
        }
    }
}
