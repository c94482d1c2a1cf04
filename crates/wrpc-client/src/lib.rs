// ABOUTME: Client runtime for an eventually-consistent orchestration backend reached over WebSocket.
// ABOUTME: Provides connection setup, RPC calls, record streams, field masks, and convergence polling.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connect;
pub mod connection;
pub mod error;
pub mod mask;
pub mod method;
pub mod probe;
pub mod retry;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;
pub mod transport;

// Connection establishment
pub use connect::{
    connect, connect_with_cancellation, ConnectConfig, ConnectRetry, DialError, Dialer, TlsMode,
    WsDialer, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_RPC_PATH,
};
pub use transport::{FrameTransport, TransportError, WsTransport};

// Wire format
pub use codec::{Envelope, FrameKind, Params, ResponseFrame, DEFAULT_COMMAND, SENTINEL};

// Calls and streams
pub use channel::ResultMapping;
pub use client::Client;
pub use connection::Connection;
pub use method::{ListMethod, RpcMethod};
pub use stream::{key_prefix, raw_record, typed_record, RecordStream};

// Field masks
pub use mask::{derive_mask, merge_inner_mask, FieldMask};

// Convergence
pub use probe::{field_populated, find_duplicate, record_exists, record_removed, ListQuery};
pub use retry::{
    converge_or_compensate, retry_until, retry_until_cancelled, ProbeOutcome, RetryPolicy,
};

// Configuration
pub use config::Config;

// Error types
pub use error::{ConfigError, ConvergenceError, MaskError, Result, RpcError};
