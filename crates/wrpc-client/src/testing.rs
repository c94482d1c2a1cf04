// ABOUTME: In-memory transport and dialer that replay scripted backend frames.
// ABOUTME: Lets channel, stream, probe and client code run without a live backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::connect::{DialError, Dialer};
use crate::transport::{FrameTransport, TransportError};

/// One scripted step on the read side.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Deliver this frame text.
    Frame(String),
    /// Report a clean peer close.
    Closed,
    /// Report an I/O failure.
    Fail(String),
    /// Never deliver anything. Used to exercise cancellation.
    Stall,
}

impl Scripted {
    /// Frame from a JSON value.
    pub fn json(value: serde_json::Value) -> Self {
        Scripted::Frame(value.to_string())
    }
}

/// What happened on a scripted transport, observable after it has been consumed.
#[derive(Debug, Default)]
pub struct TransportLog {
    pub sent: Vec<String>,
    pub reads: usize,
    pub closed: bool,
}

/// Shared view of a [`ScriptedTransport`]'s log.
#[derive(Debug, Clone, Default)]
pub struct TransportHandle(Arc<Mutex<TransportLog>>);

impl TransportHandle {
    fn with<R>(&self, f: impl FnOnce(&TransportLog) -> R) -> R {
        let log = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&log)
    }

    /// Frames written, in order.
    pub fn sent(&self) -> Vec<String> {
        self.with(|log| log.sent.clone())
    }

    /// Frames written, parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Number of read attempts, including failed ones.
    pub fn reads(&self) -> usize {
        self.with(|log| log.reads)
    }

    pub fn is_closed(&self) -> bool {
        self.with(|log| log.closed)
    }
}

/// Transport that replays a fixed script of replies.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: VecDeque<Scripted>,
    send_failure: Option<String>,
    log: TransportHandle,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: script.into(),
            send_failure: None,
            log: TransportHandle::default(),
        }
    }

    /// Transport that answers with these JSON frames, in order.
    pub fn replying(frames: Vec<serde_json::Value>) -> Self {
        Self::new(frames.into_iter().map(Scripted::json).collect())
    }

    /// Make every write fail with `message`.
    pub fn failing_send(mut self, message: impl Into<String>) -> Self {
        self.send_failure = Some(message.into());
        self
    }

    pub fn handle(&self) -> TransportHandle {
        self.log.clone()
    }

    fn record(&self, f: impl FnOnce(&mut TransportLog)) {
        let mut log = self.log.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut log);
    }
}

#[async_trait]
impl FrameTransport for ScriptedTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if let Some(message) = &self.send_failure {
            return Err(TransportError::Io(message.clone()));
        }
        self.record(|log| log.sent.push(text));
        Ok(())
    }

    async fn recv_text(&mut self) -> Result<String, TransportError> {
        self.record(|log| log.reads += 1);
        match self.script.pop_front() {
            Some(Scripted::Frame(text)) => Ok(text),
            Some(Scripted::Fail(message)) => Err(TransportError::Io(message)),
            Some(Scripted::Stall) => std::future::pending().await,
            Some(Scripted::Closed) | None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.record(|log| log.closed = true);
        Ok(())
    }
}

/// Dialer that hands out scripted dial results in order.
#[derive(Debug)]
pub struct ScriptedDialer {
    results: Mutex<VecDeque<Result<ScriptedTransport, DialError>>>,
    attempts: AtomicU32,
}

impl ScriptedDialer {
    pub fn new(results: Vec<Result<ScriptedTransport, DialError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            attempts: AtomicU32::new(0),
        }
    }

    /// Dialer whose every dial succeeds with the next transport.
    pub fn with_transports(transports: Vec<ScriptedTransport>) -> Self {
        Self::new(transports.into_iter().map(Ok).collect())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    type Transport = ScriptedTransport;

    fn address(&self) -> &str {
        "scripted://backend"
    }

    async fn dial(&self) -> Result<ScriptedTransport, DialError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self
            .results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| {
            Err(DialError::Retryable {
                status: None,
                message: "dial script exhausted".to_string(),
            })
        })
    }
}
