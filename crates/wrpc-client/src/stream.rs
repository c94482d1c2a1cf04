// ABOUTME: List-style calls: reads frames until the sentinel, extracting matching records.
// ABOUTME: Exposes a lazy, finite, non-restartable record sequence over one connection.

use std::collections::VecDeque;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::{value_kind, Envelope, FrameKind};
use crate::connection::Connection;
use crate::error::{Result, RpcError};
use crate::transport::FrameTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Reading,
    Drained,
    Failed,
}

/// Records of one list-style call, surfaced frame by frame.
///
/// The sequence is tied to the connection that produced it and can be
/// consumed once. Dropping it before the sentinel leaves that connection
/// unusable for another call.
pub struct RecordStream<'c, T, M, E, R> {
    conn: &'c mut Connection<T>,
    envelope: &'c Envelope,
    matcher: M,
    extract: E,
    buffer: VecDeque<R>,
    state: StreamState,
    frames: usize,
}

/// Send `envelope` and return the lazy sequence of its matching records.
///
/// `matcher` is applied to every key of every `result` mapping; `extract`
/// turns the value of each matching key into a record.
pub async fn stream<'c, T, M, E, R>(
    conn: &'c mut Connection<T>,
    envelope: &'c Envelope,
    matcher: M,
    extract: E,
) -> Result<RecordStream<'c, T, M, E, R>>
where
    T: FrameTransport,
    M: FnMut(&str) -> bool,
    E: FnMut(&str, Value) -> std::result::Result<R, serde_json::Error>,
{
    conn.send(envelope).await?;
    Ok(RecordStream {
        conn,
        envelope,
        matcher,
        extract,
        buffer: VecDeque::new(),
        state: StreamState::Reading,
        frames: 0,
    })
}

impl<'c, T, M, E, R> RecordStream<'c, T, M, E, R>
where
    T: FrameTransport,
    M: FnMut(&str) -> bool,
    E: FnMut(&str, Value) -> std::result::Result<R, serde_json::Error>,
{
    /// Next record, `None` once the sentinel has been seen or after a failure.
    pub async fn next(&mut self) -> Option<Result<R>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.state != StreamState::Reading {
                return None;
            }
            if let Err(e) = self.read_frame().await {
                self.state = StreamState::Failed;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
    }

    async fn read_frame(&mut self) -> Result<()> {
        let mut frame = self.conn.receive(self.envelope).await?;
        self.frames += 1;

        match frame.kind() {
            FrameKind::Sentinel => {
                tracing::debug!(
                    method = %self.envelope.qualified_method(),
                    token = %self.envelope.token,
                    frames = self.frames,
                    "stream drained"
                );
                self.state = StreamState::Drained;
                Ok(())
            }
            FrameKind::Failure(message) => Err(RpcError::Application {
                method: self.envelope.qualified_method(),
                token: self.envelope.token.clone(),
                message,
            }),
            FrameKind::Payload => match frame.take_result() {
                Some(Value::Object(entries)) => {
                    // a frame is surfaced whole or not at all
                    let mut records = Vec::new();
                    for (key, value) in entries {
                        if !(self.matcher)(&key) {
                            continue;
                        }
                        let record =
                            (self.extract)(&key, value).map_err(|e| RpcError::SchemaMismatch {
                                method: self.envelope.qualified_method(),
                                token: self.envelope.token.clone(),
                                detail: format!("record '{key}': {e}"),
                            })?;
                        records.push(record);
                    }
                    self.buffer.extend(records);
                    Ok(())
                }
                Some(other) => Err(RpcError::SchemaMismatch {
                    method: self.envelope.qualified_method(),
                    token: self.envelope.token.clone(),
                    detail: format!("'result' is {}, expected object", value_kind(&other)),
                }),
                // frames without a result carry nothing to extract
                None => Ok(()),
            },
        }
    }

    /// Drain the whole sequence. Any failure discards what was gathered.
    pub async fn collect(mut self) -> Result<Vec<R>> {
        let mut records = Vec::new();
        while let Some(item) = self.next().await {
            records.push(item?);
        }
        Ok(records)
    }

    /// True once the sentinel has been seen.
    pub fn is_drained(&self) -> bool {
        self.state == StreamState::Drained
    }

    /// Frames read so far, sentinel included.
    pub fn frames_read(&self) -> usize {
        self.frames
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<R>> + 'c
    where
        T: 'c,
        M: 'c,
        E: 'c,
        R: 'c,
    {
        futures::stream::unfold(self, |mut records| async move {
            records.next().await.map(|item| (item, records))
        })
    }
}

/// Extractor that keeps the raw value.
pub fn raw_record(_key: &str, value: Value) -> std::result::Result<Value, serde_json::Error> {
    Ok(value)
}

/// Extractor that deserializes each record into `R`.
pub fn typed_record<R: DeserializeOwned>(
    _key: &str,
    value: Value,
) -> std::result::Result<R, serde_json::Error> {
    serde_json::from_value(value)
}

/// Matcher for keys starting with `prefix`, e.g. `"vpc"` for `"vpc_1"`, `"vpc_2"`.
pub fn key_prefix(prefix: &str) -> impl FnMut(&str) -> bool + '_ {
    move |key| key.starts_with(prefix)
}
