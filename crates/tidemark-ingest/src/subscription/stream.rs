//! Connection manager for the upstream repo-commit stream.
//!
//! Each websocket binary message is one frame: a DAG-CBOR header followed by
//! a DAG-CBOR body.
//!
//! ```text
//! header { op: 1, t: "#commit" }   body: StreamMessage
//! header { op: -1 }                body: { error, message }
//! ```
//!
//! [`RepoStream`] connects at the latest durable cursor, validates every
//! frame, skips invalid ones, and reconnects with backoff when the transport
//! fails or the upstream sends an error frame. Consumers pull one message at
//! a time; the pull ends cleanly when the cancellation token trips.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use metrics::counter;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::backoff::{ReconnectConfig, Reconnector};
use super::state::StateStore;
use crate::{Error, Result};

/// XRPC method of the repo-commit stream.
pub const METHOD: &str = "com.atproto.sync.subscribeRepos";

const OP_MESSAGE: i64 = 1;
const OP_ERROR: i64 = -1;
const COMMIT_TYPE: &str = "#commit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub op: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One per-path operation of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOp {
    /// `create`, `update` or `delete`. Kept raw so an unknown action
    /// surfaces as a decode error of the whole message.
    pub action: String,
    /// `<collection>/<rkey>`.
    pub path: String,
    pub cid: Option<Cid>,
}

/// A `#commit` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub seq: i64,
    #[serde(default)]
    pub too_big: bool,
    /// DID of the repository.
    pub repo: String,
    pub commit: Cid,
    /// Commit time, RFC 3339.
    pub time: String,
    pub ops: Vec<RepoOp>,
    /// CARv1 bundle holding the blocks referenced by `ops`.
    #[serde(with = "serde_bytes")]
    pub blocks: Vec<u8>,
    #[serde(default)]
    pub blobs: Vec<Cid>,
}

impl StreamMessage {
    /// Checks the schema does not express on its own.
    pub fn validate(&self) -> Result<()> {
        if self.seq < 0 {
            return Err(Error::Validation(format!("negative seq {}", self.seq)));
        }
        if !self.repo.starts_with("did:") {
            return Err(Error::Validation(format!("repo {:?} is not a DID", self.repo)));
        }
        if chrono::DateTime::parse_from_rfc3339(&self.time).is_err() {
            return Err(Error::Validation(format!("time {:?} is not RFC 3339", self.time)));
        }
        Ok(())
    }
}

/// Whatever context could be recovered from a frame that failed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidFrame {
    pub reason: String,
    pub seq: Option<i64>,
    pub repo: Option<String>,
    pub commit: Option<String>,
    pub time: Option<String>,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Commit(StreamMessage),
    Error(ErrorFrame),
    /// A message type this consumer does not index.
    Other(String),
    Invalid(InvalidFrame),
}

fn if_number(value: Option<&Ipld>) -> Option<i64> {
    match value {
        Some(Ipld::Integer(n)) => i64::try_from(*n).ok(),
        _ => None,
    }
}

fn if_string(value: Option<&Ipld>) -> Option<String> {
    match value {
        Some(Ipld::String(s)) => Some(s.clone()),
        Some(Ipld::Link(cid)) => Some(cid.to_string()),
        _ => None,
    }
}

/// Best-effort context from a body that did not decode as a commit.
fn invalid_context(bytes: &[u8], reason: String) -> InvalidFrame {
    let mut de = serde_ipld_dagcbor::de::Deserializer::from_slice(bytes);
    let body = IgnoredAny::deserialize(&mut de)
        .ok()
        .and_then(|_| Ipld::deserialize(&mut de).ok());

    let Some(Ipld::Map(map)) = body else {
        return InvalidFrame {
            reason,
            ..Default::default()
        };
    };
    InvalidFrame {
        reason,
        seq: if_number(map.get("seq")),
        repo: if_string(map.get("repo")),
        commit: if_string(map.get("commit")),
        time: if_string(map.get("time")),
    }
}

/// Decode one frame. Malformed input yields [`Frame::Invalid`], never an error.
pub fn decode_frame(bytes: &[u8]) -> Frame {
    let mut de = serde_ipld_dagcbor::de::Deserializer::from_slice(bytes);
    let header = match FrameHeader::deserialize(&mut de) {
        Ok(header) => header,
        Err(e) => {
            return Frame::Invalid(InvalidFrame {
                reason: format!("bad frame header: {e}"),
                ..Default::default()
            });
        }
    };

    match (header.op, header.t.as_deref()) {
        (OP_ERROR, _) => match ErrorFrame::deserialize(&mut de) {
            Ok(frame) => Frame::Error(frame),
            Err(e) => Frame::Error(ErrorFrame {
                error: "Unknown".to_string(),
                message: Some(format!("undecodable error frame: {e}")),
            }),
        },
        (OP_MESSAGE, Some(COMMIT_TYPE)) => match StreamMessage::deserialize(&mut de) {
            Ok(msg) => match msg.validate() {
                Ok(()) => Frame::Commit(msg),
                Err(e) => Frame::Invalid(InvalidFrame {
                    reason: e.to_string(),
                    seq: Some(msg.seq),
                    repo: Some(msg.repo),
                    commit: Some(msg.commit.to_string()),
                    time: Some(msg.time),
                }),
            },
            Err(e) => Frame::Invalid(invalid_context(bytes, e.to_string())),
        },
        (OP_MESSAGE, Some(t)) => Frame::Other(t.to_string()),
        (op, t) => Frame::Invalid(InvalidFrame {
            reason: format!("unexpected frame op {op} type {t:?}"),
            ..Default::default()
        }),
    }
}

/// Raw frames from one upstream connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opens connections to the upstream stream.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Connect, resuming after `cursor`.
    async fn connect(&self, cursor: i64) -> Result<FrameStream>;
}

/// Websocket transport to `{service}/xrpc/{method}?cursor=N`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    service: String,
    method: String,
}

impl WebSocketTransport {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn url(&self, cursor: i64) -> String {
        format!(
            "{}/xrpc/{}?cursor={}",
            self.service.trim_end_matches('/'),
            self.method,
            cursor
        )
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(&self, cursor: i64) -> Result<FrameStream> {
        let url = self.url(cursor);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("connect {url}: {e}")))?;
        tracing::info!(url = %url, "Connected to repo stream");

        let frames = ws.filter_map(|msg| async move {
            match msg {
                Ok(WsMessage::Binary(data)) => Some(Ok(data.to_vec())),
                Ok(WsMessage::Close(frame)) => Some(Err(Error::Connection(format!(
                    "closed by upstream: {frame:?}"
                )))),
                Ok(_) => None,
                Err(e) => Some(Err(Error::Connection(e.to_string()))),
            }
        });
        Ok(Box::pin(frames))
    }
}

/// Sequential, cancellable pull over the upstream stream.
pub struct RepoStream {
    transport: Arc<dyn StreamTransport>,
    state: StateStore,
    reconnector: Reconnector,
    token: CancellationToken,
    current: Option<FrameStream>,
    last_seq: Option<i64>,
    connected_once: bool,
}

impl RepoStream {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        state: StateStore,
        reconnect: ReconnectConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            state,
            reconnector: Reconnector::new(reconnect),
            token,
            current: None,
            last_seq: None,
            connected_once: false,
        }
    }

    /// Next valid commit message.
    ///
    /// Returns `None` once cancelled. Errors are fatal to the current
    /// consumption cycle: retries exhausted, unreadable cursor, or a sequence
    /// number going backwards.
    pub async fn next(&mut self) -> Option<Result<StreamMessage>> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            if self.current.is_none() {
                if let Err(e) = self.open().await {
                    if let Some(fatal) = self.backoff(e).await {
                        return Some(Err(fatal));
                    }
                    continue;
                }
            }
            let stream = self.current.as_mut()?;

            let item = tokio::select! {
                _ = self.token.cancelled() => return None,
                item = stream.next() => item,
            };

            let bytes = match item {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    if let Some(fatal) = self.backoff(e).await {
                        return Some(Err(fatal));
                    }
                    continue;
                }
                None => {
                    let e = Error::Connection("stream ended".to_string());
                    if let Some(fatal) = self.backoff(e).await {
                        return Some(Err(fatal));
                    }
                    continue;
                }
            };

            match decode_frame(&bytes) {
                Frame::Commit(msg) => {
                    if let Some(last) = self.last_seq {
                        if msg.seq < last {
                            let err = Error::Validation(format!(
                                "sequence went backwards: {} after {}",
                                msg.seq, last
                            ));
                            return Some(Err(Error::processing(&msg, err)));
                        }
                    }
                    self.last_seq = Some(msg.seq);
                    self.reconnector.reset();
                    return Some(Ok(msg));
                }
                Frame::Error(frame) => {
                    let e = Error::Connection(format!(
                        "upstream error {}: {}",
                        frame.error,
                        frame.message.as_deref().unwrap_or("")
                    ));
                    if let Some(fatal) = self.backoff(e).await {
                        return Some(Err(fatal));
                    }
                }
                Frame::Other(t) => {
                    tracing::debug!(message_type = %t, "Skipping non-commit message");
                }
                Frame::Invalid(invalid) => {
                    counter!("subscription_messages_invalid_total").increment(1);
                    tracing::warn!(
                        err = %invalid.reason,
                        seq = ?invalid.seq,
                        repo = ?invalid.repo,
                        commit = ?invalid.commit,
                        time = ?invalid.time,
                        service = %self.state.service(),
                        "repo subscription skipped invalid message"
                    );
                }
            }
        }
    }

    async fn open(&mut self) -> Result<()> {
        // Read lazily so an external reset is honoured on the next connect
        let cursor = self.state.current().await?.cursor;
        let connected = tokio::select! {
            _ = self.token.cancelled() => return Err(Error::Cancelled),
            connected = self.transport.connect(cursor) => connected,
        };
        let stream = connected?;
        tracing::debug!(cursor, service = %self.state.service(), "Repo stream connected");
        self.current = Some(stream);
        self.last_seq = None;
        self.connected_once = true;
        Ok(())
    }

    /// Drop the connection and wait before reconnecting. Returns the error
    /// back once no more retries are allowed.
    async fn backoff(&mut self, err: Error) -> Option<Error> {
        self.current = None;
        if self.token.is_cancelled() {
            return None;
        }

        let Some(delay) = self.reconnector.next_backoff() else {
            return Some(Error::Connection(format!(
                "giving up after {} reconnects: {}",
                self.reconnector.attempt(),
                err
            )));
        };

        counter!("subscription_reconnects_total").increment(1);
        tracing::warn!(
            err = %err,
            reconnects = self.reconnector.attempt(),
            initial = !self.connected_once,
            delay_ms = delay.as_millis() as u64,
            service = %self.state.service(),
            "repo subscription reconnect"
        );

        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        None
    }
}
