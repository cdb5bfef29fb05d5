//! Fixtures shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use ipld_core::cid::Cid;
use ipld_core::cid::multihash::Multihash;
use ipld_core::ipld::Ipld;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tidemark_core::{AtUri, PreparedRecord, PreparedWrite};

use crate::db::Database;
use crate::subscription::RepoSubscription;
use crate::subscription::car::{SHA2_256, write_car};
use crate::subscription::stream::{
    ErrorFrame, FrameHeader, FrameStream, RepoOp, StreamMessage, StreamTransport,
};
use crate::{Error, Result};

const DAG_CBOR: u64 = 0x71;
const LIKE: &str = "app.bsky.feed.like";
const FOLLOW: &str = "app.bsky.graph.follow";

pub fn cid_for(bytes: &[u8]) -> Cid {
    let digest = Sha256::digest(bytes);
    let hash = Multihash::wrap(SHA2_256, digest.as_slice()).unwrap();
    Cid::new_v1(DAG_CBOR, hash)
}

/// DAG-CBOR encoding of `value` and its CID.
pub fn dag_cbor_block(value: &serde_json::Value) -> (Cid, Vec<u8>) {
    let bytes = serde_ipld_dagcbor::to_vec(value).unwrap();
    (cid_for(&bytes), bytes)
}

/// `fields` plus `$type: collection`, as a decoded record.
pub fn ipld_record(collection: &str, mut fields: serde_json::Value) -> Ipld {
    fields["$type"] = serde_json::Value::String(collection.to_string());
    let bytes = serde_ipld_dagcbor::to_vec(&fields).unwrap();
    serde_ipld_dagcbor::from_slice(&bytes).unwrap()
}

pub fn post_uri(did: &str, rkey: &str) -> AtUri {
    AtUri::make(did, "app.bsky.feed.post", rkey)
}

fn like_json(subject: &AtUri) -> serde_json::Value {
    serde_json::json!({
        "$type": LIKE,
        "subject": { "uri": subject.to_string(), "cid": "bafypost" },
        "createdAt": "2024-01-01T00:00:00.000Z",
    })
}

fn follow_json(subject_did: &str) -> serde_json::Value {
    serde_json::json!({
        "$type": FOLLOW,
        "subject": subject_did,
        "createdAt": "2024-01-01T00:00:00.000Z",
    })
}

pub fn like_block(subject: &AtUri) -> (Cid, Vec<u8>) {
    dag_cbor_block(&like_json(subject))
}

pub fn like_write(repo: &str, rkey: &str, subject: &AtUri) -> PreparedWrite {
    let (cid, bytes) = like_block(subject);
    PreparedWrite::Create(PreparedRecord {
        uri: AtUri::make(repo, LIKE, rkey),
        cid,
        record: serde_ipld_dagcbor::from_slice(&bytes).unwrap(),
        blobs: Vec::new(),
    })
}

/// Commit time of `seq`: one second apart, starting 2024-01-01.
fn time_for(seq: i64) -> String {
    chrono::DateTime::from_timestamp(1_704_067_200 + seq, 0)
        .unwrap()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn message(seq: i64, repo: &str, ops: Vec<RepoOp>, blocks: Vec<u8>) -> StreamMessage {
    StreamMessage {
        seq,
        too_big: false,
        repo: repo.to_string(),
        commit: cid_for(format!("commit-{seq}").as_bytes()),
        time: time_for(seq),
        ops,
        blocks,
        blobs: Vec::new(),
    }
}

fn create_commit(seq: i64, repo: &str, path: String, (cid, block): (Cid, Vec<u8>)) -> StreamMessage {
    let op = RepoOp {
        action: "create".to_string(),
        path,
        cid: Some(cid),
    };
    message(seq, repo, vec![op], write_car(Some(cid), &[(cid, block)]).unwrap())
}

/// A commit creating the like `repo/app.bsky.feed.like/rkey` of `subject`.
pub fn like_commit(seq: i64, repo: &str, rkey: &str, subject: &AtUri) -> StreamMessage {
    create_commit(seq, repo, format!("{LIKE}/{rkey}"), like_block(subject))
}

pub fn like_delete_commit(seq: i64, repo: &str, rkey: &str) -> StreamMessage {
    let op = RepoOp {
        action: "delete".to_string(),
        path: format!("{LIKE}/{rkey}"),
        cid: None,
    };
    message(seq, repo, vec![op], write_car(None, &[]).unwrap())
}

pub fn follow_commit(seq: i64, repo: &str, rkey: &str, subject_did: &str) -> StreamMessage {
    create_commit(
        seq,
        repo,
        format!("{FOLLOW}/{rkey}"),
        dag_cbor_block(&follow_json(subject_did)),
    )
}

pub fn encode_frame(header: &FrameHeader, body: &impl Serialize) -> Vec<u8> {
    let mut out = serde_ipld_dagcbor::to_vec(header).unwrap();
    out.extend(serde_ipld_dagcbor::to_vec(body).unwrap());
    out
}

pub fn commit_frame(msg: &StreamMessage) -> Vec<u8> {
    let header = FrameHeader {
        op: 1,
        t: Some("#commit".to_string()),
    };
    encode_frame(&header, msg)
}

pub fn error_frame(error: &str, message: &str) -> Vec<u8> {
    let header = FrameHeader { op: -1, t: None };
    let body = ErrorFrame {
        error: error.to_string(),
        message: Some(message.to_string()),
    };
    encode_frame(&header, &body)
}

/// In-memory upstream.
///
/// Each connection replays the scripted frames whose seq is past the
/// requested cursor, then stays open without sending anything.
pub struct ScriptedTransport {
    frames: Vec<(i64, Vec<u8>)>,
    connects: Mutex<Vec<i64>>,
    failing: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(frames: Vec<(i64, Vec<u8>)>) -> Self {
        Self {
            frames,
            connects: Mutex::new(Vec::new()),
            failing: AtomicUsize::new(0),
        }
    }

    /// Refuse the first `n` connection attempts.
    pub fn failing_connects(self, n: usize) -> Self {
        self.failing.store(n, Ordering::SeqCst);
        self
    }

    /// Cursors of every connection attempt, in order.
    pub fn connects(&self) -> Vec<i64> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn connect(&self, cursor: i64) -> Result<FrameStream> {
        self.connects.lock().push(cursor);
        let refused = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let frames: Vec<Result<Vec<u8>>> = self
            .frames
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .map(|(_, bytes)| Ok(bytes.clone()))
            .collect();
        Ok(Box::pin(stream::iter(frames).chain(stream::pending())))
    }
}

pub fn table_count(db: &Database, table: &str) -> i64 {
    db.with_conn(|conn| {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
    })
    .unwrap()
}

/// Every row of the index tables, rendered for comparison.
pub fn dump_tables(db: &Database) -> Vec<String> {
    let mut out = Vec::new();
    for table in ["record", "duplicate_record", "feed_like", "graph_follow"] {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {table} ORDER BY uri"))?;
            let columns = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let values = (0..columns)
                    .map(|i| row.get::<_, rusqlite::types::Value>(i).map(|v| format!("{v:?}")))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                out.push(format!("{table}|{}", values.join("|")));
            }
            Ok(())
        })
        .unwrap();
    }
    out
}

/// Wait until the durable cursor of `sub` reaches `cursor`.
pub async fn wait_for_cursor(sub: &Arc<RepoSubscription>, cursor: i64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while sub.get_state().await.unwrap().cursor < cursor {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("cursor never reached {cursor}"));
}
