//! Turns a commit message into ordered, typed writes.

use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use tidemark_core::{AtUri, PreparedRecord, PreparedWrite, WriteOpAction};

use super::car::{BlockMap, read_car};
use super::stream::{RepoOp, StreamMessage};
use crate::{Error, Result};

/// Decode every op of `msg`, preserving op order.
///
/// Fails as a whole if any op is malformed or references a block missing
/// from the bundle.
pub fn get_ops(msg: &StreamMessage) -> Result<Vec<PreparedWrite>> {
    let car = read_car(&msg.blocks)?;
    msg.ops
        .iter()
        .map(|op| prepare(msg, &car.blocks, op))
        .collect()
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    let mut parts = path.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(collection), Some(rkey), None) if !collection.is_empty() && !rkey.is_empty() => {
            Ok((collection, rkey))
        }
        _ => Err(Error::Decode(format!("invalid op path {path:?}"))),
    }
}

fn prepare(msg: &StreamMessage, blocks: &BlockMap, op: &RepoOp) -> Result<PreparedWrite> {
    let (collection, rkey) = split_path(&op.path)?;
    let uri = AtUri::make(msg.repo.as_str(), collection, rkey);
    let action: WriteOpAction = op
        .action
        .parse()
        .map_err(|e: tidemark_core::Error| Error::Decode(e.to_string()))?;

    match action {
        WriteOpAction::Create | WriteOpAction::Update => {
            let cid = op
                .cid
                .ok_or_else(|| Error::Decode(format!("{action} of {uri} carries no cid")))?;
            let block = blocks
                .get(&cid)
                .ok_or_else(|| Error::Decode(format!("block {cid} for {uri} missing from bundle")))?;
            let record: Ipld = serde_ipld_dagcbor::from_slice(block)
                .map_err(|e| Error::Decode(format!("record {uri}: {e}")))?;
            let blobs = blob_refs(&record);
            let prepared = PreparedRecord {
                uri,
                cid,
                record,
                blobs,
            };
            Ok(match action {
                WriteOpAction::Create => PreparedWrite::Create(prepared),
                _ => PreparedWrite::Update(prepared),
            })
        }
        WriteOpAction::Delete => Ok(PreparedWrite::Delete { uri }),
    }
}

/// CIDs of every `{"$type": "blob", "ref": <link>}` inside `record`.
pub fn blob_refs(record: &Ipld) -> Vec<Cid> {
    let mut out = Vec::new();
    collect_blobs(record, &mut out);
    out
}

fn collect_blobs(value: &Ipld, out: &mut Vec<Cid>) {
    match value {
        Ipld::Map(map) => {
            if let (Some(Ipld::String(t)), Some(Ipld::Link(cid))) = (map.get("$type"), map.get("ref")) {
                if t == "blob" {
                    out.push(*cid);
                    return;
                }
            }
            map.values().for_each(|v| collect_blobs(v, out));
        }
        Ipld::List(items) => items.iter().for_each(|v| collect_blobs(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::car::write_car;
    use crate::testing::{cid_for, dag_cbor_block, like_block, message, post_uri};

    fn op(action: &str, path: &str, cid: Option<Cid>) -> RepoOp {
        RepoOp {
            action: action.to_string(),
            path: path.to_string(),
            cid,
        }
    }

    #[test]
    fn test_ops_keep_order() {
        let (cid, block) = like_block(&post_uri("did:plc:alice", "p"));
        let blocks = write_car(Some(cid), &[(cid, block)]).unwrap();
        let msg = message(
            1,
            "did:plc:bob",
            vec![
                op("create", "app.bsky.feed.like/a", Some(cid)),
                op("update", "app.bsky.feed.like/a", Some(cid)),
                op("delete", "app.bsky.feed.like/a", None),
            ],
            blocks,
        );

        let writes = get_ops(&msg).unwrap();
        let actions: Vec<_> = writes.iter().map(PreparedWrite::action).collect();
        assert_eq!(
            actions,
            vec![WriteOpAction::Create, WriteOpAction::Update, WriteOpAction::Delete]
        );
        let uri = AtUri::make("did:plc:bob", "app.bsky.feed.like", "a");
        assert!(writes.iter().all(|w| w.uri() == &uri));
        match &writes[0] {
            PreparedWrite::Create(r) => {
                assert_eq!(r.cid, cid);
                assert!(matches!(&r.record, Ipld::Map(m) if m.contains_key("subject")));
            }
            other => panic!("unexpected write {other:?}"),
        }
    }

    #[test]
    fn test_missing_block_fails_message() {
        let msg = message(
            1,
            "did:plc:bob",
            vec![op("create", "app.bsky.feed.like/a", Some(cid_for(b"absent")))],
            write_car(None, &[]).unwrap(),
        );
        assert!(matches!(get_ops(&msg), Err(Error::Decode(_))));
    }

    #[test]
    fn test_create_without_cid_fails() {
        let msg = message(
            1,
            "did:plc:bob",
            vec![op("create", "app.bsky.feed.like/a", None)],
            write_car(None, &[]).unwrap(),
        );
        assert!(matches!(get_ops(&msg), Err(Error::Decode(_))));
    }

    #[test]
    fn test_unknown_action_fails() {
        let msg = message(
            1,
            "did:plc:bob",
            vec![op("upsert", "app.bsky.feed.like/a", None)],
            write_car(None, &[]).unwrap(),
        );
        let err = get_ops(&msg).unwrap_err();
        assert!(err.to_string().contains("upsert"));
    }

    #[test]
    fn test_bad_path_fails() {
        for path in ["app.bsky.feed.like", "app.bsky.feed.like/", "a/b/c", "/x"] {
            let msg = message(
                1,
                "did:plc:bob",
                vec![op("delete", path, None)],
                write_car(None, &[]).unwrap(),
            );
            assert!(get_ops(&msg).is_err(), "path {path:?} accepted");
        }
    }

    #[test]
    fn test_blob_refs_collected() {
        let image = cid_for(b"image");
        let (_, block) = dag_cbor_block(&serde_json::json!({ "text": "hi" }));
        let mut record = serde_ipld_dagcbor::from_slice::<Ipld>(&block).unwrap();
        if let Ipld::Map(map) = &mut record {
            let mut blob = std::collections::BTreeMap::new();
            blob.insert("$type".to_string(), Ipld::String("blob".to_string()));
            blob.insert("ref".to_string(), Ipld::Link(image));
            map.insert(
                "embed".to_string(),
                Ipld::List(vec![Ipld::Map(blob)]),
            );
        }
        assert_eq!(blob_refs(&record), vec![image]);
    }
}
