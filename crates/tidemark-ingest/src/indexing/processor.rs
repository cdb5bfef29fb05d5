//! Generic record processor.
//!
//! Every record collection plugs five hooks into [`RecordPlugin`] and gets the
//! shared insert, duplicate and delete handling from [`RecordProcessor`].
//!
//! # Duplicate handling
//!
//! Records sharing a semantic key (for a like: creator and subject) collapse
//! into one canonical row. Later records with the same key are kept as
//! `duplicate_record` rows pointing at the canonical uri and produce no events.
//!
//! ```text
//! ABSENT ──insert──▶ CANONICAL(a) ──insert b──▶ CANONICAL(a) + [b]
//!    ▲                   │                            │
//!    └─────delete a──────┘          delete a: promote b to CANONICAL(b)
//! ```
//!
//! The first record ever inserted for a key stays canonical, so replaying the
//! full history on top of an existing index changes nothing.

use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use metrics::counter;
use rusqlite::{OptionalExtension, Transaction, params};
use serde::de::DeserializeOwned;
use tidemark_core::{AtUri, Message, WriteOpAction};

use crate::{Error, Result};

/// Per-collection hooks used by [`RecordProcessor`].
pub trait RecordPlugin: Send + Sync + 'static {
    /// Typed record as it appears in the repository.
    type Record: DeserializeOwned;
    /// Indexed row returned by insert and delete.
    type Row: Send;

    /// Collection NSID handled by this plugin.
    const COLLECTION: &'static str;

    /// Insert a canonical row. Returns `None` when the uri or the semantic key
    /// is already present.
    fn insert(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        cid: &Cid,
        record: &Self::Record,
        timestamp: &str,
    ) -> Result<Option<Self::Row>>;

    /// Canonical uri already holding the semantic key of `record`, if any.
    fn find_duplicate(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        record: &Self::Record,
    ) -> Result<Option<AtUri>>;

    /// Delete the canonical row for `uri`, returning it if it existed.
    fn delete(&self, tx: &Transaction<'_>, uri: &AtUri) -> Result<Option<Self::Row>>;

    fn events_for_insert(&self, row: &Self::Row) -> Vec<Message>;

    /// Events for a deleted canonical row. `replacement` is the duplicate that
    /// was promoted in its place.
    fn events_for_delete(&self, deleted: &Self::Row, replacement: Option<&Self::Row>)
    -> Vec<Message>;
}

/// Object-safe face of a [`RecordProcessor`], selected by collection.
pub trait RecordHandler: Send + Sync {
    fn collection(&self) -> &'static str;

    /// Index a created or updated record. Returns the events to emit after commit.
    fn index_record(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        cid: &Cid,
        record: &Ipld,
        action: WriteOpAction,
        timestamp: &str,
    ) -> Result<Vec<Message>>;

    /// Delete a record, promoting the oldest duplicate if the canonical row goes.
    fn delete_record(&self, tx: &Transaction<'_>, uri: &AtUri) -> Result<Vec<Message>>;
}

/// A duplicate waiting to be promoted.
struct PendingDuplicate {
    uri: String,
    cid: String,
    indexed_at: String,
    data: Vec<u8>,
}

/// Shared insert/dedup/delete engine around one plugin.
pub struct RecordProcessor<P> {
    plugin: P,
}

impl<P: RecordPlugin> RecordProcessor<P> {
    pub fn new(plugin: P) -> Self {
        Self { plugin }
    }

    pub fn plugin(&self) -> &P {
        &self.plugin
    }

    /// Decode the typed record from its DAG-CBOR bytes.
    fn decode(&self, data: &[u8]) -> Result<P::Record> {
        serde_ipld_dagcbor::from_slice(data).map_err(|e| Error::InvalidRecord {
            collection: P::COLLECTION.to_string(),
            reason: e.to_string(),
        })
    }

    fn validate_type(&self, record: &Ipld) -> Result<()> {
        let Ipld::Map(map) = record else {
            return Err(self.invalid("record is not a map"));
        };
        match map.get("$type") {
            Some(Ipld::String(t)) if t == P::COLLECTION => Ok(()),
            Some(Ipld::String(t)) => Err(self.invalid(&format!("unexpected $type {t}"))),
            _ => Err(self.invalid("missing $type")),
        }
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidRecord {
            collection: P::COLLECTION.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Oldest duplicate of `canonical`, by indexing time then insertion order.
    fn earliest_duplicate(
        &self,
        tx: &Transaction<'_>,
        canonical: &AtUri,
    ) -> Result<Option<PendingDuplicate>> {
        let dup = tx
            .query_row(
                "SELECT d.uri, d.cid, d.indexed_at, r.data
                 FROM duplicate_record d
                 JOIN record r ON r.uri = d.uri
                 WHERE d.duplicate_of = ?1
                 ORDER BY d.indexed_at ASC, d.rowid ASC
                 LIMIT 1",
                [canonical.to_string()],
                |row| {
                    Ok(PendingDuplicate {
                        uri: row.get(0)?,
                        cid: row.get(1)?,
                        indexed_at: row.get(2)?,
                        data: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(dup)
    }

    /// Promote the oldest decodable duplicate of `deleted` to canonical.
    fn promote(&self, tx: &Transaction<'_>, deleted: &AtUri) -> Result<Option<P::Row>> {
        while let Some(dup) = self.earliest_duplicate(tx, deleted)? {
            tx.execute("DELETE FROM duplicate_record WHERE uri = ?1", [&dup.uri])?;

            let record = match self.decode(&dup.data) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        uri = %dup.uri,
                        error = %e,
                        "Dropping undecodable duplicate instead of promoting it"
                    );
                    continue;
                }
            };
            let uri: AtUri = dup.uri.parse()?;
            let cid: Cid = dup
                .cid
                .parse()
                .map_err(|e| Error::Integrity(format!("stored cid {}: {}", dup.cid, e)))?;

            let row = self
                .plugin
                .insert(tx, &uri, &cid, &record, &dup.indexed_at)?
                .ok_or_else(|| {
                    Error::Integrity(format!(
                        "promotion of {} to replace {} conflicted",
                        uri, deleted
                    ))
                })?;

            // Remaining duplicates now shadow the promoted record
            tx.execute(
                "UPDATE duplicate_record SET duplicate_of = ?1 WHERE duplicate_of = ?2",
                params![uri.to_string(), deleted.to_string()],
            )?;

            counter!("indexing_promotions_total", "collection" => P::COLLECTION).increment(1);
            tracing::debug!(deleted = %deleted, promoted = %uri, "Promoted duplicate record");
            return Ok(Some(row));
        }
        Ok(None)
    }
}

impl<P: RecordPlugin> RecordHandler for RecordProcessor<P> {
    fn collection(&self) -> &'static str {
        P::COLLECTION
    }

    fn index_record(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        cid: &Cid,
        record: &Ipld,
        _action: WriteOpAction,
        timestamp: &str,
    ) -> Result<Vec<Message>> {
        // Create and update are handled alike: the semantic key comes from
        // immutable record fields, so an update never changes dedup membership.
        self.validate_type(record)?;
        let data = serde_ipld_dagcbor::to_vec(record)
            .map_err(|e| self.invalid(&format!("re-encoding failed: {e}")))?;
        let typed = self.decode(&data)?;

        let stored = tx.execute(
            "INSERT INTO record (uri, cid, did, collection, data, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (uri) DO NOTHING",
            params![
                uri.to_string(),
                cid.to_string(),
                uri.host(),
                P::COLLECTION,
                data,
                timestamp
            ],
        )?;
        if stored == 0 {
            // Already indexed under this uri: replay
            return Ok(Vec::new());
        }

        if let Some(row) = self.plugin.insert(tx, uri, cid, &typed, timestamp)? {
            return Ok(self.plugin.events_for_insert(&row));
        }

        match self.plugin.find_duplicate(tx, uri, &typed)? {
            Some(canonical) if &canonical != uri => {
                tx.execute(
                    "INSERT INTO duplicate_record (uri, cid, duplicate_of, indexed_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (uri) DO NOTHING",
                    params![
                        uri.to_string(),
                        cid.to_string(),
                        canonical.to_string(),
                        timestamp
                    ],
                )?;
                counter!("indexing_duplicates_total", "collection" => P::COLLECTION).increment(1);
                tracing::debug!(uri = %uri, canonical = %canonical, "Recorded duplicate");
                Ok(Vec::new())
            }
            _ => Err(Error::Integrity(format!(
                "{} row for {} exists without a record entry",
                P::COLLECTION,
                uri
            ))),
        }
    }

    fn delete_record(&self, tx: &Transaction<'_>, uri: &AtUri) -> Result<Vec<Message>> {
        let key = uri.to_string();
        tx.execute("DELETE FROM record WHERE uri = ?1", [&key])?;

        let was_duplicate = tx.execute("DELETE FROM duplicate_record WHERE uri = ?1", [&key])?;
        if was_duplicate > 0 {
            // The canonical record and its events stay valid
            return Ok(Vec::new());
        }

        let Some(deleted) = self.plugin.delete(tx, uri)? else {
            return Ok(Vec::new());
        };

        let replacement = self.promote(tx, uri)?;
        Ok(self.plugin.events_for_delete(&deleted, replacement.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::indexing::plugins::LikePlugin;
    use crate::indexing::plugins::like::COLLECTION;
    use crate::testing::{cid_for, ipld_record, post_uri};

    fn like(subject: &AtUri) -> Ipld {
        ipld_record(
            COLLECTION,
            serde_json::json!({
                "subject": { "uri": subject.to_string(), "cid": "bafypost" },
                "createdAt": "2024-01-01T00:00:00.000Z",
            }),
        )
    }

    fn index(
        db: &Database,
        processor: &RecordProcessor<LikePlugin>,
        uri: &AtUri,
        record: &Ipld,
        ts: &str,
    ) -> Vec<Message> {
        let cid = cid_for(uri.to_string().as_bytes());
        db.transaction(|tx| {
            processor.index_record(tx, uri, &cid, record, WriteOpAction::Create, ts)
        })
        .unwrap()
    }

    fn delete(db: &Database, processor: &RecordProcessor<LikePlugin>, uri: &AtUri) -> Vec<Message> {
        db.transaction(|tx| processor.delete_record(tx, uri)).unwrap()
    }

    fn canonical_uris(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT uri FROM feed_like ORDER BY uri")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
        .unwrap()
    }

    fn duplicates(db: &Database) -> Vec<(String, String)> {
        db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT uri, duplicate_of FROM duplicate_record ORDER BY uri")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .unwrap()
    }

    #[test]
    fn test_duplicate_insert_suppressed() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let subject = post_uri("did:plc:alice", "postA");
        let uri1 = AtUri::make("did:plc:bob", COLLECTION, "1");
        let uri2 = AtUri::make("did:plc:bob", COLLECTION, "2");

        let first = index(&db, &processor, &uri1, &like(&subject), "t1");
        let second = index(&db, &processor, &uri2, &like(&subject), "t2");

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(canonical_uris(&db), vec![uri1.to_string()]);
        assert_eq!(duplicates(&db), vec![(uri2.to_string(), uri1.to_string())]);
    }

    #[test]
    fn test_promotion_on_delete() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let subject = post_uri("did:plc:alice", "postA");
        let uri1 = AtUri::make("did:plc:bob", COLLECTION, "1");
        let uri2 = AtUri::make("did:plc:bob", COLLECTION, "2");
        index(&db, &processor, &uri1, &like(&subject), "t1");
        index(&db, &processor, &uri2, &like(&subject), "t2");

        let events = delete(&db, &processor, &uri1);
        assert!(events.is_empty());
        assert_eq!(canonical_uris(&db), vec![uri2.to_string()]);
        assert!(duplicates(&db).is_empty());

        let events = delete(&db, &processor, &uri2);
        assert_eq!(events, vec![tidemark_core::delete_notifications(uri2.clone())]);
        assert!(canonical_uris(&db).is_empty());
    }

    #[test]
    fn test_promoted_row_keeps_its_own_identity() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let subject = post_uri("did:plc:alice", "postA");
        let uri1 = AtUri::make("did:plc:bob", COLLECTION, "1");
        let uri2 = AtUri::make("did:plc:bob", COLLECTION, "2");
        index(&db, &processor, &uri1, &like(&subject), "t1");
        index(&db, &processor, &uri2, &like(&subject), "t2");
        delete(&db, &processor, &uri1);

        let (cid, indexed_at): (String, String) = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT cid, indexed_at FROM feed_like WHERE uri = ?1",
                    [uri2.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(cid, cid_for(uri2.to_string().as_bytes()).to_string());
        assert_eq!(indexed_at, "t2");
    }

    #[test]
    fn test_promotion_order_and_repointing() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let subject = post_uri("did:plc:alice", "postA");
        let uris: Vec<AtUri> = ["a", "b", "c", "d"]
            .iter()
            .map(|rkey| AtUri::make("did:plc:bob", COLLECTION, *rkey))
            .collect();

        index(&db, &processor, &uris[0], &like(&subject), "t1");
        // Out of key order on purpose: "d" was indexed before "b" and "c"
        index(&db, &processor, &uris[3], &like(&subject), "t2");
        index(&db, &processor, &uris[1], &like(&subject), "t3");
        index(&db, &processor, &uris[2], &like(&subject), "t3");

        delete(&db, &processor, &uris[0]);
        assert_eq!(canonical_uris(&db), vec![uris[3].to_string()]);
        assert_eq!(
            duplicates(&db),
            vec![
                (uris[1].to_string(), uris[3].to_string()),
                (uris[2].to_string(), uris[3].to_string()),
            ]
        );

        // Same indexed_at: insertion order breaks the tie
        delete(&db, &processor, &uris[3]);
        assert_eq!(canonical_uris(&db), vec![uris[1].to_string()]);
        assert_eq!(duplicates(&db), vec![(uris[2].to_string(), uris[1].to_string())]);
    }

    #[test]
    fn test_delete_duplicate_only_removes_reference() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let subject = post_uri("did:plc:alice", "postA");
        let uri1 = AtUri::make("did:plc:bob", COLLECTION, "1");
        let uri2 = AtUri::make("did:plc:bob", COLLECTION, "2");
        index(&db, &processor, &uri1, &like(&subject), "t1");
        index(&db, &processor, &uri2, &like(&subject), "t2");

        let events = delete(&db, &processor, &uri2);
        assert!(events.is_empty());
        assert_eq!(canonical_uris(&db), vec![uri1.to_string()]);
        assert!(duplicates(&db).is_empty());

        // With no duplicate left the canonical delete retracts notifications
        let events = delete(&db, &processor, &uri1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_replayed_insert_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let subject = post_uri("did:plc:alice", "postA");
        let uri1 = AtUri::make("did:plc:bob", COLLECTION, "1");
        let uri2 = AtUri::make("did:plc:bob", COLLECTION, "2");

        assert_eq!(index(&db, &processor, &uri1, &like(&subject), "t1").len(), 1);
        assert!(index(&db, &processor, &uri1, &like(&subject), "t9").is_empty());
        index(&db, &processor, &uri2, &like(&subject), "t2");
        assert!(index(&db, &processor, &uri2, &like(&subject), "t9").is_empty());

        assert_eq!(canonical_uris(&db), vec![uri1.to_string()]);
        assert_eq!(duplicates(&db), vec![(uri2.to_string(), uri1.to_string())]);
    }

    #[test]
    fn test_delete_unknown_uri_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let uri = AtUri::make("did:plc:bob", COLLECTION, "missing");
        assert!(delete(&db, &processor, &uri).is_empty());
    }

    #[test]
    fn test_rejects_wrong_type() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let uri = AtUri::make("did:plc:bob", COLLECTION, "1");
        let record = ipld_record("app.bsky.feed.post", serde_json::json!({ "text": "hi" }));

        let err = db
            .transaction(|tx| {
                processor.index_record(tx, &uri, &cid_for(b"x"), &record, WriteOpAction::Create, "t")
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { .. }));
    }

    #[test]
    fn test_rejects_malformed_record() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(LikePlugin);
        let uri = AtUri::make("did:plc:bob", COLLECTION, "1");
        let record = ipld_record(COLLECTION, serde_json::json!({ "createdAt": "now" }));

        let err = db
            .transaction(|tx| {
                processor.index_record(tx, &uri, &cid_for(b"x"), &record, WriteOpAction::Create, "t")
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecord { .. }));
        assert!(canonical_uris(&db).is_empty());
    }
}
