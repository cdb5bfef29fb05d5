//! `app.bsky.graph.follow` records. Semantic key: (creator, subject DID).

use ipld_core::cid::Cid;
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde::Deserialize;
use tidemark_core::{AtUri, Message, NotificationReason, create_notification, delete_notifications};

use crate::Result;
use crate::indexing::processor::RecordPlugin;

pub const COLLECTION: &str = "app.bsky.graph.follow";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRecord {
    /// DID of the followed account.
    pub subject: String,
    pub created_at: String,
}

/// A row of `graph_follow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFollow {
    pub uri: AtUri,
    pub cid: String,
    pub creator: String,
    pub subject_did: String,
    pub created_at: String,
    pub indexed_at: String,
}

const COLUMNS: &str = "uri, cid, creator, subject_did, created_at, indexed_at";

struct RawFollow {
    uri: String,
    cid: String,
    creator: String,
    subject_did: String,
    created_at: String,
    indexed_at: String,
}

impl RawFollow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uri: row.get(0)?,
            cid: row.get(1)?,
            creator: row.get(2)?,
            subject_did: row.get(3)?,
            created_at: row.get(4)?,
            indexed_at: row.get(5)?,
        })
    }

    fn parse(self) -> Result<IndexedFollow> {
        Ok(IndexedFollow {
            uri: self.uri.parse()?,
            cid: self.cid,
            creator: self.creator,
            subject_did: self.subject_did,
            created_at: self.created_at,
            indexed_at: self.indexed_at,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FollowPlugin;

impl RecordPlugin for FollowPlugin {
    type Record = FollowRecord;
    type Row = IndexedFollow;

    const COLLECTION: &'static str = COLLECTION;

    fn insert(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        cid: &Cid,
        record: &FollowRecord,
        timestamp: &str,
    ) -> Result<Option<IndexedFollow>> {
        tx.query_row(
            &format!(
                "INSERT INTO graph_follow ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT DO NOTHING
                 RETURNING {COLUMNS}"
            ),
            params![
                uri.to_string(),
                cid.to_string(),
                uri.host(),
                record.subject,
                record.created_at,
                timestamp
            ],
            RawFollow::from_row,
        )
        .optional()?
        .map(RawFollow::parse)
        .transpose()
    }

    fn find_duplicate(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        record: &FollowRecord,
    ) -> Result<Option<AtUri>> {
        let found: Option<String> = tx
            .query_row(
                "SELECT uri FROM graph_follow WHERE creator = ?1 AND subject_did = ?2",
                params![uri.host(), record.subject],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.map(|u| u.parse::<AtUri>()).transpose()?)
    }

    fn delete(&self, tx: &Transaction<'_>, uri: &AtUri) -> Result<Option<IndexedFollow>> {
        tx.query_row(
            &format!("DELETE FROM graph_follow WHERE uri = ?1 RETURNING {COLUMNS}"),
            [uri.to_string()],
            RawFollow::from_row,
        )
        .optional()?
        .map(RawFollow::parse)
        .transpose()
    }

    fn events_for_insert(&self, row: &IndexedFollow) -> Vec<Message> {
        vec![create_notification(
            row.subject_did.clone(),
            row.creator.clone(),
            row.uri.clone(),
            row.cid.clone(),
            NotificationReason::Follow,
            None,
        )]
    }

    fn events_for_delete(
        &self,
        deleted: &IndexedFollow,
        replacement: Option<&IndexedFollow>,
    ) -> Vec<Message> {
        if replacement.is_some() {
            return Vec::new();
        }
        vec![delete_notifications(deleted.uri.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::indexing::processor::{RecordHandler, RecordProcessor};
    use crate::testing::{cid_for, ipld_record};

    fn follow(subject: &str) -> ipld_core::ipld::Ipld {
        ipld_record(
            COLLECTION,
            serde_json::json!({ "subject": subject, "createdAt": "2024-01-01T00:00:00.000Z" }),
        )
    }

    #[test]
    fn test_follow_dedup_and_promotion() {
        let db = Database::open_in_memory().unwrap();
        let processor = RecordProcessor::new(FollowPlugin);
        let first = AtUri::make("did:plc:carol", COLLECTION, "a");
        let second = AtUri::make("did:plc:carol", COLLECTION, "b");
        let record = follow("did:plc:alice");

        let events = db
            .transaction(|tx| {
                let mut events = processor.index_record(
                    tx,
                    &first,
                    &cid_for(b"a"),
                    &record,
                    tidemark_core::WriteOpAction::Create,
                    "t1",
                )?;
                events.extend(processor.index_record(
                    tx,
                    &second,
                    &cid_for(b"b"),
                    &record,
                    tidemark_core::WriteOpAction::Create,
                    "t2",
                )?);
                Ok(events)
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Message::Notification(n) => {
                assert_eq!(n.user_did, "did:plc:alice");
                assert_eq!(n.reason, NotificationReason::Follow);
                assert!(n.reason_subject.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let events = db
            .transaction(|tx| processor.delete_record(tx, &first))
            .unwrap();
        assert!(events.is_empty());

        let canonical: String = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT uri FROM graph_follow", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(canonical, second.to_string());
    }
}
