//! `app.bsky.feed.like` records.
//!
//! Semantic key: (creator, subject uri). A like notifies the author of the
//! liked subject; deleting the last like for a key retracts that notification.

use ipld_core::cid::Cid;
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde::Deserialize;
use tidemark_core::{AtUri, Message, NotificationReason, create_notification, delete_notifications};

use crate::Result;
use crate::indexing::processor::RecordPlugin;

pub const COLLECTION: &str = "app.bsky.feed.like";

/// Reference to a specific version of a record.
#[derive(Debug, Clone, Deserialize)]
pub struct StrongRef {
    pub uri: AtUri,
    pub cid: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRecord {
    pub subject: StrongRef,
    pub created_at: String,
}

/// A row of `feed_like`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedLike {
    pub uri: AtUri,
    pub cid: String,
    pub creator: String,
    pub subject: AtUri,
    pub subject_cid: String,
    pub created_at: String,
    pub indexed_at: String,
}

const COLUMNS: &str = "uri, cid, creator, subject, subject_cid, created_at, indexed_at";

struct RawLike {
    uri: String,
    cid: String,
    creator: String,
    subject: String,
    subject_cid: String,
    created_at: String,
    indexed_at: String,
}

impl RawLike {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uri: row.get(0)?,
            cid: row.get(1)?,
            creator: row.get(2)?,
            subject: row.get(3)?,
            subject_cid: row.get(4)?,
            created_at: row.get(5)?,
            indexed_at: row.get(6)?,
        })
    }

    fn parse(self) -> Result<IndexedLike> {
        Ok(IndexedLike {
            uri: self.uri.parse()?,
            cid: self.cid,
            creator: self.creator,
            subject: self.subject.parse()?,
            subject_cid: self.subject_cid,
            created_at: self.created_at,
            indexed_at: self.indexed_at,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LikePlugin;

impl LikePlugin {
    fn notification(row: &IndexedLike) -> Message {
        create_notification(
            row.subject.host(),
            row.creator.clone(),
            row.uri.clone(),
            row.cid.clone(),
            NotificationReason::Like,
            Some(row.subject.clone()),
        )
    }
}

impl RecordPlugin for LikePlugin {
    type Record = LikeRecord;
    type Row = IndexedLike;

    const COLLECTION: &'static str = COLLECTION;

    fn insert(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        cid: &Cid,
        record: &LikeRecord,
        timestamp: &str,
    ) -> Result<Option<IndexedLike>> {
        let raw = tx
            .query_row(
                &format!(
                    "INSERT INTO feed_like ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT DO NOTHING
                     RETURNING {COLUMNS}"
                ),
                params![
                    uri.to_string(),
                    cid.to_string(),
                    uri.host(),
                    record.subject.uri.to_string(),
                    record.subject.cid,
                    record.created_at,
                    timestamp
                ],
                RawLike::from_row,
            )
            .optional()?;
        raw.map(RawLike::parse).transpose()
    }

    fn find_duplicate(
        &self,
        tx: &Transaction<'_>,
        uri: &AtUri,
        record: &LikeRecord,
    ) -> Result<Option<AtUri>> {
        let found: Option<String> = tx
            .query_row(
                "SELECT uri FROM feed_like WHERE creator = ?1 AND subject = ?2",
                params![uri.host(), record.subject.uri.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.map(|u| u.parse::<AtUri>()).transpose()?)
    }

    fn delete(&self, tx: &Transaction<'_>, uri: &AtUri) -> Result<Option<IndexedLike>> {
        let raw = tx
            .query_row(
                &format!("DELETE FROM feed_like WHERE uri = ?1 RETURNING {COLUMNS}"),
                [uri.to_string()],
                RawLike::from_row,
            )
            .optional()?;
        raw.map(RawLike::parse).transpose()
    }

    fn events_for_insert(&self, row: &IndexedLike) -> Vec<Message> {
        vec![Self::notification(row)]
    }

    fn events_for_delete(
        &self,
        deleted: &IndexedLike,
        replacement: Option<&IndexedLike>,
    ) -> Vec<Message> {
        match replacement {
            // The subject is still liked by this creator
            Some(_) => Vec::new(),
            None => vec![delete_notifications(deleted.uri.clone())],
        }
    }
}
