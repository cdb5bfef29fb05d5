//! Durable subscription cursor.
//!
//! One row per (service, method) in the `subscription` table, holding the
//! state as JSON. The cursor is only written inside the transaction that
//! applied the message it points at; see [`StateStore::set_state`].

use std::sync::Arc;

use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::db::Database;

/// Persisted subscription progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    /// Sequence number of the last fully applied message.
    pub cursor: i64,
}

/// Reads and writes the cursor for one (service, method) pair.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    service: String,
    method: String,
}

impl StateStore {
    pub fn new(db: Arc<Database>, service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            db,
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Current durable state; a missing row reads as cursor 0.
    pub fn get_state(&self) -> Result<SubscriptionState> {
        self.db.with_conn(|conn| {
            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM subscription WHERE service = ?1 AND method = ?2",
                    params![self.service, self.method],
                    |row| row.get(0),
                )
                .optional()?;
            match state {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Ok(SubscriptionState::default()),
            }
        })
    }

    /// Forget the stored cursor so the next connection starts from 0.
    pub fn reset_state(&self) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM subscription WHERE service = ?1 AND method = ?2",
                params![self.service, self.method],
            )?;
            Ok(())
        })
    }

    /// Async [`get_state`](Self::get_state), run off the runtime.
    pub async fn current(&self) -> Result<SubscriptionState> {
        let store = self.clone();
        self.db.call(move |_| store.get_state()).await
    }

    /// Async [`reset_state`](Self::reset_state), run off the runtime.
    pub async fn reset(&self) -> Result<()> {
        let store = self.clone();
        self.db.call(move |_| store.reset_state()).await
    }

    /// Write `state` within `tx`: update the existing row, else insert one.
    pub fn set_state(&self, tx: &Transaction<'_>, state: SubscriptionState) -> Result<()> {
        let json = serde_json::to_string(&state)?;
        let updated = tx.execute(
            "UPDATE subscription SET state = ?3 WHERE service = ?1 AND method = ?2",
            params![self.service, self.method, json],
        )?;
        if updated < 1 {
            tx.execute(
                "INSERT INTO subscription (service, method, state) VALUES (?1, ?2, ?3)",
                params![self.service, self.method, json],
            )?;
        }
        Ok(())
    }
}
