//! Applies one stream message atomically.
//!
//! Every op of a message and the cursor advance to its `seq` share a single
//! transaction. Either all of it commits or none of it does, so the durable
//! cursor never runs ahead of the indexed data. When built with a [`Lease`],
//! the transaction also re-checks that lease before committing, so a holder
//! whose lease expired mid-tenure cannot write alongside its successor.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use tidemark_core::{Message, PreparedWrite};
use tokio_util::sync::CancellationToken;

use super::leader::Lease;
use super::state::{StateStore, SubscriptionState};
use super::stream::StreamMessage;
use crate::db::Database;
use crate::indexing::IndexingService;
use crate::{Error, Result};

pub struct TransactionCoordinator {
    db: Arc<Database>,
    indexing: Arc<IndexingService>,
    state: StateStore,
    lease: Option<Lease>,
}

impl TransactionCoordinator {
    pub fn new(db: Arc<Database>, indexing: Arc<IndexingService>, state: StateStore) -> Self {
        Self {
            db,
            indexing,
            state,
            lease: None,
        }
    }

    /// Fence every transaction on `lease`.
    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Apply `ops` of `msg` and advance the cursor to `msg.seq`.
    ///
    /// Returns the events produced, to be emitted by the caller now that the
    /// transaction has committed. A cancelled `token` aborts between ops and
    /// rolls everything back, as does a lease that is no longer held.
    pub async fn apply(
        &self,
        msg: &StreamMessage,
        ops: Vec<PreparedWrite>,
        token: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let started = Instant::now();
        let indexing = Arc::clone(&self.indexing);
        let state = self.state.clone();
        let lease = self.lease.clone();
        let token = token.clone();
        let (seq, time) = (msg.seq, msg.time.clone());

        let actions: Vec<&'static str> = ops.iter().map(|op| op.action().as_str()).collect();

        let events = self
            .db
            .call(move |db| {
                db.transaction(|tx| {
                    let mut events = Vec::new();
                    for op in &ops {
                        if token.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        events.extend(indexing.apply_write(tx, op, &time)?);
                    }
                    if let Some(lease) = &lease {
                        lease.verify(tx)?;
                    }
                    state.set_state(tx, SubscriptionState { cursor: seq })?;
                    Ok(events)
                })
            })
            .await?;

        for action in actions {
            counter!("subscription_ops_total", "action" => action).increment(1);
        }
        counter!("subscription_messages_total").increment(1);
        gauge!("subscription_cursor").set(seq as f64);
        histogram!("subscription_apply_seconds").record(started.elapsed().as_secs_f64());

        tracing::trace!(seq, events = events.len(), "Applied message");
        Ok(events)
    }
}
