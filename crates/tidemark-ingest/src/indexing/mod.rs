//! Record indexing: the generic processor and its per-collection plugins.

pub mod plugins;
pub mod processor;

use std::collections::HashMap;

use rusqlite::Transaction;
use tidemark_core::{Message, PreparedWrite};

use crate::Result;
pub use processor::{RecordHandler, RecordPlugin, RecordProcessor};

/// Static mapping from collection NSID to its record handler.
pub struct IndexingService {
    handlers: HashMap<&'static str, Box<dyn RecordHandler>>,
}

impl Default for IndexingService {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexingService {
    /// Service with every built-in plugin registered.
    pub fn new() -> Self {
        let mut service = Self::empty();
        service.register(RecordProcessor::new(plugins::LikePlugin));
        service.register(RecordProcessor::new(plugins::FollowPlugin));
        service
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: impl RecordHandler + 'static) {
        self.handlers.insert(handler.collection(), Box::new(handler));
    }

    pub fn handler(&self, collection: &str) -> Option<&dyn RecordHandler> {
        self.handlers.get(collection).map(|h| h.as_ref())
    }

    pub fn collections(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Apply one write inside `tx`, returning the events it produced.
    ///
    /// Writes to collections without a handler are ignored.
    pub fn apply_write(
        &self,
        tx: &Transaction<'_>,
        write: &PreparedWrite,
        timestamp: &str,
    ) -> Result<Vec<Message>> {
        let Some(handler) = write.collection().and_then(|c| self.handler(c)) else {
            tracing::trace!(uri = %write.uri(), "No handler for collection, skipping");
            return Ok(Vec::new());
        };

        match write {
            PreparedWrite::Create(r) | PreparedWrite::Update(r) => {
                handler.index_record(tx, &r.uri, &r.cid, &r.record, write.action(), timestamp)
            }
            PreparedWrite::Delete { uri } => handler.delete_record(tx, uri),
        }
    }
}
