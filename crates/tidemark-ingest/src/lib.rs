//! Tidemark ingestion engine.
//!
//! Consumes the repo-commit stream of an upstream service, indexes the
//! records it carries into SQLite and emits derived events downstream.
//!
//! # Modules
//!
//! - [`subscription`] - Stream transport, leader election, cursor and supervisor
//! - [`indexing`] - Record processor and collection plugins
//! - [`db`] - SQLite store and schema
//! - [`sink`] - Downstream event sinks
//! - [`health`] - `/health` endpoint
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Upstream WSS   │  subscribeRepos?cursor=N
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   RepoStream    │  validate, skip invalid, reconnect with backoff
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    get_ops      │  CAR blocks -> PreparedWrite
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Coordinator    │  one transaction: record plugins + cursor
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   EventSink     │  notifications after commit
//! └─────────────────┘
//! ```
//!
//! The whole pipeline runs under a database lease so that only one instance
//! writes at a time; the others wait for it to step down.

pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod indexing;
pub mod sink;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use config::SubscriptionConfig;
pub use db::{Database, DatabaseConfig};
pub use error::{Error, Result};
pub use indexing::{IndexingService, RecordHandler, RecordPlugin, RecordProcessor};
pub use sink::{ChannelSink, EventSink, LogSink};
pub use subscription::{
    RepoSubscription, StateStore, StreamMessage, SubscriptionState, WebSocketTransport,
};
