//! Core types and shared utilities for the tidemark repo-stream indexer.
//!
//! This crate provides:
//! - Record URIs (`at://repo/collection/rkey`)
//! - Typed repository write operations
//! - Derived event messages handed to downstream sinks
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod message;
pub mod metrics;
mod uri;
mod write;

pub use error::{Error, Result};
pub use message::{
    Message, Notification, NotificationReason, create_notification, delete_notifications,
};
pub use uri::AtUri;
pub use write::{PreparedRecord, PreparedWrite, WriteOpAction};

/// Re-exported so downstream crates name the same CID and IPLD types.
pub use ipld_core::{cid::Cid, ipld::Ipld};
