//! Typed repository write operations.
//!
//! A commit on the stream lists per-path ops (`create`, `update`, `delete`).
//! After the record payloads are resolved from the commit's block bundle each
//! op becomes a [`PreparedWrite`].

use crate::error::{Error, Result};
use crate::uri::AtUri;
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The action carried by a repo op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOpAction {
    Create,
    Update,
    Delete,
}

impl WriteOpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOpAction::Create => "create",
            WriteOpAction::Update => "update",
            WriteOpAction::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteOpAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(WriteOpAction::Create),
            "update" => Ok(WriteOpAction::Update),
            "delete" => Ok(WriteOpAction::Delete),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

/// A record payload resolved from the block bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub uri: AtUri,
    /// Content hash of the record's DAG-CBOR encoding.
    pub cid: Cid,
    pub record: Ipld,
    /// Blobs referenced anywhere inside the record.
    pub blobs: Vec<Cid>,
}

/// One decoded write, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedWrite {
    Create(PreparedRecord),
    Update(PreparedRecord),
    Delete { uri: AtUri },
}

impl PreparedWrite {
    pub fn action(&self) -> WriteOpAction {
        match self {
            PreparedWrite::Create(_) => WriteOpAction::Create,
            PreparedWrite::Update(_) => WriteOpAction::Update,
            PreparedWrite::Delete { .. } => WriteOpAction::Delete,
        }
    }

    pub fn uri(&self) -> &AtUri {
        match self {
            PreparedWrite::Create(r) | PreparedWrite::Update(r) => &r.uri,
            PreparedWrite::Delete { uri } => uri,
        }
    }

    /// Collection the write targets, used to pick a record plugin.
    pub fn collection(&self) -> Option<&str> {
        self.uri().collection()
    }
}
