//! Record resource identifiers.
//!
//! A record is addressed by `at://<repo>/<collection>/<rkey>`. The repository
//! part (`host`) is the DID of the repo that owns the record. Subjects of some
//! records point at a bare repo (`at://did:plc:abc`), so collection and record
//! key are optional when parsing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SCHEME: &str = "at://";

/// A parsed `at://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AtUri {
    host: String,
    collection: Option<String>,
    rkey: Option<String>,
}

impl AtUri {
    /// Build the URI of a record from its three components.
    pub fn make(host: impl Into<String>, collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            collection: Some(collection.into()),
            rkey: Some(rkey.into()),
        }
    }

    /// Repository identity (DID) the record lives in.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Collection NSID, e.g. `app.bsky.feed.like`.
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Record key within the collection.
    pub fn rkey(&self) -> Option<&str> {
        self.rkey.as_deref()
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SCHEME, self.host)?;
        if let Some(collection) = &self.collection {
            write!(f, "/{}", collection)?;
            if let Some(rkey) = &self.rkey {
                write!(f, "/{}", rkey)?;
            }
        }
        Ok(())
    }
}

impl FromStr for AtUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidUri {
            uri: s.to_string(),
            reason,
        };

        let rest = s.strip_prefix(SCHEME).ok_or_else(|| invalid("missing at:// scheme"))?;
        let rest = rest.trim_end_matches('/');
        let mut parts = rest.split('/');

        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing repository"))?;
        let collection = parts.next().filter(|c| !c.is_empty());
        let rkey = parts.next().filter(|r| !r.is_empty());

        if parts.next().is_some() {
            return Err(invalid("too many path segments"));
        }
        if collection.is_none() && rkey.is_some() {
            return Err(invalid("record key without collection"));
        }

        Ok(Self {
            host: host.to_string(),
            collection: collection.map(str::to_string),
            rkey: rkey.map(str::to_string),
        })
    }
}

impl TryFrom<String> for AtUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AtUri> for String {
    fn from(uri: AtUri) -> Self {
        uri.to_string()
    }
}
