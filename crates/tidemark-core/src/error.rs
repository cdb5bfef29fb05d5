//! Error types shared across tidemark crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while parsing the shared vocabulary types.
#[derive(Error, Debug)]
pub enum Error {
    /// A resource identifier could not be parsed.
    #[error("invalid uri '{uri}': {reason}")]
    InvalidUri {
        /// The offending input.
        uri: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// A repo operation carried an action other than create/update/delete.
    #[error("unknown repo op action: {0}")]
    UnknownAction(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_uri_display() {
        let err = Error::InvalidUri {
            uri: "http://nope".to_string(),
            reason: "missing at:// scheme",
        };
        let msg = err.to_string();
        assert!(msg.contains("http://nope"));
        assert!(msg.contains("missing at:// scheme"));
    }

    #[test]
    fn test_unknown_action_display() {
        let err = Error::UnknownAction("upsert".to_string());
        assert_eq!(err.to_string(), "unknown repo op action: upsert");
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
