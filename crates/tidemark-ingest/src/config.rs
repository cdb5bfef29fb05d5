//! Subscription configuration.

use crate::subscription::{LeaderConfig, METHOD, REPO_SUB_ID, ReconnectConfig, RetryPolicy};

/// Configuration for one [`RepoSubscription`](crate::subscription::RepoSubscription).
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Base URL of the upstream stream, e.g. `wss://bsky.network`.
    pub service: String,
    /// XRPC method of the stream.
    pub method: String,
    /// Lease id shared by every instance of this subscription.
    pub subscription_id: i64,
    /// Lease holder name; a random one is generated when unset.
    pub holder: Option<String>,
    /// Delay between supervisor cycles.
    pub retry: RetryPolicy,
    /// Backoff between transport reconnects within a cycle.
    pub reconnect: ReconnectConfig,
    pub leader: LeaderConfig,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            service: "wss://bsky.network".to_string(),
            method: METHOD.to_string(),
            subscription_id: REPO_SUB_ID,
            holder: None,
            retry: RetryPolicy::default(),
            reconnect: ReconnectConfig::default(),
            leader: LeaderConfig::default(),
        }
    }
}

impl SubscriptionConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }
}
