//! The repo-commit subscription.
//!
//! - [`stream`] - Frame decoding, transports and the reconnecting [`RepoStream`]
//! - [`car`] - Block bundle reader
//! - [`extract`] - Commit ops to [`PreparedWrite`](tidemark_core::PreparedWrite)s
//! - [`coordinator`] - One transaction per message, cursor included
//! - [`leader`] - Lease-based leader election
//! - [`state`] - Durable cursor
//! - [`repo`] - The supervisor loop tying it together

pub mod backoff;
pub mod car;
pub mod coordinator;
pub mod extract;
pub mod leader;
pub mod repo;
pub mod state;
pub mod stream;

pub use backoff::{ReconnectConfig, Reconnector, RetryPolicy};
pub use coordinator::TransactionCoordinator;
pub use extract::get_ops;
pub use leader::{Leader, LeaderConfig, LeaderRun, REPO_SUB_ID};
pub use repo::RepoSubscription;
pub use state::{StateStore, SubscriptionState};
pub use stream::{
    FrameStream, METHOD, RepoOp, RepoStream, StreamMessage, StreamTransport, WebSocketTransport,
};
