//! Health check endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::subscription::RepoSubscription;

/// Health check response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Durable cursor, `None` when the store could not be read.
    pub cursor: Option<i64>,
    /// Whether this instance currently holds the subscription lease.
    pub leader: bool,
}

/// Reports the durable cursor and leadership of the subscription.
///
/// Answers 503 when the cursor cannot be read.
pub async fn health_check(
    State(subscription): State<Arc<RepoSubscription>>,
) -> (StatusCode, Json<HealthResponse>) {
    let leader = subscription.is_leader();
    match subscription.get_state().await {
        Ok(state) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
                cursor: Some(state.cursor),
                leader,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read subscription state");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    version: env!("CARGO_PKG_VERSION"),
                    cursor: None,
                    leader,
                }),
            )
        }
    }
}

pub fn router(subscription: Arc<RepoSubscription>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(subscription)
}

/// Serve [`router`] on `port` in the background.
pub async fn start_health_server(
    port: u16,
    subscription: Arc<RepoSubscription>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health server listening on http://{}/health", addr);

    let app = router(subscription);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Health server stopped: {}", e);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionConfig;
    use crate::db::Database;
    use crate::indexing::IndexingService;
    use crate::sink::LogSink;
    use crate::testing::ScriptedTransport;

    #[tokio::test]
    async fn test_health_reports_cursor() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sub = Arc::new(RepoSubscription::new(
            SubscriptionConfig::default(),
            db,
            Arc::new(IndexingService::new()),
            Arc::new(ScriptedTransport::new(Vec::new())),
            Arc::new(LogSink),
        ));

        let (status, Json(body)) = health_check(State(sub)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "ok");
        assert_eq!(body.cursor, Some(0));
        assert!(!body.leader);
    }
}
