//! Supervisor for the repo-commit subscription.
//!
//! [`RepoSubscription::run`] loops until destroyed. Each cycle takes the
//! subscription lease, consumes the stream (extract, apply, emit) and, when
//! anything fails, releases the lease and waits a jittered delay before the
//! next cycle. Another instance may hold the lease meanwhile; the loop then
//! just keeps retrying on the same schedule.

use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::coordinator::TransactionCoordinator;
use super::extract::get_ops;
use super::leader::{Leader, LeaderRun};
use super::state::{StateStore, SubscriptionState};
use super::stream::{RepoStream, StreamTransport};
use crate::config::SubscriptionConfig;
use crate::db::Database;
use crate::indexing::IndexingService;
use crate::sink::{EventSink, emit_all};
use crate::{Error, Result};

pub struct RepoSubscription {
    config: SubscriptionConfig,
    state: StateStore,
    leader: Leader,
    coordinator: TransactionCoordinator,
    transport: Arc<dyn StreamTransport>,
    sink: Arc<dyn EventSink>,
    shutdown: Mutex<CancellationToken>,
    run_lock: tokio::sync::Mutex<()>,
}

impl RepoSubscription {
    pub fn new(
        config: SubscriptionConfig,
        db: Arc<Database>,
        indexing: Arc<IndexingService>,
        transport: Arc<dyn StreamTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let state = StateStore::new(Arc::clone(&db), &config.service, &config.method);
        let leader = match &config.holder {
            Some(holder) => Leader::with_holder(
                config.subscription_id,
                Arc::clone(&db),
                config.leader.clone(),
                holder.clone(),
            ),
            None => Leader::new(config.subscription_id, Arc::clone(&db), config.leader.clone()),
        };
        let coordinator =
            TransactionCoordinator::new(db, indexing, state.clone()).with_lease(leader.lease());

        Self {
            config,
            state,
            leader,
            coordinator,
            transport,
            sink,
            shutdown: Mutex::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Lease holder name of this instance.
    pub fn holder(&self) -> &str {
        self.leader.holder()
    }

    /// Whether this instance currently holds the lease and is consuming.
    pub fn is_leader(&self) -> bool {
        self.leader.is_running()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.lock().is_cancelled()
    }

    /// Run the supervisor loop until [`destroy`](Self::destroy) is called.
    ///
    /// Concurrent calls on the same instance queue behind each other.
    pub async fn run(&self) {
        let _running = self.run_lock.lock().await;
        let token = self.shutdown.lock().clone();

        gauge!("subscription_running").set(1.0);
        tracing::info!(
            service = %self.config.service,
            holder = %self.leader.holder(),
            "Starting repo subscription"
        );

        while !token.is_cancelled() {
            match self.leader.run(&token, |cycle| self.consume(cycle)).await {
                Ok(LeaderRun::Ran(())) => {
                    if !token.is_cancelled() {
                        counter!("subscription_errors_total", "kind" => "completed").increment(1);
                        tracing::error!(
                            service = %self.config.service,
                            "Repo sub completed, but should be persistent"
                        );
                    }
                }
                Ok(LeaderRun::Busy) => {
                    tracing::debug!(service = %self.config.service, "Another instance holds the subscription");
                }
                Err(e) if token.is_cancelled() && e.is_cancelled() => {}
                Err(e) => self.report(&e),
            }

            if token.is_cancelled() {
                break;
            }
            let delay = self.config.retry.delay();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        gauge!("subscription_running").set(0.0);
        tracing::info!(service = %self.config.service, "Repo subscription stopped");
    }

    /// One leadership tenure: pull, extract, apply and emit until cancelled.
    async fn consume(&self, token: CancellationToken) -> Result<()> {
        let mut stream = RepoStream::new(
            Arc::clone(&self.transport),
            self.state.clone(),
            self.config.reconnect.clone(),
            token.clone(),
        );

        while let Some(item) = stream.next().await {
            let msg = item?;
            let ops = get_ops(&msg).map_err(|e| Error::processing(&msg, e))?;
            let events = self
                .coordinator
                .apply(&msg, ops, &token)
                .await
                .map_err(|e| Error::processing(&msg, e))?;
            emit_all(self.sink.as_ref(), events).await;
        }
        Ok(())
    }

    fn report(&self, err: &Error) {
        counter!("subscription_errors_total", "kind" => err.kind()).increment(1);
        match err {
            Error::Processing {
                seq,
                repo,
                commit,
                time,
                source,
            } => tracing::error!(
                err = %source,
                seq,
                repo = %repo,
                commit = %commit,
                time = %time,
                service = %self.config.service,
                "repo subscription errored"
            ),
            other => tracing::error!(
                err = %other,
                service = %self.config.service,
                "repo subscription errored"
            ),
        }
    }

    /// Stop the loop, abort in-flight work and release the lease. Safe to
    /// call at any time, including before `run`.
    pub fn destroy(&self) {
        self.shutdown.lock().cancel();
        self.leader.destroy();
    }

    /// Restart the loop after [`destroy`](Self::destroy).
    pub async fn resume(&self) {
        *self.shutdown.lock() = CancellationToken::new();
        self.run().await;
    }

    pub async fn get_state(&self) -> Result<SubscriptionState> {
        self.state.current().await
    }

    /// Delete the durable cursor; the next connection starts from 0.
    pub async fn reset_state(&self) -> Result<()> {
        self.state.reset().await
    }
}
