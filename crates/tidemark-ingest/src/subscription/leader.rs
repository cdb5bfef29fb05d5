//! Database-backed leader election.
//!
//! A lease row in `subscription_lease` grants one process the right to run the
//! consumption loop for a subscription id. A lease is granted when no row
//! exists or the existing one has expired. Rows are owned by a token unique to
//! each [`Leader`], so two processes configured with the same holder name still
//! exclude each other. The holder renews the lease periodically while the body
//! runs; failing to renew trips the body's cancellation token. Writers fence
//! their transactions with [`Lease::verify`] to close the gap between an
//! expiry and the next renewal tick.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::{Error, Result};

/// Lease id of the repo subscription.
pub const REPO_SUB_ID: i64 = 1000;

/// Lease timing.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// How long a lease stays valid without renewal.
    pub ttl: Duration,
    /// How often the holder renews. Should be well under `ttl`.
    pub renew_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(30))
    }
}

impl LeaderConfig {
    /// Renew every third of the ttl.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            renew_interval: ttl / 3,
        }
    }
}

/// Outcome of [`Leader::run`].
#[derive(Debug, PartialEq, Eq)]
pub enum LeaderRun<T> {
    /// The lease was acquired and the body ran to completion.
    Ran(T),
    /// Another holder has the lease; the body was not invoked.
    Busy,
}

/// Identity of one elector's claim on a lease id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    id: i64,
    token: String,
}

impl Lease {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Fails with [`Error::Leadership`] unless this claim holds a live lease.
    ///
    /// Run it inside a write transaction: SQLite serializes writers, so the
    /// lease cannot change hands before that transaction commits.
    pub fn verify(&self, conn: &Connection) -> Result<()> {
        let held = conn
            .query_row(
                "SELECT 1 FROM subscription_lease WHERE id = ?1 AND token = ?2 AND expires_at > ?3",
                params![self.id, self.token, now_ms()],
                |_| Ok(()),
            )
            .optional()?;
        held.ok_or_else(|| Error::Leadership(format!("lease {} is no longer held", self.id)))
    }
}

/// Exclusive, cancellable ownership of a named subscription.
pub struct Leader {
    id: i64,
    holder: String,
    token: String,
    db: Arc<Database>,
    config: LeaderConfig,
    current: Mutex<Option<CancellationToken>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn try_acquire(conn: &Connection, lease: &Lease, holder: &str, ttl: Duration) -> Result<bool> {
    let now = now_ms();
    let changed = conn.execute(
        "INSERT INTO subscription_lease (id, holder, token, acquired_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (id) DO UPDATE SET
             holder = excluded.holder,
             token = excluded.token,
             acquired_at = excluded.acquired_at,
             expires_at = excluded.expires_at
         WHERE subscription_lease.expires_at <= ?4
            OR subscription_lease.token = ?3",
        params![lease.id, holder, lease.token, now, now.saturating_add(ttl_ms(ttl))],
    )?;
    Ok(changed == 1)
}

fn renew(conn: &Connection, lease: &Lease, ttl: Duration) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE subscription_lease SET expires_at = ?3 WHERE id = ?1 AND token = ?2",
        params![lease.id, lease.token, now_ms().saturating_add(ttl_ms(ttl))],
    )?;
    Ok(changed == 1)
}

fn release(conn: &Connection, lease: &Lease) -> Result<()> {
    conn.execute(
        "DELETE FROM subscription_lease WHERE id = ?1 AND token = ?2",
        params![lease.id, lease.token],
    )?;
    Ok(())
}

impl Leader {
    pub fn new(id: i64, db: Arc<Database>, config: LeaderConfig) -> Self {
        Self::with_holder(id, db, config, format!("tidemark-{}", uuid::Uuid::new_v4()))
    }

    pub fn with_holder(
        id: i64,
        db: Arc<Database>,
        config: LeaderConfig,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            id,
            holder: holder.into(),
            token: uuid::Uuid::new_v4().to_string(),
            db,
            config,
            current: Mutex::new(None),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// This elector's claim, for fencing writes made under the lease.
    pub fn lease(&self) -> Lease {
        Lease {
            id: self.id,
            token: self.token.clone(),
        }
    }

    /// Holder of the live lease for this id, if any.
    pub fn current_holder(&self) -> Result<Option<String>> {
        let id = self.id;
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT holder FROM subscription_lease WHERE id = ?1 AND expires_at > ?2",
                    params![id, now_ms()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Whether a body is currently running under this leader.
    pub fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Acquire the lease and run `body` while holding it.
    ///
    /// `body` receives a child of `parent` that is cancelled when the lease is
    /// lost or [`destroy`](Self::destroy) is called. The lease is released on
    /// every exit path. Returns [`LeaderRun::Busy`] without invoking `body` when
    /// another holder has the lease.
    pub async fn run<T, F, Fut>(&self, parent: &CancellationToken, body: F) -> Result<LeaderRun<T>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (lease, holder, ttl) = (self.lease(), self.holder.clone(), self.config.ttl);
        let acquired = self
            .db
            .call(move |db| db.with_conn(|conn| try_acquire(conn, &lease, &holder, ttl)))
            .await?;

        if !acquired {
            counter!("subscription_leader_busy_total").increment(1);
            tracing::debug!(id = self.id, "Subscription lease held elsewhere");
            return Ok(LeaderRun::Busy);
        }

        counter!("subscription_leader_acquired_total").increment(1);
        gauge!("subscription_is_leader").set(1.0);
        tracing::info!(id = self.id, holder = %self.holder, "Acquired subscription lease");

        let token = parent.child_token();
        *self.current.lock() = Some(token.clone());

        let lost = Arc::new(AtomicBool::new(false));
        let renewal = tokio::spawn(renew_loop(
            Arc::clone(&self.db),
            self.lease(),
            self.holder.clone(),
            self.config.clone(),
            token.clone(),
            Arc::clone(&lost),
        ));

        let result = body(token.clone()).await;

        // Stops the renewal task as well
        token.cancel();
        if let Err(e) = renewal.await {
            tracing::warn!(error = %e, "Lease renewal task failed");
        }
        *self.current.lock() = None;
        gauge!("subscription_is_leader").set(0.0);

        let lease = self.lease();
        match self
            .db
            .call(move |db| db.with_conn(|conn| release(conn, &lease)))
            .await
        {
            Ok(()) => tracing::info!(id = self.id, "Released subscription lease"),
            Err(e) => tracing::warn!(id = self.id, error = %e, "Failed to release subscription lease"),
        }

        if lost.load(Ordering::SeqCst) {
            return Err(Error::Leadership(format!(
                "lease {} lost by {}",
                self.id, self.holder
            )));
        }
        result.map(LeaderRun::Ran)
    }

    /// Cancel the running body, if any. Safe to call at any time.
    pub fn destroy(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            token.cancel();
        }
    }
}

async fn renew_loop(
    db: Arc<Database>,
    lease: Lease,
    holder: String,
    config: LeaderConfig,
    token: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(config.renew_interval);
    // The first tick completes immediately; the lease was just written
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let claim = lease.clone();
        let ttl = config.ttl;
        let renewed = db
            .call(move |db| db.with_conn(|conn| renew(conn, &claim, ttl)))
            .await;

        let reason = match renewed {
            Ok(true) => continue,
            Ok(false) => "lease taken over".to_string(),
            Err(e) => e.to_string(),
        };
        tracing::warn!(id = lease.id, holder = %holder, reason = %reason, "Lost subscription lease");
        lost.store(true, Ordering::SeqCst);
        token.cancel();
        return;
    }
}
