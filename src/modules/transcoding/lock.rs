use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::common::error::AdapterResult;

/// Proof of ownership handed out by `acquire`. Release and extend only act
/// while the stored value still matches, so a stale holder can never touch a
/// lease that was taken over by someone else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate(owner: &str) -> Self {
        Self(format!("{}:{}", owner, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mutual-exclusion lease over a source video, shared by all instances.
/// Leases always carry a finite TTL.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Atomic set-if-absent. `Ok(None)` means someone else holds the lease.
    async fn acquire(&self, key: &str, ttl: Duration) -> AdapterResult<Option<LeaseToken>>;

    /// Deletes the lease only if `token` still owns it. Idempotent: an absent
    /// or foreign lease is left alone and `Ok(false)` is returned.
    async fn release(&self, key: &str, token: &LeaseToken) -> AdapterResult<bool>;

    /// Deletes the lease whoever holds it. Operator use only.
    async fn force_release(&self, key: &str) -> AdapterResult<bool>;

    /// `Ok(false)` when the lease expired or changed hands.
    async fn extend(&self, key: &str, token: &LeaseToken, ttl: Duration) -> AdapterResult<bool>;

    async fn exists(&self, key: &str) -> AdapterResult<bool>;
}

pub fn lock_key(tenant_id: &str, video_id: &str) -> String {
    format!("transcode:lock:{}:{}", tenant_id, video_id)
}

/// Releases the lease when dropped unless `release` already ran, so a
/// panicking or cancelled job never keeps its lease until expiry.
pub struct LeaseGuard {
    locks: Arc<dyn LockManager>,
    key: String,
    token: LeaseToken,
    released: bool,
}

impl LeaseGuard {
    pub fn new(locks: Arc<dyn LockManager>, key: String, token: LeaseToken) -> Self {
        Self {
            locks,
            key,
            token,
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    pub async fn release(mut self) {
        self.released = true;
        match self.locks.release(&self.key, &self.token).await {
            Ok(true) => debug!(key = %self.key, "Lease released"),
            Ok(false) => debug!(key = %self.key, "Lease already gone or taken over"),
            Err(e) => warn!(key = %self.key, "Failed to release lease, it will expire: {}", e),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let locks = self.locks.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(key = %key, "Lease guard dropped without release, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = locks.release(&key, &token).await {
                        warn!(key = %key, "Background lease release failed, it will expire: {}", e);
                    }
                });
            }
            Err(_) => warn!(key = %key, "No runtime to release lease, it will expire"),
        }
    }
}

/// Periodically extends a lease while a job runs. If an extension fails the
/// job token is cancelled and `stop` reports the loss.
pub struct Heartbeat {
    stop: CancellationToken,
    lost: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(
        locks: Arc<dyn LockManager>,
        key: String,
        lease: LeaseToken,
        ttl: Duration,
        interval: Duration,
        job_token: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn({
            let stop = stop.clone();
            let lost = lost.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // First tick fires immediately; the lease was just acquired.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match locks.extend(&key, &lease, ttl).await {
                        Ok(true) => debug!(key = %key, "Lease extended"),
                        Ok(false) => {
                            error!(key = %key, "Lease no longer held, abandoning job");
                            lost.store(true, Ordering::SeqCst);
                            job_token.cancel();
                            break;
                        }
                        Err(e) => {
                            error!(key = %key, "Lease extension failed, abandoning job: {}", e);
                            lost.store(true, Ordering::SeqCst);
                            job_token.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Self { stop, lost, handle }
    }

    /// Stops the ticker and waits for it. Returns whether the lease was lost.
    pub async fn stop(self) -> bool {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        self.lost.load(Ordering::SeqCst)
    }
}
