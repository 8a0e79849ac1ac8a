use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::broker::account_manager::AccountManager;
use crate::error::BrokerError;

const INITIAL_DELAY_SECS: u64 = 5;

#[derive(Debug, Clone, Default)]
pub struct RefreshQueueStats {
    pub refresh_count: u64,
    pub error_count: u64,
    pub last_run_ms: i64,
    pub last_error: Option<String>,
}

/// Background loop that refreshes access tokens before they expire, so the
/// request path rarely has to block on an OAuth round trip.
///
/// Refreshes run serially to avoid a refresh storm when many accounts age
/// out together. Accounts that are already expired are skipped: the request
/// path refreshes those on demand, and a duplicate refresh is last-write-wins
/// on the access token anyway.
pub struct ProactiveRefreshQueue {
    manager: Arc<AccountManager>,
    buffer_seconds: u64,
    check_interval_seconds: u64,
    refresh_count: AtomicU64,
    error_count: AtomicU64,
    last_run_ms: AtomicI64,
    last_error: parking_lot::Mutex<Option<String>>,
    task: tokio::sync::Mutex<Option<(tokio::task::JoinHandle<()>, CancellationToken)>>,
}

impl ProactiveRefreshQueue {
    pub fn new(
        manager: Arc<AccountManager>,
        buffer_seconds: u64,
        check_interval_seconds: u64,
    ) -> Self {
        Self {
            manager,
            buffer_seconds,
            check_interval_seconds,
            refresh_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_run_ms: AtomicI64::new(0),
            last_error: parking_lot::Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the loop. A second start while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::debug!("[RefreshQueue] already running, start ignored");
            return;
        }

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let queue = self.clone();
        let interval = self.check_interval_seconds.max(1);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = loop_cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(INITIAL_DELAY_SECS)) => {}
            }
            loop {
                queue.run_once().await;
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                }
            }
        });
        *task = Some((handle, cancel));
        tracing::info!(
            "[RefreshQueue] started (buffer {}s, interval {}s)",
            self.buffer_seconds,
            self.check_interval_seconds
        );
    }

    /// Stop the loop and wait for the task to wind down. Idempotent.
    pub async fn stop(&self) {
        let taken = self.task.lock().await.take();
        if let Some((handle, cancel)) = taken {
            cancel.cancel();
            let _ = handle.await;
            tracing::info!("[RefreshQueue] stopped");
        }
    }

    /// One sweep over the pool. Serial on purpose.
    pub async fn run_once(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_run_ms.store(now, Ordering::Relaxed);
        let buffer_ms = (self.buffer_seconds as i64) * 1000;

        for account in self.manager.accounts_snapshot() {
            let Some(expires) = account.expires else {
                // Never refreshed; the request path will do the first one.
                continue;
            };
            if expires <= now {
                continue;
            }
            if expires > now + buffer_ms {
                continue;
            }

            tracing::debug!(
                "[RefreshQueue] refreshing account {} ({} ms to expiry)",
                account.index,
                expires - now
            );
            match crate::modules::auth::oauth::refresh_access_token(&account.refresh_token).await
            {
                Ok(refreshed) => {
                    self.manager.update_token(&account.refresh_token, &refreshed);
                    self.refresh_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(BrokerError::InvalidGrant) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    *self.last_error.lock() = Some("invalid_grant".to_string());
                    self.manager.remove_account(&account.refresh_token);
                }
                Err(e) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    *self.last_error.lock() = Some(e.to_string());
                    tracing::warn!(
                        "[RefreshQueue] refresh failed for account {}: {}",
                        account.index,
                        e
                    );
                }
            }
        }
    }

    pub fn stats(&self) -> RefreshQueueStats {
        RefreshQueueStats {
            refresh_count: self.refresh_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_run_ms: self.last_run_ms.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}
