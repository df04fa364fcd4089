//! Connectivity monitor.
//!
//! Owns the single decision of *when* the sync engine runs: probes the
//! backend health endpoint, tracks online/offline transitions, drains the
//! queue on reconnect, and keeps retrying pending items while online. Also
//! the UI's window into sync state — pending counts, in-flight flag, and
//! the last-synced timestamp — plus a manual trigger for user-initiated
//! retry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::Backend;
use crate::error::{CoreError, CoreResult};
use crate::queue::{OfflineQueue, PendingCounts};
use crate::sync::{SyncEngine, SyncReport};

/// Snapshot of connectivity and sync state for display.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending: PendingCounts,
    pub pending_total: usize,
    pub last_synced: Option<DateTime<Utc>>,
}

pub struct ConnectivityMonitor {
    backend: Arc<dyn Backend>,
    queue: OfflineQueue,
    engine: Arc<SyncEngine>,
    is_online: AtomicBool,
    is_running: Arc<AtomicBool>,
}

impl ConnectivityMonitor {
    pub fn new(backend: Arc<dyn Backend>, queue: OfflineQueue, engine: Arc<SyncEngine>) -> Self {
        Self {
            backend,
            queue,
            engine,
            // Pessimistic until the first probe answers; writes issued
            // before that simply take the queue path.
            is_online: AtomicBool::new(false),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::SeqCst)
    }

    /// Probe the backend once and handle the transition: a reconnect
    /// triggers one sync pass, going offline only updates state. Returns
    /// the observed connectivity.
    pub async fn probe(&self) -> bool {
        let online = self.backend.health_check().await;
        let was_online = self.is_online.swap(online, Ordering::SeqCst);

        if online && !was_online {
            let pending = self.queue.pending_count().unwrap_or(0);
            info!(pending, "Network restored; draining offline queue");
            if let Err(e) = self.engine.run_pass().await {
                warn!("reconnect sync failed: {e}");
            }
        } else if !online && was_online {
            info!("Network lost; new writes will queue locally");
        }

        online
    }

    /// User-initiated retry. Probes first so the answer reflects reality,
    /// then runs one pass and reports the aggregate counts.
    pub async fn trigger_sync(&self) -> CoreResult<SyncReport> {
        let online = self.backend.health_check().await;
        self.is_online.store(online, Ordering::SeqCst);
        if !online {
            return Err(CoreError::Network(
                "backend unreachable; queued items kept for retry".into(),
            ));
        }
        self.engine.run_pass().await
    }

    pub fn status(&self) -> CoreResult<SyncStatus> {
        let pending = self.queue.counts_by_kind()?;
        Ok(SyncStatus {
            is_online: self.is_online(),
            is_syncing: self.engine.is_syncing(),
            pending,
            pending_total: pending.total(),
            last_synced: self.engine.last_synced(),
        })
    }

    /// Start the background loop: probe, handle transitions, and keep
    /// retrying pending items while online. Idempotent — a second start
    /// while running is a no-op.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = Arc::clone(self);
        let is_running = Arc::clone(&self.is_running);

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Connectivity monitor started");

            loop {
                if !is_running.load(Ordering::SeqCst) {
                    info!("Connectivity monitor stopped");
                    break;
                }

                let online = monitor.probe().await;

                // Retry policy: while online, failed items are walked again
                // every cycle (unbounded, no backoff).
                if online {
                    let pending = monitor.queue.pending_count().unwrap_or(0);
                    if pending > 0 {
                        match monitor.engine.run_pass().await {
                            Ok(report) if report.failed > 0 => {
                                warn!(
                                    failed = report.failed,
                                    "sync pass left items queued; will retry"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => warn!("periodic sync failed: {e}"),
                        }
                    }
                }

                tokio::time::sleep(interval).await;
            }
        });
    }

    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
