//! Sync engine: drains the offline queue against the backend.
//!
//! One pass snapshots the pending items and replays them kind by kind in
//! FIFO order, isolating failures per item — one bad record never blocks
//! the rest of the batch. Items leave the queue only on a successful
//! server write; structurally invalid payloads are dropped immediately so
//! a poison item cannot loop forever. Retry policy is an explicit choice:
//! unbounded, no backoff — every later trigger (reconnect, manual retry)
//! walks the remaining items again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::api::{AttendanceAction, Backend};
use crate::error::{CoreError, CoreResult};
use crate::queue::{OfflineQueue, QueueItem, QueueKind, QueuePayload};
use crate::shift::ShiftManager;

/// Aggregate result of one sync pass, for user-facing feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Items replayed successfully and removed from the queue.
    pub synced: usize,
    /// Items that failed and stay queued for the next pass.
    pub failed: usize,
    /// Structurally invalid items removed without replay.
    pub dropped: usize,
}

pub struct SyncEngine {
    queue: OfflineQueue,
    shift: Arc<ShiftManager>,
    backend: Arc<dyn Backend>,
    in_flight: AtomicBool,
    last_synced: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(queue: OfflineQueue, shift: Arc<ShiftManager>, backend: Arc<dyn Backend>) -> Self {
        Self {
            queue,
            shift,
            backend,
            in_flight: AtomicBool::new(false),
            last_synced: Mutex::new(None),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// When the last completed pass finished.
    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced.lock().ok().and_then(|g| *g)
    }

    /// Run one full drain over the current queue snapshot.
    ///
    /// Single-flight: a pass started while another is running returns an
    /// empty report immediately, so two triggers can never replay the same
    /// item concurrently.
    pub async fn run_pass(&self) -> CoreResult<SyncReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync pass already in flight; skipping");
            return Ok(SyncReport::default());
        }

        let result = self.drain().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn drain(&self) -> CoreResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut session_facing_synced = 0usize;

        for kind in QueueKind::ALL {
            let items = self.queue.list_pending(Some(kind))?;
            for item in items {
                if let Err(reason) = item.payload.validate() {
                    warn!(
                        item = %item.id,
                        kind = %kind,
                        "dropping invalid queued item: {reason}"
                    );
                    self.queue.remove(&item.id)?;
                    report.dropped += 1;
                    continue;
                }

                match self.replay(&item).await {
                    Ok(()) => {
                        self.queue.remove(&item.id)?;
                        report.synced += 1;
                        if matches!(kind, QueueKind::Transaction | QueueKind::Expense) {
                            session_facing_synced += 1;
                        }
                        debug!(item = %item.id, kind = %kind, "queued item replayed");
                    }
                    Err(e) => {
                        // Item stays queued; keep walking the batch.
                        warn!(kind = %kind, "{e}");
                        report.failed += 1;
                    }
                }
            }
        }

        // Pull authoritative totals once the server has absorbed our writes,
        // so sales recorded by other devices against the same session land
        // in the local view too.
        if session_facing_synced > 0 && self.shift.is_open() {
            if let Err(e) = self.shift.refresh_from_server(&self.queue).await {
                warn!("post-sync shift refresh failed: {e}");
            }
        }

        if let Ok(mut guard) = self.last_synced.lock() {
            *guard = Some(Utc::now());
        }

        if report.synced > 0 || report.failed > 0 || report.dropped > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                dropped = report.dropped,
                "Sync pass complete"
            );
        }

        Ok(report)
    }

    /// Replay one queued item against the backend. The queue item id rides
    /// along as the idempotency identifier and `enqueued_at` reconstructs
    /// the originating time on the server record.
    async fn replay(&self, item: &QueueItem) -> CoreResult<()> {
        let originated_at = Some(item.enqueued_at);
        let outcome = match &item.payload {
            QueuePayload::Transaction(draft) => self
                .backend
                .write_transaction(draft, &item.id, originated_at)
                .await
                .map(|_| ()),
            QueuePayload::Attendance(draft) => match draft.action {
                AttendanceAction::ClockIn => self
                    .backend
                    .clock_in(draft, &item.id, originated_at)
                    .await
                    .map(|_| ()),
                AttendanceAction::ClockOut => self
                    .backend
                    .clock_out(draft, &item.id, originated_at)
                    .await
                    .map(|_| ()),
            },
            QueuePayload::Expense(draft) => self
                .backend
                .write_expense(draft, &item.id, originated_at)
                .await
                .map(|_| ()),
        };

        outcome.map_err(|e| CoreError::SyncReplay {
            item_id: item.id.clone(),
            reason: e.to_string(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
