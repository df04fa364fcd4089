//! Composition root.
//!
//! `PosCore` constructs every service once at application start — storage,
//! queue, shift manager, sync engine, connectivity monitor — and wires them
//! together by explicit injection; nothing in the crate is reachable as an
//! ambient singleton. It also owns the submit paths: each UI action tries
//! the backend first and falls back to the offline queue on a network
//! failure, so a sale is never blocked by backend unavailability while
//! invalid or conflicting requests still fail fast.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::api::{
    AttendanceAction, AttendanceDraft, AttendanceRecord, Backend, ConfirmedTransaction,
    ExpenseDraft, ExpenseRecord, HttpBackend, SessionRecord, TransactionDraft,
};
use crate::catalog::{CachedProduct, ProductCache};
use crate::config::CoreConfig;
use crate::db::{self, DbState};
use crate::error::{CoreError, CoreResult};
use crate::monitor::{ConnectivityMonitor, SyncStatus};
use crate::queue::{OfflineQueue, QueuePayload};
use crate::shift::{Employee, SessionExpense, SessionTransaction, ShiftData, ShiftManager};
use crate::sync::{SyncEngine, SyncReport};

/// How a submitted write was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission<T> {
    /// The backend acknowledged the write immediately.
    Delivered(T),
    /// The backend was unreachable; the write waits in the offline queue
    /// under this id and the caller may treat the operation as complete.
    Queued { queue_id: String },
}

impl<T> Submission<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, Submission::Queued { .. })
    }
}

pub struct PosCore {
    config: CoreConfig,
    backend: Arc<dyn Backend>,
    pub queue: OfflineQueue,
    pub catalog: ProductCache,
    pub shift: Arc<ShiftManager>,
    pub sync: Arc<SyncEngine>,
    pub monitor: Arc<ConnectivityMonitor>,
}

impl PosCore {
    /// Open the core against the real HTTP backend, with local state under
    /// `data_dir`.
    pub fn open(config: CoreConfig, data_dir: &Path) -> CoreResult<Self> {
        let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&config)?);
        let db = Arc::new(db::init(data_dir)?);
        Self::with_backend(config, db, backend)
    }

    /// Wire the services over an injected backend (tests, alternative
    /// transports).
    pub fn with_backend(
        config: CoreConfig,
        db: Arc<DbState>,
        backend: Arc<dyn Backend>,
    ) -> CoreResult<Self> {
        let queue = OfflineQueue::new(db.clone());
        let catalog = ProductCache::new(db.clone());
        let shift = Arc::new(ShiftManager::new(db, backend.clone())?);
        let sync = Arc::new(SyncEngine::new(queue.clone(), shift.clone(), backend.clone()));
        let monitor = Arc::new(ConnectivityMonitor::new(
            backend.clone(),
            queue.clone(),
            sync.clone(),
        ));

        Ok(Self {
            config,
            backend,
            queue,
            catalog,
            shift,
            sync,
            monitor,
        })
    }

    /// Start the background connectivity/sync loop.
    pub fn start(&self) {
        self.monitor.start(self.config.sync_interval);
    }

    pub fn stop(&self) {
        self.monitor.stop();
    }

    pub fn status(&self) -> CoreResult<SyncStatus> {
        self.monitor.status()
    }

    pub async fn trigger_sync(&self) -> CoreResult<SyncReport> {
        self.monitor.trigger_sync().await
    }

    // -----------------------------------------------------------------------
    // Submit paths (network-first, queue on failure)
    // -----------------------------------------------------------------------

    /// Record a checkout. Validation failures reject immediately; a
    /// network failure queues the transaction and optimistically folds it
    /// into the open shift, so the cashier can finish the sale offline.
    pub async fn submit_transaction(
        &self,
        mut draft: TransactionDraft,
    ) -> CoreResult<Submission<ConfirmedTransaction>> {
        if draft.shift_session_id.is_none() {
            draft.shift_session_id = self.shift.session_id();
        }
        let payload = QueuePayload::Transaction(draft.clone());
        payload.validate().map_err(CoreError::Validation)?;

        let client_id = Uuid::new_v4().to_string();
        match self
            .backend
            .write_transaction(&draft, &client_id, None)
            .await
        {
            Ok(confirmed) => {
                self.shift
                    .record_transaction(SessionTransaction::from(&confirmed))?;
                Ok(Submission::Delivered(confirmed))
            }
            Err(e) if e.is_network() => {
                let queue_id = self.queue.enqueue(payload)?;
                self.shift.record_transaction(SessionTransaction::optimistic(
                    &draft,
                    &queue_id,
                    Utc::now(),
                ))?;
                info!(queue_id = %queue_id, "transaction queued locally (backend unreachable)");
                Ok(Submission::Queued { queue_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Record a clock-in/out. A clock-out with no open record fails with
    /// `NotFound` when online; offline it queues like everything else.
    pub async fn submit_attendance(
        &self,
        draft: AttendanceDraft,
    ) -> CoreResult<Submission<AttendanceRecord>> {
        let payload = QueuePayload::Attendance(draft.clone());
        payload.validate().map_err(CoreError::Validation)?;

        let client_id = Uuid::new_v4().to_string();
        let attempt = match draft.action {
            AttendanceAction::ClockIn => self.backend.clock_in(&draft, &client_id, None).await,
            AttendanceAction::ClockOut => self.backend.clock_out(&draft, &client_id, None).await,
        };

        match attempt {
            Ok(record) => Ok(Submission::Delivered(record)),
            Err(e) if e.is_network() => {
                let queue_id = self.queue.enqueue(payload)?;
                info!(
                    queue_id = %queue_id,
                    action = ?draft.action,
                    "attendance queued locally (backend unreachable)"
                );
                Ok(Submission::Queued { queue_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Record an expense against the open shift.
    pub async fn submit_expense(
        &self,
        mut draft: ExpenseDraft,
    ) -> CoreResult<Submission<ExpenseRecord>> {
        if draft.shift_session_id.is_none() {
            draft.shift_session_id = self.shift.session_id();
        }
        let payload = QueuePayload::Expense(draft.clone());
        payload.validate().map_err(CoreError::Validation)?;

        let client_id = Uuid::new_v4().to_string();
        match self.backend.write_expense(&draft, &client_id, None).await {
            Ok(record) => {
                self.shift.record_expense(SessionExpense::from(&record))?;
                Ok(Submission::Delivered(record))
            }
            Err(e) if e.is_network() => {
                let queue_id = self.queue.enqueue(payload)?;
                self.shift.record_expense(SessionExpense::optimistic(
                    &draft,
                    &queue_id,
                    Utc::now(),
                ))?;
                info!(queue_id = %queue_id, "expense queued locally (backend unreachable)");
                Ok(Submission::Queued { queue_id })
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Shift lifecycle
    // -----------------------------------------------------------------------

    pub async fn check_active_session(&self) -> CoreResult<Option<SessionRecord>> {
        self.shift.check_active_session(&self.config.branch_id).await
    }

    /// Today's attendance record for an employee; decides whether the UI
    /// offers clock-in or clock-out.
    pub async fn attendance_today(
        &self,
        employee_id: &str,
    ) -> CoreResult<Option<AttendanceRecord>> {
        self.backend.attendance_today(employee_id).await
    }

    pub async fn open_shift(
        &self,
        initial_cash: f64,
        employee: Employee,
    ) -> CoreResult<ShiftData> {
        self.shift
            .open(initial_cash, employee, &self.config.branch_id)
            .await
    }

    /// Attach to an already-open session and pull its authoritative state.
    /// The refresh is best-effort — resuming offline still succeeds with
    /// the server record's opening state.
    pub async fn resume_shift(&self, session: &SessionRecord) -> CoreResult<ShiftData> {
        self.shift.resume(session)?;
        if let Err(e) = self.shift.refresh_from_server(&self.queue).await {
            tracing::warn!("resume refresh failed: {e}");
        }
        self.shift.current()
    }

    pub async fn close_shift(
        &self,
        actual_cash: f64,
        employee: Employee,
        notes: Option<String>,
    ) -> CoreResult<f64> {
        self.shift.close(actual_cash, employee, notes).await
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    /// Fetch the branch catalog and overwrite the local cache.
    pub async fn refresh_catalog(&self) -> CoreResult<usize> {
        let products = self.backend.fetch_products(&self.config.branch_id).await?;
        let stored = self.catalog.replace_all(&products)?;
        info!(products = stored, "Product cache refreshed");
        Ok(stored)
    }

    /// Cached catalog, usable offline.
    pub fn products(&self) -> CoreResult<Vec<CachedProduct>> {
        self.catalog.list()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
