//! Shift session state machine.
//!
//! One open-to-close cashier work period per branch, with running
//! cash/QRIS/expense totals and the drawer expectation
//! `expected_cash = initial_cash + cash transactions − expenses`.
//! Every mutation persists the full snapshot so a restart while open
//! resumes the exact session; the snapshot is cleared only by an explicit
//! close. Server totals are authoritative — `refresh_from_server` merges
//! them with the still-queued local items instead of blindly replacing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{
    Backend, ConfirmedTransaction, ExpenseDraft, ExpenseRecord, LineItem, PaymentMethod,
    SessionRecord, TransactionDraft, TransactionStatus,
};
use crate::db::{self, DbState};
use crate::error::{CoreError, CoreResult};
use crate::queue::{OfflineQueue, QueuePayload};

/// local_settings address of the persisted snapshot.
const SNAPSHOT_CATEGORY: &str = "shift";
const SNAPSHOT_KEY: &str = "current";

// ---------------------------------------------------------------------------
// Session view types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftState {
    Closed,
    Open,
}

/// A transaction as it appears in the session view. `offline` marks
/// locally-originated entries still waiting in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTransaction {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_code: Option<String>,
    pub time: DateTime<Utc>,
    pub payment_method: PaymentMethod,
    pub total: f64,
    pub status: TransactionStatus,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub offline: bool,
}

impl From<&ConfirmedTransaction> for SessionTransaction {
    fn from(tx: &ConfirmedTransaction) -> Self {
        Self {
            id: tx.id.clone(),
            transaction_code: tx.transaction_code.clone(),
            time: tx.date,
            payment_method: tx.payment_method,
            total: tx.total_amount,
            status: tx.status,
            items: tx.items.clone(),
            offline: false,
        }
    }
}

impl SessionTransaction {
    /// View of a queued draft, keyed by its queue id so the entry can be
    /// correlated after replay.
    pub fn optimistic(draft: &TransactionDraft, queue_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: queue_id.to_string(),
            transaction_code: None,
            time: at,
            payment_method: draft.payment_method,
            total: draft.total_amount,
            status: TransactionStatus::Completed,
            items: draft.items.clone(),
            offline: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExpense {
    pub id: String,
    pub amount: f64,
    pub description: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employee_name: Option<String>,
    #[serde(default)]
    pub offline: bool,
}

impl SessionExpense {
    pub fn new(amount: f64, description: impl Into<String>, employee: Option<&Employee>) -> Self {
        Self {
            id: format!("EXP-{}", Uuid::new_v4()),
            amount,
            description: description.into(),
            time: Utc::now(),
            employee_id: employee.map(|e| e.id.clone()),
            employee_name: employee.map(|e| e.name.clone()),
            offline: false,
        }
    }

    pub fn optimistic(draft: &ExpenseDraft, queue_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: queue_id.to_string(),
            amount: draft.amount,
            description: draft.description.clone(),
            time: at,
            employee_id: draft.recorded_by.clone(),
            employee_name: draft.recorded_by_name.clone(),
            offline: true,
        }
    }
}

impl From<&ExpenseRecord> for SessionExpense {
    fn from(rec: &ExpenseRecord) -> Self {
        Self {
            id: rec.id.clone(),
            amount: rec.amount,
            description: rec.description.clone(),
            time: rec.created_at,
            employee_id: rec.recorded_by.clone(),
            employee_name: rec.recorded_by_name.clone(),
            offline: false,
        }
    }
}

/// Full state of one shift session on this device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub branch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub initial_cash: f64,
    pub total_cash_transactions: f64,
    pub total_qris_transactions: f64,
    pub total_expenses: f64,
    pub expected_cash: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cash: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discrepancy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_by: Option<Employee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_by: Option<Employee>,
    /// Most-recent-first.
    #[serde(default)]
    pub transactions: Vec<SessionTransaction>,
    /// Most-recent-first.
    #[serde(default)]
    pub expenses: Vec<SessionExpense>,
}

impl ShiftData {
    fn recompute_expected(&mut self) {
        // QRIS settles to the bank account, not the drawer.
        self.expected_cash =
            self.initial_cash + self.total_cash_transactions - self.total_expenses;
    }
}

/// Snapshot format persisted to local_settings.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedShift {
    is_open: bool,
    data: ShiftData,
}

// ---------------------------------------------------------------------------
// Shift manager
// ---------------------------------------------------------------------------

struct ShiftInner {
    state: ShiftState,
    data: ShiftData,
}

/// Owns the session state machine for this device. Constructed once at
/// application start; restores the persisted snapshot so a reload never
/// loses an open shift.
pub struct ShiftManager {
    db: Arc<DbState>,
    backend: Arc<dyn Backend>,
    inner: Mutex<ShiftInner>,
}

impl ShiftManager {
    pub fn new(db: Arc<DbState>, backend: Arc<dyn Backend>) -> CoreResult<Self> {
        let restored = {
            let conn = db.lock()?;
            db::get_setting(&conn, SNAPSHOT_CATEGORY, SNAPSHOT_KEY)
        };

        let inner = match restored {
            Some(raw) => match serde_json::from_str::<PersistedShift>(&raw) {
                Ok(snapshot) => {
                    if snapshot.is_open {
                        info!(
                            session_id = snapshot.data.session_id.as_deref().unwrap_or("-"),
                            "Restored open shift session from snapshot"
                        );
                    }
                    ShiftInner {
                        state: if snapshot.is_open {
                            ShiftState::Open
                        } else {
                            ShiftState::Closed
                        },
                        data: snapshot.data,
                    }
                }
                Err(e) => {
                    warn!("discarding unreadable shift snapshot: {e}");
                    ShiftInner {
                        state: ShiftState::Closed,
                        data: ShiftData::default(),
                    }
                }
            },
            None => ShiftInner {
                state: ShiftState::Closed,
                data: ShiftData::default(),
            },
        };

        Ok(Self {
            db,
            backend,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, ShiftInner>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::Storage("shift state lock poisoned".into()))
    }

    fn persist(&self, inner: &ShiftInner) -> CoreResult<()> {
        let snapshot = PersistedShift {
            is_open: inner.state == ShiftState::Open,
            data: inner.data.clone(),
        };
        let serialized = serde_json::to_string(&snapshot)?;
        let conn = self.db.lock()?;
        db::set_setting(&conn, SNAPSHOT_CATEGORY, SNAPSHOT_KEY, &serialized)
    }

    pub fn state(&self) -> ShiftState {
        self.lock().map(|i| i.state).unwrap_or(ShiftState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ShiftState::Open
    }

    /// Server session id of the open shift, if acknowledged.
    pub fn session_id(&self) -> Option<String> {
        self.lock().ok().and_then(|i| {
            if i.state == ShiftState::Open {
                i.data.session_id.clone()
            } else {
                None
            }
        })
    }

    /// Current session view (cloned snapshot).
    pub fn current(&self) -> CoreResult<ShiftData> {
        Ok(self.lock()?.data.clone())
    }

    /// Ask the server whether a session is already open for the branch.
    /// Callers use this before `open` to offer resume instead.
    pub async fn check_active_session(
        &self,
        branch_id: &str,
    ) -> CoreResult<Option<SessionRecord>> {
        self.backend.active_session(branch_id).await
    }

    /// Open a new shift. Requires a server acknowledgement — a shift is
    /// never opened offline, which keeps every queued expense pointing at
    /// a session id the server already knows.
    pub async fn open(
        &self,
        initial_cash: f64,
        employee: Employee,
        branch_id: &str,
    ) -> CoreResult<ShiftData> {
        if initial_cash < 0.0 {
            return Err(CoreError::Validation(
                "initial cash cannot be negative".into(),
            ));
        }
        if self.is_open() {
            return Err(CoreError::conflict("a shift is already open on this device"));
        }

        if let Some(active) = self.backend.active_session(branch_id).await? {
            return Err(CoreError::Conflict {
                message: format!("an active shift session already exists for branch {branch_id}"),
                active_session: Some(active),
            });
        }

        let session = self
            .backend
            .open_session(branch_id, &employee.id, initial_cash)
            .await?;

        let mut inner = self.lock()?;
        inner.data = ShiftData {
            session_id: Some(session.id.clone()),
            branch_id: branch_id.to_string(),
            start_time: Some(session.start_time),
            initial_cash,
            expected_cash: initial_cash,
            opened_by: Some(employee),
            ..ShiftData::default()
        };
        inner.state = ShiftState::Open;
        self.persist(&inner)?;

        info!(
            session_id = %session.id,
            branch_id = %branch_id,
            initial_cash = %initial_cash,
            "Shift opened"
        );

        Ok(inner.data.clone())
    }

    /// Attach this device to an already-open server session, seeding from
    /// the server record. Totals start at the server's opening state; a
    /// follow-up `refresh_from_server` pulls the authoritative lists.
    pub fn resume(&self, session: &SessionRecord) -> CoreResult<ShiftData> {
        let mut inner = self.lock()?;

        if inner.state == ShiftState::Open
            && inner.data.session_id.as_deref() == Some(session.id.as_str())
        {
            debug!(session_id = %session.id, "resume: session already active on this device");
            return Ok(inner.data.clone());
        }

        inner.data = ShiftData {
            session_id: Some(session.id.clone()),
            branch_id: session.branch_id.clone(),
            start_time: Some(session.start_time),
            initial_cash: session.initial_cash,
            expected_cash: session.initial_cash,
            opened_by: session.opened_by.clone(),
            ..ShiftData::default()
        };
        inner.state = ShiftState::Open;
        self.persist(&inner)?;

        info!(session_id = %session.id, "Resumed existing shift session");

        Ok(inner.data.clone())
    }

    /// Record a confirmed or optimistic transaction into the session view.
    /// A no-op while closed. Returns whether the entry was recorded.
    pub fn record_transaction(&self, tx: SessionTransaction) -> CoreResult<bool> {
        let mut inner = self.lock()?;
        if inner.state == ShiftState::Closed {
            debug!(tx_id = %tx.id, "transaction recorded while shift closed; ignoring");
            return Ok(false);
        }

        if tx.status == TransactionStatus::Completed {
            match tx.payment_method {
                PaymentMethod::Cash => inner.data.total_cash_transactions += tx.total,
                PaymentMethod::Qris => inner.data.total_qris_transactions += tx.total,
            }
        }
        inner.data.transactions.insert(0, tx);
        inner.data.recompute_expected();
        self.persist(&inner)?;
        Ok(true)
    }

    /// Record an expense into the session view. A no-op while closed.
    pub fn record_expense(&self, entry: SessionExpense) -> CoreResult<bool> {
        if entry.amount <= 0.0 {
            return Err(CoreError::Validation(
                "expense amount must be positive".into(),
            ));
        }

        let mut inner = self.lock()?;
        if inner.state == ShiftState::Closed {
            debug!(expense_id = %entry.id, "expense recorded while shift closed; ignoring");
            return Ok(false);
        }

        inner.data.total_expenses += entry.amount;
        inner.data.expenses.insert(0, entry);
        inner.data.recompute_expected();
        self.persist(&inner)?;
        Ok(true)
    }

    /// Close the shift and report the cash discrepancy (actual − expected,
    /// never clamped — a shortage is an operational signal, not an error).
    ///
    /// Idempotent: a second close of an already-closed session returns the
    /// recorded discrepancy without another server write. A network failure
    /// on the server write still closes the shift locally; the dashboard
    /// reconciles the session later.
    pub async fn close(
        &self,
        actual_cash: f64,
        employee: Employee,
        notes: Option<String>,
    ) -> CoreResult<f64> {
        if actual_cash < 0.0 {
            return Err(CoreError::Validation(
                "actual cash cannot be negative".into(),
            ));
        }

        let (session_id, expected, discrepancy) = {
            let inner = self.lock()?;
            if inner.state == ShiftState::Closed {
                return match inner.data.discrepancy {
                    Some(recorded) => {
                        debug!("close called on already-closed shift; returning recorded result");
                        Ok(recorded)
                    }
                    None => Err(CoreError::conflict("no open shift to close")),
                };
            }
            let expected = inner.data.expected_cash;
            (
                inner.data.session_id.clone(),
                expected,
                actual_cash - expected,
            )
        };

        if let Some(sid) = session_id.as_deref() {
            if let Err(e) = self
                .backend
                .close_session(sid, &employee.id, actual_cash, expected, notes.as_deref())
                .await
            {
                warn!(
                    session_id = %sid,
                    "server close failed ({e}); closing shift locally"
                );
            }
        }

        let mut inner = self.lock()?;
        inner.data.end_time = Some(Utc::now());
        inner.data.actual_cash = Some(actual_cash);
        inner.data.discrepancy = Some(discrepancy);
        inner.data.notes = notes;
        inner.data.closed_by = Some(employee);
        inner.state = ShiftState::Closed;
        self.persist(&inner)?;

        info!(
            session_id = session_id.as_deref().unwrap_or("-"),
            expected = %expected,
            actual = %actual_cash,
            discrepancy = %discrepancy,
            "Shift closed"
        );

        Ok(discrepancy)
    }

    /// Re-fetch authoritative totals and lists for the open session and
    /// merge: server totals win for confirmed items, local not-yet-synced
    /// queue items are additive on top. Returns whether a merge happened.
    pub async fn refresh_from_server(&self, queue: &OfflineQueue) -> CoreResult<bool> {
        let session_id = match self.session_id() {
            Some(sid) => sid,
            None => return Ok(false),
        };

        let detail = self.backend.session_detail(&session_id).await?;

        // Local overlay: queued items that belong to this session.
        let mut cash_overlay = 0.0;
        let mut qris_overlay = 0.0;
        let mut expense_overlay = 0.0;
        let mut overlay_txs: Vec<SessionTransaction> = Vec::new();
        let mut overlay_expenses: Vec<SessionExpense> = Vec::new();

        for item in queue.list_pending(None)? {
            match &item.payload {
                QueuePayload::Transaction(draft)
                    if draft.shift_session_id.as_deref() == Some(session_id.as_str()) =>
                {
                    match draft.payment_method {
                        PaymentMethod::Cash => cash_overlay += draft.total_amount,
                        PaymentMethod::Qris => qris_overlay += draft.total_amount,
                    }
                    overlay_txs.push(SessionTransaction::optimistic(
                        draft,
                        &item.id,
                        item.enqueued_at,
                    ));
                }
                QueuePayload::Expense(draft)
                    if draft.shift_session_id.as_deref() == Some(session_id.as_str()) =>
                {
                    expense_overlay += draft.amount;
                    overlay_expenses.push(SessionExpense::optimistic(
                        draft,
                        &item.id,
                        item.enqueued_at,
                    ));
                }
                _ => {}
            }
        }

        // Queue order is oldest-first; the session view is newest-first.
        overlay_txs.reverse();
        overlay_expenses.reverse();

        let mut inner = self.lock()?;
        if inner.state != ShiftState::Open
            || inner.data.session_id.as_deref() != Some(session_id.as_str())
        {
            // Closed (or switched) while the fetch was in flight.
            return Ok(false);
        }

        inner.data.total_cash_transactions = detail.cash_transactions_total + cash_overlay;
        inner.data.total_qris_transactions = detail.qris_transactions_total + qris_overlay;
        inner.data.total_expenses = detail.expenses_total + expense_overlay;

        let mut transactions = overlay_txs;
        transactions.extend(detail.transactions.iter().map(SessionTransaction::from));
        inner.data.transactions = transactions;

        let mut expenses = overlay_expenses;
        expenses.extend(detail.expenses.iter().map(SessionExpense::from));
        inner.data.expenses = expenses;

        inner.data.recompute_expected();
        self.persist(&inner)?;

        debug!(
            session_id = %session_id,
            expected_cash = %inner.data.expected_cash,
            "Shift totals refreshed from server"
        );

        Ok(true)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
