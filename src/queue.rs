//! Durable local queue of pending writes.
//!
//! Pure storage over the `offline_queue` table: transactions, attendance
//! events, and expenses wait here while the backend is unreachable and are
//! removed only when their replay succeeds (or the payload turns out to be
//! structurally invalid — see the sync engine's drop rule). The monotonic
//! `seq` column preserves FIFO order within each kind across restarts.
//! This module knows nothing about the network.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::api::{AttendanceDraft, ExpenseDraft, TransactionDraft};
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Queue records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Transaction,
    Attendance,
    Expense,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [
        QueueKind::Transaction,
        QueueKind::Attendance,
        QueueKind::Expense,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Transaction => "transaction",
            QueueKind::Attendance => "attendance",
            QueueKind::Expense => "expense",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The domain record needed to replay one pending write. The `kind` tag
/// makes replay handling exhaustive at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum QueuePayload {
    Transaction(TransactionDraft),
    Attendance(AttendanceDraft),
    Expense(ExpenseDraft),
}

impl QueuePayload {
    pub fn kind(&self) -> QueueKind {
        match self {
            QueuePayload::Transaction(_) => QueueKind::Transaction,
            QueuePayload::Attendance(_) => QueueKind::Attendance,
            QueuePayload::Expense(_) => QueueKind::Expense,
        }
    }

    /// Structural validation: a failing payload is rejected at submit time
    /// and dropped (not retried) if it somehow reaches the queue.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            QueuePayload::Transaction(draft) => {
                if draft.branch_id.trim().is_empty() {
                    return Err("transaction missing branchId".into());
                }
                if draft.items.is_empty() {
                    return Err("transaction has no line items".into());
                }
                if draft.total_amount <= 0.0 {
                    return Err("transaction totalAmount must be positive".into());
                }
                Ok(())
            }
            QueuePayload::Attendance(draft) => {
                if draft.employee_id.trim().is_empty() {
                    return Err("attendance missing employeeId".into());
                }
                if draft.branch_id.trim().is_empty() {
                    return Err("attendance missing branchId".into());
                }
                Ok(())
            }
            QueuePayload::Expense(draft) => {
                if draft.branch_id.trim().is_empty() {
                    return Err("expense missing branchId".into());
                }
                if draft.category.trim().is_empty() {
                    return Err("expense missing category".into());
                }
                if draft.amount <= 0.0 {
                    return Err("expense amount must be positive".into());
                }
                Ok(())
            }
        }
    }
}

/// One pending unit of work. `id` is stable across retries and doubles as
/// the idempotency identifier sent on replay; `enqueued_at` reconstructs
/// the originating time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub payload: QueuePayload,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn kind(&self) -> QueueKind {
        self.payload.kind()
    }
}

/// Pending counts per kind, surfaced through the monitor status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub transactions: usize,
    pub attendance: usize,
    pub expenses: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.transactions + self.attendance + self.expenses
    }
}

// ---------------------------------------------------------------------------
// Queue service
// ---------------------------------------------------------------------------

/// Add/list/remove over the persisted queue. Cheap to clone; all clones
/// share the same connection.
#[derive(Clone)]
pub struct OfflineQueue {
    db: Arc<DbState>,
}

impl OfflineQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Persist one pending write and return its assigned id. A storage
    /// failure propagates — the caller must know the write was not durably
    /// queued.
    pub fn enqueue(&self, payload: QueuePayload) -> CoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let enqueued_at = Utc::now();
        let kind = payload.kind();
        let serialized = serde_json::to_string(&payload)?;

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO offline_queue (id, kind, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, kind.as_str(), serialized, enqueued_at.to_rfc3339()],
        )
        .map_err(|e| CoreError::Storage(format!("enqueue {kind}: {e}")))?;

        Ok(id)
    }

    /// Snapshot of pending items in insertion order, optionally filtered by
    /// kind. Rows whose payload no longer deserializes (e.g. written by an
    /// incompatible build) are purged and logged instead of poisoning every
    /// later pass.
    pub fn list_pending(&self, kind: Option<QueueKind>) -> CoreResult<Vec<QueueItem>> {
        let conn = self.db.lock()?;

        let (sql, filter) = match kind {
            Some(k) => (
                "SELECT id, payload, enqueued_at FROM offline_queue
                 WHERE kind = ?1 ORDER BY seq ASC",
                Some(k.as_str()),
            ),
            None => (
                "SELECT id, payload, enqueued_at FROM offline_queue ORDER BY seq ASC",
                None,
            ),
        };

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| CoreError::Storage(format!("prepare list_pending: {e}")))?;

        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(String, String, String)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        };
        let rows: Vec<(String, String, String)> = match filter {
            Some(k) => stmt.query_map(params![k], map_row),
            None => stmt.query_map([], map_row),
        }
        .map_err(|e| CoreError::Storage(format!("query list_pending: {e}")))?
        .filter_map(|r| r.ok())
        .collect();
        drop(stmt);
        drop(conn);

        let mut items = Vec::with_capacity(rows.len());
        let mut unreadable: Vec<String> = Vec::new();

        for (id, payload_json, enqueued_at) in rows {
            let payload: QueuePayload = match serde_json::from_str(&payload_json) {
                Ok(p) => p,
                Err(e) => {
                    warn!(item = %id, "purging unreadable queue row: {e}");
                    unreadable.push(id);
                    continue;
                }
            };
            let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            items.push(QueueItem {
                id,
                payload,
                enqueued_at,
            });
        }

        for id in unreadable {
            self.remove(&id)?;
        }

        Ok(items)
    }

    /// Delete one item. Idempotent: removing an absent id is not an error.
    pub fn remove(&self, id: &str) -> CoreResult<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])
            .map_err(|e| CoreError::Storage(format!("remove queue item: {e}")))?;
        Ok(())
    }

    /// Total number of pending items across all kinds.
    pub fn pending_count(&self) -> CoreResult<usize> {
        let conn = self.db.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
            .map_err(|e| CoreError::Storage(format!("count queue: {e}")))?;
        Ok(count as usize)
    }

    pub fn counts_by_kind(&self) -> CoreResult<PendingCounts> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare("SELECT kind, COUNT(*) FROM offline_queue GROUP BY kind")
            .map_err(|e| CoreError::Storage(format!("prepare counts: {e}")))?;

        let mut counts = PendingCounts::default();
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| CoreError::Storage(format!("query counts: {e}")))?;

        for row in rows.flatten() {
            let (kind, count) = row;
            match kind.as_str() {
                "transaction" => counts.transactions = count as usize,
                "attendance" => counts.attendance = count as usize,
                "expense" => counts.expenses = count as usize,
                other => warn!(kind = %other, "unknown queue kind in counts"),
            }
        }

        Ok(counts)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
