//! Shared test fixtures: an in-memory database and a scripted in-process
//! `Backend` with call recording and per-item failure injection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::api::{
    AttendanceDraft, AttendanceRecord, Backend, ConfirmedTransaction, ExpenseDraft, ExpenseRecord,
    LineItem, PaymentMethod, SessionDetail, SessionRecord, SessionStatus, TransactionDraft,
    TransactionStatus,
};
use crate::catalog::CachedProduct;
use crate::config::CoreConfig;
use crate::db::{self, DbState};
use crate::error::{CoreError, CoreResult};
use crate::shift::Employee;

pub(crate) fn test_db() -> Arc<DbState> {
    let conn = rusqlite::Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    db::run_migrations_for_test(&conn);
    Arc::new(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

pub(crate) fn test_config() -> CoreConfig {
    CoreConfig::new("localhost:3000", "test-key", "branch-1", "dev-test")
}

pub(crate) fn employee(id: &str) -> Employee {
    Employee {
        id: id.into(),
        name: format!("Pegawai {id}"),
        role: "kasir".into(),
        branch_id: Some("branch-1".into()),
    }
}

pub(crate) fn transaction_draft(total: f64, payment_method: PaymentMethod) -> TransactionDraft {
    TransactionDraft {
        branch_id: "branch-1".into(),
        cashier_id: "emp-1".into(),
        cashier_name: "Sari".into(),
        customer_name: None,
        total_amount: total,
        payment_method,
        amount_paid: total,
        change_amount: 0.0,
        shift_session_id: None,
        items: vec![LineItem {
            product_id: "p-1".into(),
            product_name: "Es Teh Original".into(),
            variant: None,
            quantity: 1,
            price: total,
            subtotal: total,
        }],
    }
}

pub(crate) fn expense_draft(amount: f64) -> ExpenseDraft {
    ExpenseDraft {
        branch_id: "branch-1".into(),
        category: "operasional".into(),
        amount,
        description: "pengeluaran harian".into(),
        recorded_by: Some("emp-1".into()),
        recorded_by_name: Some("Sari".into()),
        shift_session_id: None,
    }
}

pub(crate) fn attendance_draft(employee_id: &str) -> AttendanceDraft {
    AttendanceDraft {
        employee_id: employee_id.into(),
        branch_id: "branch-1".into(),
        action: crate::api::AttendanceAction::ClockIn,
        shift: Some("Pagi".into()),
        status: None,
        notes: None,
    }
}

/// In-process backend double. Records every call, can be flipped offline,
/// can fail specific client ids, and answers session detail from the
/// writes it has accepted.
pub(crate) struct MockBackend {
    online: AtomicBool,
    code_seq: AtomicU64,
    write_delay: Mutex<Option<Duration>>,
    fail_client_ids: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    seen_client_ids: Mutex<Vec<String>>,
    sessions: Mutex<Vec<SessionRecord>>,
    confirmed: Mutex<Vec<ConfirmedTransaction>>,
    /// Accepted expenses with the session id they were written against.
    expenses: Mutex<Vec<(ExpenseRecord, Option<String>)>>,
    attendance: Mutex<Vec<AttendanceRecord>>,
    products: Mutex<Vec<CachedProduct>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            code_seq: AtomicU64::new(0),
            write_delay: Mutex::new(None),
            fail_client_ids: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            seen_client_ids: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            confirmed: Mutex::new(Vec::new()),
            expenses: Mutex::new(Vec::new()),
            attendance: Mutex::new(Vec::new()),
            products: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn fail_for(&self, client_id: &str) {
        self.fail_client_ids
            .lock()
            .unwrap()
            .insert(client_id.to_string());
    }

    pub(crate) fn clear_failures(&self) {
        self.fail_client_ids.lock().unwrap().clear();
    }

    pub(crate) fn call_count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
    }

    pub(crate) fn total_write_calls(&self) -> usize {
        self.call_count("write_transaction")
            + self.call_count("clock_in")
            + self.call_count("clock_out")
            + self.call_count("write_expense")
    }

    pub(crate) fn seen_client_ids(&self) -> Vec<String> {
        self.seen_client_ids.lock().unwrap().clone()
    }

    pub(crate) fn confirmed_transactions(&self) -> Vec<ConfirmedTransaction> {
        self.confirmed.lock().unwrap().clone()
    }

    /// Pretend another device already opened a session on this branch.
    pub(crate) fn seed_session(&self, branch_id: &str, initial_cash: f64) -> SessionRecord {
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            branch_id: branch_id.into(),
            start_time: Utc::now(),
            initial_cash,
            status: SessionStatus::Open,
            opened_by: None,
        };
        self.sessions.lock().unwrap().push(record.clone());
        record
    }

    /// Pretend another device recorded a confirmed sale on this session.
    pub(crate) fn seed_confirmed_transaction(
        &self,
        session_id: &str,
        total: f64,
        payment_method: PaymentMethod,
    ) {
        self.confirmed.lock().unwrap().push(ConfirmedTransaction {
            id: Uuid::new_v4().to_string(),
            transaction_code: Some("#001".into()),
            date: Utc::now(),
            payment_method,
            total_amount: total,
            status: TransactionStatus::Completed,
            items: Vec::new(),
            cashier_id: None,
            cashier_name: None,
            shift_session_id: Some(session_id.into()),
        });
    }

    pub(crate) fn seed_products(&self, products: &[(&str, &str, f64)]) {
        let mut guard = self.products.lock().unwrap();
        *guard = products
            .iter()
            .map(|(id, name, price)| CachedProduct {
                id: (*id).into(),
                name: (*name).into(),
                category: None,
                price: *price,
                variants: Vec::new(),
            })
            .collect();
    }

    async fn gate(&self, name: &str, client_id: Option<&str>) -> CoreResult<()> {
        self.calls.lock().unwrap().push(name.to_string());

        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.online.load(Ordering::SeqCst) {
            return Err(CoreError::Network("mock backend offline".into()));
        }
        if let Some(client_id) = client_id {
            if self.fail_client_ids.lock().unwrap().contains(client_id) {
                return Err(CoreError::Network("injected failure".into()));
            }
            self.seen_client_ids
                .lock()
                .unwrap()
                .push(client_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn health_check(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn write_transaction(
        &self,
        draft: &TransactionDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<ConfirmedTransaction> {
        self.gate("write_transaction", Some(client_id)).await?;

        let seq = self.code_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let confirmed = ConfirmedTransaction {
            id: Uuid::new_v4().to_string(),
            transaction_code: Some(format!("#{seq:03}")),
            date: originated_at.unwrap_or_else(Utc::now),
            payment_method: draft.payment_method,
            total_amount: draft.total_amount,
            status: TransactionStatus::Completed,
            items: draft.items.clone(),
            cashier_id: Some(draft.cashier_id.clone()),
            cashier_name: Some(draft.cashier_name.clone()),
            shift_session_id: draft.shift_session_id.clone(),
        };
        self.confirmed.lock().unwrap().push(confirmed.clone());
        Ok(confirmed)
    }

    async fn clock_in(
        &self,
        draft: &AttendanceDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AttendanceRecord> {
        self.gate("clock_in", Some(client_id)).await?;

        let at = originated_at.unwrap_or_else(Utc::now);
        let date = at.format("%Y-%m-%d").to_string();
        let mut records = self.attendance.lock().unwrap();
        if records
            .iter()
            .any(|r| r.employee_id == draft.employee_id && r.date == date)
        {
            return Err(CoreError::conflict(
                "employee already has an attendance record for this date",
            ));
        }

        let record = AttendanceRecord {
            id: Uuid::new_v4().to_string(),
            employee_id: draft.employee_id.clone(),
            branch_id: draft.branch_id.clone(),
            date,
            check_in: Some(at),
            check_out: None,
            status: draft.status.clone().or_else(|| Some("Hadir".into())),
            shift: draft.shift.clone(),
            notes: draft.notes.clone(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn clock_out(
        &self,
        draft: &AttendanceDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AttendanceRecord> {
        self.gate("clock_out", Some(client_id)).await?;

        let at = originated_at.unwrap_or_else(Utc::now);
        let mut records = self.attendance.lock().unwrap();
        let open = records
            .iter_mut()
            .rev()
            .find(|r| r.employee_id == draft.employee_id && r.check_out.is_none());
        match open {
            Some(record) => {
                record.check_out = Some(at);
                Ok(record.clone())
            }
            None => Err(CoreError::NotFound(
                "no open attendance record for employee".into(),
            )),
        }
    }

    async fn attendance_today(&self, employee_id: &str) -> CoreResult<Option<AttendanceRecord>> {
        self.gate("attendance_today", None).await?;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Ok(self
            .attendance
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.employee_id == employee_id && r.date == today)
            .cloned())
    }

    async fn write_expense(
        &self,
        draft: &ExpenseDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<ExpenseRecord> {
        self.gate("write_expense", Some(client_id)).await?;

        let record = ExpenseRecord {
            id: Uuid::new_v4().to_string(),
            amount: draft.amount,
            description: draft.description.clone(),
            category: Some(draft.category.clone()),
            created_at: originated_at.unwrap_or_else(Utc::now),
            recorded_by: draft.recorded_by.clone(),
            recorded_by_name: draft.recorded_by_name.clone(),
        };
        // Keep the session linkage so session_detail can answer for it.
        self.expenses
            .lock()
            .unwrap()
            .push((record.clone(), draft.shift_session_id.clone()));
        Ok(record)
    }

    async fn active_session(&self, branch_id: &str) -> CoreResult<Option<SessionRecord>> {
        self.gate("active_session", None).await?;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.branch_id == branch_id && s.status == SessionStatus::Open)
            .cloned())
    }

    async fn open_session(
        &self,
        branch_id: &str,
        _employee_id: &str,
        initial_cash: f64,
    ) -> CoreResult<SessionRecord> {
        self.gate("open_session", None).await?;

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions
            .iter()
            .find(|s| s.branch_id == branch_id && s.status == SessionStatus::Open)
        {
            return Err(CoreError::Conflict {
                message: "an active session already exists for this branch".into(),
                active_session: Some(existing.clone()),
            });
        }

        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            branch_id: branch_id.into(),
            start_time: Utc::now(),
            initial_cash,
            status: SessionStatus::Open,
            opened_by: None,
        };
        sessions.push(record.clone());
        Ok(record)
    }

    async fn close_session(
        &self,
        session_id: &str,
        _employee_id: &str,
        _actual_cash: f64,
        _expected_cash: f64,
        _notes: Option<&str>,
    ) -> CoreResult<()> {
        self.gate("close_session", None).await?;
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.iter_mut().find(|s| s.id == session_id) {
            Some(session) => {
                session.status = SessionStatus::Closed;
                Ok(())
            }
            None => Err(CoreError::NotFound("session not found".into())),
        }
    }

    async fn session_detail(&self, session_id: &str) -> CoreResult<SessionDetail> {
        self.gate("session_detail", None).await?;

        let confirmed = self.confirmed.lock().unwrap();
        let mut transactions: Vec<ConfirmedTransaction> = confirmed
            .iter()
            .filter(|t| t.shift_session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        let cash_total = transactions
            .iter()
            .filter(|t| {
                t.status == TransactionStatus::Completed
                    && t.payment_method == PaymentMethod::Cash
            })
            .map(|t| t.total_amount)
            .sum();
        let qris_total = transactions
            .iter()
            .filter(|t| {
                t.status == TransactionStatus::Completed
                    && t.payment_method == PaymentMethod::Qris
            })
            .map(|t| t.total_amount)
            .sum();
        transactions.reverse();

        let mut expenses: Vec<ExpenseRecord> = self
            .expenses
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sid)| sid.as_deref() == Some(session_id))
            .map(|(record, _)| record.clone())
            .collect();
        let expenses_total = expenses.iter().map(|e| e.amount).sum();
        expenses.reverse();

        Ok(SessionDetail {
            cash_transactions_total: cash_total,
            qris_transactions_total: qris_total,
            expenses_total,
            transactions,
            expenses,
        })
    }

    async fn fetch_products(&self, _branch_id: &str) -> CoreResult<Vec<CachedProduct>> {
        self.gate("fetch_products", None).await?;
        Ok(self.products.lock().unwrap().clone())
    }
}
