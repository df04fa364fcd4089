//! Bestea POS — offline-resilient shift & transaction reconciliation core.
//!
//! The device-side engine behind the kasir screen: it tracks the open shift
//! and its running cash/QRIS/expense totals, queues transactions,
//! attendance events and expenses durably while the network is down,
//! replays the queue exactly once per item when connectivity returns, and
//! reconciles authoritative server totals back into the local session view.
//!
//! Construct a [`CoreConfig`], open a [`PosCore`] and call `start()`; the
//! connectivity monitor then owns when syncs run. All services are plain
//! objects wired at construction — embed the core in whatever shell hosts
//! the UI.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod catalog;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod shift;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::api::{
    AttendanceAction, AttendanceDraft, AttendanceRecord, Backend, ConfirmedTransaction,
    ExpenseDraft, ExpenseRecord, HttpBackend, LineItem, PaymentMethod, SessionDetail,
    SessionRecord, TransactionDraft, TransactionStatus,
};
pub use crate::catalog::{CachedProduct, ProductCache};
pub use crate::config::CoreConfig;
pub use crate::core::{PosCore, Submission};
pub use crate::error::{CoreError, CoreResult};
pub use crate::monitor::{ConnectivityMonitor, SyncStatus};
pub use crate::queue::{OfflineQueue, PendingCounts, QueueItem, QueueKind, QueuePayload};
pub use crate::shift::{
    Employee, SessionExpense, SessionTransaction, ShiftData, ShiftManager, ShiftState,
};
pub use crate::sync::{SyncEngine, SyncReport};

/// Install a default tracing subscriber (`RUST_LOG`-style filtering, `info`
/// fallback). Host shells with their own subscriber can skip this.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
