//! POS backend API client.
//!
//! Defines the `Backend` contract the offline core depends on — durable
//! writes for transactions, attendance and expenses, the shift-session
//! lifecycle, and a lightweight health probe — plus `HttpBackend`, the
//! reqwest implementation speaking the dashboard's JSON routes. Everything
//! above this module is network-agnostic: the sync engine and shift manager
//! only ever see `Backend`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::CachedProduct;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::shift::Employee;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Qris,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[default]
    Completed,
    Void,
}

/// One sold line within a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    pub product_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub quantity: u32,
    pub price: f64,
    pub subtotal: f64,
}

/// A checkout not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDraft {
    pub branch_id: String,
    pub cashier_id: String,
    pub cashier_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    pub total_amount: f64,
    pub payment_method: PaymentMethod,
    pub amount_paid: f64,
    pub change_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_session_id: Option<String>,
    pub items: Vec<LineItem>,
}

/// A transaction as acknowledged by the server, carrying its assigned id
/// and daily sequential display code (`#NNN`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedTransaction {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_code: Option<String>,
    pub date: DateTime<Utc>,
    pub payment_method: PaymentMethod,
    pub total_amount: f64,
    #[serde(default)]
    pub status: TransactionStatus,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashier_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashier_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceAction {
    ClockIn,
    ClockOut,
}

/// A clock-in/out event not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceDraft {
    pub employee_id: String,
    pub branch_id: String,
    pub action: AttendanceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub employee_id: String,
    pub branch_id: String,
    /// `YYYY-MM-DD` in the store's local day.
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_out: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// An expense not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseDraft {
    pub branch_id: String,
    pub category: String,
    pub amount: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseRecord {
    pub id: String,
    pub amount: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

/// A shift session as known to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub branch_id: String,
    pub start_time: DateTime<Utc>,
    pub initial_cash: f64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_by: Option<Employee>,
}

/// Authoritative totals and line items for one session, consumed by
/// `ShiftManager::refresh_from_server`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub cash_transactions_total: f64,
    pub qris_transactions_total: f64,
    pub expenses_total: f64,
    /// Most-recent-first.
    #[serde(default)]
    pub transactions: Vec<ConfirmedTransaction>,
    /// Most-recent-first.
    #[serde(default)]
    pub expenses: Vec<ExpenseRecord>,
}

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// The external write/read surface the offline core replays against.
///
/// `client_id` on the write operations is the caller-supplied idempotency
/// identifier (the queue item id on replay, so a retry after a crash
/// between server ack and local removal carries the same id). The server
/// is expected to deduplicate on it; where it does not, rare duplicate
/// inserts remain a documented residual risk of the design.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Lightweight connectivity probe; never errors, just answers.
    async fn health_check(&self) -> bool;

    /// Persist a transaction and its line items atomically. `originated_at`
    /// carries the original checkout time on replay of a queued item.
    async fn write_transaction(
        &self,
        draft: &TransactionDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<ConfirmedTransaction>;

    /// Create today's attendance record for the employee.
    async fn clock_in(
        &self,
        draft: &AttendanceDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AttendanceRecord>;

    /// Close the employee's most recent open attendance record; `NotFound`
    /// if none exists.
    async fn clock_out(
        &self,
        draft: &AttendanceDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AttendanceRecord>;

    /// Today's attendance record for the employee, if any.
    async fn attendance_today(&self, employee_id: &str) -> CoreResult<Option<AttendanceRecord>>;

    async fn write_expense(
        &self,
        draft: &ExpenseDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<ExpenseRecord>;

    /// The open session for a branch, if one exists.
    async fn active_session(&self, branch_id: &str) -> CoreResult<Option<SessionRecord>>;

    async fn open_session(
        &self,
        branch_id: &str,
        employee_id: &str,
        initial_cash: f64,
    ) -> CoreResult<SessionRecord>;

    async fn close_session(
        &self,
        session_id: &str,
        employee_id: &str,
        actual_cash: f64,
        expected_cash: f64,
        notes: Option<&str>,
    ) -> CoreResult<()>;

    async fn session_detail(&self, session_id: &str) -> CoreResult<SessionDetail>;

    /// Current catalog for the branch; feeds the local product cache.
    async fn fetch_products(&self, branch_id: &str) -> CoreResult<Vec<CachedProduct>>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a network error with a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> CoreError {
    if err.is_connect() {
        return CoreError::Network(format!("cannot reach POS backend at {url}"));
    }
    if err.is_timeout() {
        return CoreError::Network(format!("connection to {url} timed out"));
    }
    if err.is_builder() {
        return CoreError::Network(format!("invalid POS backend URL: {url}"));
    }
    CoreError::Network(format!("network error communicating with {url}: {err}"))
}

/// Map a non-success HTTP status + body detail into the error taxonomy.
fn error_from_status(status: StatusCode, detail: String) -> CoreError {
    match status.as_u16() {
        400 | 422 => CoreError::Validation(detail),
        404 => CoreError::NotFound(detail),
        409 => CoreError::Conflict {
            message: detail,
            active_session: None,
        },
        _ => CoreError::Network(format!("{detail} (HTTP {})", status.as_u16())),
    }
}

/// Extract the most useful message from an error response body.
fn extract_error_detail(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        if let Some(msg) = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
        {
            return msg.to_string();
        }
    }
    let trimmed = body_text.trim();
    if trimmed.is_empty() {
        format!("POS backend returned HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// `Backend` over the dashboard's JSON routes.
pub struct HttpBackend {
    client: Client,
    health_client: Client,
    base_url: String,
    api_key: String,
    device_id: String,
}

impl HttpBackend {
    pub fn new(config: &CoreConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::Network(format!("failed to create HTTP client: {e}")))?;
        let health_client = Client::builder()
            .timeout(config.health_timeout)
            .build()
            .map_err(|e| CoreError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            health_client,
            base_url: normalize_base_url(&config.api_base_url),
            api_key: config.api_key.clone(),
            device_id: config.device_id.clone(),
        })
    }

    /// Perform an authenticated JSON request. `path` includes the leading
    /// slash, e.g. `/api/transactions`.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> CoreResult<Value> {
        let full_url = format!("{}{path}", self.base_url);

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-device-id", &self.device_id)
            .header("Content-Type", "application/json");

        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();

        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let detail = extract_error_detail(status, &body_text);
            return Err(error_from_status(status, detail));
        }

        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| CoreError::Network(format!("invalid JSON from POS backend: {e}")))
    }
}

/// Serialize a draft as a JSON object, dropping fields sent elsewhere and
/// attaching the idempotency identifier.
fn draft_body<T: Serialize>(
    draft: &T,
    client_id: &str,
    strip: &[&str],
) -> CoreResult<serde_json::Map<String, Value>> {
    let mut obj = match serde_json::to_value(draft)? {
        Value::Object(obj) => obj,
        _ => serde_json::Map::new(),
    };
    for key in strip {
        obj.remove(*key);
    }
    obj.insert(
        "clientRequestId".into(),
        Value::String(client_id.to_string()),
    );
    Ok(obj)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn health_check(&self) -> bool {
        let health_url = format!("{}/api/health", self.base_url);
        match self
            .health_client
            .head(&health_url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn write_transaction(
        &self,
        draft: &TransactionDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<ConfirmedTransaction> {
        let mut transaction = draft_body(draft, client_id, &["items"])?;
        if let Some(at) = originated_at {
            transaction.insert("createdAt".into(), serde_json::to_value(at)?);
        }

        let body = serde_json::json!({
            "transaction": transaction,
            "items": draft.items,
        });

        let resp = self
            .request(Method::POST, "/api/transactions", Some(body))
            .await?;
        serde_json::from_value(resp).map_err(CoreError::from)
    }

    async fn clock_in(
        &self,
        draft: &AttendanceDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AttendanceRecord> {
        let mut body = draft_body(draft, client_id, &["action"])?;
        if let Some(at) = originated_at {
            body.insert("checkInTime".into(), serde_json::to_value(at)?);
        }

        let resp = self
            .request(Method::POST, "/api/attendance", Some(Value::Object(body)))
            .await?;
        serde_json::from_value(resp).map_err(CoreError::from)
    }

    async fn clock_out(
        &self,
        draft: &AttendanceDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AttendanceRecord> {
        let mut body = draft_body(draft, client_id, &[])?;
        body.insert("action".into(), Value::String("clock_out".into()));
        if let Some(at) = originated_at {
            body.insert("checkOutTime".into(), serde_json::to_value(at)?);
        }

        let resp = self
            .request(Method::PUT, "/api/attendance", Some(Value::Object(body)))
            .await?;
        serde_json::from_value(resp).map_err(CoreError::from)
    }

    async fn attendance_today(&self, employee_id: &str) -> CoreResult<Option<AttendanceRecord>> {
        let path = format!(
            "/api/attendance?checkStatus=true&employeeId={}",
            percent_encode(employee_id)
        );
        let resp = self.request(Method::GET, &path, None).await?;
        if resp.is_null() {
            return Ok(None);
        }
        serde_json::from_value(resp)
            .map(Some)
            .map_err(CoreError::from)
    }

    async fn write_expense(
        &self,
        draft: &ExpenseDraft,
        client_id: &str,
        originated_at: Option<DateTime<Utc>>,
    ) -> CoreResult<ExpenseRecord> {
        let mut body = draft_body(draft, client_id, &[])?;
        if let Some(at) = originated_at {
            body.insert("date".into(), serde_json::to_value(at)?);
        }

        let resp = self
            .request(Method::POST, "/api/expenses", Some(Value::Object(body)))
            .await?;
        serde_json::from_value(resp).map_err(CoreError::from)
    }

    async fn active_session(&self, branch_id: &str) -> CoreResult<Option<SessionRecord>> {
        let path = format!(
            "/api/shift-sessions?branchId={}&status=open",
            percent_encode(branch_id)
        );
        let resp = self.request(Method::GET, &path, None).await?;
        // The route answers null (or an empty object) when no session is open.
        if resp.is_null() || resp.get("id").is_none() {
            return Ok(None);
        }
        serde_json::from_value(resp)
            .map(Some)
            .map_err(CoreError::from)
    }

    async fn open_session(
        &self,
        branch_id: &str,
        employee_id: &str,
        initial_cash: f64,
    ) -> CoreResult<SessionRecord> {
        let body = serde_json::json!({
            "branchId": branch_id,
            "employeeId": employee_id,
            "initialCash": initial_cash,
        });
        let resp = self
            .request(Method::POST, "/api/shift-sessions", Some(body))
            .await?;
        serde_json::from_value(resp).map_err(CoreError::from)
    }

    async fn close_session(
        &self,
        session_id: &str,
        employee_id: &str,
        actual_cash: f64,
        expected_cash: f64,
        notes: Option<&str>,
    ) -> CoreResult<()> {
        let body = serde_json::json!({
            "id": session_id,
            "employeeId": employee_id,
            "actualCash": actual_cash,
            "expectedCash": expected_cash,
            "notes": notes,
        });
        self.request(Method::PUT, "/api/shift-sessions", Some(body))
            .await
            .map(|_| ())
    }

    async fn session_detail(&self, session_id: &str) -> CoreResult<SessionDetail> {
        let path = format!("/api/shift-sessions/{}", percent_encode(session_id));
        let resp = self.request(Method::GET, &path, None).await?;
        serde_json::from_value(resp).map_err(CoreError::from)
    }

    async fn fetch_products(&self, branch_id: &str) -> CoreResult<Vec<CachedProduct>> {
        let path = format!("/api/products?branchId={}", percent_encode(branch_id));
        let resp = self.request(Method::GET, &path, None).await?;
        serde_json::from_value(resp).map_err(CoreError::from)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("pos.bestea.id"), "https://pos.bestea.id");
        assert_eq!(
            normalize_base_url("https://pos.bestea.id/"),
            "https://pos.bestea.id"
        );
        assert_eq!(
            normalize_base_url("https://pos.bestea.id/api/"),
            "https://pos.bestea.id"
        );
        assert_eq!(
            normalize_base_url("localhost:3000/api"),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_base_url("  127.0.0.1:8080  "),
            "http://127.0.0.1:8080"
        );
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("abc-123_x.y~z"), "abc-123_x.y~z");
        assert_eq!(percent_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_error_from_status_mapping() {
        assert!(matches!(
            error_from_status(StatusCode::BAD_REQUEST, "missing amount".into()),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            error_from_status(StatusCode::NOT_FOUND, "no open record".into()),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            error_from_status(StatusCode::CONFLICT, "session already open".into()),
            CoreError::Conflict { .. }
        ));
        assert!(error_from_status(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server exploded".into()
        )
        .is_network());
        assert!(error_from_status(StatusCode::SERVICE_UNAVAILABLE, "down".into()).is_network());
    }

    #[test]
    fn test_extract_error_detail_prefers_json_message() {
        let detail = extract_error_detail(
            StatusCode::BAD_REQUEST,
            r#"{"error":"Missing required fields"}"#,
        );
        assert_eq!(detail, "Missing required fields");

        let detail = extract_error_detail(StatusCode::BAD_GATEWAY, "upstream timeout");
        assert_eq!(detail, "upstream timeout");

        let detail = extract_error_detail(StatusCode::BAD_GATEWAY, "");
        assert!(detail.contains("502"));
    }

    #[test]
    fn test_draft_serialization_shape() {
        let draft = TransactionDraft {
            branch_id: "branch-1".into(),
            cashier_id: "emp-1".into(),
            cashier_name: "Sari".into(),
            customer_name: None,
            total_amount: 50_000.0,
            payment_method: PaymentMethod::Qris,
            amount_paid: 50_000.0,
            change_amount: 0.0,
            shift_session_id: Some("sess-1".into()),
            items: vec![LineItem {
                product_id: "p-1".into(),
                product_name: "Es Teh Original".into(),
                variant: Some("Large".into()),
                quantity: 2,
                price: 25_000.0,
                subtotal: 50_000.0,
            }],
        };

        let v = serde_json::to_value(&draft).unwrap();
        assert_eq!(v["paymentMethod"], "qris");
        assert_eq!(v["shiftSessionId"], "sess-1");
        assert_eq!(v["items"][0]["productName"], "Es Teh Original");
        // camelCase only — the snake_case DB names never cross the wire
        assert!(v.get("payment_method").is_none());
    }

    #[test]
    fn test_draft_body_strips_and_tags() {
        let draft = AttendanceDraft {
            employee_id: "emp-1".into(),
            branch_id: "branch-1".into(),
            action: AttendanceAction::ClockIn,
            shift: Some("Pagi".into()),
            status: None,
            notes: None,
        };
        let body = draft_body(&draft, "q-123", &["action"]).unwrap();
        assert!(body.get("action").is_none());
        assert_eq!(body["clientRequestId"], "q-123");
        assert_eq!(body["employeeId"], "emp-1");
    }
}
