//! Row types for the queue, history and base-object tables.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Lifecycle state of a queue entry.
///
/// An entry is UNPROCESSED until a dispatch tick claims it; a non-null claim
/// marker implies TO_PROCESS. PROCESSED only ever appears on history rows —
/// successful entries leave the queue in the same transaction that records
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_state", rename_all = "snake_case")]
pub enum QueueState {
    Unprocessed,
    ToProcess,
    Processed,
}

/// One pending unit of work: a single page of a paginated listing.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i32,
    pub token_id: i32,
    pub url: String,
    pub base_object_url: String,
    pub object_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub execute_at: DateTime<Utc>,
    pub retry_count: i32,
    pub state: QueueState,
    /// Claim marker: opaque string shared by every row of one dispatch tick.
    pub uuid: Option<String>,
    pub headers: Value,
    pub params: Value,
    pub error: Option<String>,
}

/// A queue entry joined with the secret of its owning token.
///
/// `by_id` and `by_claim` return this shape so dispatch never needs a second
/// round-trip for the credential.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedEntry {
    #[sqlx(flatten)]
    pub entry: QueueEntry,
    pub token_secret: String,
}

/// Fields required to insert a fresh queue entry.
///
/// `execute_at`, state and retry count are computed server-side on insert.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub token_id: i32,
    pub url: String,
    pub base_object_url: String,
    pub object_type: String,
    pub headers: Value,
    pub params: Value,
}

/// Durable record of an entry that has left the queue, success or terminal
/// failure. Used by tests and operational queries; the write side goes
/// through `data::queue::save_history`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: i32,
    pub base_object_url: String,
    pub object_url: String,
    pub object_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub state: QueueState,
    pub retry_count: i32,
    pub error_text: Option<String>,
}
