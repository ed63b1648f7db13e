use chrono::{DateTime, Utc};
use quarry::data::models::{HistoryRow, QueueEntry, QueueState};
use sqlx::PgPool;

/// Insert a token row, returning the generated ID.
pub async fn insert_token(pool: &PgPool, secret: &str, enabled: bool) -> i32 {
    sqlx::query_scalar("INSERT INTO token (value, is_enable) VALUES ($1, $2) RETURNING id")
        .bind(secret)
        .bind(enabled)
        .fetch_one(pool)
        .await
        .expect("insert_token failed")
}

/// Insert a base object row.
pub async fn insert_base_object(pool: &PgPool, url: &str, comment_state: &str) {
    sqlx::query("INSERT INTO issue_loading (url, comment_state) VALUES ($1, $2)")
        .bind(url)
        .bind(comment_state)
        .execute(pool)
        .await
        .expect("insert_base_object failed");
}

/// Insert a queue row directly via SQL, returning the generated ID.
#[allow(clippy::too_many_arguments)]
pub async fn insert_queue_entry(
    pool: &PgPool,
    token_id: i32,
    url: &str,
    base_object_url: &str,
    execute_at: DateTime<Utc>,
    retry_count: i32,
    state: QueueState,
    claim: Option<&str>,
    params: serde_json::Value,
) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO object_queue \
            (token_id, url, base_object_url, object_type, execute_at, retry_count, \
             state, uuid, headers, params) \
         VALUES ($1, $2, $3, 'comments', $4, $5, $6, $7, '{}'::jsonb, $8) \
         RETURNING id",
    )
    .bind(token_id)
    .bind(url)
    .bind(base_object_url)
    .bind(execute_at)
    .bind(retry_count)
    .bind(state)
    .bind(claim)
    .bind(params)
    .fetch_one(pool)
    .await
    .expect("insert_queue_entry failed")
}

/// Default request params for a fresh listing.
pub fn default_params() -> serde_json::Value {
    serde_json::json!({"per_page": 100, "page": 1})
}

pub async fn queue_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM object_queue")
        .fetch_one(pool)
        .await
        .expect("queue_count failed")
}

pub async fn fetch_entry(pool: &PgPool, id: i32) -> QueueEntry {
    sqlx::query_as("SELECT * FROM object_queue WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("fetch_entry failed")
}

pub async fn fetch_all_entries(pool: &PgPool) -> Vec<QueueEntry> {
    sqlx::query_as("SELECT * FROM object_queue ORDER BY execute_at")
        .fetch_all(pool)
        .await
        .expect("fetch_all_entries failed")
}

pub async fn fetch_history(pool: &PgPool) -> Vec<HistoryRow> {
    sqlx::query_as("SELECT * FROM object_history ORDER BY id")
        .fetch_all(pool)
        .await
        .expect("fetch_history failed")
}

pub async fn base_state(pool: &PgPool, url: &str) -> String {
    sqlx::query_scalar("SELECT comment_state FROM issue_loading WHERE url = $1")
        .bind(url)
        .fetch_one(pool)
        .await
        .expect("base_state failed")
}
