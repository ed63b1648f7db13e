//! Audit rows: one `loading` row per HTTP attempt.
//!
//! The row is created before the request goes out and completed after,
//! whatever happened in between. Scheduling never reads this table.

use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Maximum stored error length; matches the column width.
const MAX_ERROR_CHARS: usize = 4096;

/// An open audit row for one HTTP attempt.
#[derive(Debug, Clone)]
pub struct LoadingAudit {
    pub id: i32,
    pub guid: Uuid,
    pub url: String,
    pub begin_timestamp: DateTime<Utc>,
}

/// Response-side fields written when the attempt completes.
#[derive(Debug, Default)]
pub struct AuditOutcome {
    pub resp_status: Option<i32>,
    pub resp_headers: Option<String>,
    pub resp_text: Option<String>,
    pub error: Option<String>,
}

/// Open an audit row for a request about to be dispatched.
///
/// `req_params` and `req_headers` are the serialized request values as they
/// will go on the wire (Authorization included). The begin timestamp is
/// taken server-side.
pub async fn create(
    url: &str,
    req_params: Option<&str>,
    req_headers: Option<&str>,
    db_pool: &PgPool,
) -> Result<LoadingAudit> {
    let guid = Uuid::new_v4();

    let (id, begin_timestamp): (i32, DateTime<Utc>) = sqlx::query_as(
        "INSERT INTO loading (url, req_params, req_headers, begin_timestamp, guid) \
         VALUES ($1, $2, $3, NOW(), $4) \
         RETURNING id, begin_timestamp",
    )
    .bind(url)
    .bind(req_params)
    .bind(req_headers)
    .bind(guid)
    .fetch_one(db_pool)
    .await?;

    Ok(LoadingAudit {
        id,
        guid,
        url: url.to_string(),
        begin_timestamp,
    })
}

/// Close an audit row with whatever the attempt produced.
///
/// Error text longer than the column allows is truncated.
pub async fn finish(id: i32, outcome: &AuditOutcome, db_pool: &PgPool) -> Result<()> {
    let error = outcome
        .error
        .as_deref()
        .map(|e| e.chars().take(MAX_ERROR_CHARS).collect::<String>());

    sqlx::query(
        "UPDATE loading \
         SET resp_status = $1, \
             resp_headers = $2, \
             resp_text = $3, \
             end_timestamp = NOW(), \
             error = $4 \
         WHERE id = $5",
    )
    .bind(outcome.resp_status)
    .bind(outcome.resp_headers.as_deref())
    .bind(outcome.resp_text.as_deref())
    .bind(error)
    .bind(id)
    .execute(db_pool)
    .await?;

    Ok(())
}
