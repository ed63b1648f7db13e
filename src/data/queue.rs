//! Database operations for the time-sharded crawl queue.
//!
//! Every scheduling invariant lives in SQL so that concurrent dispatchers
//! (in-process or across processes) observe the same rules: per-token
//! `execute_at` spacing on insert, atomic window claiming, token-wide quota
//! shifts. Functions that participate in the composed completion
//! transactions take a `&mut PgConnection`; standalone operations take the
//! pool directly.

use crate::data::models::{ClaimedEntry, NewQueueEntry, QueueEntry, QueueState};
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

/// Spacing between two entries of the same token, in seconds.
///
/// New entries always land this far behind the token's current tail, which
/// caps a token's steady-state request rate at 1/Δ regardless of queue
/// depth.
pub const DELTA_SECONDS: f64 = 0.72;

/// Retry ceiling. An entry whose retry count reaches this leaves the queue
/// for history permanently.
pub const MAX_RETRY_COUNT: i32 = 10;

/// Seconds added to every pending entry of a token on a quota response.
pub const SHIFT_SECONDS: f64 = 7.0;

/// Insert a single entry at the end of its token's schedule.
///
/// `execute_at` is computed server-side as the token's current maximum plus
/// [`DELTA_SECONDS`], or `now() + Δ` for an idle token, so concurrent
/// inserts cannot interleave inside the gap. State starts as UNPROCESSED
/// with a zero retry count.
pub async fn add_entry(entry: &NewQueueEntry, db_pool: &PgPool) -> Result<()> {
    sqlx::query(
        "INSERT INTO object_queue \
            (token_id, url, base_object_url, object_type, retry_count, state, headers, params, execute_at) \
         VALUES ($1, $2, $3, $4, 0, $5, $6, $7, \
            (SELECT COALESCE(MAX(execute_at), NOW()) + INTERVAL '1 second' * $8 \
             FROM object_queue WHERE token_id = $1))",
    )
    .bind(entry.token_id)
    .bind(&entry.url)
    .bind(&entry.base_object_url)
    .bind(&entry.object_type)
    .bind(QueueState::Unprocessed)
    .bind(&entry.headers)
    .bind(&entry.params)
    .bind(DELTA_SECONDS)
    .execute(db_pool)
    .await?;

    Ok(())
}

/// Bulk-enqueue base objects onto under-filled tokens.
///
/// One CTE, one statement, so fill cannot interleave with concurrent
/// dispatch:
/// 1. enabled tokens whose queue depth is at or below `queue_threshold`,
///    each with its current schedule tail (or `now()+3s` when idle);
/// 2. TO_DO base objects with no queue row, ordered by URL;
/// 3. candidate *i* (0-based) is assigned token `i / objects_per_token` and
///    spaced `((i mod objects_per_token) + 1) · Δ` behind that token's tail.
///
/// Inserted entries start UNPROCESSED with empty headers and
/// `{"per_page": per_page, "page": 1}` params.
///
/// # Returns
/// The number of rows inserted.
pub async fn fill(
    queue_threshold: i64,
    objects_per_token: i64,
    per_page: i64,
    db_pool: &PgPool,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        WITH token_to_enqueue AS (
            SELECT
                tkn.id AS token_id,
                COALESCE(MAX(q.execute_at), NOW() + INTERVAL '3 seconds') AS last_execute
            FROM token tkn
            LEFT JOIN object_queue q ON q.token_id = tkn.id
            WHERE tkn.is_enable
            GROUP BY tkn.id
            HAVING COUNT(q.id) <= $1
        ),
        numbered_token AS (
            SELECT token_id, last_execute,
                   ROW_NUMBER() OVER (ORDER BY token_id) AS rn
            FROM token_to_enqueue
        ),
        candidate AS (
            SELECT
                il.url AS base_object_url,
                il.url || '/comments' AS url,
                ROW_NUMBER() OVER (ORDER BY il.url ASC) AS rn
            FROM issue_loading il
            LEFT JOIN object_queue oq ON oq.base_object_url = il.url
            WHERE il.comment_state = 'TO_DO'
              AND oq.base_object_url IS NULL
            LIMIT (SELECT COUNT(*) * $2 * 2 FROM token_to_enqueue)
        ),
        assigned AS (
            SELECT
                t.token_id,
                t.last_execute,
                c.base_object_url,
                c.url,
                ((c.rn - 1) % $2) + 1 AS slot
            FROM candidate c
            JOIN numbered_token t ON t.rn = ((c.rn - 1) / $2) + 1
            WHERE c.rn <= (SELECT COUNT(*) * $2 FROM token_to_enqueue)
        )
        INSERT INTO object_queue
            (token_id, base_object_url, url, object_type, retry_count, state,
             headers, params, execute_at)
        SELECT
            token_id,
            base_object_url,
            url,
            'comments',
            0,
            'unprocessed',
            '{}'::jsonb,
            jsonb_build_object('per_page', $3, 'page', 1),
            last_execute + slot * INTERVAL '1 second' * $4
        FROM assigned
        "#,
    )
    .bind(queue_threshold)
    .bind(objects_per_token)
    .bind(per_page)
    .bind(DELTA_SECONDS)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected())
}

/// Atomically claim every due entry inside the sliding window.
///
/// Marks UNPROCESSED, unclaimed rows with `execute_at` in
/// `[now − μ, now + μ)` as TO_PROCESS and stamps them with the claim
/// marker. Cross-process safety rests entirely on this single UPDATE.
///
/// # Returns
/// The number of rows claimed.
pub async fn claim_window(
    claim_id: &str,
    now: DateTime<Utc>,
    mu_seconds: f64,
    db_pool: &PgPool,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE object_queue \
         SET updated_at = NOW(), state = $1, uuid = $2 \
         WHERE execute_at >= $3 - INTERVAL '1 second' * $4 \
           AND execute_at <  $3 + INTERVAL '1 second' * $4 \
           AND state = $5 \
           AND uuid IS NULL",
    )
    .bind(QueueState::ToProcess)
    .bind(claim_id)
    .bind(now)
    .bind(mu_seconds)
    .bind(QueueState::Unprocessed)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected())
}

/// Read back a claimed batch, joined with each entry's token secret.
pub async fn by_claim(claim_id: &str, db_pool: &PgPool) -> Result<Vec<ClaimedEntry>> {
    let entries = sqlx::query_as::<_, ClaimedEntry>(
        "SELECT q.*, t.value AS token_secret \
         FROM object_queue q \
         JOIN token t ON t.id = q.token_id \
         WHERE q.uuid = $1",
    )
    .bind(claim_id)
    .fetch_all(db_pool)
    .await?;

    Ok(entries)
}

/// Look up a single entry by id, joined with its token secret.
pub async fn by_id(id: i32, db_pool: &PgPool) -> Result<Option<ClaimedEntry>> {
    let entry = sqlx::query_as::<_, ClaimedEntry>(
        "SELECT q.*, t.value AS token_secret \
         FROM object_queue q \
         JOIN token t ON t.id = q.token_id \
         WHERE q.id = $1",
    )
    .bind(id)
    .fetch_optional(db_pool)
    .await?;

    Ok(entry)
}

/// Push every pending entry of a token `shift_seconds` into the future.
///
/// Used on quota responses (403/429) to stall the whole credential. This is
/// a single unserialized UPDATE: concurrent shifts for the same token
/// compound, and a concurrent `move_entry_to_end` can overwrite the shift
/// for that one row. Last writer wins per row.
///
/// # Returns
/// The number of rows shifted.
pub async fn shift_by_token(token_id: i32, shift_seconds: f64, db_pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE object_queue \
         SET execute_at = execute_at + INTERVAL '1 second' * $1 \
         WHERE token_id = $2",
    )
    .bind(shift_seconds)
    .bind(token_id)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected())
}

/// Reposition an entry at the tail of its token's schedule.
///
/// Clears the claim marker, resets state to UNPROCESSED and takes the retry
/// count from the supplied entry (the handler increments it before calling).
pub async fn move_entry_to_end(entry: &QueueEntry, conn: &mut PgConnection) -> Result<()> {
    sqlx::query(
        "UPDATE object_queue \
         SET execute_at = (SELECT MAX(execute_at) + INTERVAL '1 second' * $1 \
                           FROM object_queue WHERE token_id = $2), \
             retry_count = $3, \
             uuid = NULL, \
             state = $4, \
             updated_at = NOW() \
         WHERE id = $5",
    )
    .bind(DELTA_SECONDS)
    .bind(entry.token_id)
    .bind(entry.retry_count)
    .bind(QueueState::Unprocessed)
    .bind(entry.id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Record an entry in history.
///
/// `final_retry` is the attempt count to persist: the success path passes
/// `retry_count + 1`, the failure path passes the already-incremented count,
/// so history rows always read "attempts made".
pub async fn save_history(
    entry: &QueueEntry,
    final_retry: i32,
    error_text: Option<&str>,
    conn: &mut PgConnection,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO object_history \
            (base_object_url, object_url, object_type, created_at, updated_at, \
             closed_at, state, retry_count, error_text) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&entry.base_object_url)
    .bind(&entry.url)
    .bind(&entry.object_type)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .bind(entry.closed_at)
    .bind(entry.state)
    .bind(final_retry)
    .bind(error_text)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Flip the parent base object to DONE, ending its paging stream.
pub async fn mark_base_done(base_url: &str, conn: &mut PgConnection) -> Result<()> {
    sqlx::query("UPDATE issue_loading SET comment_state = 'DONE' WHERE url = $1")
        .bind(base_url)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Delete a queue entry by id.
///
/// Only ever called after `save_history` inside the same transaction; an
/// entry must not vanish without a history row.
pub async fn delete_by_id(id: i32, conn: &mut PgConnection) -> Result<()> {
    sqlx::query("DELETE FROM object_queue WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Prune entries whose `execute_at` fell more than `depth_seconds` into the
/// past. Catches rows orphaned by crashes mid-claim.
///
/// # Returns
/// The number of rows removed.
pub async fn delete_ancient(depth_seconds: f64, db_pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM object_queue \
         WHERE execute_at < NOW() - INTERVAL '1 second' * $1",
    )
    .bind(depth_seconds)
    .execute(db_pool)
    .await?;

    Ok(result.rows_affected())
}

/// Wipe the queue. Called once at startup so claims from a previous run
/// cannot be reprocessed.
pub async fn truncate(db_pool: &PgPool) -> Result<()> {
    sqlx::query("TRUNCATE TABLE object_queue")
        .execute(db_pool)
        .await?;

    Ok(())
}
