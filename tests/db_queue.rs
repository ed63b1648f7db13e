#[allow(dead_code)]
mod helpers;

use chrono::{Duration, DurationRound, Utc};
use quarry::data::models::{NewQueueEntry, QueueState};
use quarry::data::queue;
use serde_json::json;
use sqlx::PgPool;

fn new_entry(token_id: i32, url: &str, base_url: &str) -> NewQueueEntry {
    NewQueueEntry {
        token_id,
        url: url.to_string(),
        base_object_url: base_url.to_string(),
        object_type: "comments".to_string(),
        headers: json!({}),
        params: helpers::default_params(),
    }
}

// ── add_entry ───────────────────────────────────────────────────────

#[sqlx::test]
async fn add_entry_spaced_delta_after_tail(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;

    queue::add_entry(&new_entry(token, "https://api/x/comments", "https://api/x"), &pool)
        .await
        .unwrap();
    queue::add_entry(&new_entry(token, "https://api/y/comments", "https://api/y"), &pool)
        .await
        .unwrap();

    let entries = helpers::fetch_all_entries(&pool).await;
    assert_eq!(entries.len(), 2);

    let gap = (entries[1].execute_at - entries[0].execute_at).num_milliseconds();
    assert!(
        (710..=730).contains(&gap),
        "entries of one token should be spaced 0.72s apart, got {gap}ms"
    );
    assert_eq!(entries[0].retry_count, 0);
    assert!(matches!(entries[0].state, QueueState::Unprocessed));
    assert!(entries[0].uuid.is_none());
}

#[sqlx::test]
async fn add_entry_tokens_schedule_independently(pool: PgPool) {
    let token_a = helpers::insert_token(&pool, "a", true).await;
    let token_b = helpers::insert_token(&pool, "b", true).await;

    queue::add_entry(&new_entry(token_a, "https://api/1/comments", "https://api/1"), &pool)
        .await
        .unwrap();
    queue::add_entry(&new_entry(token_a, "https://api/2/comments", "https://api/2"), &pool)
        .await
        .unwrap();
    queue::add_entry(&new_entry(token_b, "https://api/3/comments", "https://api/3"), &pool)
        .await
        .unwrap();

    let entries = helpers::fetch_all_entries(&pool).await;
    let tail_a = entries
        .iter()
        .filter(|e| e.token_id == token_a)
        .map(|e| e.execute_at)
        .max()
        .unwrap();
    let first_b = entries
        .iter()
        .find(|e| e.token_id == token_b)
        .unwrap()
        .execute_at;

    // B starts its own chain near now, not behind A's tail
    assert!(first_b < tail_a, "token B must not queue behind token A");
}

// ── claim_window ────────────────────────────────────────────────────

#[sqlx::test]
async fn claim_window_claims_single_due_slot(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    let now = Utc::now();

    // Ten entries spaced Δ apart, the first one due right now
    for i in 0..10 {
        helpers::insert_queue_entry(
            &pool,
            token,
            &format!("https://api/{i}/comments"),
            &format!("https://api/{i}"),
            now + Duration::milliseconds(720 * i),
            0,
            QueueState::Unprocessed,
            None,
            helpers::default_params(),
        )
        .await;
    }

    let marked = queue::claim_window("claim-1", now, 0.1, &pool).await.unwrap();
    assert_eq!(marked, 1, "only the entry within ±0.1s should be claimed");

    let untouched: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM object_queue WHERE state = 'unprocessed' AND uuid IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(untouched, 9);
}

#[sqlx::test]
async fn claim_window_bounds(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    // Whole milliseconds so the stored timestamptz(3) values hit the window
    // bounds exactly
    let now = Utc::now().duration_trunc(Duration::milliseconds(1)).unwrap();

    // Lower bound is inclusive, upper bound exclusive
    let at_lower = helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/low/comments",
        "https://api/low",
        now - Duration::milliseconds(100),
        0,
        QueueState::Unprocessed,
        None,
        helpers::default_params(),
    )
    .await;
    helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/high/comments",
        "https://api/high",
        now + Duration::milliseconds(100),
        0,
        QueueState::Unprocessed,
        None,
        helpers::default_params(),
    )
    .await;

    let marked = queue::claim_window("claim-1", now, 0.1, &pool).await.unwrap();
    assert_eq!(marked, 1);

    let claimed = helpers::fetch_entry(&pool, at_lower).await;
    assert_eq!(claimed.uuid.as_deref(), Some("claim-1"));
    assert!(matches!(claimed.state, QueueState::ToProcess));
}

#[sqlx::test]
async fn claim_window_skips_already_claimed(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    let now = Utc::now();

    helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/x/comments",
        "https://api/x",
        now,
        0,
        QueueState::ToProcess,
        Some("older-claim"),
        helpers::default_params(),
    )
    .await;

    let marked = queue::claim_window("claim-2", now, 0.1, &pool).await.unwrap();
    assert_eq!(marked, 0, "entries claimed by another tick must be skipped");
}

// ── by_claim / by_id ────────────────────────────────────────────────

#[sqlx::test]
async fn by_claim_returns_batch_with_secret(pool: PgPool) {
    let token = helpers::insert_token(&pool, "s3cr3t", true).await;
    let now = Utc::now();

    for i in 0..2 {
        helpers::insert_queue_entry(
            &pool,
            token,
            &format!("https://api/{i}/comments"),
            &format!("https://api/{i}"),
            now,
            0,
            QueueState::Unprocessed,
            None,
            helpers::default_params(),
        )
        .await;
    }

    let marked = queue::claim_window("claim-1", now, 0.1, &pool).await.unwrap();
    assert_eq!(marked, 2);

    let batch = queue::by_claim("claim-1", &pool).await.unwrap();
    assert_eq!(batch.len(), 2);
    for claimed in &batch {
        assert_eq!(claimed.token_secret, "s3cr3t");
        assert!(matches!(claimed.entry.state, QueueState::ToProcess));
        assert_eq!(claimed.entry.uuid.as_deref(), Some("claim-1"));
    }
}

#[sqlx::test]
async fn by_id_joins_token_secret(pool: PgPool) {
    let token = helpers::insert_token(&pool, "s3cr3t", true).await;
    let id = helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/x/comments",
        "https://api/x",
        Utc::now(),
        0,
        QueueState::Unprocessed,
        None,
        helpers::default_params(),
    )
    .await;

    let claimed = queue::by_id(id, &pool).await.unwrap().expect("entry should exist");
    assert_eq!(claimed.entry.id, id);
    assert_eq!(claimed.token_secret, "s3cr3t");
}

#[sqlx::test]
async fn by_id_missing_returns_none(pool: PgPool) {
    let result = queue::by_id(999_999, &pool).await.unwrap();
    assert!(result.is_none());
}

// ── shift_by_token ──────────────────────────────────────────────────

#[sqlx::test]
async fn shift_by_token_shifts_only_that_token(pool: PgPool) {
    let token_a = helpers::insert_token(&pool, "a", true).await;
    let token_b = helpers::insert_token(&pool, "b", true).await;
    let now = Utc::now();

    for i in 0..3 {
        helpers::insert_queue_entry(
            &pool,
            token_a,
            &format!("https://api/a{i}/comments"),
            &format!("https://api/a{i}"),
            now + Duration::seconds(i),
            0,
            QueueState::Unprocessed,
            None,
            helpers::default_params(),
        )
        .await;
    }
    let b_id = helpers::insert_queue_entry(
        &pool,
        token_b,
        "https://api/b/comments",
        "https://api/b",
        now,
        0,
        QueueState::Unprocessed,
        None,
        helpers::default_params(),
    )
    .await;

    let before: Vec<_> = helpers::fetch_all_entries(&pool).await;
    let shifted = queue::shift_by_token(token_a, 7.0, &pool).await.unwrap();
    assert_eq!(shifted, 3);

    let after = helpers::fetch_all_entries(&pool).await;
    for entry in &after {
        let old = before.iter().find(|e| e.id == entry.id).unwrap();
        let delta = (entry.execute_at - old.execute_at).num_milliseconds();
        if entry.id == b_id {
            assert_eq!(delta, 0, "other tokens must be untouched");
        } else {
            assert_eq!(delta, 7000, "every entry of the token shifts by exactly 7s");
        }
    }
}

// ── move_entry_to_end ───────────────────────────────────────────────

#[sqlx::test]
async fn move_entry_to_end_repositions_after_tail(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    let now = Utc::now();

    let first = helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/1/comments",
        "https://api/1",
        now,
        0,
        QueueState::ToProcess,
        Some("claim-1"),
        helpers::default_params(),
    )
    .await;
    helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/2/comments",
        "https://api/2",
        now + Duration::seconds(2),
        0,
        QueueState::Unprocessed,
        None,
        helpers::default_params(),
    )
    .await;

    let tail_before = helpers::fetch_all_entries(&pool)
        .await
        .into_iter()
        .map(|e| e.execute_at)
        .max()
        .unwrap();

    let mut entry = helpers::fetch_entry(&pool, first).await;
    entry.retry_count = 4;
    let mut conn = pool.acquire().await.unwrap();
    queue::move_entry_to_end(&entry, &mut *conn).await.unwrap();

    let moved = helpers::fetch_entry(&pool, first).await;
    assert_eq!((moved.execute_at - tail_before).num_milliseconds(), 720);
    assert!(moved.uuid.is_none(), "claim marker should be cleared");
    assert!(matches!(moved.state, QueueState::Unprocessed));
    assert_eq!(moved.retry_count, 4, "retry count comes from the supplied entry");
}

// ── delete_ancient / truncate ───────────────────────────────────────

#[sqlx::test]
async fn delete_ancient_prunes_stranded_entries(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    let now = Utc::now();

    for (i, offset) in [-200i64, -121, -10, 60].iter().enumerate() {
        helpers::insert_queue_entry(
            &pool,
            token,
            &format!("https://api/{i}/comments"),
            &format!("https://api/{i}"),
            now + Duration::seconds(*offset),
            0,
            QueueState::Unprocessed,
            None,
            helpers::default_params(),
        )
        .await;
    }

    let removed = queue::delete_ancient(120.0, &pool).await.unwrap();
    assert_eq!(removed, 2, "only entries older than the depth are pruned");
    assert_eq!(helpers::queue_count(&pool).await, 2);
}

#[sqlx::test]
async fn truncate_wipes_the_queue(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/x/comments",
        "https://api/x",
        Utc::now(),
        0,
        QueueState::ToProcess,
        Some("stale-claim"),
        helpers::default_params(),
    )
    .await;

    queue::truncate(&pool).await.unwrap();
    assert_eq!(helpers::queue_count(&pool).await, 0);
}

// ── fill ────────────────────────────────────────────────────────────

#[sqlx::test]
async fn fill_enqueues_todo_bases_for_idle_token(pool: PgPool) {
    helpers::insert_token(&pool, "t", true).await;
    for i in 0..3 {
        helpers::insert_base_object(&pool, &format!("https://api/issues/{i}"), "TO_DO").await;
    }

    let inserted = queue::fill(50, 150, 100, &pool).await.unwrap();
    assert_eq!(inserted, 3);

    let entries = helpers::fetch_all_entries(&pool).await;
    assert_eq!(entries[0].url, "https://api/issues/0/comments");
    assert_eq!(entries[0].base_object_url, "https://api/issues/0");
    assert_eq!(entries[0].object_type, "comments");
    assert_eq!(entries[0].params, serde_json::json!({"per_page": 100, "page": 1}));
    assert_eq!(entries[0].headers, serde_json::json!({}));
    assert!(matches!(entries[0].state, QueueState::Unprocessed));

    // Idle token: schedule starts 3s out, entries spaced Δ apart
    let lead = (entries[0].execute_at - Utc::now()).num_milliseconds();
    assert!((3000..4500).contains(&lead), "first slot should be ~3.72s out, got {lead}ms");
    let gap = (entries[1].execute_at - entries[0].execute_at).num_milliseconds();
    assert_eq!(gap, 720);
}

#[sqlx::test]
async fn fill_skips_tokens_over_threshold(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    let now = Utc::now();
    for i in 0..60 {
        helpers::insert_queue_entry(
            &pool,
            token,
            &format!("https://api/{i}/comments"),
            &format!("https://api/{i}"),
            now + Duration::seconds(i),
            0,
            QueueState::Unprocessed,
            None,
            helpers::default_params(),
        )
        .await;
    }
    helpers::insert_base_object(&pool, "https://api/issues/fresh", "TO_DO").await;

    let inserted = queue::fill(50, 150, 100, &pool).await.unwrap();
    assert_eq!(inserted, 0, "a token with 60 queued entries is over the threshold of 50");
}

#[sqlx::test]
async fn fill_threshold_is_inclusive(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    let now = Utc::now();
    for i in 0..2 {
        helpers::insert_queue_entry(
            &pool,
            token,
            &format!("https://api/{i}/comments"),
            &format!("https://api/{i}"),
            now + Duration::seconds(i),
            0,
            QueueState::Unprocessed,
            None,
            helpers::default_params(),
        )
        .await;
    }
    helpers::insert_base_object(&pool, "https://api/issues/fresh", "TO_DO").await;

    let inserted = queue::fill(2, 150, 100, &pool).await.unwrap();
    assert_eq!(inserted, 1, "depth equal to the threshold still gets topped up");
}

#[sqlx::test]
async fn fill_is_idempotent(pool: PgPool) {
    helpers::insert_token(&pool, "t", true).await;
    for i in 0..2 {
        helpers::insert_base_object(&pool, &format!("https://api/issues/{i}"), "TO_DO").await;
    }

    assert_eq!(queue::fill(50, 150, 100, &pool).await.unwrap(), 2);
    assert_eq!(
        queue::fill(50, 150, 100, &pool).await.unwrap(),
        0,
        "a second fill with no new base objects inserts nothing"
    );
}

#[sqlx::test]
async fn fill_distributes_in_url_order_across_tokens(pool: PgPool) {
    let token_a = helpers::insert_token(&pool, "a", true).await;
    let token_b = helpers::insert_token(&pool, "b", true).await;
    for name in ["a", "b", "c", "d"] {
        helpers::insert_base_object(&pool, &format!("https://api/issues/{name}"), "TO_DO").await;
    }

    let inserted = queue::fill(50, 2, 100, &pool).await.unwrap();
    assert_eq!(inserted, 4);

    let entries = helpers::fetch_all_entries(&pool).await;
    let of_token = |t: i32| {
        let mut urls: Vec<_> = entries
            .iter()
            .filter(|e| e.token_id == t)
            .map(|e| e.base_object_url.clone())
            .collect();
        urls.sort();
        urls
    };

    // The first base object by URL goes to the first token; none are lost
    assert_eq!(
        of_token(token_a),
        vec!["https://api/issues/a", "https://api/issues/b"]
    );
    assert_eq!(
        of_token(token_b),
        vec!["https://api/issues/c", "https://api/issues/d"]
    );
}

#[sqlx::test]
async fn fill_truncates_at_per_token_capacity(pool: PgPool) {
    helpers::insert_token(&pool, "t", true).await;
    for i in 0..5 {
        helpers::insert_base_object(&pool, &format!("https://api/issues/{i}"), "TO_DO").await;
    }

    let inserted = queue::fill(50, 2, 100, &pool).await.unwrap();
    assert_eq!(inserted, 2, "only objects_per_token entries per token");
}

#[sqlx::test]
async fn fill_skips_done_and_already_queued_bases(pool: PgPool) {
    let token = helpers::insert_token(&pool, "t", true).await;
    helpers::insert_base_object(&pool, "https://api/issues/done", "DONE").await;
    helpers::insert_base_object(&pool, "https://api/issues/queued", "TO_DO").await;
    helpers::insert_base_object(&pool, "https://api/issues/free", "TO_DO").await;
    helpers::insert_queue_entry(
        &pool,
        token,
        "https://api/issues/queued/comments",
        "https://api/issues/queued",
        Utc::now() + Duration::seconds(30),
        0,
        QueueState::Unprocessed,
        None,
        helpers::default_params(),
    )
    .await;

    let inserted = queue::fill(50, 150, 100, &pool).await.unwrap();
    assert_eq!(inserted, 1);

    let entries = helpers::fetch_all_entries(&pool).await;
    assert!(
        entries
            .iter()
            .any(|e| e.base_object_url == "https://api/issues/free"),
        "only the unqueued TO_DO base should be enqueued"
    );
}

#[sqlx::test]
async fn fill_skips_disabled_tokens(pool: PgPool) {
    helpers::insert_token(&pool, "t", false).await;
    helpers::insert_base_object(&pool, "https://api/issues/x", "TO_DO").await;

    let inserted = queue::fill(50, 150, 100, &pool).await.unwrap();
    assert_eq!(inserted, 0);
}
