//! Queue manager: composed transactions and the claim critical section.
//!
//! The store primitives in [`crate::data::queue`] are single statements;
//! this facade groups them into the three terminal transitions an entry can
//! take (success, park-for-retry, terminal failure), each inside one
//! transaction so the history-then-delete invariant holds, and serializes
//! claim-and-read against other dispatch ticks in this process.

use crate::config::SchedulerConfig;
use crate::data::models::{ClaimedEntry, NewQueueEntry, QueueEntry};
use crate::data::queue;
use crate::error::Result;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub struct QueueManager {
    db_pool: PgPool,
    /// Serializes `claim_window` + `by_claim` so two dispatch ticks in this
    /// process cannot double-count a batch. Cross-process claiming relies on
    /// the atomic UPDATE alone.
    claim_lock: Mutex<()>,
    queue_threshold: i64,
    objects_per_token: i64,
    mark_window: f64,
    per_page: i64,
}

impl QueueManager {
    pub fn new(db_pool: PgPool, scheduler: &SchedulerConfig, per_page: i64) -> Self {
        Self {
            db_pool,
            claim_lock: Mutex::new(()),
            queue_threshold: scheduler.sched_queue_threshold,
            objects_per_token: scheduler.sched_object_per_token,
            mark_window: scheduler.sched_mark_timestamp_delta,
            per_page,
        }
    }

    /// Top up under-filled tokens from the TO_DO base objects.
    pub async fn fill(&self) -> Result<u64> {
        let inserted = queue::fill(
            self.queue_threshold,
            self.objects_per_token,
            self.per_page,
            &self.db_pool,
        )
        .await?;

        if inserted > 0 {
            info!(inserted, "Queue fill complete");
        } else {
            debug!("Queue fill found nothing to enqueue");
        }
        Ok(inserted)
    }

    /// Claim the current time window and read the batch back.
    ///
    /// Every returned entry is TO_PROCESS and stamped with a claim marker
    /// freshly generated for this tick.
    pub async fn next_entries(&self) -> Result<Vec<ClaimedEntry>> {
        let claim_id = Uuid::new_v4().to_string();

        let _guard = self.claim_lock.lock().await;
        let marked =
            queue::claim_window(&claim_id, Utc::now(), self.mark_window, &self.db_pool).await?;
        if marked == 0 {
            return Ok(Vec::new());
        }
        debug!(claim_id = %claim_id, marked, "Claimed dispatch window");
        let entries = queue::by_claim(&claim_id, &self.db_pool).await?;

        Ok(entries)
    }

    /// Enqueue the next page of a paginated listing.
    ///
    /// Deliberately runs outside (before) the completion transaction of the
    /// page that produced it: losing the completion must not lose the
    /// already-scheduled follow-up.
    pub async fn register_next_page(&self, entry: &NewQueueEntry) -> Result<()> {
        queue::add_entry(entry, &self.db_pool).await?;
        debug!(
            token_id = entry.token_id,
            url = %entry.url,
            "Registered next page"
        );
        Ok(())
    }

    /// Success: record history, finish the base object, drop the entry.
    pub async fn complete_ok(&self, entry: &QueueEntry) -> Result<()> {
        let mut tx = self.db_pool.begin().await?;
        queue::save_history(entry, entry.retry_count + 1, None, &mut *tx).await?;
        queue::mark_base_done(&entry.base_object_url, &mut *tx).await?;
        queue::delete_by_id(entry.id, &mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Failure with retries remaining: record the attempt, park the entry at
    /// the tail of its token's schedule.
    pub async fn complete_retry(&self, entry: &QueueEntry, error_text: &str) -> Result<()> {
        let mut tx = self.db_pool.begin().await?;
        queue::save_history(entry, entry.retry_count, Some(error_text), &mut *tx).await?;
        queue::move_entry_to_end(entry, &mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Terminal failure: record the attempt, drop the entry, and close out
    /// the base object so fill never resurrects it.
    pub async fn complete_terminal(&self, entry: &QueueEntry, error_text: &str) -> Result<()> {
        let mut tx = self.db_pool.begin().await?;
        queue::save_history(entry, entry.retry_count, Some(error_text), &mut *tx).await?;
        queue::delete_by_id(entry.id, &mut *tx).await?;
        queue::mark_base_done(&entry.base_object_url, &mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stall a whole token after a quota response.
    pub async fn shift_token(&self, token_id: i32) -> Result<u64> {
        let shifted = queue::shift_by_token(token_id, queue::SHIFT_SECONDS, &self.db_pool).await?;
        info!(token_id, shifted, "Token backlog shifted after quota response");
        Ok(shifted)
    }

    /// Prune entries stranded in the past.
    pub async fn delete_ancient(&self, depth_seconds: f64) -> Result<u64> {
        let removed = queue::delete_ancient(depth_seconds, &self.db_pool).await?;
        if removed > 0 {
            info!(removed, "Removed ancient queue entries");
        }
        Ok(removed)
    }

    /// Startup reset: wipe the queue so stale claims from a previous run are
    /// never reprocessed.
    pub async fn truncate(&self) -> Result<()> {
        queue::truncate(&self.db_pool).await
    }
}
