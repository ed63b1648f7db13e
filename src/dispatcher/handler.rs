//! Per-entry orchestration: reconcile one fetch outcome with queue state.

use crate::data::models::{ClaimedEntry, NewQueueEntry, QueueEntry, QueueState};
use crate::data::queue::{self, MAX_RETRY_COUNT};
use crate::error::Result;
use crate::github::{EntityLoader, LoadResult, PageableBehaviour};
use crate::queue::QueueManager;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runs one claimed queue entry through fetch and write-back.
///
/// Every invocation carries a fresh proc UUID in its log fields so the
/// whole dispatch of one entry can be correlated across components.
pub struct LoadHandler {
    db_pool: PgPool,
    manager: Arc<QueueManager>,
    client: reqwest::Client,
    per_page: i64,
}

impl LoadHandler {
    pub fn new(
        db_pool: PgPool,
        manager: Arc<QueueManager>,
        client: reqwest::Client,
        per_page: i64,
    ) -> Self {
        Self {
            db_pool,
            manager,
            client,
            per_page,
        }
    }

    /// Process one entry to completion.
    ///
    /// Never propagates an error: fetch failures are folded into the retry
    /// path, and a storage failure while recording the outcome leaves the
    /// entry in its prior state (the startup truncate is the ultimate
    /// reset).
    pub async fn handle(&self, entry_id: i32) {
        let proc_uuid = Uuid::new_v4();

        let claimed = match queue::by_id(entry_id, &self.db_pool).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                warn!(entry_id, proc_uuid = %proc_uuid, "No queue entry with this id");
                return;
            }
            Err(e) => {
                error!(entry_id, proc_uuid = %proc_uuid, error = ?e, "Failed to read queue entry");
                return;
            }
        };

        info!(
            object_type = %claimed.entry.object_type,
            token_id = claimed.entry.token_id,
            url = %claimed.entry.url,
            proc_uuid = %proc_uuid,
            "Processing queue entry"
        );

        if let Err(e) = self.process(&claimed, proc_uuid).await {
            error!(
                object_type = %claimed.entry.object_type,
                url = %claimed.entry.url,
                proc_uuid = %proc_uuid,
                error = ?e,
                "Entry processing failed"
            );
            // Status-unknown retry path for anything that escaped the loader.
            if let Err(e) = self.fail(claimed.entry.clone(), None, &e.to_string()).await {
                error!(entry_id, proc_uuid = %proc_uuid, error = ?e, "Failed to record entry failure");
            }
        }
    }

    async fn process(&self, claimed: &ClaimedEntry, proc_uuid: Uuid) -> Result<()> {
        let entry = &claimed.entry;
        let headers = entry.headers.as_object().cloned().unwrap_or_default();
        let params = entry.params.as_object().cloned().unwrap_or_default();

        let behaviour = PageableBehaviour::new(
            self.client.clone(),
            claimed.token_secret.clone(),
            self.per_page,
            entry.object_type.clone(),
            entry.url.clone(),
            headers,
            params,
            entry.token_id,
            proc_uuid,
        );

        let Some(result) = EntityLoader::new(&behaviour, &self.db_pool).load().await? else {
            return Ok(());
        };

        match result.resp_status {
            Some(status) if status < 400 => self.succeed(entry.clone(), &result).await,
            status => {
                let error_text = result
                    .error
                    .clone()
                    .or_else(|| result.resp_text.clone())
                    .unwrap_or_else(|| "unknown fetch error".to_string());
                self.fail(entry.clone(), status, &error_text).await
            }
        }
    }

    /// Success: register the next page if the stream continues, then retire
    /// the entry into history.
    async fn succeed(&self, mut entry: QueueEntry, result: &LoadResult) -> Result<()> {
        if let Some(next) = &result.next_context {
            let mut headers = next.headers.clone();
            // The secret lives on the token row; stored headers never carry it.
            headers.remove("Authorization");

            self.manager
                .register_next_page(&NewQueueEntry {
                    token_id: entry.token_id,
                    url: next.url.clone(),
                    base_object_url: entry.base_object_url.clone(),
                    object_type: entry.object_type.clone(),
                    headers: Value::Object(headers),
                    params: Value::Object(next.params.clone()),
                })
                .await?;
        }

        let now = Utc::now();
        entry.state = QueueState::Processed;
        entry.updated_at = now;
        entry.closed_at = Some(now);
        self.manager.complete_ok(&entry).await
    }

    /// Failure: park for retry or retire terminally, and stall the whole
    /// token on a quota response.
    async fn fail(&self, mut entry: QueueEntry, status: Option<i32>, error_text: &str) -> Result<()> {
        let now = Utc::now();
        entry.state = QueueState::Unprocessed;
        entry.updated_at = now;
        entry.retry_count += 1;

        if entry.retry_count >= MAX_RETRY_COUNT {
            entry.closed_at = Some(now);
            self.manager.complete_terminal(&entry, error_text).await?;
        } else {
            self.manager.complete_retry(&entry, error_text).await?;
        }

        if matches!(status, Some(403) | Some(429)) {
            self.manager.shift_token(entry.token_id).await?;
        }
        Ok(())
    }
}
