//! Generic one-shot fetch driver.
//!
//! [`EntityLoader`] wraps a single fetch attempt with the audit-row
//! lifecycle: open the row, run the behaviour with pre/post hooks, capture
//! any failure into the row, and always close it. Behaviours are capability
//! objects, one per remote site shape; there is no inheritance chain, a
//! behaviour composes whatever helpers it needs.

use crate::data::loading::{self, AuditOutcome, LoadingAudit};
use crate::error::Result;
use serde_json::{Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

/// JSON object shape used for request params and headers throughout the
/// fetch layer; mirrors the JSONB columns they are persisted in.
pub type JsonMap = Map<String, Value>;

/// Paging cursor threaded through one fetch invocation.
///
/// Carried explicitly instead of in thread-local storage so that the proc
/// UUID correlating all log lines of one dispatch survives task hops.
#[derive(Debug, Clone)]
pub struct PageState {
    pub page: i64,
    /// Quota remaining when this context was fabricated; -1 when unknown.
    pub remaining: i64,
    pub token_id: i32,
    pub proc_uuid: Uuid,
}

/// Everything needed to issue one request.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub url: String,
    pub params: JsonMap,
    pub headers: JsonMap,
    pub page: PageState,
}

/// Outcome of one fetch attempt.
///
/// `resp_status` is None when the request itself failed (transport error,
/// unparseable body); the handler routes those to the retry path exactly
/// like a 5xx. A None `next_context` means the paging stream is exhausted
/// for this base object.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub results: Vec<Value>,
    pub resp_status: Option<i32>,
    pub resp_headers: Option<JsonMap>,
    pub resp_text: Option<String>,
    pub error: Option<String>,
    pub next_context: Option<LoadContext>,
}

impl LoadResult {
    /// Status-less result synthesized when the fetch never produced a
    /// response.
    pub fn terminal(error: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            resp_status: None,
            resp_headers: None,
            resp_text: None,
            error: Some(error.into()),
            next_context: None,
        }
    }
}

/// Capability interface for one fetch against one remote site shape.
#[async_trait::async_trait]
pub trait LoadBehaviour: Send + Sync {
    /// Initial context, or None when there is nothing to load.
    fn context(&self) -> Option<LoadContext>;

    /// Issue the request described by `ctx`.
    async fn load(&self, ctx: &LoadContext, audit: &LoadingAudit) -> Result<LoadResult>;

    /// Synthesize the result for a fetch that failed outright.
    fn on_error(&self, _ctx: &LoadContext, _audit: &LoadingAudit, error: &anyhow::Error) -> LoadResult {
        LoadResult::terminal(error.to_string())
    }

    fn pre_load(&self, _ctx: &LoadContext) {}

    fn post_load(&self, _result: &LoadResult) {}
}

/// Drives one behaviour through a single audited fetch.
pub struct EntityLoader<'a, B: LoadBehaviour> {
    behaviour: &'a B,
    db_pool: &'a PgPool,
}

impl<'a, B: LoadBehaviour> EntityLoader<'a, B> {
    pub fn new(behaviour: &'a B, db_pool: &'a PgPool) -> Self {
        Self { behaviour, db_pool }
    }

    /// Run one fetch: audit row open → pre_load → load → post_load → audit
    /// row close.
    ///
    /// A behaviour failure is captured into the audit row and converted to a
    /// terminal result via `on_error`; only storage failures propagate as
    /// errors.
    pub async fn load(&self) -> Result<Option<LoadResult>> {
        let Some(ctx) = self.behaviour.context() else {
            return Ok(None);
        };

        let req_params = serde_json::to_string(&ctx.params).ok();
        let req_headers = serde_json::to_string(&ctx.headers).ok();
        let audit = loading::create(
            &ctx.url,
            req_params.as_deref(),
            req_headers.as_deref(),
            self.db_pool,
        )
        .await?;

        self.behaviour.pre_load(&ctx);
        let result = match self.behaviour.load(&ctx, &audit).await {
            Ok(result) => {
                self.behaviour.post_load(&result);
                result
            }
            Err(e) => self.behaviour.on_error(&ctx, &audit, &e),
        };

        let outcome = AuditOutcome {
            resp_status: result.resp_status,
            resp_headers: result
                .resp_headers
                .as_ref()
                .and_then(|h| serde_json::to_string(h).ok()),
            resp_text: result.resp_text.clone(),
            error: result.error.clone(),
        };
        loading::finish(audit.id, &outcome, self.db_pool).await?;

        Ok(Some(result))
    }
}
