//! Paginated fetch behaviour for GitHub-style listing endpoints.
//!
//! One invocation is one GET. The behaviour composes the final URL from the
//! entry's stored params, injects the token credential, interprets
//! `X-RateLimit-Remaining`, and decides whether a next page exists.

use crate::data::loading::LoadingAudit;
use crate::error::Result;
use crate::github::errors::FetchError;
use crate::github::loader::{JsonMap, LoadBehaviour, LoadContext, LoadResult, PageState};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Compose the query-string suffix from request params.
///
/// Values are appended verbatim, without RFC-3986 escaping — the remote
/// accepts the raw form and stored params round-trip through the queue
/// unchanged.
fn query_string(params: &JsonMap) -> String {
    let joined = params
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join("&");

    if joined.is_empty() {
        joined
    } else {
        format!("?{joined}")
    }
}

/// A page is the last when the remote returned fewer items than requested,
/// or when the listing is gone outright.
fn is_last_page(result_count: usize, per_page: i64, status: i32) -> bool {
    if status < 400 && (result_count as i64) < per_page {
        return true;
    }
    status == 404
}

/// The page cursor only advances on success; error responses retry the same
/// page.
fn next_page(current: i64, status: i32) -> i64 {
    if status < 400 { current + 1 } else { current }
}

/// One paginated listing endpoint bound to one credential.
pub struct PageableBehaviour {
    client: reqwest::Client,
    token_secret: String,
    per_page: i64,
    object_type: String,
    url: String,
    headers: JsonMap,
    params: JsonMap,
    token_id: i32,
    proc_uuid: Uuid,
}

impl PageableBehaviour {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        token_secret: String,
        per_page: i64,
        object_type: String,
        url: String,
        headers: JsonMap,
        params: JsonMap,
        token_id: i32,
        proc_uuid: Uuid,
    ) -> Self {
        Self {
            client,
            token_secret,
            per_page,
            object_type,
            url,
            headers,
            params,
            token_id,
            proc_uuid,
        }
    }

    /// Stored params with the page cursor overridden when advancing.
    fn compose_params(&self, page: Option<i64>) -> JsonMap {
        let mut params = self.params.clone();
        if let Some(page) = page {
            params.insert("page".to_string(), Value::from(page));
        }
        params
    }

    /// Stored headers plus the credential.
    fn compose_headers(&self) -> JsonMap {
        let mut headers = self.headers.clone();
        headers.insert(
            "Authorization".to_string(),
            Value::String(format!("token {}", self.token_secret)),
        );
        headers
    }

    /// Current page as stored in the entry's params; a fresh listing starts
    /// at page 1.
    fn current_page(&self) -> i64 {
        self.params.get("page").and_then(Value::as_i64).unwrap_or(1)
    }
}

#[async_trait::async_trait]
impl LoadBehaviour for PageableBehaviour {
    fn context(&self) -> Option<LoadContext> {
        Some(LoadContext {
            url: self.url.clone(),
            params: self.compose_params(None),
            headers: self.compose_headers(),
            page: PageState {
                page: self.current_page(),
                remaining: -1,
                token_id: self.token_id,
                proc_uuid: self.proc_uuid,
            },
        })
    }

    async fn load(&self, ctx: &LoadContext, _audit: &LoadingAudit) -> Result<LoadResult> {
        let current_page = ctx.page.page;
        let url = format!("{}{}", ctx.url, query_string(&ctx.params));

        let mut request = self.client.get(&url);
        for (key, value) in &ctx.headers {
            match value {
                Value::String(s) => request = request.header(key.as_str(), s.as_str()),
                other => request = request.header(key.as_str(), other.to_string()),
            }
        }

        let response = request.send().await.map_err(FetchError::Transport)?;
        let status = response.status().as_u16() as i32;

        let resp_headers: JsonMap = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let remaining = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        let text = response.text().await.map_err(FetchError::Transport)?;
        let results: Vec<Value> = if status < 400 {
            serde_json::from_str(&text).map_err(FetchError::Body)?
        } else {
            Vec::new()
        };

        info!(
            token_id = ctx.page.token_id,
            proc_uuid = %ctx.page.proc_uuid,
            object_type = %self.object_type,
            status,
            page = current_page,
            count = results.len(),
            remaining,
            url = %url,
            "Page fetched"
        );
        if remaining <= 0 {
            warn!(token_id = ctx.page.token_id, "Token quota exhausted");
        }

        let next_context = if is_last_page(results.len(), self.per_page, status) {
            None
        } else {
            let next = next_page(current_page, status);
            Some(LoadContext {
                url: self.url.clone(),
                params: self.compose_params(Some(next)),
                headers: self.compose_headers(),
                page: PageState {
                    page: next,
                    remaining,
                    token_id: self.token_id,
                    proc_uuid: self.proc_uuid,
                },
            })
        };

        Ok(LoadResult {
            results,
            resp_status: Some(status),
            resp_headers: Some(resp_headers),
            resp_text: Some(text),
            error: None,
            next_context,
        })
    }

    fn on_error(&self, ctx: &LoadContext, audit: &LoadingAudit, e: &anyhow::Error) -> LoadResult {
        error!(
            url = %ctx.url,
            loading_id = audit.id,
            error = %e,
            "Fetch failed"
        );
        LoadResult::terminal(e.to_string())
    }
}
