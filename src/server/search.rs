//! Interactive search and search session handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AppState, client_info, owner};
use crate::backend::{SearchPage, scroll_page};
use crate::error::{ExecutionError, Result};
use crate::query::{QueryOptions, SearchParams, build_query};
use crate::session::{SearchSessionRecord, SessionStats};

const DEFAULT_PAGE_SIZE: u64 = 100;
const MAX_PAGE_SIZE: u64 = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSession {
    search_id: String,
    search_params: SearchParams,
}

/// Register a search, superseding the caller's other active searches.
pub(super) async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSession>,
) -> Result<Json<SearchSessionRecord>> {
    let owner = owner(&headers)?;
    state
        .registry
        .create(&owner, &body.search_id, body.search_params, client_info(&headers))
        .await?;
    let record = state.registry.status(&body.search_id, &owner).await?;
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct CancelSession {
    #[serde(default)]
    reason: Option<String>,
}

pub(super) async fn cancel_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(search_id): Path<String>,
    body: Option<Json<CancelSession>>,
) -> Result<Json<SearchSessionRecord>> {
    let owner = owner(&headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let record = state
        .registry
        .cancel(&search_id, &owner, body.reason.as_deref())
        .await?;
    Ok(Json(record))
}

pub(super) async fn session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(search_id): Path<String>,
) -> Result<Json<SearchSessionRecord>> {
    let owner = owner(&headers)?;
    Ok(Json(state.registry.status(&search_id, &owner).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Cleanup {
    #[serde(default)]
    max_age_minutes: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(super) struct CleanupResult {
    removed: usize,
}

pub(super) async fn cleanup_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<Cleanup>>,
) -> Result<Json<CleanupResult>> {
    owner(&headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let max_age = body
        .max_age_minutes
        .unwrap_or(state.config.server.search_session_max_age);
    if max_age == 0 {
        return Err(ExecutionError::InvalidParameters("maxAgeMinutes must be at least 1".into()).into());
    }
    let removed = state.registry.cleanup_inactive(max_age).await?;
    Ok(Json(CleanupResult { removed }))
}

pub(super) async fn session_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionStats>> {
    owner(&headers)?;
    Ok(Json(state.registry.stats().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SearchRequest {
    #[serde(default)]
    search_id: Option<String>,
    search_params: SearchParams,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SearchResponse {
    search_id: String,
    #[serde(flatten)]
    page: SearchPage,
}

/// One page of results, run under a search session so another request
/// can cancel it.
pub(super) async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let owner = owner(&headers)?;
    let params = body.search_params;
    params.validate()?;
    let page = params.current_page.unwrap_or(1);
    let page_size = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE) as usize;
    let query = build_query(&params, &QueryOptions::from(&state.config.backend))?;

    let search_id = body
        .search_id
        .unwrap_or_else(|| format!("search-{}", Uuid::new_v4()));
    let guard = state
        .registry
        .create(&owner, &search_id, params, client_info(&headers))
        .await?;

    let result = scroll_page(
        state.backend.as_ref(),
        &query,
        page,
        page_size,
        state.config.scroll_ttl(),
        &guard,
    )
    .await;

    match result {
        Ok(page) => {
            if let Err(e) = state.registry.complete(guard.session_id()).await {
                warn!(search_id, error = %e, "failed to record completed search");
            }
            Ok(Json(SearchResponse { search_id, page }))
        }
        Err(e) => {
            if e.is_cancellation() {
                debug!(search_id, "search cancelled");
            } else if let Err(record_err) = state.registry.fail(guard.session_id(), &e.to_string()).await {
                warn!(search_id, error = %record_err, "failed to record search failure");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode as Http;
    use serde_json::{Value, json};

    use super::super::tests::{params, spawn_server};
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn test_search_returns_requested_page() {
        let server = spawn_server(MemoryBackend::with_rows(25), 10).await;
        let mut search_params = params();
        search_params["currentPage"] = json!(3);
        search_params["limit"] = json!(10);

        let response = server
            .post(
                "/api/search",
                "alice",
                json!({ "searchId": "s-page", "searchParams": search_params }),
            )
            .await;
        assert_eq!(response.status(), Http::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["searchId"], "s-page");
        assert_eq!(body["total"], 25);
        assert_eq!(body["page"], 3);
        assert_eq!(body["hits"].as_array().unwrap().len(), 5);

        let status: Value = server
            .get("/api/search-sessions/s-page", "alice")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_search_rejects_bad_filter() {
        let server = spawn_server(MemoryBackend::with_rows(5), 10).await;
        let mut search_params = params();
        search_params["filter"] = json!("srcIp = ");
        let response = server
            .post("/api/search", "alice", json!({ "searchParams": search_params }))
            .await;
        assert_eq!(response.status(), Http::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_session_lifecycle() {
        let server = spawn_server(MemoryBackend::with_rows(1), 10).await;

        let first: Value = server
            .post(
                "/api/search-sessions",
                "alice",
                json!({ "searchId": "s-1", "searchParams": params() }),
            )
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(first["status"], "ACTIVE");
        assert_eq!(first["userId"], "alice");

        server
            .post(
                "/api/search-sessions",
                "alice",
                json!({ "searchId": "s-2", "searchParams": params() }),
            )
            .await;
        let superseded: Value = server
            .get("/api/search-sessions/s-1", "alice")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(superseded["status"], "CANCELLED");

        assert_eq!(
            server.get("/api/search-sessions/s-2", "bob").await.status(),
            Http::FORBIDDEN
        );
        assert_eq!(
            server.get("/api/search-sessions/none", "alice").await.status(),
            Http::NOT_FOUND
        );

        let cancelled: Value = server
            .post(
                "/api/search-sessions/s-2/cancel",
                "alice",
                json!({ "reason": "user closed the tab" }),
            )
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(cancelled["status"], "CANCELLED");
        assert_eq!(cancelled["cancelReason"], "user closed the tab");

        let stats: Value = server
            .get("/api/search-sessions/stats", "alice")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(stats["cancelled"], 2);

        let cleaned: Value = server
            .post("/api/search-sessions/cleanup", "alice", json!({ "maxAgeMinutes": 30 }))
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(cleaned["removed"], 2);

        let rejected = server
            .post("/api/search-sessions/cleanup", "alice", json!({ "maxAgeMinutes": 0 }))
            .await;
        assert_eq!(rejected.status(), Http::BAD_REQUEST);

        server
            .post(
                "/api/search-sessions",
                "alice",
                json!({ "searchId": "s-3", "searchParams": params() }),
            )
            .await;
        let overflow = server
            .post(
                "/api/search-sessions/cleanup",
                "alice",
                json!({ "maxAgeMinutes": u64::MAX }),
            )
            .await;
        assert_eq!(overflow.status(), Http::BAD_REQUEST);
        let live: Value = server
            .get("/api/search-sessions/s-3", "alice")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(live["status"], "ACTIVE");
    }
}
