//! OpenSearch HTTP client implementing [`SearchBackend`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Batch, BackendResult, CursorId, Row, SearchBackend, SearchQuery};
use crate::config::BackendConfig;
use crate::error::{BackendError, ConfigError, Result};

/// Only scroll ids and hit ids are returned while skipping to an offset.
const SKIP_FILTER_PATH: &str = "_scroll_id,hits.hits._id";

/// Longest backend error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Client for the OpenSearch count and scroll APIs.
#[derive(Debug, Clone)]
pub struct OpenSearchClient {
    http: reqwest::Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl OpenSearchClient {
    /// Build a client from backend settings.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout));

        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "backend.ca_cert_path".to_string(),
                    value: format!("{}: {e}", path.display()),
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if config.accept_invalid_certs {
            warn!("TLS certificate verification is disabled for the search backend");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let request = self.http.request(method, url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    /// Send a request and decode the JSON body, classifying failures.
    async fn send(&self, request: RequestBuilder, scroll: bool) -> BackendResult<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Unavailable(format!("failed to read response: {e}")))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| BackendError::QueryError(format!("invalid response body: {e}")));
        }

        Err(classify_failure(status, &body, scroll))
    }

    async fn search(
        &self,
        query: &SearchQuery,
        size: usize,
        scroll: &str,
        skip_only: bool,
    ) -> BackendResult<Value> {
        let mut path = format!("{}/_search?scroll={scroll}", self.index);
        if skip_only {
            path.push_str("&filter_path=");
            path.push_str(SKIP_FILTER_PATH);
        }
        let request = self.request(Method::POST, &path).json(&query.search_body(size));
        self.send(request, false).await
    }

    async fn scroll(&self, cursor: &CursorId, scroll: &str, skip_only: bool) -> BackendResult<Value> {
        let path = if skip_only {
            format!("_search/scroll?filter_path={SKIP_FILTER_PATH}")
        } else {
            "_search/scroll".to_string()
        };
        let request = self
            .request(Method::POST, &path)
            .json(&json!({ "scroll": scroll, "scroll_id": cursor.as_str() }));
        self.send(request, true).await
    }

    /// Open a cursor and move it to `query.offset`.
    ///
    /// Whole batches before the offset are fetched with ids only; the head
    /// of the batch straddling the offset is dropped locally.
    async fn position(
        &self,
        query: &SearchQuery,
        size: usize,
        scroll: &str,
        current: &mut Option<CursorId>,
    ) -> BackendResult<(CursorId, Batch)> {
        let size_u64 = size as u64;
        let mut remaining = query.offset;
        let mut skip_only = remaining >= size_u64;
        let mut response = self.search(query, size, scroll, skip_only).await?;

        loop {
            let cursor = scroll_id(&response)?;
            *current = Some(cursor.clone());
            let hits = hits(&response);

            if hits.is_empty() {
                return Ok((cursor, Batch::exhausted()));
            }

            if skip_only {
                remaining = remaining.saturating_sub(hits.len() as u64);
                skip_only = remaining >= size_u64;
                response = self.scroll(&cursor, scroll, skip_only).await?;
                continue;
            }

            let exhausted = hits.len() < size;
            let mut rows = into_rows(hits);
            let head = (remaining as usize).min(rows.len());
            rows.drain(..head);
            return Ok((cursor, Batch { rows, exhausted }));
        }
    }
}

#[async_trait]
impl SearchBackend for OpenSearchClient {
    async fn count(&self, query: &SearchQuery) -> BackendResult<u64> {
        let path = format!("{}/_count", self.index);
        let request = self.request(Method::POST, &path).json(&query.count_body());
        let response = self.send(request, false).await?;

        response
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| BackendError::QueryError("count response has no `count` field".into()))
    }

    async fn open_cursor(
        &self,
        query: &SearchQuery,
        batch_size: usize,
        ttl: Duration,
    ) -> BackendResult<(CursorId, Batch)> {
        let size = batch_size.max(1);
        let scroll = keep_alive(ttl);
        let mut current = None;

        match self.position(query, size, &scroll, &mut current).await {
            Ok((cursor, batch)) => {
                debug!(
                    cursor = %cursor,
                    offset = query.offset,
                    rows = batch.len(),
                    "opened scroll cursor"
                );
                Ok((cursor, batch))
            }
            Err(e) => {
                if let Some(cursor) = current {
                    self.close_cursor(&cursor).await;
                }
                Err(e)
            }
        }
    }

    async fn advance_cursor(&self, cursor: &CursorId, ttl: Duration) -> BackendResult<Batch> {
        let response = self.scroll(cursor, &keep_alive(ttl), false).await?;
        let hits = hits(&response);
        if hits.is_empty() {
            return Ok(Batch::exhausted());
        }
        Ok(Batch {
            rows: into_rows(hits),
            exhausted: false,
        })
    }

    async fn close_cursor(&self, cursor: &CursorId) {
        let request = self
            .request(Method::DELETE, "_search/scroll")
            .json(&json!({ "scroll_id": [cursor.as_str()] }));

        match self.send(request, true).await {
            Ok(_) => debug!(cursor = %cursor, "closed scroll cursor"),
            Err(BackendError::CursorExpired(_)) => {
                debug!(cursor = %cursor, "scroll cursor already gone")
            }
            Err(e) => warn!(cursor = %cursor, error = %e, "failed to close scroll cursor"),
        }
    }
}

fn keep_alive(ttl: Duration) -> String {
    format!("{}s", ttl.as_secs().max(1))
}

fn classify_failure(status: StatusCode, body: &str, scroll: bool) -> BackendError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    if body.contains("search_context_missing_exception") || (scroll && status == StatusCode::NOT_FOUND) {
        BackendError::CursorExpired(detail)
    } else if status.is_server_error() {
        BackendError::Unavailable(detail)
    } else {
        BackendError::QueryError(detail)
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

fn scroll_id(response: &Value) -> BackendResult<CursorId> {
    response
        .get("_scroll_id")
        .and_then(Value::as_str)
        .map(|id| CursorId(id.to_string()))
        .ok_or_else(|| BackendError::QueryError("search response has no `_scroll_id`".into()))
}

/// Hits of a search response; `filter_path` omits the array when it is empty.
fn hits(response: &Value) -> Vec<Value> {
    response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn into_rows(hits: Vec<Value>) -> Vec<Row> {
    hits.into_iter()
        .map(|mut hit| match hit.get_mut("_source").map(Value::take) {
            Some(Value::Object(source)) => source,
            _ => Row::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode as HttpStatus;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};

    /// Emulates the scroll API over `total` numbered documents.
    ///
    /// Scroll ids encode `position:size` so the mock stays stateless.
    #[derive(Default)]
    struct MockCluster {
        total: usize,
        light_requests: AtomicUsize,
        deletes: AtomicUsize,
    }

    fn page(cluster: &MockCluster, position: usize, size: usize, light: bool) -> Value {
        let end = (position + size).min(cluster.total);
        let hits: Vec<Value> = (position..end)
            .map(|i| {
                if light {
                    json!({ "_id": i.to_string() })
                } else {
                    json!({ "_id": i.to_string(), "_source": { "seq": i, "srcIp": format!("10.0.0.{i}") } })
                }
            })
            .collect();
        if light && hits.is_empty() {
            return json!({ "_scroll_id": format!("{end}:{size}") });
        }
        json!({ "_scroll_id": format!("{end}:{size}"), "hits": { "hits": hits } })
    }

    async fn count(
        State(cluster): State<Arc<MockCluster>>,
        Path(_index): Path<String>,
    ) -> Json<Value> {
        Json(json!({ "count": cluster.total }))
    }

    async fn search(
        State(cluster): State<Arc<MockCluster>>,
        Path(_index): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let light = params.contains_key("filter_path");
        if light {
            cluster.light_requests.fetch_add(1, Ordering::SeqCst);
        }
        let size = body["size"].as_u64().unwrap_or(10) as usize;
        Json(page(&cluster, 0, size, light))
    }

    async fn scroll(
        State(cluster): State<Arc<MockCluster>>,
        Query(params): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        let id = body["scroll_id"].as_str().unwrap_or_default();
        if id == "expired" {
            return (
                HttpStatus::NOT_FOUND,
                Json(json!({ "error": { "type": "search_context_missing_exception" } })),
            )
                .into_response();
        }
        let light = params.contains_key("filter_path");
        if light {
            cluster.light_requests.fetch_add(1, Ordering::SeqCst);
        }
        let (position, size) = id.split_once(':').unwrap();
        Json(page(
            &cluster,
            position.parse().unwrap(),
            size.parse().unwrap(),
            light,
        ))
        .into_response()
    }

    async fn clear(State(cluster): State<Arc<MockCluster>>) -> Json<Value> {
        cluster.deletes.fetch_add(1, Ordering::SeqCst);
        Json(json!({ "succeeded": true }))
    }

    async fn broken() -> impl IntoResponse {
        (HttpStatus::SERVICE_UNAVAILABLE, "cluster is restarting")
    }

    async fn spawn_cluster(total: usize) -> (OpenSearchClient, Arc<MockCluster>) {
        let cluster = Arc::new(MockCluster {
            total,
            ..Default::default()
        });
        let app = Router::new()
            .route("/:index/_count", post(count))
            .route("/:index/_search", post(search))
            .route("/_search/scroll", post(scroll).delete(clear))
            .with_state(cluster.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = BackendConfig {
            url: format!("http://{addr}"),
            index: "logs-test".into(),
            ..Default::default()
        };
        (OpenSearchClient::new(&config).unwrap(), cluster)
    }

    fn seq(row: &Row) -> u64 {
        row["seq"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_count() {
        let (client, _) = spawn_cluster(42).await;
        let query = SearchQuery::new(json!({ "match_all": {} }));
        assert_eq!(client.count(&query).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_open_at_zero_and_advance_to_end() {
        let (client, _) = spawn_cluster(25).await;
        let query = SearchQuery::new(json!({ "match_all": {} }));
        let ttl = Duration::from_secs(60);

        let (cursor, first) = client.open_cursor(&query, 10, ttl).await.unwrap();
        assert_eq!(first.len(), 10);
        assert!(!first.exhausted);
        assert_eq!(seq(&first.rows[0]), 0);

        let second = client.advance_cursor(&cursor, ttl).await.unwrap();
        assert_eq!(seq(&second.rows[0]), 10);
    }

    #[tokio::test]
    async fn test_open_at_offset_skips_with_ids_only() {
        let (client, cluster) = spawn_cluster(100).await;
        let query = SearchQuery::new(json!({ "match_all": {} })).window(35, 20);

        let (_, first) = client
            .open_cursor(&query, 10, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(first.len(), 5);
        assert_eq!(seq(&first.rows[0]), 35);
        assert_eq!(cluster.light_requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_small_final_window_skips_in_full_batches() {
        use crate::export::stream::{RowStream, ScrollStream};

        let (client, cluster) = spawn_cluster(1005).await;
        let query = SearchQuery::new(json!({ "match_all": {} }));
        let mut stream = ScrollStream::new(
            Arc::new(client),
            &query,
            1000,
            5,
            100,
            Duration::from_secs(60),
        );

        let rows = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(seq(&rows[0]), 1000);
        assert_eq!(cluster.light_requests.load(Ordering::SeqCst), 10);
        assert_eq!(stream.next_batch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_past_end_is_exhausted() {
        let (client, _) = spawn_cluster(10).await;
        let query = SearchQuery::new(json!({ "match_all": {} })).window(40, 10);

        let (_, first) = client
            .open_cursor(&query, 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first.is_empty());
        assert!(first.exhausted);
    }

    #[tokio::test]
    async fn test_expired_cursor() {
        let (client, _) = spawn_cluster(10).await;
        let err = client
            .advance_cursor(&CursorId("expired".into()), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::CursorExpired(_)));
    }

    #[tokio::test]
    async fn test_close_cursor_sends_delete() {
        let (client, cluster) = spawn_cluster(10).await;
        client.close_cursor(&CursorId("0:10".into())).await;
        assert_eq!(cluster.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let app = Router::new().route("/:index/_count", post(broken));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = BackendConfig {
            url: format!("http://{addr}"),
            ..Default::default()
        };
        let client = OpenSearchClient::new(&config).unwrap();
        let err = client
            .count(&SearchQuery::new(json!({ "match_all": {} })))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let config = BackendConfig {
            url: "http://127.0.0.1:1".into(),
            request_timeout: 2,
            ..Default::default()
        };
        let client = OpenSearchClient::new(&config).unwrap();
        let err = client
            .count(&SearchQuery::new(json!({ "match_all": {} })))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "parsing_exception", false),
            BackendError::QueryError(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, "index_not_found_exception", false),
            BackendError::QueryError(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, "{}", true),
            BackendError::CursorExpired(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, "", false),
            BackendError::Unavailable(_)
        ));
    }
}
