//! JSON query surface over HTTP: page, filter, search, reload and status.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::loglens_core::{FilterRequest, LogRecord};
use crate::loglens_pager::{PagerError, PagerStatus, PaginationIndex, SearchOptions, SearchResult};

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error(transparent)]
    Pager(#[from] PagerError),
}

impl HttpError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HttpError::Pager(PagerError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Pager(PagerError::InvalidRegex { .. }) => StatusCode::BAD_REQUEST,
            HttpError::Pager(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, "query failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub start_idx: u64,
    pub end_idx: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageResponse {
    pub version: u64,
    pub total: u64,
    pub rows: Vec<LogRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterResponse {
    pub version: u64,
    pub changed: bool,
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(flatten)]
    pub options: SearchOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadResponse {
    pub version: u64,
}

pub fn router(pager: Arc<PaginationIndex>) -> Router {
    Router::new()
        .route("/page", post(page_handler))
        .route("/filter", post(filter_handler))
        .route("/search", post(search_handler))
        .route("/reload", post(reload_handler))
        .route("/status", get(status_handler))
        .with_state(pager)
}

/// Serves `router(pager)` on `listener` until Ctrl-C.
pub async fn serve(listener: TcpListener, pager: Arc<PaginationIndex>) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "serving queries");
    axum::serve(listener, router(pager))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

async fn page_handler(
    State(pager): State<Arc<PaginationIndex>>,
    Json(request): Json<PageRequest>,
) -> Result<Json<PageResponse>, HttpError> {
    let page = pager.read_range_by_idx(request.start_idx, request.end_idx).await?;
    Ok(Json(PageResponse { version: page.version, total: page.total, rows: page.records }))
}

async fn filter_handler(
    State(pager): State<Arc<PaginationIndex>>,
    Json(request): Json<FilterRequest>,
) -> Result<Json<FilterResponse>, HttpError> {
    let changed = pager.set_filter(&request)?;
    let version = pager.version()?;
    let total = match pager.get_filtered_total().await {
        Ok(total) => total,
        Err(PagerError::NotReady) => 0,
        Err(err) => return Err(err.into()),
    };
    Ok(Json(FilterResponse { version, changed, total }))
}

async fn search_handler(
    State(pager): State<Arc<PaginationIndex>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResult>, HttpError> {
    Ok(Json(pager.search_all(&request.query, &request.options).await?))
}

async fn reload_handler(State(pager): State<Arc<PaginationIndex>>) -> Result<Json<ReloadResponse>, HttpError> {
    Ok(Json(ReloadResponse { version: pager.reload()? }))
}

async fn status_handler(State(pager): State<Arc<PaginationIndex>>) -> Result<Json<PagerStatus>, HttpError> {
    Ok(Json(pager.status()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loglens_storage::DatasetWriter;
    use axum::body::Body;
    use axum::http::Request;
    use rstest::{fixture, rstest};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Served {
        _dir: TempDir,
        pager: Arc<PaginationIndex>,
    }

    #[fixture]
    fn served() -> Served {
        let dir = TempDir::new().expect("temp dir");
        let mut writer = DatasetWriter::create(dir.path(), 3).expect("writer");
        let records: Vec<LogRecord> = (1..=8)
            .rev()
            .map(|n| {
                let proc = if n % 2 == 0 { "dnsmasq" } else { "hostapd" };
                LogRecord::from_line(n, "messages", format!("Jan  1 00:00:0{n} gw {proc}[{n}]: line {n}"), None)
            })
            .collect();
        writer.append_older(&records).expect("append");
        writer.finish().expect("finish");
        let pager = Arc::new(PaginationIndex::default());
        pager.open_manifest(dir.path()).expect("open");
        Served { _dir: dir, pager }
    }

    async fn call(pager: Arc<PaginationIndex>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |body| Body::from(body.to_string())))
            .expect("request");
        let response = router(pager).oneshot(request).await.unwrap_or_else(|err| match err {});
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[rstest]
    #[tokio::test]
    async fn page_returns_ascending_rows_with_version(served: Served) {
        let (status, body) = call(served.pager.clone(), "POST", "/page", Some(json!({"startIdx": 2, "endIdx": 4}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], json!(1));
        assert_eq!(body["total"], json!(8));
        let idx: Vec<u64> = body["rows"]
            .as_array()
            .expect("rows")
            .iter()
            .map(|row| row["idx"].as_u64().expect("idx"))
            .collect();
        assert_eq!(idx, vec![2, 3, 4]);
    }

    #[rstest]
    #[tokio::test]
    async fn filter_reports_change_and_total_once(served: Served) {
        let filter = json!({"proc": "dnsmasq"});
        let (status, body) = call(served.pager.clone(), "POST", "/filter", Some(filter.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], json!(true));
        assert_eq!(body["total"], json!(4));
        assert_eq!(body["version"], json!(2));

        let (_, again) = call(served.pager.clone(), "POST", "/filter", Some(filter)).await;
        assert_eq!(again["changed"], json!(false));
        assert_eq!(again["version"], json!(2));
    }

    #[rstest]
    #[tokio::test]
    async fn invalid_regex_is_a_bad_request(served: Served) {
        let (status, body) =
            call(served.pager.clone(), "POST", "/search", Some(json!({"query": "(", "regex": true}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().expect("error").contains("invalid regex"));
    }

    #[rstest]
    #[tokio::test]
    async fn search_honours_top(served: Served) {
        let (status, body) =
            call(served.pager.clone(), "POST", "/search", Some(json!({"query": "line", "top": 2}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hits"].as_array().expect("hits").len(), 2);
        assert_eq!(body["hits"][0]["idx"], json!(1));
    }

    #[tokio::test]
    async fn queries_before_any_dataset_are_unavailable() {
        let pager = Arc::new(PaginationIndex::default());
        let (status, _) = call(pager.clone(), "POST", "/page", Some(json!({"startIdx": 1, "endIdx": 5}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = call(pager, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], json!("uninitialized"));
        assert_eq!(body["version"], json!(0));
    }
}
