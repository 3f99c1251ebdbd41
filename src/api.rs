use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use orchestrator::{archive_job, CrawlOptions, Orchestrator, OrchestratorError};
use poller::SubmitResponse;
use serde::Deserialize;
use session::JobStatus;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        match error {
            OrchestratorError::InvalidInput(message) => ApiError::BadRequest(message),
            OrchestratorError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<session::SessionError> for ApiError {
    fn from(error: session::SessionError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub url: String,
    #[serde(default)]
    pub options: Option<CrawlOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

impl SessionQuery {
    fn require(self) -> Result<String, ApiError> {
        self.session_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("sessionId is required".to_string()))
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(health))
        .route("/capture", post(submit_capture).get(capture_status))
        .route("/download", get(download))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_capture(
    State(state): State<AppState>,
    payload: Result<Json<CaptureRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let options = request.options.unwrap_or_default();

    let session_id = state.orchestrator.submit(&request.url, options).await?;
    info!(session_id = %session_id, url = %request.url, "Capture submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            session_id,
            status: "processing".to_string(),
        }),
    ))
}

async fn capture_status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, ApiError> {
    let session_id = query.require()?;
    match state.orchestrator.store().get(&session_id).await? {
        Some(job) => Ok(Json(job.report()).into_response()),
        None => Err(ApiError::NotFound(format!("session not found: {}", session_id))),
    }
}

/// Streams the archive of a finished job, then evicts the job.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, ApiError> {
    let session_id = query.require()?;
    let store = state.orchestrator.store();

    let job = store
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", session_id)))?;
    if !job.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "session {} is still {}",
            session_id,
            job.status.as_str()
        )));
    }
    if job.status == JobStatus::Failed {
        let cause = job.error.as_deref().unwrap_or("unknown error");
        return Err(ApiError::Unprocessable(format!("session {} failed: {}", session_id, cause)));
    }

    let archive = tokio::task::spawn_blocking(move || archive_job(&job))
        .await
        .map_err(|e| ApiError::Internal(format!("archive task failed: {}", e)))?
        .map_err(|e| match e {
            exporter::ExportError::NothingToPackage => ApiError::Unprocessable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        })?;

    store.delete(&session_id).await?;
    info!(session_id = %session_id, size = archive.len(), "Archive delivered, session evicted");

    let disposition = format!("attachment; filename=\"capture-{}.zip\"", session_id);
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/zip".to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use browser::mock::{MockFailure, MockLauncher, MockPageSpec, MockSite};
    use browser::{BrowserPool, PoolPolicy};
    use crawler::{LinkDiscoverer, ScrollConfig};
    use http_body_util::BodyExt;
    use session::{CrawlJob, InMemoryJobStore, JobStatus, JobStore, JobUpdate};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(site: &MockSite) -> (Router, Arc<Orchestrator>) {
        let pool = Arc::new(BrowserPool::new(
            Arc::new(MockLauncher::new(site.clone())),
            PoolPolicy::default(),
        ));
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let orchestrator = Arc::new(Orchestrator::new(pool, store).with_discoverer(LinkDiscoverer::new(
            ScrollConfig {
                step_px: 800,
                delay: Duration::ZERO,
                max_iterations: 10,
            },
        )));
        let router = create_router(AppState {
            orchestrator: orchestrator.clone(),
        });
        (router, orchestrator)
    }

    fn fast_options() -> serde_json::Value {
        serde_json::json!({ "timeoutMs": 5000, "postLoadDelayMs": 0 })
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, headers, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = app(&MockSite::new());
        let (status, _, body) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_poll_download() {
        let site = MockSite::new()
            .page("https://example.com/", MockPageSpec::new("Home").with_links(["/about"]))
            .page("https://example.com/about", MockPageSpec::new("About"));
        let (router, _) = app(&site);

        let (status, _, body) = send(
            &router,
            post_json(
                "/capture",
                serde_json::json!({ "url": "https://example.com", "options": fast_options() }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let submitted = json(&body);
        assert_eq!(submitted["status"], "processing");
        let session_id = submitted["sessionId"].as_str().unwrap().to_string();

        let status_uri = format!("/capture?sessionId={}", session_id);
        let mut report = serde_json::Value::Null;
        for _ in 0..200 {
            let (status, _, body) = send(&router, get(&status_uri)).await;
            assert_eq!(status, StatusCode::OK);
            report = json(&body);
            if report["status"] == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(report["status"], "completed");
        assert_eq!(report["successCount"], 2);
        assert_eq!(report["pages"][0]["url"], "https://example.com/");

        let (status, headers, body) =
            send(&router, get(&format!("/download?sessionId={}", session_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/zip");
        assert_eq!(
            headers[CONTENT_DISPOSITION],
            format!("attachment; filename=\"capture-{}.zip\"", session_id).as_str()
        );
        assert!(body.starts_with(b"PK"));

        let (status, _, _) = send(&router, get(&status_uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let (router, orchestrator) = app(&MockSite::new());

        let (status, _, body) = send(
            &router,
            post_json("/capture", serde_json::json!({ "url": "javascript:alert(1)" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json(&body)["error"].as_str().unwrap().contains("Invalid URL"));

        let (status, _, _) = send(&router, post_json("/capture", serde_json::json!({ "options": {} }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(
            &router,
            post_json(
                "/capture",
                serde_json::json!({ "url": "https://example.com", "options": { "maxLinks": 1000 } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert!(orchestrator.store().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_requires_session_id() {
        let (router, _) = app(&MockSite::new());
        let (status, _, _) = send(&router, get("/capture")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(&router, get("/capture?sessionId=unknown")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_unknown_session_is_not_found() {
        let (router, _) = app(&MockSite::new());
        let (status, _, body) = send(&router, get("/download?sessionId=never-created")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json(&body)["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_download_of_all_failed_job_is_unprocessable() {
        let site = MockSite::new().page(
            "https://unreachable.invalid/",
            MockPageSpec::new("").with_failure(MockFailure::Dns),
        );
        let (router, orchestrator) = app(&site);
        let job = orchestrator
            .run(
                "https://unreachable.invalid/",
                serde_json::from_value(fast_options()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let (status, _, _) = send(&router, get(&format!("/download?sessionId={}", job.session_id))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(orchestrator.store().get(&job.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_download_of_failed_job_reports_its_error() {
        let (router, orchestrator) = app(&MockSite::new());
        let store = orchestrator.store();
        store
            .create(CrawlJob::new("broken", &url::Url::parse("https://example.com").unwrap()))
            .await
            .unwrap();
        store
            .update("broken", JobUpdate::failed("Failed to launch browser: chrome binary not found"))
            .await
            .unwrap();

        let (status, _, body) = send(&router, get("/download?sessionId=broken")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let message = json(&body)["error"].as_str().unwrap().to_string();
        assert!(message.contains("chrome binary not found"));
        assert!(store.get("broken").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_download_before_completion_conflicts() {
        let (router, orchestrator) = app(&MockSite::new());
        let store = orchestrator.store();
        let job = CrawlJob::new("running", &url::Url::parse("https://example.com").unwrap());
        store.create(job).await.unwrap();
        store
            .update("running", JobUpdate::status(JobStatus::Processing))
            .await
            .unwrap();

        let (status, _, _) = send(&router, get("/download?sessionId=running")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let (router, _) = app(&MockSite::new());
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/capture")
            .header("origin", "https://app.example.org")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();

        let (status, headers, _) = send(&router, request).await;
        assert!(status.is_success());
        assert_eq!(headers["access-control-allow-origin"], "*");
        let methods = headers["access-control-allow-methods"].to_str().unwrap();
        assert!(methods.contains("POST"));
    }
}
