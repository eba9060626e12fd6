mod files;
mod indexes;
mod runs;

use std::future::Future;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_transfer::failure::classify_failure;
use courier_transfer::{ErrorKind, RemoteError, TransferError};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{metrics, state::AppState};

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config().body_limit();
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/files", post(files::upload_multipart))
        .route("/files/base64", post(files::upload_base64))
        .route("/files/:file_id", get(files::get_file))
        .route("/indexes", post(indexes::create_index))
        .route("/indexes/:index_id", get(indexes::get_index))
        .route(
            "/indexes/:index_id/files",
            get(indexes::list_index_files).post(indexes::attach_file),
        )
        .route("/runs", post(runs::stream_run))
        .route("/runs/analyze", post(runs::analyze))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "build": env!("COURIER_BUILD_ID"),
        "commit": env!("COURIER_BUILD_COMMIT"),
        "builtAt": env!("COURIER_BUILD_TIME"),
    }))
}

async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}

/// One remote read under the configured fetch budget.
async fn fetch<T, F, Fut>(state: &AppState, subject: &str, operation: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    state
        .config()
        .runs
        .fetch_retry
        .execute_if(subject, operation, RemoteError::is_retryable)
        .await
        .map_err(|err| ApiError::transfer(classify_failure(subject, err), state))
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Error response body: a short `message`, the underlying `error`, a stable
/// `code`, and debug `details` outside production.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
    error: String,
    code: &'static str,
    details: Option<String>,
}

#[derive(Serialize)]
struct ApiErrorBody<'a> {
    message: &'a str,
    error: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Invalid request",
            error: error.into(),
            code: ErrorKind::Validation.code(),
            details: None,
        }
    }

    pub fn transfer(err: TransferError, state: &AppState) -> Self {
        let kind = err.kind();
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let details = state
            .config()
            .environment
            .is_development()
            .then(|| format!("{err:?}"));
        Self {
            status,
            message: title(kind),
            error: err.to_string(),
            code: kind.code(),
            details,
        }
    }
}

fn title(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "Invalid request",
        ErrorKind::NotFound => "Not found",
        ErrorKind::TooLarge => "File too large",
        ErrorKind::TooLargeForEnvironment => "File too large for production environment",
        ErrorKind::UploadTimeout => "Upload timed out",
        ErrorKind::ServerOutOfMemory => "Server ran out of memory",
        ErrorKind::UpstreamFault | ErrorKind::UpstreamGateway => "Document service error",
        ErrorKind::RemoteFailed => "Document service reported a failure",
        ErrorKind::StreamStall => "Document service stopped responding",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            message: self.message,
            error: &self.error,
            code: self.code,
            details: self.details.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Environment, GatewayConfig};
    use axum::{
        body::{self, Body},
        http::{header, Request},
    };
    use courier_transfer::{
        MemoryDocumentService, RemoteStatus, UploadLimits, UploadSettings, MEBI_BYTE,
    };
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const BOUNDARY: &str = "courier-test-boundary";

    fn app_with(config: GatewayConfig) -> (Router, Arc<MemoryDocumentService>) {
        let service = Arc::new(MemoryDocumentService::new());
        let state = AppState::in_memory(config, service.clone());
        (build_router(state), service)
    }

    fn limited(absolute: u64, recommended: Option<u64>, environment: Environment) -> GatewayConfig {
        GatewayConfig {
            environment,
            upload: UploadSettings {
                limits: UploadLimits {
                    absolute,
                    recommended,
                },
                ..UploadSettings::default()
            },
            ..GatewayConfig::default()
        }
    }

    fn multipart(file_name: &str, contents: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: text/plain\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Result<Value, Box<dyn std::error::Error>> {
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn health_reports_ok() -> TestResult {
        let (app, _service) = app_with(GatewayConfig::default());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await?;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["commit"], env!("COURIER_BUILD_COMMIT"));
        let build = body["build"].as_str().ok_or("missing build")?;
        assert!(build.starts_with(env!("CARGO_PKG_VERSION")));
        Ok(())
    }

    #[tokio::test]
    async fn declared_oversize_is_rejected_without_remote_calls() -> TestResult {
        let (app, service) = app_with(limited(100 * MEBI_BYTE, None, Environment::Production));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={BOUNDARY}"),
                    )
                    .header(header::CONTENT_LENGTH, 120 * MEBI_BYTE)
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await?;
        assert_eq!(body["message"], "File too large");
        assert_eq!(body["code"], "file_too_large");
        assert!(body.get("details").is_none());
        assert_eq!(service.calls().create_file, 0);
        Ok(())
    }

    fn multipart_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/files")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn deployment_limit_uses_its_own_message() -> TestResult {
        let (app, service) = app_with(limited(
            100 * MEBI_BYTE,
            Some(1_000),
            Environment::Development,
        ));
        let response = app
            .oneshot(multipart_request(multipart("big.txt", &[b'x'; 1_500])))
            .await?;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await?;
        assert_eq!(body["message"], "File too large for production environment");
        assert_eq!(body["code"], "file_too_large_for_environment");
        assert!(body["details"].is_string());
        assert_eq!(service.calls().create_file, 0);
        Ok(())
    }

    #[tokio::test]
    async fn file_exactly_at_the_limit_is_accepted() -> TestResult {
        let (app, service) = app_with(limited(1_000, Some(1_000), Environment::Production));
        let body = multipart("exact.bin", &[b'x'; 1_000]);
        assert!(body.len() > 1_000);
        let response = app.oneshot(multipart_request(body)).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await?["bytes"], 1_000);
        assert_eq!(service.calls().create_file, 1);
        Ok(())
    }

    #[tokio::test]
    async fn file_one_byte_over_the_limit_is_rejected() -> TestResult {
        let (app, service) = app_with(limited(1_000, None, Environment::Production));
        let response = app
            .oneshot(multipart_request(multipart("over.bin", &[b'x'; 1_001])))
            .await?;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await?["code"], "file_too_large");
        assert_eq!(service.calls().create_file, 0);
        Ok(())
    }

    #[tokio::test]
    async fn multipart_upload_returns_receipt() -> TestResult {
        let (app, service) = app_with(GatewayConfig::default());
        let body = multipart("notes.txt", b"quarterly figures");
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files")
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={BOUNDARY}"),
                    )
                    .body(Body::from(body))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let receipt = json_body(response).await?;
        assert_eq!(receipt["fileName"], "notes.txt");
        assert_eq!(receipt["bytes"], 17);
        let id = receipt["id"].as_str().ok_or("missing id")?;
        assert_eq!(
            service.file_contents(id).as_deref(),
            Some(&b"quarterly figures"[..])
        );
        Ok(())
    }

    #[tokio::test]
    async fn base64_upload_decodes_content() -> TestResult {
        let (app, service) = app_with(GatewayConfig::default());
        let response = app
            .oneshot(json_request(
                "/files/base64",
                json!({"fileObject": {"name": "a.txt", "content": "aGVsbG8=", "type": "text/plain"}}),
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let receipt = json_body(response).await?;
        let id = receipt["id"].as_str().ok_or("missing id")?;
        assert_eq!(service.file_contents(id).as_deref(), Some(&b"hello"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn base64_upload_rejects_invalid_content() -> TestResult {
        let (app, service) = app_with(GatewayConfig::default());
        let response = app
            .oneshot(json_request(
                "/files/base64",
                json!({"fileObject": {"name": "a.txt", "content": "not base64!"}}),
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await?["code"], "validation_error");
        assert_eq!(service.calls().create_file, 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_index_is_not_found() -> TestResult {
        let (app, _service) = app_with(GatewayConfig::default());
        let response = app
            .oneshot(Request::builder().uri("/indexes/vs-missing").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await?["code"], "not_found");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn index_create_and_attach() -> TestResult {
        let (app, service) = app_with(GatewayConfig::default());
        let response = app
            .clone()
            .oneshot(json_request("/indexes", json!({})))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let index = json_body(response).await?;
        assert_eq!(index["name"], "Document Store");
        let index_id = index["id"].as_str().ok_or("missing index id")?.to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                "/files/base64",
                json!({"fileObject": {"name": "a.txt", "content": "aGVsbG8="}}),
            ))
            .await?;
        let file_id = json_body(response).await?["id"]
            .as_str()
            .ok_or("missing file id")?
            .to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                &format!("/indexes/{index_id}/files"),
                json!({"fileId": file_id}),
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let outcome = json_body(response).await?;
        assert_eq!(outcome["id"], file_id.as_str());
        assert_eq!(outcome["verified"], true);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/indexes/{index_id}/files"))
                    .body(Body::empty())?,
            )
            .await?;
        let listed = json_body(response).await?;
        assert_eq!(listed["data"][0]["id"], file_id.as_str());
        assert_eq!(service.calls().attach_file_to_index, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn run_streams_frames_then_done() -> TestResult {
        let (app, service) = app_with(GatewayConfig::default());
        service.insert_index("vs_1", "Document Store");
        let response = app
            .oneshot(json_request(
                "/runs",
                json!({"indexId": "vs_1", "instructions": "Summarise"}),
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let bytes = response.into_body().collect().await?.to_bytes();
        let text = String::from_utf8(bytes.to_vec())?;
        let data: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert!(data.len() >= 2);
        assert_eq!(data.last(), Some(&"[DONE]"));
        let first: Value = serde_json::from_str(data[0])?;
        assert!(first["event"].is_string());
        Ok(())
    }

    #[tokio::test]
    async fn run_against_missing_index_fails_before_streaming() -> TestResult {
        let (app, _service) = app_with(GatewayConfig::default());
        let response = app
            .oneshot(json_request(
                "/runs",
                json!({"indexId": "vs_missing", "instructions": "Summarise"}),
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn analyze_returns_output_text() -> TestResult {
        let (app, service) = app_with(GatewayConfig::default());
        service.insert_index("vs_1", "Document Store");
        service.set_run_statuses([RemoteStatus::InProgress, RemoteStatus::Completed]);
        service.set_run_output("Three phases.");
        let response = app
            .oneshot(json_request(
                "/runs/analyze",
                json!({"indexId": "vs_1", "instructions": "Summarise"}),
            ))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let outcome = json_body(response).await?;
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["reachedTerminal"], true);
        assert_eq!(outcome["text"], "Three phases.");
        Ok(())
    }
}
