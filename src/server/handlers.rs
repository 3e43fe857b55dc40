use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::lifecycle::LifecycleError;
use crate::logs::stream_function_logs;
use crate::model::Language;
use crate::proxy::ProxyError;
use crate::server::state::AppState;
use crate::store::StoreError;
use crate::substrate::SubstrateError;

/// Error surface of the HTTP API. Every failure renders as
/// `{"error": "..."}` with a status chosen from the error class.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let status = match &err {
            LifecycleError::PreconditionFailed => StatusCode::BAD_REQUEST,
            LifecycleError::ConfigMissing(_) | LifecycleError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            LifecycleError::ConfigDisabled(_) => StatusCode::FORBIDDEN,
            LifecycleError::Substrate(_) | LifecycleError::Store(_) => {
                error!(error = %err, "lifecycle operation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<SubstrateError> for ApiError {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            _ => {
                error!(error = %err, "substrate call failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store access failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        error!(error = %err, "proxy request failed");
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Caller identity, carried in the `x-owner-id` header on every function and
/// config route.
fn owner_from(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing x-owner-id header"))
}

fn default_language() -> Language {
    Language::Nodejs
}

fn require_code(code: &str) -> Result<(), ApiError> {
    if code.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Function code must not be empty",
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateFunctionRequest {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: Language,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFunctionRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigRequest {
    pub owner: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleConfigRequest {
    pub owner: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Control plane status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ServerStatus {
        served_requests: state.served_count(),
    })
}

#[derive(Serialize)]
struct ServerStatus {
    served_requests: u64,
}

pub async fn create_function(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateFunctionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    require_code(&request.code)?;
    let function = state
        .lifecycle
        .create(&owner, &project_id, &request.code, request.language)
        .await?;
    Ok((StatusCode::CREATED, Json(function)))
}

pub async fn list_functions(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    let functions = state.lifecycle.list(&owner, &project_id).await?;
    Ok(Json(functions))
}

pub async fn get_function(
    State(state): State<AppState>,
    Path((project_id, code_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    let function = state.lifecycle.get(&owner, &project_id, code_id).await?;
    Ok(Json(function))
}

pub async fn update_function(
    State(state): State<AppState>,
    Path((project_id, code_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    Json(request): Json<UpdateFunctionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    require_code(&request.code)?;
    let function = state
        .lifecycle
        .update(&owner, &project_id, code_id, &request.code)
        .await?;
    Ok(Json(function))
}

pub async fn delete_function(
    State(state): State<AppState>,
    Path((project_id, code_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    state.lifecycle.delete(&owner, &project_id, code_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run the function's image build to completion and return the updated
/// record. The response arrives only once the build watch has resolved.
pub async fn build_function(
    State(state): State<AppState>,
    Path((project_id, code_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    let function = state.lifecycle.build(&owner, &project_id, code_id).await?;
    Ok(Json(function))
}

pub async fn deploy_function(
    State(state): State<AppState>,
    Path((project_id, code_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    let function = state.lifecycle.deploy(&owner, &project_id, code_id).await?;
    Ok(Json(function))
}

pub async fn redeploy_function(
    State(state): State<AppState>,
    Path((project_id, code_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    let function = state
        .lifecycle
        .redeploy(&owner, &project_id, code_id)
        .await?;
    Ok(Json(function))
}

/// Merged log stream over every pod serving the function, framed per pod.
pub async fn function_logs(
    State(state): State<AppState>,
    Path((project_id, code_id)): Path<(String, Uuid)>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    // Resolves ownership and the config gate before any substrate access.
    let function = state.lifecycle.get(&owner, &project_id, code_id).await?;

    let stream =
        stream_function_logs(state.substrate.clone(), &function.id.to_string(), query.follow)
            .await?;
    Ok((
        [("content-type", "text/event-stream")],
        Body::from_stream(stream),
    ))
}

pub async fn create_config(
    State(state): State<AppState>,
    Json(request): Json<CreateConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .lifecycle
        .create_config(&request.owner, &request.project_id)
        .await?;
    Ok((StatusCode::CREATED, Json(config)))
}

pub async fn toggle_config(
    State(state): State<AppState>,
    Json(request): Json<ToggleConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .lifecycle
        .set_config_enabled(&request.owner, &request.project_id, request.enabled)
        .await?;
    Ok(Json(config))
}

pub async fn serve_root(
    State(state): State<AppState>,
    Path(function_id): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy_request(state, function_id, String::new(), request).await
}

pub async fn serve_path(
    State(state): State<AppState>,
    Path((function_id, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy_request(state, function_id, format!("/{}", path), request).await
}

/// Forward one `/serve` request to the function's service and stream the
/// upstream response back. Unknown function ids are rejected here, before
/// anything goes upstream.
async fn proxy_request(
    state: AppState,
    function_id: String,
    path: String,
    request: Request,
) -> Result<Response, ApiError> {
    state.record_served();

    let known = match Uuid::parse_str(&function_id) {
        Ok(id) => state.functions.get(id).await?.is_some(),
        Err(_) => false,
    };
    if !known {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Function '{}' not found", function_id),
        ));
    }

    let (parts, body) = request.into_parts();
    let query = parts.uri.query().map(str::to_string);
    let upstream = state
        .proxy
        .forward(
            &function_id,
            parts.method,
            &path,
            query.as_deref(),
            parts.headers,
            reqwest::Body::wrap_stream(body.into_data_stream()),
        )
        .await?;

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| ApiError::new(StatusCode::BAD_GATEWAY, err.to_string()))
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/config", post(create_config).patch(toggle_config))
        .route("/function/{project_id}", post(create_function))
        .route("/functions/{project_id}", get(list_functions))
        .route(
            "/function/{project_id}/{code_id}",
            get(get_function)
                .patch(update_function)
                .delete(delete_function),
        )
        .route("/function/{project_id}/{code_id}/build", post(build_function))
        .route(
            "/function/{project_id}/{code_id}/deploy",
            post(deploy_function),
        )
        .route(
            "/function/{project_id}/{code_id}/redeploy",
            post(redeploy_function),
        )
        .route("/function/{project_id}/{code_id}/logs", get(function_logs))
        .route("/serve/{function_id}", any(serve_root))
        .route("/serve/{function_id}/{*path}", any(serve_path))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::settings::Settings;
    use crate::store::MemoryStore;
    use crate::substrate::{MockSubstrate, PodPhase, PodState, ResourceEvent};

    fn create_test_app() -> (Router, Arc<MockSubstrate>) {
        let store = Arc::new(MemoryStore::new());
        let substrate = Arc::new(MockSubstrate::new());
        let state = AppState::new(
            Settings::default(),
            store.clone(),
            store,
            substrate.clone(),
        );
        (create_router(state), substrate)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-owner-id", "alice")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-owner-id", "alice")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_config(app: &Router) {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/config",
                serde_json::json!({"owner": "alice", "projectId": "shop"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    async fn seed_function(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/function/shop",
                serde_json::json!({"code": "console.log('hi')", "language": "nodejs"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["served_requests"], 0);
    }

    #[tokio::test]
    async fn test_create_function_requires_config() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(json_request(
                "POST",
                "/function/shop",
                serde_json::json!({"code": "x"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("config"));
    }

    #[tokio::test]
    async fn test_create_function_returns_record() {
        let (app, _) = create_test_app();
        seed_config(&app).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/function/shop",
                serde_json::json!({"code": "console.log('hi')"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["buildStatus"], "NotBuilt");
        assert_eq!(body["deployStatus"], "NotDeployed");
        assert_eq!(body["lastAction"], "Create");
        assert_eq!(body["projectId"], "shop");
    }

    #[tokio::test]
    async fn test_missing_owner_header_is_rejected() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/function/shop")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"code": "x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_build_endpoint_runs_to_terminal_status() {
        let (app, substrate) = create_test_app();
        seed_config(&app).await;
        let id = seed_function(&app).await;
        substrate.script_pod_events(vec![ResourceEvent::Pod(PodState {
            name: "build-pod".to_string(),
            phase: PodPhase::Succeeded,
            message: String::new(),
        })]);

        let response = app
            .clone()
            .oneshot(empty_request(
                "POST",
                &format!("/function/shop/{}/build", id),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["buildStatus"], "Success");
        assert_eq!(body["lastAction"], "Build");
    }

    #[tokio::test]
    async fn test_deploy_before_build_is_rejected() {
        let (app, _) = create_test_app();
        seed_config(&app).await;
        let id = seed_function(&app).await;

        let response = app
            .clone()
            .oneshot(empty_request(
                "POST",
                &format!("/function/shop/{}/deploy", id),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_rebuilds_and_flips_to_redeploy_required() {
        let (app, substrate) = create_test_app();
        seed_config(&app).await;
        let id = seed_function(&app).await;
        substrate.script_pod_events(vec![ResourceEvent::Pod(PodState {
            name: "build-pod".to_string(),
            phase: PodPhase::Succeeded,
            message: String::new(),
        })]);

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &format!("/function/shop/{}", id),
                serde_json::json!({"code": "console.log('v2')"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["buildStatus"], "Success");
        assert_eq!(body["deployStatus"], "RedeployRequired");
        assert_eq!(body["lastAction"], "Update");
        assert_eq!(body["code"], "console.log('v2')");
        assert_eq!(substrate.build_jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_function() {
        let (app, _) = create_test_app();
        seed_config(&app).await;

        let response = app
            .oneshot(empty_request(
                "GET",
                &format!("/function/shop/{}", Uuid::new_v4()),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disabled_config_is_forbidden() {
        let (app, _) = create_test_app();
        seed_config(&app).await;
        let id = seed_function(&app).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/config",
                serde_json::json!({"owner": "alice", "projectId": "shop", "enabled": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/function/shop/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_logs_endpoint_streams_frames() {
        let (app, substrate) = create_test_app();
        seed_config(&app).await;
        let id = seed_function(&app).await;
        let selector = crate::substrate::LabelSelector::app(&id);
        substrate.register_pod("pod-a", &selector);
        substrate.script_pod_logs("pod-a", vec![Ok(b"hello from fn".to_vec())]);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/function/shop/{}/logs", id)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"data: pod-a: hello from fn\n\n");
    }

    #[tokio::test]
    async fn test_list_functions() {
        let (app, _) = create_test_app();
        seed_config(&app).await;
        seed_function(&app).await;
        seed_function(&app).await;

        let response = app
            .oneshot(empty_request("GET", "/functions/shop"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_function() {
        let (app, substrate) = create_test_app();
        seed_config(&app).await;
        let id = seed_function(&app).await;

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/function/shop/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            substrate.deleted_deployments.lock().unwrap().as_slice(),
            [id.clone()]
        );

        let response = app
            .oneshot(empty_request("GET", &format!("/function/shop/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_unknown_function_is_404_before_forwarding() {
        let (app, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(empty_request(
                "GET",
                &format!("/serve/{}/anything", Uuid::new_v4()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Non-UUID ids never resolve either.
        let response = app
            .oneshot(empty_request("GET", "/serve/not-a-uuid"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_code_is_rejected() {
        let (app, _) = create_test_app();
        seed_config(&app).await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/function/shop",
                serde_json::json!({"code": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(empty_request("GET", "/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
