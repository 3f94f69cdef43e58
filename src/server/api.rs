//! HTTP surface of the worker API.
//!
//! All routes hang off the configured base path. Errors use the stable
//! `IMAGE-BUILDER-WORKER-<n>` code catalog so workers can match on them
//! across server versions.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::jobs::split_type;

use super::Server;

const CODE_INVALID_REQUEST: u32 = 1;
const CODE_UNKNOWN_ROUTE: u32 = 2;
const CODE_METHOD_NOT_ALLOWED: u32 = 3;
const CODE_AUTH_REQUIRED: u32 = 4;
const CODE_TOKEN_NOT_FOUND: u32 = 5;
const CODE_STORAGE: u32 = 6;
const CODE_NOT_PENDING: u32 = 7;
const CODE_UNKNOWN_JOB: u32 = 8;
const CODE_TARGETED_KIND_ONLY: u32 = 15;

pub fn router(server: Arc<Server>) -> Router {
    let routes = Router::new()
        .route("/status", get(status))
        .route("/jobs", post(request_job).fallback(method_not_allowed))
        .route(
            "/jobs/:token",
            get(job_status).patch(update_job).fallback(method_not_allowed),
        )
        .route(
            "/jobs/:token/artifacts/:name",
            put(upload_artifact).fallback(method_not_allowed),
        );

    let base = server.config().normalized_base().to_string();
    let mut app = if base.is_empty() {
        routes
    } else {
        Router::new().nest(&base, routes)
    };
    app = app
        .fallback(not_found)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http());
    if server.config().require_auth {
        app = app.layer(middleware::from_fn_with_state(
            server.clone(),
            require_bearer,
        ));
    }
    app.with_state(server)
}

#[derive(Serialize)]
struct StatusResponse {
    kind: &'static str,
    href: String,
    status: &'static str,
}

#[derive(Deserialize)]
struct RequestJobBody {
    arch: String,
    types: Vec<String>,
}

#[derive(Serialize)]
struct RequestJobResponse {
    kind: &'static str,
    href: String,
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact_location: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    jtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dynamic_args: Option<Vec<Value>>,
}

#[derive(Serialize)]
struct JobStatusResponse {
    kind: &'static str,
    href: String,
    id: Uuid,
    canceled: bool,
}

#[derive(Serialize)]
struct UpdateJobResponse {
    kind: &'static str,
    href: String,
    id: Uuid,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    id: String,
    code: String,
    href: String,
    message: String,
    reason: String,
    operation_id: String,
}

fn error_response(
    base: &str,
    status: StatusCode,
    code: u32,
    message: &str,
    reason: &str,
) -> Response {
    let body = ErrorBody {
        kind: "Error",
        id: code.to_string(),
        code: format!("IMAGE-BUILDER-WORKER-{code}"),
        href: format!("{base}/errors/{code}"),
        message: message.to_string(),
        reason: reason.to_string(),
        operation_id: Uuid::new_v4().simple().to_string(),
    };
    (status, Json(body)).into_response()
}

fn broker_error_response(base: &str, err: BrokerError) -> Response {
    match &err {
        BrokerError::UnknownToken(_) => error_response(
            base,
            StatusCode::NOT_FOUND,
            CODE_TOKEN_NOT_FOUND,
            "Token not found",
            "Token not found",
        ),
        BrokerError::UnknownJob(id) => error_response(
            base,
            StatusCode::NOT_FOUND,
            CODE_UNKNOWN_JOB,
            "Job not found",
            &format!("Job {id} does not exist"),
        ),
        BrokerError::NotPending(id) => error_response(
            base,
            StatusCode::BAD_REQUEST,
            CODE_NOT_PENDING,
            "Job is not pending",
            &format!("Job {id} is not eligible for dispatch"),
        ),
        BrokerError::TargetedKindOnly(kind) => error_response(
            base,
            StatusCode::BAD_REQUEST,
            CODE_TARGETED_KIND_ONLY,
            "Requesting this job type is not supported",
            &format!("Job type {kind} can only be requested by id"),
        ),
        BrokerError::InvalidDependency(_) | BrokerError::UnknownKind(_) => error_response(
            base,
            StatusCode::BAD_REQUEST,
            CODE_INVALID_REQUEST,
            "Invalid request",
            &err.to_string(),
        ),
        _ => {
            tracing::error!(error = %err, "Request failed");
            error_response(
                base,
                StatusCode::INTERNAL_SERVER_ERROR,
                CODE_STORAGE,
                "Internal server error",
                &err.to_string(),
            )
        }
    }
}

async fn require_bearer(
    State(server): State<Arc<Server>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| !token.trim().is_empty())
        .unwrap_or(false);

    if !authorized {
        return error_response(
            server.config().normalized_base(),
            StatusCode::UNAUTHORIZED,
            CODE_AUTH_REQUIRED,
            "Authorization required",
            "Missing or invalid bearer token",
        );
    }
    next.run(request).await
}

async fn status(State(server): State<Arc<Server>>) -> Response {
    let base = server.config().normalized_base();
    Json(StatusResponse {
        kind: "Status",
        href: format!("{base}/status"),
        status: "OK",
    })
    .into_response()
}

async fn request_job(State(server): State<Arc<Server>>, body: Bytes) -> Response {
    let base = server.config().normalized_base().to_string();
    let request: RequestJobBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                &base,
                StatusCode::BAD_REQUEST,
                CODE_INVALID_REQUEST,
                "Invalid request body",
                &err.to_string(),
            )
        }
    };

    match server.request_job(&request.arch, &request.types).await {
        Ok(dispatch) => {
            let (kind, _) = split_type(&dispatch.jtype);
            let response = RequestJobResponse {
                kind: "RequestJob",
                href: format!("{base}/jobs"),
                id: dispatch.job_id,
                location: Some(format!("{base}/jobs/{}", dispatch.token)),
                artifact_location: Some(format!("{base}/jobs/{}/artifacts/", dispatch.token)),
                jtype: Some(kind.to_string()),
                args: Some(dispatch.args),
                dynamic_args: if dispatch.dep_results.is_empty() {
                    None
                } else {
                    Some(dispatch.dep_results)
                },
            };
            (StatusCode::CREATED, Json(response)).into_response()
        }
        // The distinguished "no job" response: a zero UUID with no payload.
        Err(BrokerError::DequeueTimeout) => {
            let response = RequestJobResponse {
                kind: "RequestJob",
                href: format!("{base}/jobs"),
                id: Uuid::nil(),
                location: None,
                artifact_location: None,
                jtype: None,
                args: None,
                dynamic_args: None,
            };
            (StatusCode::NO_CONTENT, Json(response)).into_response()
        }
        Err(err) => broker_error_response(&base, err),
    }
}

async fn job_status(State(server): State<Arc<Server>>, Path(token): Path<String>) -> Response {
    let base = server.config().normalized_base().to_string();
    let Ok(token) = token.parse::<Uuid>() else {
        return error_response(
            &base,
            StatusCode::BAD_REQUEST,
            CODE_INVALID_REQUEST,
            "Invalid token",
            "Token must be a UUID",
        );
    };

    match server.is_canceled_by_token(token) {
        Ok(canceled) => Json(JobStatusResponse {
            kind: "JobStatus",
            href: format!("{base}/jobs/{token}"),
            id: token,
            canceled,
        })
        .into_response(),
        Err(err) => broker_error_response(&base, err),
    }
}

async fn update_job(
    State(server): State<Arc<Server>>,
    Path(token): Path<String>,
    body: Bytes,
) -> Response {
    let base = server.config().normalized_base().to_string();
    // The body is validated before the token so a worker with a stale token
    // still learns about a malformed result payload.
    let result: Value = match serde_json::from_slice(&body) {
        Ok(result) => result,
        Err(err) => {
            return error_response(
                &base,
                StatusCode::BAD_REQUEST,
                CODE_INVALID_REQUEST,
                "Invalid request body",
                &err.to_string(),
            )
        }
    };
    let Ok(token) = token.parse::<Uuid>() else {
        return error_response(
            &base,
            StatusCode::BAD_REQUEST,
            CODE_INVALID_REQUEST,
            "Invalid token",
            "Token must be a UUID",
        );
    };

    match server.finish_job(token, result) {
        Ok(_) => Json(UpdateJobResponse {
            kind: "UpdateJobResponse",
            href: format!("{base}/jobs/{token}"),
            id: token,
        })
        .into_response(),
        Err(err) => broker_error_response(&base, err),
    }
}

async fn upload_artifact(
    State(server): State<Arc<Server>>,
    Path((token, name)): Path<(String, String)>,
    body: Body,
) -> Response {
    let base = server.config().normalized_base().to_string();
    let Ok(token) = token.parse::<Uuid>() else {
        return error_response(
            &base,
            StatusCode::BAD_REQUEST,
            CODE_INVALID_REQUEST,
            "Invalid token",
            "Token must be a UUID",
        );
    };
    if !is_plain_file_name(&name) {
        return error_response(
            &base,
            StatusCode::BAD_REQUEST,
            CODE_INVALID_REQUEST,
            "Invalid artifact name",
            "Artifact name must be a plain file name",
        );
    }

    let path = match server.artifact_path(token, &name) {
        Ok(Some(path)) => path,
        Ok(None) => {
            // No artifact store configured; accept and discard the bytes.
            tracing::warn!(%token, name = %name, "Discarding artifact, no artifacts directory");
            let mut stream = body.into_data_stream();
            while let Some(chunk) = stream.next().await {
                if chunk.is_err() {
                    break;
                }
            }
            return StatusCode::OK.into_response();
        }
        Err(err) => return broker_error_response(&base, err),
    };

    // Stream through a partial file and rename, so a finished job never
    // sees a torn artifact.
    let partial = path.with_file_name(format!("{name}.partial"));
    let result = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            tracing::error!(%token, name = %name, error = %err, "Artifact upload failed");
            error_response(
                &base,
                StatusCode::INTERNAL_SERVER_ERROR,
                CODE_STORAGE,
                "Artifact upload failed",
                &err.to_string(),
            )
        }
    }
}

/// The artifact name must be exactly one normal path component. The router
/// percent-decodes the segment after splitting the request target, so a
/// decoded name can contain separators or `..` and would otherwise escape
/// the artifacts directory when joined.
fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return false;
    }
    let mut components = std::path::Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

async fn not_found(State(server): State<Arc<Server>>) -> Response {
    error_response(
        server.config().normalized_base(),
        StatusCode::NOT_FOUND,
        CODE_UNKNOWN_ROUTE,
        "Requested resource doesn't exist",
        "Requested resource doesn't exist",
    )
}

async fn method_not_allowed(State(server): State<Arc<Server>>) -> Response {
    error_response(
        server.config().normalized_base(),
        StatusCode::METHOD_NOT_ALLOWED,
        CODE_METHOD_NOT_ALLOWED,
        "Method not allowed",
        "Method not allowed for this resource",
    )
}
