use std::time::SystemTime;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{OriginalUri, Path, RawQuery, State},
    http::{Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use octofhir_api::{ApiError, FHIR_JSON};
use octofhir_bulk::error::{BAD_REQUEST, NOT_FOUND};
use octofhir_bulk::{ExportError, ExportLevel, KickoffMethod, KickoffRequest, StatusReport};
use octofhir_core::{is_supported_resource_type, now_utc};
use octofhir_storage::{ErrorCategory, StorageError};
use serde::Serialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use crate::server::AppState;

pub const NDJSON_CONTENT_TYPE: &str = "application/fhir+ndjson";
pub const X_PROGRESS: &str = "x-progress";
pub const IN_PROGRESS_MESSAGE: &str = "Exporting files";

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Maps an engine error onto the HTTP error it is reported as.
pub fn export_error(err: ExportError) -> ApiError {
    match err.code {
        BAD_REQUEST => ApiError::bad_request(err.message),
        NOT_FOUND => ApiError::not_found(err.message),
        code => ApiError::processing(code, err.message),
    }
}

// ---- $export kickoff ----

pub async fn system_export(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    kickoff(&state, ExportLevel::System, &method, &uri, query.as_deref(), &body).await
}

pub async fn patient_export(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    kickoff(&state, ExportLevel::Patient, &method, &uri, query.as_deref(), &body).await
}

pub async fn group_export(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let level = ExportLevel::Group { id: group_id };
    kickoff(&state, level, &method, &uri, query.as_deref(), &body).await
}

async fn kickoff(
    state: &AppState,
    level: ExportLevel,
    method: &Method,
    uri: &Uri,
    query: Option<&str>,
    body: &[u8],
) -> Result<Response, ApiError> {
    let method = if method == Method::POST {
        KickoffMethod::Post
    } else {
        KickoffMethod::Get
    };
    // A body that is not JSON is treated like a missing Parameters body.
    let body: Option<Value> = serde_json::from_slice(body).ok();
    let request_url = format!(
        "{}{}",
        state.exports.settings().base_url.trim_end_matches('/'),
        uri.path_and_query().map_or(uri.path(), |pq| pq.as_str())
    );

    let job_id = state
        .exports
        .kickoff(KickoffRequest {
            level: &level,
            method,
            request_url: &request_url,
            query,
            body: body.as_ref(),
        })
        .await
        .map_err(export_error)?;

    Ok((
        StatusCode::ACCEPTED,
        [(header::CONTENT_LOCATION, state.exports.status_url(&job_id))],
    )
        .into_response())
}

// ---- status and files ----

pub async fn export_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let report = state
        .exports
        .poll(&job_id, now_utc())
        .await
        .map_err(export_error)?;

    let response = match report {
        StatusReport::InProgress { retry_after_secs } => (
            StatusCode::ACCEPTED,
            [
                (header::HeaderName::from_static(X_PROGRESS), IN_PROGRESS_MESSAGE.to_string()),
                (header::RETRY_AFTER, retry_after_secs.to_string()),
            ],
        )
            .into_response(),
        StatusReport::Throttled => StatusCode::TOO_MANY_REQUESTS.into_response(),
        StatusReport::Completed { manifest, expires } => (
            StatusCode::OK,
            [(
                header::EXPIRES,
                httpdate::fmt_http_date(SystemTime::from(expires)),
            )],
            Json(manifest),
        )
            .into_response(),
        StatusReport::Failed(error) => {
            return Err(ApiError::processing(error.code, error.message));
        }
    };
    Ok(response)
}

pub async fn export_file(
    State(state): State<AppState>,
    Path((job_id, file_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let path = state
        .exports
        .output_file(&job_id, &file_name)
        .await
        .map_err(export_error)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)], body).into_response())
}

// ---- resource endpoints used to seed and inspect data ----

pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let resource = parse_resource(&resource_type, &body)?;
    let stored = state.storage.create(&resource).await.map_err(storage_error)?;
    tracing::info!(resource_type = %resource_type, id = %stored.id, "Resource created");
    Ok(fhir_json(StatusCode::CREATED, &stored.resource))
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    ensure_supported(&resource_type)?;
    let stored = state
        .storage
        .read(&resource_type, &id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApiError::not_found(format!("Resource {resource_type}/{id} not found")))?;
    Ok(fhir_json(StatusCode::OK, &stored.resource))
}

pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut resource = parse_resource(&resource_type, &body)?;
    match resource.get("id").and_then(Value::as_str) {
        Some(body_id) if body_id != id => {
            return Err(ApiError::bad_request(format!(
                "Resource id {body_id} does not match the request id {id}"
            )));
        }
        Some(_) => {}
        None => {
            if let Some(object) = resource.as_object_mut() {
                object.insert("id".to_string(), Value::String(id.clone()));
            }
        }
    }
    let stored = state.storage.upsert(&resource).await.map_err(storage_error)?;
    Ok(fhir_json(StatusCode::OK, &stored.resource))
}

fn ensure_supported(resource_type: &str) -> Result<(), ApiError> {
    if is_supported_resource_type(resource_type) {
        Ok(())
    } else {
        Err(ApiError::not_found(format!(
            "Unsupported resource type: {resource_type}"
        )))
    }
}

fn parse_resource(resource_type: &str, body: &[u8]) -> Result<Value, ApiError> {
    ensure_supported(resource_type)?;
    let resource: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {e}")))?;
    match resource.get("resourceType").and_then(Value::as_str) {
        Some(body_type) if body_type == resource_type => Ok(resource),
        Some(body_type) => Err(ApiError::bad_request(format!(
            "Resource type {body_type} does not match the request path {resource_type}"
        ))),
        None => Err(ApiError::bad_request("Missing resourceType")),
    }
}

fn storage_error(err: StorageError) -> ApiError {
    match err.category() {
        ErrorCategory::NotFound => ApiError::not_found(err.to_string()),
        ErrorCategory::Conflict => ApiError::conflict(err.to_string()),
        ErrorCategory::Validation => ApiError::bad_request(err.to_string()),
        _ => ApiError::internal(err.to_string()),
    }
}

fn fhir_json(status: StatusCode, resource: &Value) -> Response {
    (status, [(header::CONTENT_TYPE, FHIR_JSON)], Json(resource)).into_response()
}
