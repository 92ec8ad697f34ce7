use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dbvault_core::{
    BackupKind, BackupRecord, EngineError, NewSchedule, RestoreEvent, ScheduleDefinition,
};
use dbvault_engine::{BackupService, RestoreResult, RetentionReport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Uploaded artifacts are buffered in memory before staging.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: BackupService,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/targets", get(list_targets))
        .route("/api/v1/targets/{id}/restores", get(restore_history))
        .route("/api/v1/targets/{id}/restore-upload", post(restore_upload))
        .route("/api/v1/targets/{id}/retention", post(enforce_retention))
        .route("/api/v1/backups", get(list_backups).post(create_backup))
        .route("/api/v1/backups/{id}", get(backup_detail))
        .route("/api/v1/backups/{id}/download", get(download_backup))
        .route("/api/v1/backups/{id}/restore", post(restore_backup))
        .route("/api/v1/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/api/v1/schedules/{id}",
            get(schedule_detail).delete(delete_schedule),
        )
        .route("/api/v1/schedules/{id}/toggle", post(toggle_schedule))
        .route("/api/v1/schedules/{id}/run", post(run_schedule))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// JSON error body carrying the full context chain.
#[derive(Debug)]
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

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = err
            .downcast_ref::<EngineError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = format!("{err:#}");
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %message, "request rejected");
        }
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    use EngineError as E;
    match err {
        E::NotFound { .. } | E::MissingArtifact(_) => StatusCode::NOT_FOUND,
        E::SchedulingConflict(_) => StatusCode::CONFLICT,
        E::FormatUnrecognized { .. }
        | E::IncompatibleFormat { .. }
        | E::ChecksumMismatch { .. }
        | E::InvalidSchedule(_)
        | E::SerializationError(_)
        | E::PartialRestoreFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        E::ToolUnavailable { .. }
        | E::ToolFailed { .. }
        | E::ToolTimeout { .. }
        | E::DumpTooSmall { .. }
        | E::ConnectionError(_) => StatusCode::BAD_GATEWAY,
        E::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")),
    }
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid id: {raw}")))
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

async fn list_targets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<String>>> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.service.target_ids()))
}

async fn restore_history(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<RestoreEvent>>> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.service.restore_history(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    target: Option<String>,
}

async fn list_backups(
    Query(query): Query<ListQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<BackupRecord>>> {
    require_api_auth(&state, &headers)?;
    let rows = state.service.list_backups(query.target.as_deref()).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct CreateBackupRequest {
    target_id: String,
    kind: BackupKind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
}

async fn create_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateBackupRequest>,
) -> ApiResult<(StatusCode, Json<BackupRecord>)> {
    require_api_auth(&state, &headers)?;
    let record = state
        .service
        .create_backup(&req.target_id, req.kind, req.name, req.created_by)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn backup_detail(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<BackupRecord>> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    Ok(Json(state.service.get_backup(id).await?))
}

async fn download_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    let path = state.service.backup_file(id).await?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| anyhow::Error::new(e).context(format!("reading {}", path.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("backup-{id}"));
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut response = bytes.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
struct RestoreRequest {
    #[serde(default)]
    clear_data_before_restore: bool,
}

async fn restore_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<RestoreResult>> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    // An empty body restores without clearing.
    let req: RestoreRequest = if body.is_empty() {
        RestoreRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))?
    };
    let result = state
        .service
        .restore_backup(id, req.clear_data_before_restore)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    kind: Option<BackupKind>,
    #[serde(default)]
    clear: bool,
}

async fn restore_upload(
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<RestoreResult>> {
    require_api_auth(&state, &headers)?;
    if body.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "empty upload"));
    }
    let file_name = query.file_name.unwrap_or_else(|| "upload".to_owned());
    let result = state
        .service
        .restore_from_uploaded_file(
            &id,
            &body,
            &file_name,
            query.kind.unwrap_or(BackupKind::Full),
            query.clear,
        )
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct RetentionRequest {
    kind: BackupKind,
}

async fn enforce_retention(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RetentionRequest>,
) -> ApiResult<Json<RetentionReport>> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.service.enforce_retention(&id, req.kind).await?))
}

async fn list_schedules(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ScheduleDefinition>>> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.service.list_schedules().await?))
}

async fn create_schedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewSchedule>,
) -> ApiResult<(StatusCode, Json<ScheduleDefinition>)> {
    require_api_auth(&state, &headers)?;
    let def = state.service.create_schedule(new).await?;
    Ok((StatusCode::CREATED, Json(def)))
}

async fn schedule_detail(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ScheduleDefinition>> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    Ok(Json(state.service.get_schedule(id).await?))
}

async fn delete_schedule(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    state.service.delete_schedule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    is_active: bool,
}

async fn toggle_schedule(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ToggleRequest>,
) -> ApiResult<Json<ScheduleDefinition>> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    Ok(Json(state.service.toggle_schedule(id, req.is_active).await?))
}

async fn run_schedule(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<BackupRecord>> {
    require_api_auth(&state, &headers)?;
    let id = parse_id(&id)?;
    Ok(Json(state.service.run_schedule_now(id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::not_found("backup", "x"), 404),
            (EngineError::SchedulingConflict(Uuid::nil()), 409),
            (
                EngineError::ChecksumMismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                },
                422,
            ),
            (
                EngineError::ToolFailed {
                    tool: "pg_restore".into(),
                    code: 1,
                    stderr: String::new(),
                },
                502,
            ),
            (EngineError::Cancelled, 500),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err).as_u16(), expected, "{err}");
        }
    }

    #[test]
    fn context_does_not_hide_the_engine_error() {
        let err = anyhow::Error::new(EngineError::MissingArtifact(Uuid::nil()))
            .context("restore backup");
        let api = ApiError::from(err);
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert!(api.message.starts_with("restore backup: "));
    }
}
