use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::json;

use crate::execute;
use crate::fsio;
use crate::protocol::{
    BashAction, BashObservation, CloseSessionRequest, CloseSessionResponse, Command,
    CommandResponse, CreateSessionRequest, CreateSessionResponse, EmptyResponse,
    InterruptRequest, IsAliveResponse, ListSessionsResponse, ReadFileRequest, ReadFileResponse,
    WriteFileRequest,
};

use super::error::ApiError;
use super::{ApiJson, AppState};

/// Liveness probe; intentionally unauthenticated.
pub(super) async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "hello world" }))
}

pub(super) async fn is_alive() -> Json<IsAliveResponse> {
    Json(IsAliveResponse {
        is_alive: true,
        message: String::new(),
    })
}

pub(super) async fn create_session(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    if request.session.is_empty() {
        return Err(ApiError::bad_request("session name must not be empty"));
    }
    if request.session_type != "bash" {
        return Err(ApiError::bad_request(format!(
            "unknown session type: {:?}",
            request.session_type
        )));
    }
    let response = state.sessions.create(&request).await?;
    Ok(Json(response))
}

pub(super) async fn run_in_session(
    State(state): State<AppState>,
    ApiJson(action): ApiJson<BashAction>,
) -> Result<Json<BashObservation>, ApiError> {
    let session = state.sessions.get(&action.session)?;
    let observation = session.run(&action).await?;
    Ok(Json(observation))
}

pub(super) async fn interrupt_session(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<InterruptRequest>,
) -> Result<Json<BashObservation>, ApiError> {
    let session = state.sessions.get(&request.session)?;
    let observation = session.interrupt(&request).await?;
    Ok(Json(observation))
}

pub(super) async fn close_session(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CloseSessionRequest>,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    state.sessions.close(&request.session).await;
    Ok(Json(CloseSessionResponse::default()))
}

pub(super) async fn list_sessions(
    State(state): State<AppState>,
) -> Json<ListSessionsResponse> {
    Json(ListSessionsResponse {
        sessions: state.sessions.list(),
    })
}

pub(super) async fn execute_command(
    ApiJson(command): ApiJson<Command>,
) -> Result<Json<CommandResponse>, ApiError> {
    let response = execute::execute(&command).await?;
    Ok(Json(response))
}

pub(super) async fn read_file(
    ApiJson(request): ApiJson<ReadFileRequest>,
) -> Result<Json<ReadFileResponse>, ApiError> {
    let response = fsio::read_file(&request).await?;
    Ok(Json(response))
}

pub(super) async fn write_file(
    ApiJson(request): ApiJson<WriteFileRequest>,
) -> Result<Json<EmptyResponse>, ApiError> {
    fsio::write_file(&request).await?;
    Ok(Json(EmptyResponse::default()))
}

/// Multipart upload: a `file` part with the content and a `target_path`
/// part naming the destination on this machine.
pub(super) async fn upload(mut multipart: Multipart) -> Result<Json<EmptyResponse>, ApiError> {
    let mut target_path: Option<String> = None;
    let mut content: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("target_path") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("invalid target_path: {e}")))?;
                target_path = Some(text);
            }
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("invalid file part: {e}")))?;
                content = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let target_path =
        target_path.ok_or_else(|| ApiError::bad_request("missing target_path part"))?;
    let content = content.ok_or_else(|| ApiError::bad_request("missing file part"))?;

    tokio::task::spawn_blocking(move || fsio::write_bytes(&target_path, &content, true))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(EmptyResponse::default()))
}

/// Tear the whole runtime down: respond, then let the supervisor drain.
pub(super) async fn close_runtime(State(state): State<AppState>) -> Json<EmptyResponse> {
    tracing::info!("close requested over the API, shutting down");
    state.shutdown.cancel();
    Json(EmptyResponse::default())
}
