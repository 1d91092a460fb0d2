//! Request handlers
//!
//! Handlers only convert: path variables and hex/JSON bodies in, core
//! results out. Every core failure becomes a 400 with `{"error": "..."}`;
//! the error strings are the contract clients match on.
//!
//! Cancellation: dropping a handler future (the client went away) trips
//! the request's CancellationToken via a drop guard, which the core wires
//! to auto-release on the call path and to a prompt return on the listen
//! path.

use crate::core::{CallMode, Core, CoreError};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use protocol::{wire, EnumerateEntry, SessionInfo, VersionInfo};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cors, status};

#[derive(Clone)]
pub struct AppState {
    pub core: Core,
    pub version: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(info).get(root_redirect))
        .route("/configure", post(info))
        .route("/enumerate", post(enumerate))
        .route("/listen", post(listen))
        .route("/acquire/{path}", post(acquire))
        .route("/acquire/{path}/{session}", post(acquire_with_previous))
        .route("/release/{session}", post(release))
        .route("/call/{session}", post(call))
        .route("/post/{session}", post(post_message))
        .route("/read/{session}", post(read_message))
        .route("/debug/acquire/{path}", post(debug_acquire))
        .route(
            "/debug/acquire/{path}/{session}",
            post(debug_acquire_with_previous),
        )
        .route("/debug/release/{session}", post(debug_release))
        .route("/debug/call/{session}", post(debug_call))
        .route("/debug/post/{session}", post(debug_post_message))
        .route("/debug/read/{session}", post(debug_read_message))
        .route("/status/", get(status::page))
        .layer(middleware::from_fn(cors::enforce))
        .with_state(state)
}

/// A core failure surfaced to the client.
pub struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!("returning error: {}", self.0);
        (StatusCode::BAD_REQUEST, Json(json!({ "error": self.0 }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err.to_string())
    }
}

impl From<hex::FromHexError> for ApiError {
    fn from(err: hex::FromHexError) -> Self {
        ApiError(err.to_string())
    }
}

async fn info(State(state): State<AppState>) -> Json<VersionInfo> {
    Json(VersionInfo {
        version: state.version.clone(),
    })
}

async fn root_redirect() -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/status/")],
    )
        .into_response()
}

async fn enumerate(State(state): State<AppState>) -> Result<Json<Vec<EnumerateEntry>>, ApiError> {
    Ok(Json(state.core.enumerate().await?))
}

async fn listen(
    State(state): State<AppState>,
    Json(baseline): Json<Vec<EnumerateEntry>>,
) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    match state.core.listen(cancel, baseline).await? {
        Some(entries) => Ok(Json(entries).into_response()),
        // the caller is gone; an empty value keeps the wire tidy
        None => Ok(Json(serde_json::Value::Null).into_response()),
    }
}

async fn acquire(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    do_acquire(state, path, None, false).await
}

async fn acquire_with_previous(
    State(state): State<AppState>,
    Path((path, session)): Path<(String, String)>,
) -> Result<Json<SessionInfo>, ApiError> {
    do_acquire(state, path, Some(session), false).await
}

async fn debug_acquire(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    do_acquire(state, path, None, true).await
}

async fn debug_acquire_with_previous(
    State(state): State<AppState>,
    Path((path, session)): Path<(String, String)>,
) -> Result<Json<SessionInfo>, ApiError> {
    do_acquire(state, path, Some(session), true).await
}

async fn do_acquire(
    state: AppState,
    path: String,
    previous: Option<String>,
    debug: bool,
) -> Result<Json<SessionInfo>, ApiError> {
    // the literal "null" path segment means no previous holder
    let previous = previous.filter(|session| session != "null");
    let session = state.core.acquire(path, previous, debug).await?;
    Ok(Json(SessionInfo { session }))
}

async fn release(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    do_release(state, session, false).await
}

async fn debug_release(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    do_release(state, session, true).await
}

async fn do_release(
    state: AppState,
    session: String,
    debug: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.core.release(session.clone(), debug).await?;
    // echo of the path variables
    Ok(Json(json!({ "session": session })))
}

async fn call(
    State(state): State<AppState>,
    Path(session): Path<String>,
    body: String,
) -> Result<String, ApiError> {
    do_call(state, session, CallMode::ReadWrite, false, Some(body)).await
}

async fn post_message(
    State(state): State<AppState>,
    Path(session): Path<String>,
    body: String,
) -> Result<String, ApiError> {
    do_call(state, session, CallMode::Write, false, Some(body)).await
}

async fn read_message(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<String, ApiError> {
    do_call(state, session, CallMode::Read, false, None).await
}

async fn debug_call(
    State(state): State<AppState>,
    Path(session): Path<String>,
    body: String,
) -> Result<String, ApiError> {
    do_call(state, session, CallMode::ReadWrite, true, Some(body)).await
}

async fn debug_post_message(
    State(state): State<AppState>,
    Path(session): Path<String>,
    body: String,
) -> Result<String, ApiError> {
    do_call(state, session, CallMode::Write, true, Some(body)).await
}

async fn debug_read_message(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<String, ApiError> {
    do_call(state, session, CallMode::Read, true, None).await
}

async fn do_call(
    state: AppState,
    session: String,
    mode: CallMode,
    debug: bool,
    body: Option<String>,
) -> Result<String, ApiError> {
    let msg = match body {
        Some(body) if mode != CallMode::Read => {
            let binary = hex::decode(body.trim())?;
            Some(wire::from_outer(&binary).map_err(CoreError::from)?)
        }
        _ => None,
    };

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let reply = state.core.call(cancel, msg, session, mode, debug).await?;

    Ok(match reply {
        Some(msg) => hex::encode(wire::to_outer(&msg)),
        None => String::new(),
    })
}
