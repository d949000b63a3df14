//! Federation endpoints
//!
//! - Actor document
//! - Note document
//! - Per-actor inbox (activity receiving)

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::{
    Router,
    extract::{ConnectInfo, OriginalUri, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use http::HeaderMap;

use crate::AppState;
use crate::data::{Actor, EntityId};
use crate::error::AppError;
use crate::federation::{Activity, InboundRequest, Sender, Verification, builder};
use crate::metrics::{
    ACTIVITIES_RECEIVED, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

/// Create federation router
///
/// Routes:
/// - GET /users/:id - Actor document
/// - POST /users/:id/inbox - Personal inbox
/// - GET /notes/:id - Note document
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:id", get(actor))
        .route("/users/:id/inbox", post(inbox))
        .route("/notes/:id", get(note))
}

/// GET /users/:id
///
/// Returns the actor document of a local actor.
async fn actor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Activity>, AppError> {
    let actor = local_actor(&state, &id).await?;
    Ok(Json(Activity::ActorUpdate(builder::actor(&state.ctx, &actor))))
}

/// GET /notes/:id
///
/// Only public and unlisted local notes are served; anything else is 404.
async fn note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Activity>, AppError> {
    let id = EntityId::parse(&id).ok_or(AppError::NotFound)?;
    let note = state.notes.get(&id.0).await?;
    if note.uri.is_some() || !note.visibility.is_world_readable() {
        return Err(AppError::NotFound);
    }

    let (_, object) = state.outbound.note_object(&note).await?;
    Ok(Json(Activity::Note(object)))
}

/// POST /users/:id/inbox
///
/// Receives an activity addressed to a local actor.
///
/// # Steps
/// 1. Drop requests from blocked origins
/// 2. Look up the inbox owner
/// 3. Authenticate the request (bridge, HTTP signature)
/// 4. Parse the body against the federation schema
/// 5. Dispatch the activity
///
/// Requests from blocked origins are acknowledged without processing.
async fn inbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let path = uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or_else(|| uri.path());
    let request = InboundRequest {
        method: "POST",
        path,
        headers: &headers,
        body: &body,
        source_ip: connect_info.map(|ConnectInfo(addr)| addr.ip()),
    };

    let result = receive(&state, &id, request).await;

    let status = match &result {
        Ok(status) => *status,
        Err(error) => error.status_and_type().0,
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", status.as_str()])
        .inc();

    result
}

async fn receive(
    state: &AppState,
    id: &str,
    request: InboundRequest<'_>,
) -> Result<StatusCode, AppError> {
    // Blocked origins learn nothing, not even whether the inbox exists
    if state.verifier.blocked_origin(request.headers).is_some() {
        return Ok(StatusCode::ACCEPTED);
    }
    let owner = local_actor(state, id).await?;

    let sender = match state.verifier.verify(request).await? {
        Verification::Blocked(_) => return Ok(StatusCode::ACCEPTED),
        Verification::Bridged => Sender::Bridged,
        Verification::Signed(actor) => Sender::Signed(actor),
    };

    let activity = match Activity::parse(request.body) {
        Ok(activity) => activity,
        Err(AppError::UnsupportedActivity(kind)) => {
            tracing::warn!(activity_type = %kind, inbox = %owner.id, "Unsupported activity");
            ACTIVITIES_RECEIVED
                .with_label_values(&["unsupported", "rejected"])
                .inc();
            return Err(AppError::UnsupportedActivity(kind));
        }
        Err(error) => return Err(error),
    };

    state.dispatcher.dispatch(activity, sender, &owner).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn local_actor(state: &AppState, id: &str) -> Result<Actor, AppError> {
    let id = EntityId::parse(id).ok_or(AppError::NotFound)?;
    state.accounts.get_local_actor(&id.0).await
}
