//! # Session Management REST Handlers
//!
//! The speaker's control surface: create a session, inspect it, and drive the
//! broadcast state (pause/resume/mute/unmute/end). Every mutating endpoint
//! requires the speaker's bearer token; listeners have no REST surface — they
//! only ever join over the WebSocket.
//!
//! ## Available Endpoints:
//! - `POST /api/v1/sessions` - create a session (speaker token required)
//! - `GET  /api/v1/sessions/{id}` - status + listener counts by language
//! - `POST /api/v1/sessions/{id}/pause|resume|mute|unmute` - broadcast state
//! - `POST /api/v1/sessions/{id}/end` - end the session for everyone

use crate::broadcast::BroadcastNotice;
use crate::error::{AppError, AppResult};
use crate::handlers::models::CreateSessionRequest;
use crate::session::model::{Session, SessionStatus};
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn create_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateSessionRequest>,
) -> AppResult<HttpResponse> {
    if body.source_language.is_empty() {
        return Err(AppError::ValidationError(
            "sourceLanguage must not be empty".to_string(),
        ));
    }

    let subject = require_speaker_subject(&req, &state).await?;
    let max_duration = state.get_config().lifecycle.session_max_duration();
    let session = state
        .registry
        .create_session(subject, body.source_language.clone(), max_duration)
        .await?;

    Ok(HttpResponse::Created().json(session_document(&state, &session).await))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = load_session(&state, &session_id).await?;
    Ok(HttpResponse::Ok().json(session_document(&state, &session).await))
}

pub async fn pause_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    set_broadcast_state(req, state, path.into_inner(), BroadcastAction::Pause).await
}

pub async fn resume_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    set_broadcast_state(req, state, path.into_inner(), BroadcastAction::Resume).await
}

pub async fn mute_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    set_broadcast_state(req, state, path.into_inner(), BroadcastAction::Mute).await
}

pub async fn unmute_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    set_broadcast_state(req, state, path.into_inner(), BroadcastAction::Unmute).await
}

/// End the session: status flips to Ended, every participant receives
/// `sessionEnded`, and the routing state is torn down.
pub async fn end_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = load_session(&state, &session_id).await?;
    require_session_owner(&req, &state, &session).await?;

    state
        .store
        .update_session_status(&session_id, SessionStatus::Ended)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let notified = state
        .broadcaster
        .notify(&session_id, BroadcastNotice::SessionEnded);
    state.broadcaster.remove_session(&session_id);

    info!(session_id = %session_id, notified, "Session ended by speaker");
    Ok(HttpResponse::Ok().json(json!({
        "sessionId": session_id,
        "status": "ended",
        "notified": notified
    })))
}

enum BroadcastAction {
    Pause,
    Resume,
    Mute,
    Unmute,
}

async fn set_broadcast_state(
    req: HttpRequest,
    state: web::Data<AppState>,
    session_id: String,
    action: BroadcastAction,
) -> AppResult<HttpResponse> {
    let session = load_session(&state, &session_id).await?;
    require_session_owner(&req, &state, &session).await?;

    let notice = match action {
        BroadcastAction::Pause => {
            state
                .store
                .update_session_status(&session_id, SessionStatus::Paused)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            BroadcastNotice::Paused
        }
        BroadcastAction::Resume => {
            state
                .store
                .update_session_status(&session_id, SessionStatus::Active)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            BroadcastNotice::Resumed
        }
        BroadcastAction::Mute => {
            state
                .store
                .set_session_muted(&session_id, true)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            BroadcastNotice::Muted
        }
        BroadcastAction::Unmute => {
            state
                .store
                .set_session_muted(&session_id, false)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            BroadcastNotice::Unmuted
        }
    };

    let notified = state.broadcaster.notify(&session_id, notice);
    Ok(HttpResponse::Ok().json(json!({
        "sessionId": session_id,
        "notified": notified
    })))
}

async fn load_session(state: &AppState, session_id: &str) -> Result<Session, AppError> {
    state
        .store
        .get_session(session_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))
}

/// A bearer token is mandatory here: the REST surface belongs to speakers.
async fn require_speaker_subject(req: &HttpRequest, state: &AppState) -> Result<String, AppError> {
    let token = rest_bearer_token(req)
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;
    let principal = state.authorizer.authorize(Some(&token)).await?;
    principal
        .subject()
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::Unauthorized("Speaker credential required".to_string()))
}

async fn require_session_owner(
    req: &HttpRequest,
    state: &AppState,
    session: &Session,
) -> Result<(), AppError> {
    let subject = require_speaker_subject(req, state).await?;
    if subject != session.speaker_principal {
        return Err(AppError::Forbidden(
            "Only the session's speaker may do that".to_string(),
        ));
    }
    Ok(())
}

fn rest_bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.to_string())
}

async fn session_document(state: &AppState, session: &Session) -> serde_json::Value {
    let listener_counts = state.broadcaster.listener_counts(&session.session_id);
    let speaker_connected = state
        .registry
        .find_speaker_connection(&session.session_id)
        .await
        .is_some();

    json!({
        "sessionId": session.session_id,
        "sourceLanguage": session.source_language,
        "status": session.status.as_str(),
        "muted": session.muted,
        "createdAt": session.created_at.to_rfc3339(),
        "maxDurationDeadline": session.max_duration_deadline.to_rfc3339(),
        "speakerConnected": speaker_connected,
        "listeners": listener_counts
    })
}
