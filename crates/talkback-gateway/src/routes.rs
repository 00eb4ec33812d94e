//! Turn-based talk over HTTP.
//!
//! Callers identify themselves with the `x-user-id` header; sessions are
//! scoped to that user.

use std::sync::Arc;
#[cfg(feature = "metrics")]
use std::time::Instant;

use axum::Json;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, warn};

use talkback_core::error::TalkError;
use talkback_core::protocol::{
    AddTurnRequest, AddTurnResponse, CreateTalkRequest, CreateTalkResponse, SessionContextResponse,
    TalkReply, decode_audio,
};

use crate::state::GatewayState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// A [`TalkError`] rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub TalkError);

impl From<TalkError> for ApiError {
    fn from(e: TalkError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TalkError::SessionNotFound | TalkError::ScenarioNotFound(_) | TalkError::UserNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            TalkError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TalkError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.0.code(), error = %self.0, "Request failed");
        } else {
            debug!(code = self.0.code(), error = %self.0, "Request rejected");
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(self.0.code());

        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Caller identity taken from the `x-user-id` header.
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_id_from_headers(&parts.headers)
            .map(UserId)
            .ok_or_else(|| ApiError(TalkError::InvalidInput(format!("missing {USER_ID_HEADER} header"))))
    }
}

pub(crate) fn user_id_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub async fn create_talk(
    State(state): State<Arc<GatewayState>>,
    UserId(user_id): UserId,
    Json(req): Json<CreateTalkRequest>,
) -> Result<Json<CreateTalkResponse>, ApiError> {
    #[cfg(feature = "metrics")]
    let started = Instant::now();

    let (session_id, turn) = state.talk.create_talk(&user_id, &req.scenario_id).await?;

    #[cfg(feature = "metrics")]
    crate::metrics::record_turn("create_talk", started.elapsed().as_secs_f64());

    Ok(Json(CreateTalkResponse {
        session_id,
        reply: TalkReply::new(turn.text, &turn.audio),
    }))
}

pub async fn add_turn(
    State(state): State<Arc<GatewayState>>,
    UserId(user_id): UserId,
    Path(session_id): Path<String>,
    Json(req): Json<AddTurnRequest>,
) -> Result<Json<AddTurnResponse>, ApiError> {
    #[cfg(feature = "metrics")]
    let started = Instant::now();

    let audio = decode_audio(&req.audio_bytes_base64)
        .map_err(|e| TalkError::InvalidInput(format!("audioBytesBase64 is not valid base64: {e}")))?;
    let (transcript, turn) = state
        .talk
        .add_spoken_turn(&user_id, &session_id, &audio)
        .await?;

    #[cfg(feature = "metrics")]
    crate::metrics::record_turn("add_turn", started.elapsed().as_secs_f64());

    Ok(Json(AddTurnResponse {
        transcript,
        reply: TalkReply::new(turn.text, &turn.audio),
    }))
}

pub async fn session_context(
    State(state): State<Arc<GatewayState>>,
    UserId(user_id): UserId,
    Path(session_id): Path<String>,
) -> Result<Json<SessionContextResponse>, ApiError> {
    let history = state.talk.session_context(&user_id, &session_id).await?;
    Ok(Json(SessionContextResponse { session_id, history }))
}
