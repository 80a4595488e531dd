//! Voice agent token route

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{parse_body, within, ApiError, AppState, VOICE_PATH};
use crate::error::AssistError;
use crate::livekit::VideoGrant;
use crate::observability::{ObservationKind, TraceUpdate};

const NOT_CONFIGURED: &str = "Voice agent is not configured. LiveKit credentials are missing.";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VoiceInput {
    user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceTokenResponse {
    pub token: String,
    pub url: String,
    pub room_name: String,
    pub trace_id: String,
}

pub(super) async fn create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<VoiceInput>, JsonRejection>,
) -> std::result::Result<Json<VoiceTokenResponse>, ApiError> {
    let policy = state.config.routes.voice.clone();
    state.admit(&headers, VOICE_PATH, &policy)?;
    let Some((url, signer)) = state.livekit.clone() else {
        return Err(AssistError::NotConfigured {
            message: NOT_CONFIGURED.to_string(),
        }
        .into());
    };
    let input = parse_body(payload)?;
    let participant = input
        .user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("guest-{}", &Uuid::new_v4().simple().to_string()[..8]));

    let ctx = state
        .recorder
        .start_trace("voice-agent-token", ObservationKind::Span);
    ctx.update_active_trace(TraceUpdate {
        name: Some("Voice-Agent-Session".to_string()),
        user_id: Some(participant.clone()),
        input: Some(json!({ "action": "create-session" })),
        ..Default::default()
    });
    let trace_id = ctx.trace_id();

    let room_name = format!("voice-demo-{}", Uuid::new_v4());
    let result = within(&policy, async {
        let token = signer.mint(&participant, VideoGrant::join(&room_name))?;
        ctx.update_active_trace(TraceUpdate {
            output: Some(json!({ "roomName": room_name, "participantName": participant })),
            ..Default::default()
        });
        Ok(token)
    })
    .await;
    state.conclude(&ctx, &result);
    info!(trace_id = %trace_id, room = %room_name, "voice session token minted");

    Ok(Json(VoiceTokenResponse {
        token: result?,
        url,
        room_name,
        trace_id,
    }))
}
