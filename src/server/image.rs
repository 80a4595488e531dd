//! Image generation route

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{parse_body, required, within, ApiError, AppState, IMAGE_PATH};
use crate::error::Result;
use crate::observability::{ObservationKind, ObservationUpdate, RequestContext, TraceUpdate};
use crate::provider::{GeneratedImage, ImageRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ImageInput {
    prompt: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBody {
    pub base64: String,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResponse {
    pub image: ImageBody,
    pub trace_id: String,
}

pub(super) async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ImageInput>, JsonRejection>,
) -> std::result::Result<Json<ImageResponse>, ApiError> {
    let policy = state.config.routes.image.clone();
    state.admit(&headers, IMAGE_PATH, &policy)?;
    let input = parse_body(payload)?;
    let prompt = required(input.prompt, "Prompt")?;

    let ctx = state
        .recorder
        .start_trace("image-generator", ObservationKind::Generation);
    ctx.update_active_trace(TraceUpdate {
        name: Some("Image-Generator".to_string()),
        user_id: input.user_id,
        input: Some(Value::String(prompt.clone())),
        tags: Some(vec!["image-generator".to_string()]),
        ..Default::default()
    });
    let trace_id = ctx.trace_id();
    info!(trace_id = %trace_id, "image request");

    let request = ImageRequest::new(prompt, state.config.image_model.clone());
    let result = within(&policy, render(&state, &ctx, &request)).await;
    state.conclude(&ctx, &result);

    let image = result?;
    Ok(Json(ImageResponse {
        image: ImageBody {
            base64: image.base64,
            media_type: image.media_type,
        },
        trace_id,
    }))
}

async fn render(
    state: &AppState,
    ctx: &RequestContext,
    request: &ImageRequest,
) -> Result<GeneratedImage> {
    ctx.update_active_observation(
        ObservationUpdate {
            input: Some(Value::String(request.prompt.clone())),
            model: Some(request.model.clone()),
            model_parameters: Some(json!({
                "size": request.size,
                "quality": request.quality,
            })),
            ..Default::default()
        },
        ObservationKind::Generation,
    );

    let image = state.image_generator.generate(request).await?;

    let summary = json!({
        "mediaType": image.media_type,
        "sizeBytes": image.decoded_len()?,
    });
    ctx.update_active_observation(
        ObservationUpdate {
            output: Some(summary.clone()),
            usage: image.usage,
            ..Default::default()
        },
        ObservationKind::Generation,
    );
    ctx.update_active_trace(TraceUpdate {
        output: Some(summary),
        ..Default::default()
    });
    Ok(image)
}
