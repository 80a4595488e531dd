//! Sentiment classification route

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{parse_body, required, within, ApiError, AppState, SENTIMENT_PATH};
use crate::error::Result;
use crate::observability::{ObservationKind, ObservationUpdate, RequestContext, TraceUpdate};
use crate::provider::SentimentResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SentimentInput {
    text: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentResponse {
    pub result: SentimentResult,
    pub trace_id: String,
}

pub(super) async fn classify(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<SentimentInput>, JsonRejection>,
) -> std::result::Result<Json<SentimentResponse>, ApiError> {
    let policy = state.config.routes.sentiment.clone();
    state.admit(&headers, SENTIMENT_PATH, &policy)?;
    let input = parse_body(payload)?;
    let text = required(input.text, "Text")?;

    let ctx = state
        .recorder
        .start_trace("sentiment-classifier", ObservationKind::Span);
    ctx.update_active_trace(TraceUpdate {
        name: Some("Sentiment-Classifier".to_string()),
        user_id: input.user_id,
        input: Some(Value::String(text.clone())),
        ..Default::default()
    });
    let trace_id = ctx.trace_id();
    info!(trace_id = %trace_id, chars = text.len(), "sentiment request");

    let result = within(&policy, classify_traced(&state, &ctx, &text)).await;
    state.conclude(&ctx, &result);

    Ok(Json(SentimentResponse {
        result: result?,
        trace_id,
    }))
}

async fn classify_traced(
    state: &AppState,
    ctx: &RequestContext,
    text: &str,
) -> Result<SentimentResult> {
    let classifier = state.sentiment_classifier.clone();
    let model = state.config.sentiment_model.clone();
    let result = ctx
        .in_observation("classify-sentiment", ObservationKind::Generation, |generation| async move {
            generation.update_active_observation(
                ObservationUpdate {
                    input: Some(Value::String(text.to_string())),
                    model: Some(model),
                    ..Default::default()
                },
                ObservationKind::Generation,
            );
            let classification = classifier.classify(text).await?;
            generation.update_active_observation(
                ObservationUpdate {
                    output: serde_json::to_value(&classification.result).ok(),
                    model: Some(classification.model.clone()),
                    usage: classification.usage,
                    ..Default::default()
                },
                ObservationKind::Generation,
            );
            Ok::<_, crate::error::AssistError>(classification.result)
        })
        .await?;

    let output = serde_json::to_value(&result)?;
    ctx.update_active_observation(
        ObservationUpdate {
            output: Some(output.clone()),
            ..Default::default()
        },
        ObservationKind::Span,
    );
    ctx.update_active_trace(TraceUpdate {
        output: Some(output),
        ..Default::default()
    });
    Ok(result)
}
