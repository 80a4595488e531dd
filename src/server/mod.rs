//! HTTP surface
//!
//! What this module provides
//! - `AppState`: the long-lived collaborators every handler shares
//! - `router`: the five API routes plus a health probe
//! - `ApiError`: `AssistError` rendered as `{"error": ...}` with its status
//!
//! Every handler follows the same order: admission, body validation, then
//! trace work. Requests rejected by the first two never open a trace.

mod chat;
mod image;
mod sentiment;
mod voice;

use std::future::Future;
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{AssistConfig, RoutePolicy};
use crate::error::{AssistError, Result};
use crate::livekit::AccessTokenSigner;
use crate::observability::{Finalizer, LangfuseSink, Recorder, RequestContext, TelemetrySink};
use crate::prompts::{InMemoryPromptStore, LangfusePromptStore, PromptResolver, PromptStore};
use crate::provider::{
    ImageGenerator, OpenAIImageGenerator, OpenAISentimentClassifier, OpenAIStreamProvider,
    SentimentClassifier,
};
use crate::rate_limit::{client_key, RateLimiter};
use crate::streaming::SharedProvider;
use crate::tools::{HttpToolGateway, ToolGateway};

pub use chat::{StreamEvent, AI_DEMO_SYSTEM_PROMPT};
pub use image::{ImageBody, ImageResponse};
pub use sentiment::SentimentResponse;
pub use voice::VoiceTokenResponse;

pub const CHAT_PATH: &str = "/api/qa-chatbot";
pub const AI_DEMO_PATH: &str = "/api/ai-demo";
pub const IMAGE_PATH: &str = "/api/image-generator";
pub const SENTIMENT_PATH: &str = "/api/sentiment-classifier";
pub const VOICE_PATH: &str = "/api/voice-agent-token";

/// External collaborators behind the handlers.
pub struct Backends {
    pub prompt_store: Arc<dyn PromptStore>,
    pub tool_gateway: Arc<dyn ToolGateway>,
    pub chat_provider: SharedProvider,
    pub image_generator: Arc<dyn ImageGenerator>,
    pub sentiment_classifier: Arc<dyn SentimentClassifier>,
    pub sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Backends {
    /// Production backends: OpenAI, Langfuse and the HTTP tool gateway.
    pub fn from_config(config: &AssistConfig) -> Self {
        let http = reqwest::Client::new();
        let openai = Arc::new(Client::<OpenAIConfig>::new());

        let prompt_store: Arc<dyn PromptStore> = match &config.prompt_store {
            Some(creds) => Arc::new(
                LangfusePromptStore::new(http.clone(), creds.clone())
                    .with_ttl(config.prompt_cache_ttl),
            ),
            None => {
                warn!("no prompt store configured; the chatbot will fail to resolve prompts");
                Arc::new(InMemoryPromptStore::default())
            }
        };

        let sinks = config
            .telemetry
            .iter()
            .map(|creds| {
                debug!(base_url = %creds.base_url, "exporting telemetry");
                Arc::new(LangfuseSink::new(http.clone(), creds.clone())) as Arc<dyn TelemetrySink>
            })
            .collect();

        Self {
            prompt_store,
            tool_gateway: Arc::new(
                HttpToolGateway::new(http.clone(), config.tool_gateway_url.clone())
                    .with_timeout(config.tool_request_timeout),
            ),
            chat_provider: Arc::new(OpenAIStreamProvider::new(openai.clone())),
            image_generator: Arc::new(OpenAIImageGenerator::from_env(http)),
            sentiment_classifier: Arc::new(OpenAISentimentClassifier::new(
                openai,
                config.sentiment_model.clone(),
            )),
            sinks,
        }
    }
}

/// Shared handler state. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AssistConfig>,
    pub limiter: RateLimiter,
    pub recorder: Recorder,
    pub finalizer: Finalizer,
    pub prompts: PromptResolver,
    pub tool_gateway: Arc<dyn ToolGateway>,
    pub chat_provider: SharedProvider,
    pub image_generator: Arc<dyn ImageGenerator>,
    pub sentiment_classifier: Arc<dyn SentimentClassifier>,
    pub livekit: Option<(String, AccessTokenSigner)>,
}

impl AppState {
    pub fn new(config: AssistConfig, backends: Backends) -> Self {
        let livekit = config
            .livekit
            .credentials()
            .map(|(url, key, secret)| (url.to_string(), AccessTokenSigner::new(key, secret)));
        Self {
            config: Arc::new(config),
            limiter: RateLimiter::new(),
            recorder: Recorder::new(backends.sinks),
            finalizer: Finalizer::new(),
            prompts: PromptResolver::new(backends.prompt_store),
            tool_gateway: backends.tool_gateway,
            chat_provider: backends.chat_provider,
            image_generator: backends.image_generator,
            sentiment_classifier: backends.sentiment_classifier,
            livekit,
        }
    }

    /// Count this request against the route's admission rule.
    fn admit(&self, headers: &HeaderMap, path: &str, policy: &RoutePolicy) -> Result<()> {
        let Some(rule) = &policy.rate_limit else {
            return Ok(());
        };
        let key = client_key(headers, path);
        let decision = self.limiter.allow(&key, rule);
        if !decision.permitted {
            debug!(key = %key, "rate limited");
            return Err(AssistError::RateLimited {
                message: rule.message.clone(),
            });
        }
        Ok(())
    }

    /// Close out a JSON request's trace: mark failures, end the root span
    /// and schedule the export.
    fn conclude<T>(&self, ctx: &RequestContext, result: &Result<T>) {
        if let Err(e) = result {
            ctx.record_error(e.to_string());
        }
        ctx.end_active_span();
        self.recorder.schedule_flush(&self.finalizer);
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(CHAT_PATH, post(chat::qa_chatbot))
        .route(AI_DEMO_PATH, post(chat::ai_demo))
        .route(IMAGE_PATH, post(image::generate))
        .route(SENTIMENT_PATH, post(sentiment::classify))
        .route(VOICE_PATH, post(voice::create_token))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError(pub AssistError);

impl From<AssistError> for ApiError {
    fn from(err: AssistError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(AssistError::InvalidBody {
            message: rejection.body_text(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Unwrap a JSON body, turning extractor rejections into 400s.
fn parse_body<T>(
    payload: std::result::Result<Json<T>, JsonRejection>,
) -> std::result::Result<T, ApiError> {
    payload.map(|Json(body)| body).map_err(ApiError::from)
}

/// Trimmed, non-empty string or a validation error naming `field`.
fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AssistError::validation(field))
}

/// Run `work` under the route's wall-clock ceiling.
async fn within<T, F>(policy: &RoutePolicy, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(policy.max_duration, work).await {
        Ok(result) => result,
        Err(_) => Err(AssistError::Timeout {
            seconds: policy.max_duration.as_secs(),
        }),
    }
}
