//! Streaming chat routes: the QA chatbot and the AI demo
//!
//! Both routes open a tool session, run the bounded loop and stream its
//! events as SSE. The root observation stays open until the loop's finish
//! hook has closed the session and stamped the output.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_openai::types::{
    ChatCompletionTool, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    ReasoningEffort,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tower::{Layer, ServiceExt};
use tracing::{debug, info, warn};

use super::{parse_body, ApiError, AppState, AI_DEMO_PATH, CHAT_PATH};
use crate::config::RoutePolicy;
use crate::error::{AssistError, Result};
use crate::observability::{ObservationKind, ObservationUpdate, RequestContext, TraceUpdate, Usage};
use crate::prompts::{history_from_ui, ChatMessage, PromptConfig, PromptKind, UiMessage};
use crate::provider::to_request_messages;
use crate::streaming::{
    AgentEvent, BoundedLoopLayer, LoopFinish, LoopRequest, LoopState, StepChunk,
    StepStreamService,
};
use crate::tools::{ToolRouter, ToolSessionHandle};

/// System prompt of the AI demo, which does not use the prompt store.
pub const AI_DEMO_SYSTEM_PROMPT: &str = "You are Langfuse's AI assistant. Focus exclusively on Langfuse products, documentation, SDKs, and examples. Prefer factual, concise answers with links to the official docs where helpful. Use the available tools (searchLangfuseDocs, getLangfuseOverview) to retrieve accurate, up-to-date information. If you are unsure, state that clearly and suggest relevant docs pages.";

const CHAT_HISTORY: &str = "chat_history";
const MASKED_ERROR: &str = "An error occurred.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChatBody {
    #[serde(default)]
    messages: Vec<UiMessage>,
    chat_id: Option<String>,
    user_id: Option<String>,
}

/// One SSE payload of a chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Start { message_id: String },
    StartStep { step: usize },
    TextDelta { delta: String },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
        is_error: bool,
    },
    FinishStep,
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
    Finish { state: String },
}

/// Per-route differences between the two chat flows.
struct ChatRoute {
    root: &'static str,
    trace_name: &'static str,
    session_prefix: &'static str,
    mask_errors: bool,
}

const QA_CHATBOT: ChatRoute = ChatRoute {
    root: "handle-chatbot-message",
    trace_name: "QA-Chatbot",
    session_prefix: "qa-chatbot",
    mask_errors: false,
};

const AI_DEMO: ChatRoute = ChatRoute {
    root: "handle-ai-demo-message",
    trace_name: "AI-Demo",
    session_prefix: "ai-demo",
    mask_errors: true,
};

/// Messages and model knobs for one run, before tools are attached.
struct Plan {
    model: String,
    messages: Vec<ChatMessage>,
    config: PromptConfig,
    prompt: Option<Value>,
}

impl Plan {
    fn reasoning_effort(&self) -> Option<ReasoningEffort> {
        match self.config.reasoning_effort.as_deref()? {
            "low" => Some(ReasoningEffort::Low),
            "medium" => Some(ReasoningEffort::Medium),
            "high" => Some(ReasoningEffort::High),
            other => {
                warn!(value = other, "ignoring unknown reasoning effort");
                None
            }
        }
    }

    fn model_parameters(&self) -> Value {
        json!({
            "reasoningEffort": self.config.reasoning_effort,
            "reasoningSummary": self.config.reasoning_summary,
            "textVerbosity": self.config.text_verbosity,
        })
    }

    fn build_request(&self, tools: Vec<ChatCompletionTool>) -> Result<CreateChatCompletionRequest> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(to_request_messages(&self.messages)?);
        if !tools.is_empty() {
            args.tools(tools);
        }
        if let Some(effort) = self.reasoning_effort() {
            args.reasoning_effort(effort);
        }
        Ok(args.build()?)
    }
}

pub(super) async fn qa_chatbot(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ChatBody>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let policy = state.config.routes.chat.clone();
    state.admit(&headers, CHAT_PATH, &policy)?;
    let body = parse_body(payload)?;
    if body.messages.is_empty() {
        return Err(AssistError::validation("Messages").into());
    }
    let deadline = Instant::now() + policy.max_duration;

    let ctx = open_trace(&state, &QA_CHATBOT, &body);
    let plan = match bounded(deadline, &policy, chatbot_plan(&state, &ctx, &body.messages)).await {
        Ok(plan) => plan,
        Err(e) => return Err(abandon(&state, &ctx, None, e).await),
    };
    run(state, ctx, &QA_CHATBOT, plan, deadline, policy).await
}

pub(super) async fn ai_demo(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ChatBody>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let policy = state.config.routes.ai_demo.clone();
    state.admit(&headers, AI_DEMO_PATH, &policy)?;
    let body = parse_body(payload)?;
    if body.messages.is_empty() {
        return Err(AssistError::validation("Messages").into());
    }
    let deadline = Instant::now() + policy.max_duration;

    let ctx = open_trace(&state, &AI_DEMO, &body);
    let mut messages = vec![ChatMessage::system(AI_DEMO_SYSTEM_PROMPT)];
    messages.extend(history_from_ui(&body.messages));
    let plan = Plan {
        model: state.config.ai_demo_model.clone(),
        messages,
        config: PromptConfig::default(),
        prompt: None,
    };
    run(state, ctx, &AI_DEMO, plan, deadline, policy).await
}

fn open_trace(state: &AppState, route: &ChatRoute, body: &ChatBody) -> RequestContext {
    let ctx = state
        .recorder
        .start_trace(route.root, ObservationKind::Generation);
    let input = body
        .messages
        .last()
        .and_then(UiMessage::first_text)
        .map(|t| Value::String(t.to_string()));
    ctx.update_active_observation(
        ObservationUpdate {
            input: input.clone(),
            ..Default::default()
        },
        ObservationKind::Generation,
    );
    ctx.update_active_trace(TraceUpdate {
        name: Some(route.trace_name.to_string()),
        session_id: body.chat_id.clone(),
        user_id: body.user_id.clone(),
        input,
        ..Default::default()
    });
    info!(trace_id = %ctx.trace_id(), route = route.trace_name, "chat request");
    ctx
}

async fn chatbot_plan(state: &AppState, ctx: &RequestContext, ui: &[UiMessage]) -> Result<Plan> {
    let template = state
        .prompts
        .get_prompt(ctx, &state.config.chatbot_prompt_name, PromptKind::Chat)
        .await?;
    let placeholders = HashMap::from([(CHAT_HISTORY.to_string(), history_from_ui(ui))]);
    let messages = template.compile(&HashMap::new(), &placeholders);
    let model = template
        .config
        .model
        .clone()
        .ok_or_else(|| AssistError::PromptStore {
            message: format!("prompt {} has no model configured", template.name),
        })?;
    Ok(Plan {
        model,
        messages,
        config: template.config.clone(),
        prompt: Some(template.to_json()),
    })
}

/// Await `work` until `deadline`, mapping expiry to the route's timeout.
async fn bounded<T>(
    deadline: Instant,
    policy: &RoutePolicy,
    work: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout_at(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(AssistError::Timeout {
            seconds: policy.max_duration.as_secs(),
        }),
    }
}

/// Give up before the stream starts: close the session if one is open, end
/// the root span and schedule the export.
async fn abandon(
    state: &AppState,
    ctx: &RequestContext,
    session: Option<&ToolSessionHandle>,
    err: AssistError,
) -> ApiError {
    if let Some(session) = session {
        session.close().await;
    }
    warn!(trace_id = %ctx.trace_id(), error = %err, "chat request failed before streaming");
    ctx.record_error(err.to_string());
    ctx.end_active_span();
    state.recorder.schedule_flush(&state.finalizer);
    ApiError(err)
}

async fn run(
    state: AppState,
    ctx: RequestContext,
    route: &ChatRoute,
    plan: Plan,
    deadline: Instant,
    policy: RoutePolicy,
) -> std::result::Result<Response, ApiError> {
    let opened = bounded(
        deadline,
        &policy,
        ToolSessionHandle::open_traced(state.tool_gateway.as_ref(), &ctx, route.session_prefix),
    )
    .await;
    let session = match opened {
        Ok(session) => session,
        Err(e) => return Err(abandon(&state, &ctx, None, e).await),
    };

    let prepared = bounded(deadline, &policy, async {
        let defs = session.tools().await?;
        let (router, specs) = ToolRouter::new(defs)?;
        let request = plan.build_request(specs)?;
        Ok((router, request))
    })
    .await;
    let (router, request) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => return Err(abandon(&state, &ctx, Some(&session), e).await),
    };
    debug!(
        trace_id = %ctx.trace_id(),
        session_id = session.session_id(),
        tools = router.names().len(),
        model = %plan.model,
        "starting loop"
    );

    ctx.update_active_observation(
        ObservationUpdate {
            model: Some(plan.model.clone()),
            model_parameters: Some(plan.model_parameters()),
            metadata: plan.prompt.clone().map(|p| json!({ "langfusePrompt": p })),
            ..Default::default()
        },
        ObservationKind::Generation,
    );

    let step = StepStreamService::new(state.chat_provider.clone(), router);
    let agent = BoundedLoopLayer::new(state.config.max_steps).layer(step);
    let hook = finish_hook(&state, &ctx, &session);
    // Boxed so rustc can prove the handler future is `Send`.
    let started = futures::FutureExt::boxed(
        agent.oneshot(LoopRequest::new(request).on_finish(hook).deadline(deadline)),
    )
    .await;
    let events = match started {
        Ok(events) => events,
        Err(e) => return Err(abandon(&state, &ctx, Some(&session), e.into()).await),
    };

    let trace_id = ctx.trace_id();
    let first_token = Arc::new(AtomicBool::new(false));
    let mask_errors = route.mask_errors;
    let body = events.filter_map(move |event| {
        let payload = match event {
            AgentEvent::Step(n) => Some(StreamEvent::StartStep { step: n }),
            AgentEvent::Item(chunk) => stream_item(chunk, &ctx, &first_token, mask_errors),
            AgentEvent::Finished(finish) => Some(StreamEvent::Finish {
                state: finish_label(&finish).to_string(),
            }),
        };
        futures::future::ready(payload.map(to_sse))
    });
    let start = stream::once(futures::future::ready(to_sse(StreamEvent::Start {
        message_id: trace_id.clone(),
    })));
    let done = stream::once(futures::future::ready(Ok::<_, Infallible>(
        Event::default().data("[DONE]"),
    )));
    let sse = Sse::new(start.chain(body).chain(done)).keep_alive(KeepAlive::default());

    Ok((
        [(HeaderName::from_static("x-trace-id"), trace_id)],
        sse,
    )
        .into_response())
}

fn stream_item(
    chunk: StepChunk,
    ctx: &RequestContext,
    first_token: &AtomicBool,
    mask_errors: bool,
) -> Option<StreamEvent> {
    match chunk {
        StepChunk::Token(delta) => {
            if !first_token.swap(true, Ordering::SeqCst) {
                ctx.update_active_observation(
                    ObservationUpdate {
                        completion_start_time: Some(chrono::Utc::now()),
                        ..Default::default()
                    },
                    ObservationKind::Generation,
                );
            }
            Some(StreamEvent::TextDelta { delta })
        }
        StepChunk::ToolCallStart {
            id,
            name,
            arguments,
        } => Some(StreamEvent::ToolInputAvailable {
            tool_call_id: id,
            tool_name: name,
            input: arguments,
        }),
        StepChunk::ToolCallEnd {
            id,
            output,
            is_error,
        } => Some(StreamEvent::ToolOutputAvailable {
            tool_call_id: id,
            output,
            is_error,
        }),
        StepChunk::StepComplete { .. } => Some(StreamEvent::FinishStep),
        StepChunk::Error(message) => Some(StreamEvent::Error {
            error_text: if mask_errors {
                MASKED_ERROR.to_string()
            } else {
                message
            },
        }),
        StepChunk::UsageDelta { .. } => None,
    }
}

fn finish_label(finish: &LoopFinish) -> &'static str {
    match finish.state {
        LoopState::Done(_) => "done",
        LoopState::Aborted(_) => "aborted",
    }
}

fn to_sse(event: StreamEvent) -> std::result::Result<Event, Infallible> {
    let data = serde_json::to_string(&event).unwrap_or_else(|e| {
        json!({ "type": "error", "errorText": e.to_string() }).to_string()
    });
    Ok(Event::default().data(data))
}

/// Runs once when the loop ends, on every exit path.
fn finish_hook(
    state: &AppState,
    ctx: &RequestContext,
    session: &ToolSessionHandle,
) -> impl FnOnce(LoopFinish) -> futures::future::BoxFuture<'static, ()> + Send + 'static {
    let ctx = ctx.clone();
    let session = session.clone();
    let recorder = state.recorder.clone();
    let finalizer = state.finalizer.clone();
    move |finish: LoopFinish| {
        Box::pin(async move {
            session.close().await;

            let usage = Usage::new(finish.usage.prompt_tokens, finish.usage.completion_tokens);
            match (&finish.state, &finish.final_text) {
                (LoopState::Done(_), Some(text)) => {
                    ctx.update_active_observation(
                        ObservationUpdate {
                            output: Some(Value::String(text.clone())),
                            usage: Some(usage),
                            ..Default::default()
                        },
                        ObservationKind::Generation,
                    );
                    ctx.update_active_trace(TraceUpdate {
                        output: Some(Value::String(text.clone())),
                        ..Default::default()
                    });
                }
                (LoopState::Done(_), None) => ctx.update_active_observation(
                    ObservationUpdate {
                        usage: Some(usage),
                        ..Default::default()
                    },
                    ObservationKind::Generation,
                ),
                (LoopState::Aborted(reason), _) => ctx.record_error(reason.clone()),
            }
            debug!(
                trace_id = %ctx.trace_id(),
                steps = finish.steps,
                state = ?finish.state,
                "chat stream finished"
            );
            ctx.end_active_span();
            recorder.schedule_flush(&finalizer);
        })
    }
}
