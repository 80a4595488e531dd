//! Bounded streaming agent loop
//!
//! What this module provides
//! - `StepStreamService`: one model call streamed as `StepChunk`s, followed by
//!   the tool calls it requested and a terminal `StepComplete`
//! - `BoundedLoopLayer`/`BoundedLoop`: repeats steps while the model keeps
//!   calling tools, up to `max_steps` model calls, and streams `AgentEvent`s
//! - `collect_final`: drain a loop stream and return its `LoopFinish`
//!
//! State machine
//! - `Generating` (step n) → tool calls requested → tools run, results
//!   appended → `Generating` (step n + 1)
//! - no tool call, or step `max_steps` reached → `Done`
//! - provider failure, deadline, or the consumer going away → `Aborted`
//!
//! Tool failures are not loop failures: they become `is_error` tool results
//! the model sees on the next step.
//!
//! Every run ends by calling its finish hook exactly once with the
//! `LoopFinish`, before the final `AgentEvent::Finished` is sent.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestToolMessageArgs, ChatCompletionToolType,
    CreateChatCompletionRequest, FunctionCall,
};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::tools::{ToolInvocation, ToolOutput};

/// Streaming step-level items.
#[derive(Debug, Clone)]
pub enum StepChunk {
    Token(String),
    ToolCallStart {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolCallEnd {
        id: String,
        output: Value,
        is_error: bool,
    },
    UsageDelta {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// Terminal item that signals the end of a step and carries the outcome
    StepComplete {
        outcome: StepOutcome,
    },
    /// Model/provider failure; ends the step without an outcome
    Error(String),
}

/// One block of a step's output, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        output: Value,
        is_error: bool,
    },
}

/// Last text block in `blocks`, ignoring any tool blocks that trail it.
pub fn last_text(blocks: &[ContentBlock]) -> Option<&str> {
    blocks.iter().rev().find_map(|b| match b {
        ContentBlock::Text(t) => Some(t.as_str()),
        _ => None,
    })
}

/// Auxiliary accounting captured per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepAux {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tool_invocations: usize,
}

impl StepAux {
    fn absorb(&mut self, other: &StepAux) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.tool_invocations += other.tool_invocations;
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Tools ran; `messages` carries the assistant turn and tool results.
    Next {
        messages: Vec<ChatCompletionRequestMessage>,
        blocks: Vec<ContentBlock>,
        aux: StepAux,
        invoked_tools: Vec<String>,
    },
    /// The model answered without calling tools.
    Done {
        messages: Vec<ChatCompletionRequestMessage>,
        blocks: Vec<ContentBlock>,
        aux: StepAux,
    },
}

impl StepOutcome {
    fn into_parts(self) -> (Vec<ChatCompletionRequestMessage>, Vec<ContentBlock>, StepAux, bool) {
        match self {
            StepOutcome::Next {
                messages,
                blocks,
                aux,
                ..
            } => (messages, blocks, aux, true),
            StepOutcome::Done {
                messages,
                blocks,
                aux,
            } => (messages, blocks, aux, false),
        }
    }
}

/// A provider that yields an assistant response as a stream of `StepChunk`s.
pub trait StepProvider: Send + Sync + 'static {
    type Stream: Stream<Item = StepChunk> + Send + 'static;
    fn stream_step(
        &self,
        req: CreateChatCompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream, BoxError>> + Send>>;
}

/// Input to one step: the request and its 1-based step number.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub step: usize,
    pub request: CreateChatCompletionRequest,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = StepChunk> + Send>>;

/// Type-erased provider, as held by the server.
pub type SharedProvider = Arc<dyn StepProvider<Stream = ChunkStream>>;

/// Service that executes a single step and returns a stream of `StepChunk`s.
///
/// Token and tool-call streaming come from the `StepProvider`; this service
/// runs the requested tools in order, yields `ToolCallEnd` for each and then
/// the final `StepComplete` outcome.
pub struct StepStreamService<P: ?Sized, T> {
    provider: Arc<P>,
    tools: Arc<tokio::sync::Mutex<T>>,
}

impl<P: ?Sized, T> StepStreamService<P, T> {
    pub fn new(provider: Arc<P>, tools: T) -> Self {
        Self {
            provider,
            tools: Arc::new(tokio::sync::Mutex::new(tools)),
        }
    }
}

impl<P, T> Service<StepRequest> for StepStreamService<P, T>
where
    P: StepProvider + ?Sized,
    T: Service<ToolInvocation, Response = ToolOutput, Error = BoxError> + Send + 'static,
    T::Future: Send + 'static,
{
    type Response = ChunkStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StepRequest) -> Self::Future {
        let provider = self.provider.clone();
        let tools = self.tools.clone();
        Box::pin(async move {
            let StepRequest { step, request } = req;
            let stream = provider.stream_step(request.clone()).await?;

            let (tx, rx) = mpsc::channel::<StepChunk>(32);
            let task = tokio::spawn(async move {
                let mut text_buf = String::new();
                let mut current_text = String::new();
                let mut blocks: Vec<ContentBlock> = Vec::new();
                let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
                let mut aux = StepAux::default();

                futures::pin_mut!(stream);
                while let Some(item) = stream.next().await {
                    match &item {
                        StepChunk::Token(t) => {
                            text_buf.push_str(t);
                            current_text.push_str(t);
                        }
                        StepChunk::ToolCallStart {
                            id,
                            name,
                            arguments,
                        } => {
                            if !current_text.is_empty() {
                                blocks.push(ContentBlock::Text(std::mem::take(&mut current_text)));
                            }
                            blocks.push(ContentBlock::ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                arguments: arguments.clone(),
                            });
                            tool_calls.push((id.clone(), name.clone(), arguments.clone()));
                        }
                        StepChunk::UsageDelta {
                            prompt_tokens,
                            completion_tokens,
                        } => {
                            aux.prompt_tokens += *prompt_tokens;
                            aux.completion_tokens += *completion_tokens;
                        }
                        StepChunk::Error(_) => {
                            // model failure: forward and end the step without an outcome
                            let _ = tx.send(item).await;
                            return;
                        }
                        _ => {}
                    }
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
                if !current_text.is_empty() {
                    blocks.push(ContentBlock::Text(current_text));
                }

                let mut messages: Vec<ChatCompletionRequestMessage> = request.messages.clone();
                let mut asst = ChatCompletionRequestAssistantMessageArgs::default();
                if !text_buf.is_empty() {
                    asst.content(text_buf);
                }
                if !tool_calls.is_empty() {
                    let calls: Vec<ChatCompletionMessageToolCall> = tool_calls
                        .iter()
                        .map(|(id, name, arguments)| ChatCompletionMessageToolCall {
                            id: id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: name.clone(),
                                arguments: arguments.to_string(),
                            },
                        })
                        .collect();
                    asst.tool_calls(calls);
                }
                match asst.build() {
                    Ok(msg) => messages.push(msg.into()),
                    Err(e) => {
                        let _ = tx
                            .send(StepChunk::Error(format!("assistant build: {}", e)))
                            .await;
                        return;
                    }
                }

                // Execute tools sequentially; failures become error results
                let mut invoked_tools = Vec::with_capacity(tool_calls.len());
                for (id, name, arguments) in tool_calls {
                    invoked_tools.push(name.clone());
                    let inv = ToolInvocation {
                        id: id.clone(),
                        name: name.clone(),
                        arguments,
                        step,
                    };
                    let mut guard = tools.lock().await;
                    let result = match guard.ready().await {
                        Ok(svc) => svc.call(inv).await,
                        Err(e) => Err(e),
                    };
                    drop(guard);
                    let output = match result {
                        Ok(out) => out,
                        Err(e) => {
                            warn!(tool = %name, step, error = %e, "tool invocation failed");
                            ToolOutput {
                                id: id.clone(),
                                content: Value::String(format!("Error: {e}")),
                                is_error: true,
                            }
                        }
                    };
                    aux.tool_invocations += 1;

                    let content = match &output.content {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    match ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(output.id.clone())
                        .content(content)
                        .build()
                    {
                        Ok(tool_msg) => messages.push(tool_msg.into()),
                        Err(e) => {
                            let _ = tx
                                .send(StepChunk::Error(format!("tool msg build: {}", e)))
                                .await;
                            return;
                        }
                    }
                    blocks.push(ContentBlock::ToolResult {
                        id: output.id.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error,
                    });
                    if tx
                        .send(StepChunk::ToolCallEnd {
                            id: output.id,
                            output: output.content,
                            is_error: output.is_error,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }

                let outcome = if invoked_tools.is_empty() {
                    StepOutcome::Done {
                        messages,
                        blocks,
                        aux,
                    }
                } else {
                    StepOutcome::Next {
                        messages,
                        blocks,
                        aux,
                        invoked_tools,
                    }
                };
                let _ = tx.send(StepChunk::StepComplete { outcome }).await;
            });

            Ok(Box::pin(StepChunks {
                rx: ReceiverStream::new(rx),
                task: task.abort_handle(),
            }) as ChunkStream)
        })
    }
}

/// Receiving end of a step. Dropping it aborts the step task, so a run cut
/// off by its deadline or consumer does not keep invoking tools against a
/// session that is being closed.
struct StepChunks {
    rx: ReceiverStream<StepChunk>,
    task: AbortHandle,
}

impl Stream for StepChunks {
    type Item = StepChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StepChunk>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for StepChunks {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Why a run reached `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    NoToolCalls,
    MaxSteps,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Done(LoopStop),
    Aborted(String),
}

/// Summary handed to the finish hook and carried by `AgentEvent::Finished`.
#[derive(Debug, Clone)]
pub struct LoopFinish {
    pub state: LoopState,
    /// Last text block of the final step; `None` unless `Done` with non-empty text
    pub final_text: Option<String>,
    pub steps: usize,
    pub messages: Vec<ChatCompletionRequestMessage>,
    pub blocks: Vec<ContentBlock>,
    pub usage: StepAux,
}

impl LoopFinish {
    pub fn is_done(&self) -> bool {
        matches!(self.state, LoopState::Done(_))
    }
}

/// Events emitted by the loop stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Step(usize),
    Item(StepChunk),
    Finished(LoopFinish),
}

pub type AgentStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// Async callback run once when the loop reaches a terminal state.
pub type FinishHook = Box<dyn FnOnce(LoopFinish) -> BoxFuture<'static, ()> + Send>;

/// Input to the loop.
pub struct LoopRequest {
    pub request: CreateChatCompletionRequest,
    pub on_finish: Option<FinishHook>,
    /// Abort the run when this instant passes
    pub deadline: Option<Instant>,
}

impl LoopRequest {
    pub fn new(request: CreateChatCompletionRequest) -> Self {
        Self {
            request,
            on_finish: None,
            deadline: None,
        }
    }

    pub fn on_finish<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(LoopFinish) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_finish = Some(Box::new(move |finish| Box::pin(f(finish))));
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Layer that turns a streaming step into a bounded multi-step stream.
#[derive(Debug, Clone, Copy)]
pub struct BoundedLoopLayer {
    max_steps: usize,
}

impl BoundedLoopLayer {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps: max_steps.max(1),
        }
    }
}

pub struct BoundedLoop<S> {
    inner: Arc<tokio::sync::Mutex<S>>,
    max_steps: usize,
}

impl<S> Clone for BoundedLoop<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            max_steps: self.max_steps,
        }
    }
}

impl<S> Layer<S> for BoundedLoopLayer {
    type Service = BoundedLoop<S>;
    fn layer(&self, inner: S) -> Self::Service {
        BoundedLoop {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            max_steps: self.max_steps,
        }
    }
}

impl<S> Service<LoopRequest> for BoundedLoop<S>
where
    S: Service<StepRequest, Response = ChunkStream, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = AgentStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: LoopRequest) -> Self::Future {
        let inner = self.inner.clone();
        let max_steps = self.max_steps;
        Box::pin(async move {
            let (tx, rx) = mpsc::channel::<AgentEvent>(64);
            let LoopRequest {
                request,
                on_finish,
                deadline,
            } = req;
            tokio::spawn(async move {
                let progress = Progress::new(request.messages.clone());
                let run = drive(inner, request, max_steps, tx.clone(), progress.clone());
                let state = match deadline {
                    Some(at) => match tokio::time::timeout_at(at, run).await {
                        Ok(state) => state,
                        Err(_) => LoopState::Aborted("deadline exceeded".to_string()),
                    },
                    None => run.await,
                };
                let finish = progress.finish(state);
                debug!(steps = finish.steps, state = ?finish.state, "loop finished");
                if let Some(hook) = on_finish {
                    hook(finish.clone()).await;
                }
                let _ = tx.send(AgentEvent::Finished(finish)).await;
            });
            Ok(Box::pin(ReceiverStream::new(rx)) as AgentStream)
        })
    }
}

/// State shared between the step driver and the finisher, so a run cut off
/// by its deadline still reports what it had done.
#[derive(Clone)]
struct Progress(Arc<std::sync::Mutex<ProgressState>>);

struct ProgressState {
    steps: usize,
    messages: Vec<ChatCompletionRequestMessage>,
    blocks: Vec<ContentBlock>,
    usage: StepAux,
}

impl Progress {
    fn new(messages: Vec<ChatCompletionRequestMessage>) -> Self {
        Self(Arc::new(std::sync::Mutex::new(ProgressState {
            steps: 0,
            messages,
            blocks: Vec::new(),
            usage: StepAux::default(),
        })))
    }

    fn with<R>(&self, f: impl FnOnce(&mut ProgressState) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    fn finish(&self, state: LoopState) -> LoopFinish {
        self.with(|p| {
            let final_text = match state {
                LoopState::Done(_) => last_text(&p.blocks)
                    .filter(|t| !t.trim().is_empty())
                    .map(str::to_string),
                LoopState::Aborted(_) => None,
            };
            LoopFinish {
                state,
                final_text,
                steps: p.steps,
                messages: p.messages.clone(),
                blocks: p.blocks.clone(),
                usage: p.usage,
            }
        })
    }
}

async fn drive<S>(
    inner: Arc<tokio::sync::Mutex<S>>,
    request: CreateChatCompletionRequest,
    max_steps: usize,
    tx: mpsc::Sender<AgentEvent>,
    progress: Progress,
) -> LoopState
where
    S: Service<StepRequest, Response = ChunkStream, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    let mut current = request;
    for step in 1..=max_steps {
        let mut guard = inner.lock().await;
        let stream = match guard.ready().await {
            Ok(svc) => svc
                .call(StepRequest {
                    step,
                    request: current.clone(),
                })
                .await,
            Err(e) => Err(e),
        };
        drop(guard);
        let stream = match stream {
            Ok(st) => st,
            Err(e) => {
                let _ = tx
                    .send(AgentEvent::Item(StepChunk::Error(format!("step stream: {}", e))))
                    .await;
                return LoopState::Aborted(e.to_string());
            }
        };

        progress.with(|p| p.steps = step);
        if tx.send(AgentEvent::Step(step)).await.is_err() {
            return LoopState::Aborted("consumer dropped".to_string());
        }

        // Forward inner items until StepComplete or an error
        futures::pin_mut!(stream);
        let mut outcome: Option<StepOutcome> = None;
        let mut failure: Option<String> = None;
        while let Some(item) = stream.next().await {
            match &item {
                StepChunk::StepComplete { outcome: o } => outcome = Some(o.clone()),
                StepChunk::Error(e) => failure = Some(e.clone()),
                _ => {}
            }
            let terminal = outcome.is_some() || failure.is_some();
            if tx.send(AgentEvent::Item(item)).await.is_err() {
                return LoopState::Aborted("consumer dropped".to_string());
            }
            if terminal {
                break;
            }
        }

        let outcome = match (outcome, failure) {
            (Some(o), _) => o,
            (None, Some(e)) => return LoopState::Aborted(e),
            (None, None) => return LoopState::Aborted("missing StepComplete".to_string()),
        };

        let (messages, blocks, aux, wants_more) = outcome.into_parts();
        progress.with(|p| {
            p.messages = messages.clone();
            p.blocks = blocks;
            p.usage.absorb(&aux);
        });

        if !wants_more {
            return LoopState::Done(LoopStop::NoToolCalls);
        }
        current.messages = messages;
    }
    LoopState::Done(LoopStop::MaxSteps)
}

/// Utility: drain a loop stream and return its `LoopFinish`.
pub async fn collect_final<S>(stream: &mut S) -> Option<LoopFinish>
where
    S: Stream<Item = AgentEvent> + Unpin,
{
    let mut finish: Option<LoopFinish> = None;
    while let Some(ev) = stream.next().await {
        if let AgentEvent::Finished(f) = ev {
            finish = Some(f);
        }
    }
    finish
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::tools::ToolSvc;
    use async_openai::types::CreateChatCompletionRequestArgs;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::service_fn;

    fn request() -> CreateChatCompletionRequest {
        CreateChatCompletionRequestArgs::default()
            .model("gpt-4o")
            .messages(vec![])
            .build()
            .unwrap()
    }

    fn tool_call(id: &str) -> StepChunk {
        StepChunk::ToolCallStart {
            id: id.into(),
            name: "searchLangfuseDocs".into(),
            arguments: json!({"query": "tracing"}),
        }
    }

    fn echo_tool() -> ToolSvc {
        ToolSvc::new(service_fn(|inv: ToolInvocation| async move {
            Ok::<_, BoxError>(ToolOutput {
                id: inv.id,
                content: json!({"step": inv.step}),
                is_error: false,
            })
        }))
    }

    #[tokio::test]
    async fn step_stream_invokes_tool_and_finishes() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            StepChunk::Token("Hello ".into()),
            StepChunk::Token("world".into()),
            tool_call("call_1"),
        ]]));
        let mut svc = StepStreamService::new(provider, echo_tool());
        let mut stream = svc
            .call(StepRequest {
                step: 1,
                request: request(),
            })
            .await
            .unwrap();
        let mut got_tool_end = false;
        let mut got_complete = false;
        while let Some(item) = stream.next().await {
            match item {
                StepChunk::ToolCallEnd { id, output, .. } => {
                    assert_eq!(id, "call_1");
                    assert_eq!(output, json!({"step": 1}));
                    got_tool_end = true;
                }
                StepChunk::StepComplete { outcome } => {
                    match outcome {
                        StepOutcome::Next {
                            messages,
                            blocks,
                            invoked_tools,
                            ..
                        } => {
                            assert_eq!(messages.len(), 2); // assistant + tool
                            assert_eq!(invoked_tools, vec!["searchLangfuseDocs".to_string()]);
                            assert_eq!(blocks[0], ContentBlock::Text("Hello world".into()));
                            assert_eq!(last_text(&blocks), Some("Hello world"));
                        }
                        _ => panic!("expected Next"),
                    }
                    got_complete = true;
                }
                _ => {}
            }
        }
        assert!(got_tool_end && got_complete);
    }

    #[tokio::test]
    async fn failing_tool_becomes_error_content() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![tool_call("c")]]));
        let tool = service_fn(|_inv: ToolInvocation| async move {
            Err::<ToolOutput, BoxError>("docs offline".into())
        });
        let mut svc = StepStreamService::new(provider, tool);
        let mut stream = svc
            .call(StepRequest {
                step: 1,
                request: request(),
            })
            .await
            .unwrap();
        let mut saw_error_result = false;
        while let Some(item) = stream.next().await {
            if let StepChunk::ToolCallEnd {
                output, is_error, ..
            } = item
            {
                assert!(is_error);
                assert_eq!(output, json!("Error: docs offline"));
                saw_error_result = true;
            }
        }
        assert!(saw_error_result);
    }

    #[tokio::test]
    async fn tool_free_run_finishes_in_one_step() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![StepChunk::Token("ok".into())]]));
        let step = StepStreamService::new(provider.clone(), echo_tool());
        let mut agent = BoundedLoopLayer::new(10).layer(step);

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hc = hook_calls.clone();
        let req = LoopRequest::new(request()).on_finish(move |f: LoopFinish| async move {
            assert_eq!(f.final_text.as_deref(), Some("ok"));
            hc.fetch_add(1, Ordering::SeqCst);
        });
        let mut stream = agent.call(req).await.unwrap();
        let finish = collect_final(&mut stream).await.unwrap();
        assert_eq!(finish.steps, 1);
        assert_eq!(finish.state, LoopState::Done(LoopStop::NoToolCalls));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn step_cap_forces_done() {
        // the model would call tools forever
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            StepChunk::Token("thinking".into()),
            tool_call("c"),
        ]]));
        let steps_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = steps_seen.clone();
        let tool = service_fn(move |inv: ToolInvocation| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(inv.step);
                Ok::<_, BoxError>(ToolOutput {
                    id: inv.id,
                    content: json!("result"),
                    is_error: false,
                })
            }
        });
        let step = StepStreamService::new(provider.clone(), tool);
        let mut agent = BoundedLoopLayer::new(3).layer(step);
        let mut stream = agent.call(LoopRequest::new(request())).await.unwrap();
        let finish = collect_final(&mut stream).await.unwrap();

        assert_eq!(finish.state, LoopState::Done(LoopStop::MaxSteps));
        assert_eq!(finish.steps, 3);
        assert_eq!(provider.calls(), 3);
        assert_eq!(*steps_seen.lock().unwrap(), vec![1, 2, 3]);
        // the tool result trails the final text block
        assert!(matches!(finish.blocks.last(), Some(ContentBlock::ToolResult { .. })));
        assert_eq!(finish.final_text.as_deref(), Some("thinking"));
    }

    #[tokio::test]
    async fn two_text_blocks_last_wins() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![StepChunk::Token("first".into()), tool_call("a")],
            vec![StepChunk::Token("answer".into())],
        ]));
        let step = StepStreamService::new(provider, echo_tool());
        let mut agent = BoundedLoopLayer::new(10).layer(step);
        let mut stream = agent.call(LoopRequest::new(request())).await.unwrap();
        let finish = collect_final(&mut stream).await.unwrap();
        assert_eq!(finish.steps, 2);
        assert_eq!(finish.final_text.as_deref(), Some("answer"));
        assert_eq!(finish.usage.tool_invocations, 1);
    }

    #[tokio::test]
    async fn provider_failure_aborts_and_still_finishes() {
        let provider = Arc::new(ScriptedProvider::failing("model overloaded"));
        let step = StepStreamService::new(provider, echo_tool());
        let mut agent = BoundedLoopLayer::new(10).layer(step);
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hc = hook_calls.clone();
        let req = LoopRequest::new(request()).on_finish(move |f: LoopFinish| async move {
            assert!(!f.is_done());
            assert!(f.final_text.is_none());
            hc.fetch_add(1, Ordering::SeqCst);
        });
        let mut stream = agent.call(req).await.unwrap();
        let finish = collect_final(&mut stream).await.unwrap();
        assert!(matches!(finish.state, LoopState::Aborted(ref m) if m.contains("model overloaded")));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mid_stream_error_aborts() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            StepChunk::Token("par".into()),
            StepChunk::Error("connection reset".into()),
        ]]));
        let step = StepStreamService::new(provider, echo_tool());
        let mut agent = BoundedLoopLayer::new(10).layer(step);
        let mut stream = agent.call(LoopRequest::new(request())).await.unwrap();
        let finish = collect_final(&mut stream).await.unwrap();
        assert_eq!(finish.state, LoopState::Aborted("connection reset".into()));
    }

    #[tokio::test]
    async fn deadline_aborts_slow_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![tool_call("slow")]]));
        let tool = service_fn(|inv: ToolInvocation| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, BoxError>(ToolOutput {
                id: inv.id,
                content: json!(null),
                is_error: false,
            })
        });
        let step = StepStreamService::new(provider, tool);
        let mut agent = BoundedLoopLayer::new(10).layer(step);
        let req = LoopRequest::new(request()).deadline(Instant::now() + Duration::from_millis(50));
        let mut stream = agent.call(req).await.unwrap();
        let finish = collect_final(&mut stream).await.unwrap();
        assert_eq!(finish.state, LoopState::Aborted("deadline exceeded".into()));
        assert_eq!(finish.steps, 1);
    }

    #[tokio::test]
    async fn deadline_cancels_in_flight_tool_call() {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(ScriptedProvider::new(vec![vec![tool_call("slow")]]));
        let (d, c) = (dropped.clone(), completed.clone());
        let tool = service_fn(move |inv: ToolInvocation| {
            let flag = Flag(d.clone());
            let completed = c.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                drop(flag);
                Ok::<_, BoxError>(ToolOutput {
                    id: inv.id,
                    content: json!(null),
                    is_error: false,
                })
            }
        });
        let step = StepStreamService::new(provider, tool);
        let mut agent = BoundedLoopLayer::new(10).layer(step);
        let req = LoopRequest::new(request()).deadline(Instant::now() + Duration::from_millis(50));
        let mut stream = agent.call(req).await.unwrap();
        let finish = collect_final(&mut stream).await.unwrap();
        assert_eq!(finish.state, LoopState::Aborted("deadline exceeded".into()));

        // the aborted step task drops the pending tool future
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_consumer_still_runs_hook() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            StepChunk::Token("a".into()),
            StepChunk::Token("b".into()),
        ]]));
        let step = StepStreamService::new(provider, echo_tool());
        let mut agent = BoundedLoopLayer::new(10).layer(step);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let req = LoopRequest::new(request()).on_finish(move |f: LoopFinish| async move {
            let _ = done_tx.send(f.state);
        });
        let stream = agent.call(req).await.unwrap();
        drop(stream);
        let state = tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, LoopState::Aborted("consumer dropped".into()));
    }
}
