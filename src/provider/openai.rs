//! OpenAI streaming chat adapter

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::{ChatCompletionStreamOptions, CreateChatCompletionRequest};
use async_openai::Client;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::BoxError;
use tracing::debug;

use super::{StepChunk, StepProvider};

/// Streams chat completions and translates deltas into `StepChunk`s.
///
/// Text deltas are forwarded as they arrive. Tool-call deltas are
/// accumulated by index and emitted as `ToolCallStart` once the response
/// stream ends, when their arguments are complete.
#[derive(Clone)]
pub struct OpenAIStreamProvider {
    client: Arc<Client<OpenAIConfig>>,
}

impl OpenAIStreamProvider {
    pub fn new(client: Arc<Client<OpenAIConfig>>) -> Self {
        Self { client }
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl StepProvider for OpenAIStreamProvider {
    type Stream = Pin<Box<dyn Stream<Item = StepChunk> + Send>>;

    fn stream_step(
        &self,
        mut req: CreateChatCompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream, BoxError>> + Send>> {
        let client = self.client.clone();
        Box::pin(async move {
            req.stream_options = Some(ChatCompletionStreamOptions {
                include_usage: true,
            });
            debug!(model = %req.model, messages = req.messages.len(), "opening completion stream");
            let mut upstream = client.chat().create_stream(req).await?;

            let (tx, rx) = mpsc::channel::<StepChunk>(64);
            tokio::spawn(async move {
                let mut calls: BTreeMap<u32, PartialCall> = BTreeMap::new();
                while let Some(item) = upstream.next().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let _ = tx.send(StepChunk::Error(e.to_string())).await;
                            return;
                        }
                    };
                    if let Some(usage) = chunk.usage {
                        let delta = StepChunk::UsageDelta {
                            prompt_tokens: u64::from(usage.prompt_tokens),
                            completion_tokens: u64::from(usage.completion_tokens),
                        };
                        if tx.send(delta).await.is_err() {
                            return;
                        }
                    }
                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.content {
                            if !text.is_empty() && tx.send(StepChunk::Token(text)).await.is_err() {
                                return;
                            }
                        }
                        for call in choice.delta.tool_calls.unwrap_or_default() {
                            let entry = calls.entry(call.index).or_default();
                            if let Some(id) = call.id {
                                entry.id = id;
                            }
                            if let Some(function) = call.function {
                                if let Some(name) = function.name {
                                    entry.name.push_str(&name);
                                }
                                if let Some(args) = function.arguments {
                                    entry.arguments.push_str(&args);
                                }
                            }
                        }
                    }
                }
                for (_, call) in calls {
                    let start = StepChunk::ToolCallStart {
                        id: call.id,
                        name: call.name,
                        arguments: parse_arguments(&call.arguments),
                    };
                    if tx.send(start).await.is_err() {
                        return;
                    }
                }
            });

            Ok(Box::pin(ReceiverStream::new(rx)) as Pin<Box<dyn Stream<Item = StepChunk> + Send>>)
        })
    }
}
