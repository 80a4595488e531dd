//! Model provider abstraction
//!
//! What this module provides
//! - `StepProvider` implementations: `OpenAIStreamProvider` adapts the
//!   OpenAI streaming chat API to `StepChunk`s, `ScriptedProvider` replays
//!   scripted steps for tests
//! - `ImageGenerator` and `SentimentClassifier`: the single-shot model calls
//!   behind the image and sentiment handlers
//! - `to_request_messages`: compiled prompt messages to async-openai messages
//!
//! Testing strategy
//! - Loop and handler tests run against `ScriptedProvider` and the fixed
//!   generators; the OpenAI adapters are exercised against wiremock

mod image;
mod openai;
mod sentiment;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest,
};
use futures::stream;
use futures::Stream;
use tower::BoxError;

use crate::error::{AssistError, Result};
use crate::prompts::ChatMessage;

pub use crate::streaming::{StepChunk, StepProvider};
pub use image::{
    FixedImageGenerator, GeneratedImage, ImageGenerator, ImageRequest, OpenAIImageGenerator,
};
pub use openai::OpenAIStreamProvider;
pub use sentiment::{
    Classification, FixedSentimentClassifier, OpenAISentimentClassifier, Sentiment,
    SentimentClassifier, SentimentResult,
};

/// Convert compiled `{role, content}` messages to chat request messages.
pub fn to_request_messages(messages: &[ChatMessage]) -> Result<Vec<ChatCompletionRequestMessage>> {
    messages
        .iter()
        .map(|m| -> Result<ChatCompletionRequestMessage> {
            let content = m.content.clone();
            Ok(match m.role.as_str() {
                "system" | "developer" => ChatCompletionRequestSystemMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
                "assistant" => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
                "user" => ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()?
                    .into(),
                other => {
                    return Err(AssistError::InvalidBody {
                        message: format!("Unsupported message role '{other}'"),
                    });
                }
            })
        })
        .collect()
}

enum Script {
    Steps(Vec<Vec<StepChunk>>),
    Fail(String),
}

/// A provider that replays one scripted chunk list per call.
///
/// Call `n` receives script `n`; once the scripts run out the last one is
/// repeated.
pub struct ScriptedProvider {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<CreateChatCompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Vec<StepChunk>>) -> Self {
        Self {
            script: Script::Steps(steps),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Provider whose every call fails before streaming.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            script: Script::Fail(message.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CreateChatCompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl StepProvider for ScriptedProvider {
    type Stream = Pin<Box<dyn Stream<Item = StepChunk> + Send>>;
    fn stream_step(
        &self,
        req: CreateChatCompletionRequest,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Self::Stream, BoxError>> + Send>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(req);
        let result: std::result::Result<Vec<StepChunk>, BoxError> = match &self.script {
            Script::Fail(message) => Err(message.clone().into()),
            Script::Steps(steps) => Ok(steps
                .get(n)
                .or_else(|| steps.last())
                .cloned()
                .unwrap_or_default()),
        };
        Box::pin(async move {
            let items = result?;
            Ok(Box::pin(stream::iter(items)) as Pin<Box<dyn Stream<Item = StepChunk> + Send>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::types::CreateChatCompletionRequestArgs;
    use futures::StreamExt;

    fn req() -> CreateChatCompletionRequest {
        CreateChatCompletionRequestArgs::default()
            .model("gpt-4o")
            .messages(vec![])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn scripted_provider_replays_steps_in_order() {
        let p = ScriptedProvider::new(vec![
            vec![StepChunk::Token("a".into()), StepChunk::Token("b".into())],
            vec![StepChunk::Token("c".into())],
        ]);
        let first: Vec<_> = p.stream_step(req()).await.unwrap().collect().await;
        let second: Vec<_> = p.stream_step(req()).await.unwrap().collect().await;
        let third: Vec<_> = p.stream_step(req()).await.unwrap().collect().await;
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(third.len(), 1);
        assert_eq!(p.calls(), 3);
        assert_eq!(p.requests().len(), 3);
    }

    #[tokio::test]
    async fn failing_provider_errors_before_streaming() {
        let p = ScriptedProvider::failing("quota exceeded");
        let err = p.stream_step(req()).await.err().unwrap();
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn converts_roles() {
        let msgs = to_request_messages(&[
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ])
        .unwrap();
        assert!(matches!(msgs[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(msgs[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(msgs[2], ChatCompletionRequestMessage::Assistant(_)));

        let err = to_request_messages(&[ChatMessage::new("tool", "x")]).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            err.to_string(),
            "Invalid request body: Unsupported message role 'tool'"
        );
    }
}
