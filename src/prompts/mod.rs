//! Versioned prompt templates
//!
//! A [`PromptTemplate`] is fetched by name from a [`PromptStore`] and compiled
//! per request into a concrete message list. Chat templates may contain
//! placeholder entries (`{"type": "placeholder", "name": "chat_history"}`)
//! that are replaced by caller-supplied message lists, and `{{variable}}`
//! markers inside message content that are replaced by variables.
//!
//! Compilation takes `&self`; a template is never mutated after it is fetched.
//!
//! The [`PromptResolver`] wraps a store and records each fetch as a
//! `get-langfuse-prompt` span on the request's trace.

mod store;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{AssistError, Result};
use crate::observability::{ObservationKind, ObservationUpdate, RequestContext};

pub use store::{InMemoryPromptStore, LangfusePromptStore, PromptStore};

/// One concrete chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Marker for placeholder entries; serializes as `"placeholder"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderTag {
    Placeholder,
}

/// Entry of a chat template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptMessage {
    Placeholder {
        #[serde(rename = "type")]
        tag: PlaceholderTag,
        name: String,
    },
    Chat(ChatMessage),
}

impl PromptMessage {
    pub fn placeholder(name: impl Into<String>) -> Self {
        PromptMessage::Placeholder {
            tag: PlaceholderTag::Placeholder,
            name: name.into(),
        }
    }
}

/// Template kind requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    Chat,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromptBody {
    Chat(Vec<PromptMessage>),
    Text(String),
}

impl PromptBody {
    pub fn kind(&self) -> PromptKind {
        match self {
            PromptBody::Chat(_) => PromptKind::Chat,
            PromptBody::Text(_) => PromptKind::Text,
        }
    }
}

/// Model and response-shaping knobs stored alongside a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_verbosity: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A named, versioned prompt as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPrompt", into = "RawPrompt")]
pub struct PromptTemplate {
    pub name: String,
    pub version: u32,
    pub labels: Vec<String>,
    pub body: PromptBody,
    pub config: PromptConfig,
}

#[derive(Serialize, Deserialize)]
struct RawPrompt {
    name: String,
    version: u32,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(rename = "type")]
    kind: PromptKind,
    prompt: Value,
    #[serde(default)]
    config: Value,
}

impl TryFrom<RawPrompt> for PromptTemplate {
    type Error = serde_json::Error;

    fn try_from(raw: RawPrompt) -> std::result::Result<Self, Self::Error> {
        let body = match raw.kind {
            PromptKind::Chat => PromptBody::Chat(serde_json::from_value(raw.prompt)?),
            PromptKind::Text => PromptBody::Text(serde_json::from_value(raw.prompt)?),
        };
        let config = match raw.config {
            Value::Null => PromptConfig::default(),
            other => serde_json::from_value(other)?,
        };
        Ok(Self {
            name: raw.name,
            version: raw.version,
            labels: raw.labels,
            body,
            config,
        })
    }
}

impl From<PromptTemplate> for RawPrompt {
    fn from(t: PromptTemplate) -> Self {
        let kind = t.body.kind();
        let prompt = match t.body {
            PromptBody::Chat(messages) => json!(messages),
            PromptBody::Text(text) => Value::String(text),
        };
        Self {
            name: t.name,
            version: t.version,
            labels: t.labels,
            kind,
            prompt,
            config: serde_json::to_value(t.config).unwrap_or(Value::Null),
        }
    }
}

impl PromptTemplate {
    pub fn chat(name: impl Into<String>, version: u32, messages: Vec<PromptMessage>) -> Self {
        Self {
            name: name.into(),
            version,
            labels: Vec::new(),
            body: PromptBody::Chat(messages),
            config: PromptConfig::default(),
        }
    }

    pub fn text(name: impl Into<String>, version: u32, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            labels: Vec::new(),
            body: PromptBody::Text(text.into()),
            config: PromptConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PromptConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kind(&self) -> PromptKind {
        self.body.kind()
    }

    /// Compile into concrete messages.
    ///
    /// Placeholders are replaced by the matching entry of `placeholders`
    /// (omitted when none is supplied). `{{name}}` markers are replaced by
    /// `variables`; unknown markers are left as they are. A text template
    /// compiles to a single user message.
    pub fn compile(
        &self,
        variables: &HashMap<String, String>,
        placeholders: &HashMap<String, Vec<ChatMessage>>,
    ) -> Vec<ChatMessage> {
        match &self.body {
            PromptBody::Text(text) => vec![ChatMessage::user(substitute(text, variables))],
            PromptBody::Chat(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        PromptMessage::Chat(m) => out.push(ChatMessage {
                            role: m.role.clone(),
                            content: substitute(&m.content, variables),
                        }),
                        PromptMessage::Placeholder { name, .. } => match placeholders.get(name) {
                            Some(history) => out.extend(history.iter().cloned()),
                            None => {
                                warn!(prompt = %self.name, placeholder = %name, "unfilled placeholder omitted")
                            }
                        },
                    }
                }
                out
            }
        }
    }

    /// Wire representation, as attached to generation metadata.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn substitute(text: &str, variables: &HashMap<String, String>) -> String {
    if variables.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let key = after[..close].trim();
                match variables.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Message shape sent by chat UIs: a role plus typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub parts: Vec<UiPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

impl UiMessage {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: role.into(),
            parts: vec![UiPart::Text { text: text.into() }],
        }
    }

    /// All text parts joined, non-text parts dropped.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                UiPart::Text { text } => Some(text.as_str()),
                UiPart::Other => None,
            })
            .collect()
    }

    /// First text part, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match p {
            UiPart::Text { text } => Some(text.as_str()),
            UiPart::Other => None,
        })
    }
}

/// Convert UI messages to `{role, content}` history entries.
pub fn history_from_ui(messages: &[UiMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage::new(m.role.clone(), m.joined_text()))
        .collect()
}

/// Fetches templates through a store and records the fetch on the trace.
#[derive(Clone)]
pub struct PromptResolver {
    store: Arc<dyn PromptStore>,
}

impl PromptResolver {
    pub fn new(store: Arc<dyn PromptStore>) -> Self {
        Self { store }
    }

    pub async fn get_prompt(
        &self,
        ctx: &RequestContext,
        name: &str,
        kind: PromptKind,
    ) -> Result<Arc<PromptTemplate>> {
        let store = self.store.clone();
        ctx.in_observation("get-langfuse-prompt", ObservationKind::Span, |span| async move {
            span.update_active_observation(
                ObservationUpdate {
                    input: Some(json!({ "name": name, "type": kind })),
                    ..Default::default()
                },
                ObservationKind::Span,
            );
            let template = store.get_prompt(name, kind).await?;
            if template.kind() != kind {
                return Err(AssistError::PromptStore {
                    message: format!(
                        "prompt {name} is a {:?} prompt, expected {kind:?}",
                        template.kind()
                    ),
                });
            }
            debug!(prompt = name, version = template.version, "resolved prompt");
            span.update_active_observation(
                ObservationUpdate {
                    output: Some(json!({ "name": template.name, "version": template.version })),
                    ..Default::default()
                },
                ObservationKind::Span,
            );
            Ok(template)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{MemorySink, Recorder};
    use pretty_assertions::assert_eq;

    fn docs_template() -> PromptTemplate {
        PromptTemplate::chat(
            "langfuse-docs-assistant-chat",
            3,
            vec![
                PromptMessage::Chat(ChatMessage::system("You answer questions about {{product}}.")),
                PromptMessage::placeholder("chat_history"),
            ],
        )
    }

    fn vars() -> HashMap<String, String> {
        HashMap::from([("product".to_string(), "Langfuse".to_string())])
    }

    #[test]
    fn compile_substitutes_history_and_variables() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let compiled = docs_template().compile(
            &vars(),
            &HashMap::from([("chat_history".to_string(), history.clone())]),
        );
        assert_eq!(
            compiled,
            vec![
                ChatMessage::system("You answer questions about Langfuse."),
                history[0].clone(),
                history[1].clone(),
            ]
        );
    }

    #[test]
    fn compile_differs_only_in_history_slot() {
        let t = docs_template();
        let a = t.compile(
            &vars(),
            &HashMap::from([("chat_history".to_string(), vec![ChatMessage::user("one")])]),
        );
        let b = t.compile(
            &vars(),
            &HashMap::from([(
                "chat_history".to_string(),
                vec![ChatMessage::user("two"), ChatMessage::assistant("three")],
            )]),
        );
        assert_eq!(a[0], b[0]);
        assert_eq!(&a[1..], &[ChatMessage::user("one")]);
        assert_eq!(t, docs_template());
    }

    #[test]
    fn unfilled_placeholder_and_unknown_variable() {
        let compiled = docs_template().compile(&HashMap::new(), &HashMap::new());
        assert_eq!(
            compiled,
            vec![ChatMessage::system("You answer questions about {{product}}.")]
        );
        assert_eq!(substitute("a {{ x }} b {{y", &HashMap::from([("x".into(), "1".into())])), "a 1 b {{y");
    }

    #[test]
    fn parses_store_payload() {
        let payload = json!({
            "name": "langfuse-docs-assistant-chat",
            "version": 7,
            "type": "chat",
            "labels": ["production"],
            "prompt": [
                {"role": "system", "content": "Be concise.", "type": "chatmessage"},
                {"type": "placeholder", "name": "chat_history"}
            ],
            "config": {"model": "gpt-5", "reasoningEffort": "low", "temperature": 0.2}
        });
        let t: PromptTemplate = serde_json::from_value(payload).unwrap();
        assert_eq!(t.version, 7);
        assert_eq!(t.config.model.as_deref(), Some("gpt-5"));
        assert_eq!(t.config.reasoning_effort.as_deref(), Some("low"));
        assert_eq!(t.config.extra.get("temperature"), Some(&json!(0.2)));
        match &t.body {
            PromptBody::Chat(entries) => {
                assert_eq!(entries[1], PromptMessage::placeholder("chat_history"));
            }
            PromptBody::Text(_) => panic!("expected chat body"),
        }
        assert_eq!(t.to_json()["type"], json!("chat"));
    }

    #[test]
    fn history_drops_non_text_parts() {
        let msg: UiMessage = serde_json::from_value(json!({
            "role": "user",
            "parts": [
                {"type": "text", "text": "foo "},
                {"type": "file", "url": "x"},
                {"type": "text", "text": "bar"}
            ]
        }))
        .unwrap();
        assert_eq!(history_from_ui(&[msg.clone()]), vec![ChatMessage::user("foo bar")]);
        assert_eq!(msg.first_text(), Some("foo "));
    }

    #[tokio::test]
    async fn resolver_records_span_and_rejects_missing() {
        let sink = Arc::new(MemorySink::default());
        let recorder = Recorder::new(vec![sink.clone()]);
        let ctx = recorder.start_trace("root", ObservationKind::Span);
        let store = InMemoryPromptStore::default();
        store.insert(docs_template());
        let resolver = PromptResolver::new(Arc::new(store));

        let t = resolver
            .get_prompt(&ctx, "langfuse-docs-assistant-chat", PromptKind::Chat)
            .await
            .unwrap();
        assert_eq!(t.version, 3);

        let err = resolver
            .get_prompt(&ctx, "missing", PromptKind::Chat)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::PromptNotFound { .. }));

        let spans = sink.observations(&ctx.trace_id());
        assert_eq!(spans.len(), 3);
        assert!(spans[1..]
            .iter()
            .all(|o| o.name == "get-langfuse-prompt" && o.end_time.is_some()));
    }

    #[tokio::test]
    async fn resolver_rejects_kind_mismatch() {
        let recorder = Recorder::disabled();
        let ctx = recorder.start_trace("root", ObservationKind::Span);
        let store = InMemoryPromptStore::default();
        store.insert(PromptTemplate::text("plain", 1, "hello"));
        let resolver = PromptResolver::new(Arc::new(store));
        let err = resolver
            .get_prompt(&ctx, "plain", PromptKind::Chat)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::PromptStore { .. }));
    }
}
