//! Structured sentiment classification

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
    ResponseFormatJsonSchema,
};
use async_openai::Client;
use async_trait::async_trait;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{AssistError, Result};
use crate::observability::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

/// Classifier output as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SentimentResult {
    pub sentiment: Sentiment,
    /// Between 0 and 1
    pub confidence: f64,
    pub explanation: String,
    pub key_phrases: Vec<String>,
}

impl SentimentResult {
    /// Strict-mode JSON schema: subschemas inlined, no extra properties.
    pub fn json_schema() -> Value {
        let settings = SchemaSettings::draft07().with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        });
        let schema = settings.into_generator().into_root_schema_for::<SentimentResult>();
        let mut value = serde_json::to_value(schema).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("title");
            map.insert("additionalProperties".to_string(), Value::Bool(false));
        }
        value
    }

    fn validate(self) -> Result<Self> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(AssistError::ModelBehaviorError {
                message: format!("confidence {} outside [0, 1]", self.confidence),
            });
        }
        Ok(self)
    }
}

/// Classification plus the usage it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub result: SentimentResult,
    pub model: String,
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification>;
}

fn classification_prompt(text: &str) -> String {
    format!(
        "Analyze the sentiment of the following text. Classify it as positive, negative, or neutral. \
         Provide a confidence score between 0 and 1, a brief explanation of your reasoning, and \
         extract the key phrases that influenced your classification.\n\nText: {text}"
    )
}

/// Chat completion with a JSON-schema response format.
pub struct OpenAISentimentClassifier {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAISentimentClassifier {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl SentimentClassifier for OpenAISentimentClassifier {
    async fn classify(&self, text: &str) -> Result<Classification> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(classification_prompt(text))
            .build()?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![message.into()])
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: Some("Sentiment of a text".to_string()),
                    name: "sentiment_result".to_string(),
                    schema: Some(SentimentResult::json_schema()),
                    strict: Some(true),
                },
            })
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| AssistError::ModelBehaviorError {
                message: "No structured output in response".to_string(),
            })?;
        debug!(model = %self.model, bytes = content.len(), "sentiment classified");

        let result: SentimentResult =
            serde_json::from_str(&content).map_err(|e| AssistError::ModelBehaviorError {
                message: format!("structured output does not match schema: {e}"),
            })?;
        Ok(Classification {
            result: result.validate()?,
            model: response.model,
            usage: response.usage.map(|u| {
                Usage::new(u64::from(u.prompt_tokens), u64::from(u.completion_tokens))
            }),
        })
    }
}

/// Returns one fixed classification, or fails with a fixed message.
#[derive(Debug, Clone)]
pub struct FixedSentimentClassifier {
    result: std::result::Result<SentimentResult, String>,
}

impl FixedSentimentClassifier {
    pub fn new(result: SentimentResult) -> Self {
        Self { result: Ok(result) }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
        }
    }
}

#[async_trait]
impl SentimentClassifier for FixedSentimentClassifier {
    async fn classify(&self, _text: &str) -> Result<Classification> {
        let result = self.result.clone().map_err(AssistError::Other)?;
        Ok(Classification {
            result,
            model: "fixed".to_string(),
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn schema_is_inlined_and_closed() {
        let schema = SentimentResult::json_schema();
        assert_eq!(schema["additionalProperties"], json!(false));
        assert!(schema.get("definitions").is_none());
        assert_eq!(
            schema["properties"]["sentiment"]["enum"],
            json!(["positive", "negative", "neutral"])
        );
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("keyPhrases")));
    }

    fn client(server: &MockServer) -> Arc<Client<OpenAIConfig>> {
        Arc::new(Client::with_config(
            OpenAIConfig::new().with_api_base(server.uri()).with_api_key("test"),
        ))
    }

    fn completion(content: &str) -> Value {
        json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 80, "completion_tokens": 30, "total_tokens": 110}
        })
    }

    #[tokio::test]
    async fn classifies_with_json_schema_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"response_format": {"type": "json_schema"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"sentiment":"positive","confidence":0.93,"explanation":"Praise.","keyPhrases":["love it"]}"#,
            )))
            .mount(&server)
            .await;

        let classifier = OpenAISentimentClassifier::new(client(&server), "gpt-4o-mini");
        let out = classifier.classify("I love it").await.unwrap();
        assert_eq!(out.result.sentiment, Sentiment::Positive);
        assert_eq!(out.result.key_phrases, vec!["love it".to_string()]);
        assert_eq!(out.usage.unwrap().total, 110);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"sentiment":"neutral","confidence":1.7,"explanation":"","keyPhrases":[]}"#,
            )))
            .mount(&server)
            .await;

        let classifier = OpenAISentimentClassifier::new(client(&server), "gpt-4o-mini");
        let err = classifier.classify("meh").await.unwrap_err();
        assert!(matches!(err, AssistError::ModelBehaviorError { .. }));
    }
}
