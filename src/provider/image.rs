//! Image generation

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{AssistError, Result};
use crate::observability::Usage;

/// Parameters for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub prompt: String,
    pub model: String,
    pub size: String,
    pub quality: String,
}

impl ImageRequest {
    /// Square, low-quality image with `model`.
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            size: "1024x1024".to_string(),
            quality: "low".to_string(),
        }
    }
}

/// A generated image as base64 plus the usage reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub base64: String,
    pub media_type: String,
    pub usage: Option<Usage>,
}

impl GeneratedImage {
    /// Size of the decoded image; fails if the payload is not valid base64.
    pub fn decoded_len(&self) -> Result<usize> {
        STANDARD
            .decode(self.base64.as_bytes())
            .map(|bytes| bytes.len())
            .map_err(|e| AssistError::ModelBehaviorError {
                message: format!("image data is not valid base64: {e}"),
            })
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage>;
}

/// Calls `POST {api_base}/images/generations`.
pub struct OpenAIImageGenerator {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAIImageGenerator {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
        }
    }

    /// Reads `OPENAI_API_KEY` and, if set, `OPENAI_BASE_URL`.
    pub fn from_env(http: reqwest::Client) -> Self {
        let mut generator = Self::new(http, std::env::var("OPENAI_API_KEY").unwrap_or_default());
        if let Ok(base) = std::env::var("OPENAI_BASE_URL") {
            generator.api_base = base;
        }
        generator
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
    #[serde(default)]
    usage: Option<ImageUsage>,
}

#[derive(Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}

#[derive(Deserialize)]
struct ImageUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[async_trait]
impl ImageGenerator for OpenAIImageGenerator {
    async fn generate(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        debug!(model = %request.model, size = %request.size, "generating image");
        let response = self
            .http
            .post(format!(
                "{}/images/generations",
                self.api_base.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": request.model,
                "prompt": request.prompt,
                "size": request.size,
                "quality": request.quality,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| format!("image generation returned {status}"));
            return Err(AssistError::Other(message));
        }

        let body: ImagesResponse = response.json().await?;
        let base64 = body
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| AssistError::ModelBehaviorError {
                message: "No image data returned".to_string(),
            })?;
        Ok(GeneratedImage {
            base64,
            media_type: "image/png".to_string(),
            usage: body.usage.map(|u| Usage {
                input: u.input_tokens,
                output: u.output_tokens,
                total: u.total_tokens,
            }),
        })
    }
}

/// Returns the same image for every prompt, or fails with a fixed message.
#[derive(Debug, Clone)]
pub struct FixedImageGenerator {
    result: std::result::Result<GeneratedImage, String>,
}

impl FixedImageGenerator {
    pub fn new(base64: impl Into<String>) -> Self {
        Self {
            result: Ok(GeneratedImage {
                base64: base64.into(),
                media_type: "image/png".to_string(),
                usage: Some(Usage::new(20, 4160)),
            }),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
        }
    }
}

#[async_trait]
impl ImageGenerator for FixedImageGenerator {
    async fn generate(&self, _request: &ImageRequest) -> Result<GeneratedImage> {
        self.result.clone().map_err(AssistError::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn decodes_image_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-image-1", "quality": "low"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "created": 1,
                "data": [{"b64_json": "iVBORw0KGgo="}],
                "usage": {"input_tokens": 9, "output_tokens": 272, "total_tokens": 281}
            })))
            .mount(&server)
            .await;

        let generator =
            OpenAIImageGenerator::new(reqwest::Client::new(), "sk-test").with_api_base(server.uri());
        let image = generator
            .generate(&ImageRequest::new("a lighthouse", "gpt-image-1"))
            .await
            .unwrap();
        assert_eq!(image.base64, "iVBORw0KGgo=");
        assert_eq!(image.media_type, "image/png");
        assert_eq!(image.decoded_len().unwrap(), 8);
        assert_eq!(image.usage.unwrap().total, 281);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let image = GeneratedImage {
            base64: "not base64!".into(),
            media_type: "image/png".into(),
            usage: None,
        };
        assert!(image.decoded_len().is_err());
    }

    #[tokio::test]
    async fn empty_data_is_model_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;
        let generator =
            OpenAIImageGenerator::new(reqwest::Client::new(), "k").with_api_base(server.uri());
        let err = generator
            .generate(&ImageRequest::new("x", "gpt-image-1"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Model behavior error: No image data returned");
    }

    #[tokio::test]
    async fn api_error_message_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                json!({"error": {"message": "Your request was rejected by the safety system."}}),
            ))
            .mount(&server)
            .await;
        let generator =
            OpenAIImageGenerator::new(reqwest::Client::new(), "k").with_api_base(server.uri());
        let err = generator
            .generate(&ImageRequest::new("x", "gpt-image-1"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Your request was rejected by the safety system.");
    }
}
