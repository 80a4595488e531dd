//! Prompt store backends

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{PromptKind, PromptTemplate};
use crate::config::LangfuseCredentials;
use crate::error::{AssistError, Result};

/// Source of prompt templates.
#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn get_prompt(&self, name: &str, kind: PromptKind) -> Result<Arc<PromptTemplate>>;
}

/// Fixed set of templates held in memory.
#[derive(Default)]
pub struct InMemoryPromptStore {
    prompts: Mutex<HashMap<String, Arc<PromptTemplate>>>,
}

impl InMemoryPromptStore {
    pub fn insert(&self, template: PromptTemplate) {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(template.name.clone(), Arc::new(template));
    }
}

#[async_trait]
impl PromptStore for InMemoryPromptStore {
    async fn get_prompt(&self, name: &str, _kind: PromptKind) -> Result<Arc<PromptTemplate>> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| AssistError::PromptNotFound {
                name: name.to_string(),
            })
    }
}

const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// HTTP client for the Langfuse prompt API with a short TTL cache.
pub struct LangfusePromptStore {
    http: reqwest::Client,
    credentials: LangfuseCredentials,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, Arc<PromptTemplate>)>>,
}

impl LangfusePromptStore {
    pub fn new(http: reqwest::Client, credentials: LangfuseCredentials) -> Self {
        Self {
            http,
            credentials,
            ttl: DEFAULT_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cached(&self, name: &str) -> Option<Arc<PromptTemplate>> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(name)
            .filter(|(fetched_at, _)| fetched_at.elapsed() < self.ttl)
            .map(|(_, t)| t.clone())
    }

    fn url(&self, name: &str) -> Result<reqwest::Url> {
        let mut url =
            reqwest::Url::parse(&self.credentials.base_url).map_err(|e| AssistError::PromptStore {
                message: format!("invalid base url: {e}"),
            })?;
        url.path_segments_mut()
            .map_err(|_| AssistError::PromptStore {
                message: "base url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(["api", "public", "v2", "prompts", name]);
        Ok(url)
    }
}

#[async_trait]
impl PromptStore for LangfusePromptStore {
    async fn get_prompt(&self, name: &str, _kind: PromptKind) -> Result<Arc<PromptTemplate>> {
        if let Some(hit) = self.cached(name) {
            debug!(prompt = name, "prompt cache hit");
            return Ok(hit);
        }

        let response = self
            .http
            .get(self.url(name)?)
            .basic_auth(
                &self.credentials.public_key,
                Some(&self.credentials.secret_key),
            )
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(AssistError::PromptNotFound {
                    name: name.to_string(),
                })
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(AssistError::PromptStore {
                    message: format!("{status}: {body}"),
                });
            }
            _ => {}
        }

        let template: PromptTemplate = response.json().await?;
        let template = Arc::new(template);
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), (Instant::now(), template.clone()));
        Ok(template)
    }
}
