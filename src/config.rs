//! Configuration for the assist pipeline
//!
//! Everything the server needs is collected in [`AssistConfig`]: model
//! defaults, the tool gateway and prompt store endpoints, telemetry regions,
//! LiveKit credentials and the per-route admission and wall-clock policies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::rate_limit::RateLimitRule;

/// Default ceiling on model calls per chat request.
pub const DEFAULT_MAX_STEPS: usize = 10;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistConfig {
    /// Socket address the HTTP server binds to
    pub bind_addr: String,

    /// Maximum model calls per agentic loop run
    pub max_steps: usize,

    /// Tool-protocol endpoint exposing the documentation tools
    pub tool_gateway_url: String,

    /// Prompt used by the QA chatbot
    pub chatbot_prompt_name: String,

    /// Model used by the AI demo (no prompt store involved)
    pub ai_demo_model: String,

    /// Model used for image generation
    pub image_model: String,

    /// Model used for sentiment classification
    pub sentiment_model: String,

    /// Prompt store credentials; the chatbot is unavailable without them
    pub prompt_store: Option<LangfuseCredentials>,

    /// Telemetry regions every trace is exported to
    pub telemetry: Vec<LangfuseCredentials>,

    /// LiveKit credentials for the voice agent
    pub livekit: LiveKitConfig,

    /// Per-route admission and duration policies
    pub routes: RoutePolicies,

    /// Timeout applied to each HTTP request to the tool gateway
    pub tool_request_timeout: Duration,

    /// How long fetched prompt templates are served from cache
    pub prompt_cache_ttl: Duration,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            tool_gateway_url: "https://langfuse.com/api/mcp".to_string(),
            chatbot_prompt_name: "langfuse-docs-assistant-chat".to_string(),
            ai_demo_model: "gpt-5".to_string(),
            image_model: "gpt-image-1".to_string(),
            sentiment_model: "gpt-4o-mini".to_string(),
            prompt_store: None,
            telemetry: Vec::new(),
            livekit: LiveKitConfig::default(),
            routes: RoutePolicies::default(),
            tool_request_timeout: Duration::from_secs(20),
            prompt_cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Base URL and key pair for a Langfuse-compatible region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LangfuseCredentials {
    pub base_url: String,
    pub public_key: String,
    pub secret_key: String,
}

/// LiveKit server credentials; all three must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveKitConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl LiveKitConfig {
    /// Returns `(url, api_key, api_secret)` when fully configured.
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        match (&self.url, &self.api_key, &self.api_secret) {
            (Some(u), Some(k), Some(s)) if !u.is_empty() && !k.is_empty() && !s.is_empty() => {
                Some((u.as_str(), k.as_str(), s.as_str()))
            }
            _ => None,
        }
    }
}

/// Admission rule plus wall-clock ceiling for one route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// `None` disables admission control for the route
    pub rate_limit: Option<RateLimitRule>,

    /// Upper bound on the handler's total duration
    pub max_duration: Duration,
}

impl RoutePolicy {
    pub fn new(rate_limit: Option<RateLimitRule>, max_duration: Duration) -> Self {
        Self {
            rate_limit,
            max_duration,
        }
    }
}

/// Policies for every route the server exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicies {
    pub chat: RoutePolicy,
    pub ai_demo: RoutePolicy,
    pub image: RoutePolicy,
    pub sentiment: RoutePolicy,
    pub voice: RoutePolicy,
}

impl Default for RoutePolicies {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            chat: RoutePolicy::new(None, Duration::from_secs(30)),
            ai_demo: RoutePolicy::new(None, Duration::from_secs(30)),
            image: RoutePolicy::new(
                Some(RateLimitRule::new(3, minute).with_message(
                    "Rate limit exceeded. Image generation is limited to 3 per minute. Please try again later.",
                )),
                Duration::from_secs(60),
            ),
            sentiment: RoutePolicy::new(
                Some(RateLimitRule::new(15, minute)),
                Duration::from_secs(30),
            ),
            voice: RoutePolicy::new(Some(RateLimitRule::new(5, minute)), Duration::from_secs(10)),
        }
    }
}

impl RoutePolicies {
    fn by_name_mut(&mut self) -> [(&'static str, &mut RoutePolicy); 5] {
        [
            ("CHAT", &mut self.chat),
            ("AI_DEMO", &mut self.ai_demo),
            ("IMAGE", &mut self.image),
            ("SENTIMENT", &mut self.sentiment),
            ("VOICE", &mut self.voice),
        ]
    }

    /// Apply `ASSIST_<ROUTE>_RATE_LIMIT` (requests per window, `0` disables)
    /// and `ASSIST_<ROUTE>_TIMEOUT_SECS` overrides read through `lookup`.
    ///
    /// Routes without a rule get a one-minute window when a limit is set.
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (route, policy) in self.by_name_mut() {
            let key = format!("ASSIST_{route}_RATE_LIMIT");
            if let Some(raw) = lookup(&key) {
                match raw.trim().parse::<u32>() {
                    Ok(0) => policy.rate_limit = None,
                    Ok(limit) => match policy.rate_limit.as_mut() {
                        Some(rule) => rule.limit = limit,
                        None => {
                            policy.rate_limit =
                                Some(RateLimitRule::new(limit, Duration::from_secs(60)))
                        }
                    },
                    Err(_) => tracing::warn!(key = %key, value = %raw, "ignoring invalid rate limit"),
                }
            }

            let key = format!("ASSIST_{route}_TIMEOUT_SECS");
            if let Some(raw) = lookup(&key) {
                match raw.trim().parse::<u64>() {
                    Ok(secs) if secs > 0 => policy.max_duration = Duration::from_secs(secs),
                    _ => tracing::warn!(key = %key, value = %raw, "ignoring invalid timeout"),
                }
            }
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: AssistConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AssistConfig::default(),
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    pub fn max_steps(mut self, steps: usize) -> Self {
        self.config.max_steps = steps;
        self
    }

    pub fn tool_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.tool_gateway_url = url.into();
        self
    }

    pub fn chatbot_prompt(mut self, name: impl Into<String>) -> Self {
        self.config.chatbot_prompt_name = name.into();
        self
    }

    pub fn prompt_store(mut self, creds: LangfuseCredentials) -> Self {
        self.config.prompt_store = Some(creds);
        self
    }

    pub fn telemetry_region(mut self, creds: LangfuseCredentials) -> Self {
        self.config.telemetry.push(creds);
        self
    }

    pub fn livekit(mut self, livekit: LiveKitConfig) -> Self {
        self.config.livekit = livekit;
        self
    }

    pub fn routes(mut self, routes: RoutePolicies) -> Self {
        self.config.routes = routes;
        self
    }

    pub fn build(self) -> AssistConfig {
        self.config
    }
}

fn region_from_env(prefix: &str) -> Option<LangfuseCredentials> {
    let base_url = std::env::var(format!("{prefix}_BASE_URL")).ok()?;
    let public_key = std::env::var(format!("{prefix}_PUBLIC_KEY")).ok()?;
    let secret_key = std::env::var(format!("{prefix}_SECRET_KEY")).ok()?;
    Some(LangfuseCredentials {
        base_url,
        public_key,
        secret_key,
    })
}

impl AssistConfig {
    /// Load configuration from environment variables, reading `.env` first if present.
    pub fn from_env() -> Self {
        if let Err(e) = dotenv::dotenv() {
            tracing::debug!(error = %e, "no .env file loaded");
        }

        let mut config = AssistConfig::default();

        if let Ok(addr) = std::env::var("ASSIST_BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Ok(steps) = std::env::var("ASSIST_MAX_STEPS") {
            match steps.parse::<usize>() {
                Ok(n) if n > 0 => config.max_steps = n,
                _ => tracing::warn!(value = %steps, "ignoring invalid ASSIST_MAX_STEPS"),
            }
        }

        if let Ok(url) = std::env::var("ASSIST_TOOL_GATEWAY_URL") {
            config.tool_gateway_url = url;
        }

        if let Ok(name) = std::env::var("ASSIST_CHATBOT_PROMPT") {
            config.chatbot_prompt_name = name;
        }

        for (key, slot) in [
            ("ASSIST_TOOL_TIMEOUT_SECS", &mut config.tool_request_timeout),
            ("ASSIST_PROMPT_CACHE_TTL_SECS", &mut config.prompt_cache_ttl),
        ] {
            if let Ok(raw) = std::env::var(key) {
                match raw.parse::<u64>() {
                    Ok(secs) if secs > 0 => *slot = Duration::from_secs(secs),
                    _ => tracing::warn!(key, value = %raw, "ignoring invalid duration"),
                }
            }
        }

        for (key, slot) in [
            ("ASSIST_AI_DEMO_MODEL", &mut config.ai_demo_model),
            ("ASSIST_IMAGE_MODEL", &mut config.image_model),
            ("ASSIST_SENTIMENT_MODEL", &mut config.sentiment_model),
        ] {
            if let Ok(model) = std::env::var(key) {
                *slot = model;
            }
        }

        config
            .routes
            .apply_overrides(|key| std::env::var(key).ok());

        let eu = region_from_env("LANGFUSE_EU");
        let us = region_from_env("LANGFUSE_US");
        config.prompt_store = eu.clone();
        config.telemetry = eu.into_iter().chain(us).collect();

        config.livekit = LiveKitConfig {
            url: std::env::var("LIVEKIT_URL").ok(),
            api_key: std::env::var("LIVEKIT_API_KEY").ok(),
            api_secret: std::env::var("LIVEKIT_API_SECRET").ok(),
        };

        config
    }
}
