//! # tower-assist
//!
//! A traced, tool-augmented streaming inference pipeline built from Tower
//! services. A request is admitted by the rate limiter, opens a trace,
//! resolves a versioned prompt, discovers tools through a remote tool
//! gateway and drives a bounded multi-step completion loop whose events are
//! streamed back to the caller. The trace is exported to every configured
//! telemetry sink once the response has been produced.
//!
//! ## Core Concepts
//!
//! - **RequestContext**: explicit handle on the active trace and observation,
//!   threaded through the resolver, the tool gateway and the loop
//! - **ToolDef**: a discovered `ToolSpec` plus a Tower service invoking it
//! - **BoundedLoop**: a Tower layer turning one streaming step into a
//!   multi-step stream capped at `max_steps`
//! - **Finalizer**: deferred post-response work the server drains before exit
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use tower_assist::config::AssistConfig;
//! use tower_assist::server::{router, AppState, Backends};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let config = AssistConfig::from_env();
//! let backends = Backends::from_config(&config);
//! let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
//! let state = AppState::new(config, backends);
//! axum::serve(listener, router(state)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod livekit;
pub mod observability;
pub mod prompts;
pub mod provider;
pub mod rate_limit;
pub mod server;
pub mod streaming;
pub mod tools;

pub use config::{AssistConfig, ConfigBuilder};
pub use error::{AssistError, Result};
pub use observability::{Finalizer, Recorder, RequestContext};
pub use rate_limit::{RateDecision, RateLimitRule, RateLimiter};
pub use server::{router, AppState, Backends};
pub use streaming::{BoundedLoopLayer, LoopFinish, LoopRequest, LoopState};
pub use tools::{ToolDef, ToolGateway, ToolSession, ToolSpec};
