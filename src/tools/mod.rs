//! Tool discovery and routing
//!
//! A [`ToolGateway`] opens one [`ToolSession`] per request. The session's
//! tools are discovered once, frozen, and exposed to the loop as
//! [`ToolDef`]s: a typed [`ToolSpec`] plus a Tower service that invokes the
//! tool through the session. [`ToolRouter`] dispatches invocations by name.
//!
//! [`ToolSessionHandle`] owns the session for the request and guarantees it
//! is closed at most once, whichever exit path gets there first.

pub mod mcp;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_openai::types::{
    ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType, FunctionObjectArgs,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;
use tower::{BoxError, Service};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AssistError, Result};
use crate::observability::{ObservationKind, ObservationUpdate, RequestContext};

pub use mcp::HttpToolGateway;

/// A tool as advertised by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// A tool call requested by the model during loop step `step`.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub step: usize,
}

/// Result of a tool call. `is_error` results are still fed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub id: String,
    pub content: Value,
    pub is_error: bool,
}

/// Result body returned by a session, before it is tied to a call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

/// Boxed tool service type alias.
pub type ToolSvc = BoxCloneService<ToolInvocation, ToolOutput, BoxError>;

/// Definition of a tool: its spec plus the service implementing it.
pub struct ToolDef {
    pub spec: ToolSpec,
    pub service: ToolSvc,
}

impl ToolDef {
    pub fn to_openai_tool(&self) -> Result<ChatCompletionTool> {
        let func = FunctionObjectArgs::default()
            .name(self.spec.name.clone())
            .description(self.spec.description.clone())
            .parameters(self.spec.input_schema.clone())
            .build()?;
        Ok(ChatCompletionToolArgs::default()
            .r#type(ChatCompletionToolType::Function)
            .function(func)
            .build()?)
    }
}

/// Simple router service over tools.
#[derive(Clone)]
pub struct ToolRouter {
    name_to_index: HashMap<String, usize>,
    services: Vec<ToolSvc>, // index 0 is the unknown-tool fallback
}

impl ToolRouter {
    pub fn new(tools: Vec<ToolDef>) -> Result<(Self, Vec<ChatCompletionTool>)> {
        let unknown = BoxCloneService::new(tower::service_fn(|inv: ToolInvocation| async move {
            Err::<ToolOutput, BoxError>(format!("unknown tool: {}", inv.name).into())
        }));

        let mut services: Vec<ToolSvc> = vec![unknown];
        let mut specs: Vec<ChatCompletionTool> = Vec::with_capacity(tools.len());
        let mut name_to_index: HashMap<String, usize> = HashMap::new();

        for (i, td) in tools.into_iter().enumerate() {
            specs.push(td.to_openai_tool()?);
            name_to_index.insert(td.spec.name, i + 1);
            services.push(td.service);
        }

        Ok((
            Self {
                name_to_index,
                services,
            },
            specs,
        ))
    }

    pub fn names(&self) -> Vec<&str> {
        self.name_to_index.keys().map(String::as_str).collect()
    }
}

impl Service<ToolInvocation> for ToolRouter {
    type Response = ToolOutput;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        // Readiness is checked per selected service inside `call`.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ToolInvocation) -> Self::Future {
        let idx = self
            .name_to_index
            .get(req.name.as_str())
            .copied()
            .unwrap_or(0);

        // index 0 is always present (unknown fallback)
        let svc: &mut ToolSvc = &mut self.services[idx];
        Box::pin(svc.call(req))
    }
}

/// One open session on a tool-protocol endpoint.
#[async_trait]
pub trait ToolSession: Send + Sync {
    fn session_id(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    async fn invoke(&self, name: &str, arguments: Value, step: usize) -> Result<ToolResult>;

    async fn close(&self) -> Result<()>;
}

/// Opens tool sessions.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn open(&self, session_id: &str) -> Result<Arc<dyn ToolSession>>;
}

/// Request-scoped owner of a tool session.
///
/// Discovery runs once; later calls to [`ToolSessionHandle::tools`] return
/// services over the same frozen spec list. [`ToolSessionHandle::close`]
/// closes the remote session on its first call only.
#[derive(Clone)]
pub struct ToolSessionHandle {
    session: Arc<dyn ToolSession>,
    specs: Arc<OnceCell<Vec<ToolSpec>>>,
    closed: Arc<AtomicBool>,
    invoke_timeout: Duration,
}

/// Ceiling on a single tool invocation.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(20);

impl ToolSessionHandle {
    pub fn new(session: Arc<dyn ToolSession>) -> Self {
        Self {
            session,
            specs: Arc::new(OnceCell::new()),
            closed: Arc::new(AtomicBool::new(false)),
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// Open a session named `<prefix>-<uuid>` inside a `create-mcp-client` span.
    pub async fn open_traced(
        gateway: &dyn ToolGateway,
        ctx: &RequestContext,
        prefix: &str,
    ) -> Result<Self> {
        let session_id = format!("{prefix}-{}", Uuid::new_v4());
        ctx.in_observation("create-mcp-client", ObservationKind::Span, |span| async move {
            span.update_active_observation(
                ObservationUpdate {
                    input: Some(json!({ "sessionId": session_id })),
                    ..Default::default()
                },
                ObservationKind::Span,
            );
            let session = gateway.open(&session_id).await?;
            debug!(session_id = %session_id, "tool session opened");
            Ok(Self::new(session))
        })
        .await
    }

    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    /// Discover the session's tools (once) and wrap them as tool definitions.
    pub async fn tools(&self) -> Result<Vec<ToolDef>> {
        let specs = self
            .specs
            .get_or_try_init(|| async {
                let specs = self.session.list_tools().await?;
                debug!(session_id = self.session_id(), tools = specs.len(), "tools discovered");
                Ok::<_, AssistError>(specs)
            })
            .await?;

        Ok(specs
            .iter()
            .cloned()
            .map(|spec| {
                let session = self.session.clone();
                let svc = tower::service_fn(move |inv: ToolInvocation| {
                    let session = session.clone();
                    async move {
                        let result = session.invoke(&inv.name, inv.arguments, inv.step).await?;
                        Ok::<_, BoxError>(ToolOutput {
                            id: inv.id,
                            content: result.content,
                            is_error: result.is_error,
                        })
                    }
                });
                let svc = ServiceBuilder::new()
                    .layer(TimeoutLayer::new(self.invoke_timeout))
                    .service(svc);
                ToolDef {
                    spec,
                    service: BoxCloneService::new(svc),
                }
            })
            .collect())
    }

    /// Close the session. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.session.close().await {
            warn!(session_id = self.session_id(), error = %e, "closing tool session failed");
        } else {
            debug!(session_id = self.session_id(), "tool session closed");
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type StaticHandler = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// In-process gateway serving a fixed tool set. Counts sessions, closes and
/// the step number of every invocation.
#[derive(Clone, Default)]
pub struct StaticToolGateway {
    tools: Vec<(ToolSpec, StaticHandler)>,
    fail_open: bool,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    steps: Arc<Mutex<Vec<usize>>>,
}

impl StaticToolGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<F>(mut self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.tools.push((
            ToolSpec {
                name: name.to_string(),
                description: description.to_string(),
                input_schema: empty_object_schema(),
            },
            Arc::new(handler),
        ));
        self
    }

    /// Make `open` fail, as an unreachable endpoint would.
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Step numbers observed by invocations, in call order.
    pub fn observed_steps(&self) -> Vec<usize> {
        self.steps.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

struct StaticSession {
    id: String,
    gateway: StaticToolGateway,
}

#[async_trait]
impl ToolSession for StaticSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(self.gateway.tools.iter().map(|(s, _)| s.clone()).collect())
    }

    async fn invoke(&self, name: &str, arguments: Value, step: usize) -> Result<ToolResult> {
        self.gateway
            .steps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(step);
        let handler = self
            .gateway
            .tools
            .iter()
            .find(|(s, _)| s.name == name)
            .map(|(_, h)| h.clone())
            .ok_or_else(|| AssistError::ToolGateway {
                message: format!("unknown tool: {name}"),
            })?;
        Ok(match handler(arguments) {
            Ok(content) => ToolResult {
                content,
                is_error: false,
            },
            Err(message) => ToolResult {
                content: Value::String(message),
                is_error: true,
            },
        })
    }

    async fn close(&self) -> Result<()> {
        self.gateway.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ToolGateway for StaticToolGateway {
    async fn open(&self, session_id: &str) -> Result<Arc<dyn ToolSession>> {
        if self.fail_open {
            return Err(AssistError::ToolGateway {
                message: "connection refused".to_string(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StaticSession {
            id: session_id.to_string(),
            gateway: self.clone(),
        }))
    }
}
