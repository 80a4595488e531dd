//! Streamable-HTTP tool-protocol client
//!
//! Speaks JSON-RPC 2.0 over `POST` to a single endpoint: `initialize`, then
//! `notifications/initialized`, `tools/list` (following `nextCursor`) and
//! `tools/call`. The server-assigned `Mcp-Session-Id` header is echoed on
//! every later request and the session is ended with `DELETE`. Responses may
//! be plain JSON or a `text/event-stream` body carrying the JSON-RPC reply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ToolGateway, ToolResult, ToolSession, ToolSpec};
use crate::error::{AssistError, Result};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION: &str = "2025-03-26";

fn gateway_err(message: impl Into<String>) -> AssistError {
    AssistError::ToolGateway {
        message: message.into(),
    }
}

/// Gateway for an HTTP tool-protocol endpoint.
#[derive(Clone)]
pub struct HttpToolGateway {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpToolGateway {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolSpec>,
    #[serde(default)]
    next_cursor: Option<String>,
}

struct HttpToolSession {
    id: String,
    gateway: HttpToolGateway,
    remote_session: Option<String>,
    next_id: AtomicU64,
}

impl HttpToolSession {
    fn request(&self) -> reqwest::RequestBuilder {
        let builder = self
            .gateway
            .http
            .post(&self.gateway.url)
            .timeout(self.gateway.timeout)
            .header(ACCEPT, "application/json, text/event-stream");
        match &self.remote_session {
            Some(sid) => builder.header(SESSION_HEADER, sid),
            None => builder,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self.request().json(&body).send().await?;
        let (_, reply) = read_reply(response, id).await?;
        Ok(reply)
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        let response = self.request().json(&body).send().await?;
        if !response.status().is_success() {
            return Err(gateway_err(format!(
                "{method} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Extract the JSON-RPC result with `id` from a JSON or SSE response.
async fn read_reply(response: reqwest::Response, id: u64) -> Result<(Option<String>, Value)> {
    let status = response.status();
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let is_sse = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);
    let text = response.text().await?;
    if !status.is_success() {
        return Err(gateway_err(format!("endpoint returned {status}: {text}")));
    }

    let candidates: Vec<RpcResponse> = if is_sse {
        text.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .filter_map(|data| serde_json::from_str(data.trim()).ok())
            .collect()
    } else {
        vec![serde_json::from_str(&text)?]
    };

    let reply = candidates
        .into_iter()
        .find(|r| r.id.as_ref().and_then(Value::as_u64) == Some(id))
        .ok_or_else(|| gateway_err(format!("no reply for request {id}")))?;

    if let Some(err) = reply.error {
        return Err(gateway_err(format!("rpc error {}: {}", err.code, err.message)));
    }
    Ok((session, reply.result.unwrap_or(Value::Null)))
}

/// Flatten `tools/call` content into a JSON value for the model.
fn call_content(result: &Value) -> Value {
    match result.get("content").and_then(Value::as_array) {
        Some(items) => {
            let texts: Vec<&str> = items
                .iter()
                .filter(|i| i.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|i| i.get("text").and_then(Value::as_str))
                .collect();
            if texts.len() == items.len() {
                Value::String(texts.join("\n"))
            } else {
                Value::Array(items.clone())
            }
        }
        None => result.clone(),
    }
}

#[async_trait]
impl ToolGateway for HttpToolGateway {
    async fn open(&self, session_id: &str) -> Result<Arc<dyn ToolSession>> {
        let init = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": session_id, "version": env!("CARGO_PKG_VERSION") }
            }
        });
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&init)
            .send()
            .await?;
        let (remote_session, _) = read_reply(response, 0).await?;
        debug!(session_id, remote = ?remote_session, "tool endpoint initialized");

        let session = HttpToolSession {
            id: session_id.to_string(),
            gateway: self.clone(),
            remote_session,
            next_id: AtomicU64::new(1),
        };
        if let Err(e) = session.notify("notifications/initialized").await {
            // the remote side already holds a session; end it before bailing out
            if let Err(close_err) = session.close().await {
                warn!(session_id, error = %close_err, "failed to close half-open tool session");
            }
            return Err(e);
        }
        Ok(Arc::new(session))
    }
}

#[async_trait]
impl ToolSession for HttpToolSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let page: ListToolsResult = serde_json::from_value(self.call("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    async fn invoke(&self, name: &str, arguments: Value, step: usize) -> Result<ToolResult> {
        debug!(session_id = %self.id, tool = name, step, "invoking tool");
        let result = self
            .call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(ToolResult {
            content: call_content(&result),
            is_error: result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    async fn close(&self) -> Result<()> {
        let Some(sid) = &self.remote_session else {
            return Ok(());
        };
        let response = self
            .gateway
            .http
            .delete(&self.gateway.url)
            .timeout(self.gateway.timeout)
            .header(SESSION_HEADER, sid)
            .send()
            .await?;
        match response.status() {
            // servers without explicit session teardown answer 405
            s if s.is_success() || s == StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            s => Err(gateway_err(format!("close returned {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_endpoint(server: &MockServer) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "remote-1")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": {"capabilities": {}}})),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(header("mcp-session-id", "remote-1"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[{\"name\":\"searchLangfuseDocs\",\"description\":\"Search\",\"inputSchema\":{\"type\":\"object\"}}]}}\n\n",
                "text/event-stream",
            ))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {"content": [{"type": "text", "text": "Langfuse is"}, {"type": "text", "text": "open source"}], "isError": false}
            })))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(header("mcp-session-id", "remote-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let server = MockServer::start().await;
        mount_endpoint(&server).await;

        let gateway = HttpToolGateway::new(reqwest::Client::new(), server.uri());
        let session = gateway.open("qa-chatbot-test").await.unwrap();
        assert_eq!(session.session_id(), "qa-chatbot-test");

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "searchLangfuseDocs");
        assert_eq!(tools[0].input_schema, json!({"type": "object"}));

        let result = session
            .invoke("searchLangfuseDocs", json!({"query": "what"}), 1)
            .await
            .unwrap();
        assert_eq!(result.content, json!("Langfuse is\nopen source"));
        assert!(!result.is_error);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn rpc_error_is_gateway_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"jsonrpc": "2.0", "id": 0, "error": {"code": -32600, "message": "bad"}}),
            ))
            .mount(&server)
            .await;

        let gateway = HttpToolGateway::new(reqwest::Client::new(), server.uri());
        let err = gateway.open("s").await.err().unwrap();
        assert!(matches!(err, AssistError::ToolGateway { ref message } if message.contains("bad")));
    }

    #[tokio::test]
    async fn failed_initialized_notification_ends_remote_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "remote-2")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": {}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header("mcp-session-id", "remote-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpToolGateway::new(reqwest::Client::new(), server.uri());
        let err = gateway.open("s").await.err().unwrap();
        assert!(matches!(err, AssistError::ToolGateway { ref message } if message.contains("500")));
        server.verify().await;
    }

    #[test]
    fn mixed_content_is_kept_structured() {
        let result = json!({"content": [{"type": "text", "text": "a"}, {"type": "image", "data": "x"}]});
        assert!(call_content(&result).is_array());
    }
}
