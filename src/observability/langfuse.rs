//! Langfuse ingestion sink
//!
//! Buffers records as ingestion events and posts them in one batch to
//! `POST {base_url}/api/public/ingestion` on flush, authenticating with the
//! region's public/secret key pair.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ObservationKind, ObservationRecord, TelemetryEvent, TelemetrySink};
use crate::config::LangfuseCredentials;
use crate::error::{AssistError, Result};

/// One entry of an ingestion batch.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionEvent {
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub body: Value,
}

impl IngestionEvent {
    pub fn from_telemetry(event: &TelemetryEvent) -> Self {
        let (kind, body) = match event {
            TelemetryEvent::TraceUpsert(trace) => (
                "trace-create",
                serde_json::to_value(trace).unwrap_or(Value::Null),
            ),
            TelemetryEvent::ObservationCreate(o) => (
                match o.kind {
                    ObservationKind::Span => "span-create",
                    ObservationKind::Generation => "generation-create",
                },
                observation_body(o),
            ),
            TelemetryEvent::ObservationUpdate(o) => (
                match o.kind {
                    ObservationKind::Span => "span-update",
                    ObservationKind::Generation => "generation-update",
                },
                observation_body(o),
            ),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind,
            body,
        }
    }
}

fn observation_body(o: &ObservationRecord) -> Value {
    let mut body = json!({
        "id": o.id,
        "traceId": o.trace_id,
        "parentObservationId": o.parent_id,
        "name": o.name,
        "startTime": o.start_time.to_rfc3339(),
    });
    let fields = [
        ("endTime", o.end_time.map(|t| json!(t.to_rfc3339()))),
        (
            "completionStartTime",
            o.completion_start_time.map(|t| json!(t.to_rfc3339())),
        ),
        ("input", o.input.clone()),
        ("output", o.output.clone()),
        ("model", o.model.clone().map(Value::String)),
        ("modelParameters", o.model_parameters.clone()),
        ("usage", o.usage.map(|u| json!(u))),
        ("metadata", o.metadata.clone()),
        ("level", o.level.map(|l| json!(l))),
        ("statusMessage", o.status_message.clone().map(Value::String)),
    ];
    if let Value::Object(map) = &mut body {
        for (key, value) in fields {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        }
    }
    body
}

/// Exports to one Langfuse region.
pub struct LangfuseSink {
    http: reqwest::Client,
    credentials: LangfuseCredentials,
    buffer: Mutex<Vec<IngestionEvent>>,
}

impl LangfuseSink {
    pub fn new(http: reqwest::Client, credentials: LangfuseCredentials) -> Self {
        Self {
            http,
            credentials,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<IngestionEvent>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/api/public/ingestion",
            self.credentials.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl TelemetrySink for LangfuseSink {
    fn record(&self, event: TelemetryEvent) {
        self.lock().push(IngestionEvent::from_telemetry(&event));
    }

    async fn flush(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return Ok(());
        }
        debug!(events = batch.len(), base_url = %self.credentials.base_url, "exporting telemetry batch");

        let response = self
            .http
            .post(self.endpoint())
            .basic_auth(
                &self.credentials.public_key,
                Some(&self.credentials.secret_key),
            )
            .json(&json!({ "batch": batch }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "telemetry batch rejected");
            return Err(AssistError::Telemetry {
                message: format!("ingestion returned {status}: {body}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Recorder;
    use std::sync::Arc;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds(base_url: String) -> LangfuseCredentials {
        LangfuseCredentials {
            base_url,
            public_key: "pk-lf-test".into(),
            secret_key: "sk-lf-test".into(),
        }
    }

    #[test]
    fn generation_updates_use_generation_event_type() {
        let sink = Arc::new(LangfuseSink::new(
            reqwest::Client::new(),
            creds("http://localhost".into()),
        ));
        let recorder = Recorder::new(vec![sink.clone()]);
        let ctx = recorder.start_trace("image-generator", ObservationKind::Generation);
        ctx.end_active_span();

        let kinds: Vec<&str> = sink.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec!["trace-create", "generation-create", "generation-update"]
        );
        assert!(sink.lock()[2].body.get("endTime").is_some());
    }

    #[tokio::test]
    async fn flush_posts_batch_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/public/ingestion"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(207).set_body_json(json!({"successes": [], "errors": []})))
            .expect(1)
            .mount(&server)
            .await;

        let sink = Arc::new(LangfuseSink::new(reqwest::Client::new(), creds(server.uri())));
        let recorder = Recorder::new(vec![sink.clone()]);
        recorder.start_trace("root", ObservationKind::Span);
        assert_eq!(sink.pending(), 2);

        sink.flush().await.unwrap();
        assert_eq!(sink.pending(), 0);
        // nothing buffered, no second request
        sink.flush().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_batch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/public/ingestion"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let sink = LangfuseSink::new(reqwest::Client::new(), creds(server.uri()));
        sink.record(TelemetryEvent::ObservationCreate(ObservationRecord::new(
            "t".into(),
            None,
            "x",
            ObservationKind::Span,
        )));
        let err = sink.flush().await.unwrap_err();
        assert!(matches!(err, AssistError::Telemetry { .. }));
    }
}
