use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tower::{Layer, ServiceExt};

use async_openai::types::CreateChatCompletionRequestArgs;
use tower_assist::prompts::{ChatMessage, PromptMessage, PromptTemplate};
use tower_assist::provider::ScriptedProvider;
use tower_assist::rate_limit::RateLimiter;
use tower_assist::streaming::{collect_final, BoundedLoopLayer, LoopRequest, StepChunk, StepStreamService};
use tower_assist::tools::{StaticToolGateway, ToolGateway, ToolRouter, ToolSessionHandle};

fn bench_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new();
    let keys: Vec<String> = (0..256).map(|i| format!("10.0.{}.{}:/api/chat", i / 16, i % 16)).collect();
    let t0 = Instant::now();
    let mut tick = 0u64;
    c.bench_function("limiter_256_keys", |b| {
        b.iter(|| {
            tick += 1;
            let key = &keys[(tick % 256) as usize];
            limiter.allow_at(key, 15, Duration::from_secs(60), t0 + Duration::from_millis(tick))
        })
    });
}

fn bench_compile(c: &mut Criterion) {
    let template = PromptTemplate::chat(
        "langfuse-docs-assistant-chat",
        1,
        vec![
            PromptMessage::Chat(ChatMessage::system("You answer questions about {{product}}.")),
            PromptMessage::placeholder("chat_history"),
        ],
    );
    let variables = HashMap::from([("product".to_string(), "Langfuse".to_string())]);
    let history: Vec<ChatMessage> = (0..20)
        .map(|i| {
            if i % 2 == 0 {
                ChatMessage::user(format!("question {i} about tracing and sessions"))
            } else {
                ChatMessage::assistant(format!("answer {i} with a link to the docs"))
            }
        })
        .collect();
    let placeholders = HashMap::from([("chat_history".to_string(), history)]);
    c.bench_function("compile_20_message_history", |b| {
        b.iter(|| template.compile(&variables, &placeholders))
    });
}

fn bench_loop(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let gateway = StaticToolGateway::new().with_tool("searchLangfuseDocs", "Search", |_| Ok(json!("hit")));

    c.bench_function("loop_two_steps_one_tool", |b| {
        b.to_async(&rt).iter_batched(
            || {
                Arc::new(ScriptedProvider::new(vec![
                    vec![StepChunk::ToolCallStart {
                        id: "call_1".into(),
                        name: "searchLangfuseDocs".into(),
                        arguments: json!({"query": "traces"}),
                    }],
                    vec![StepChunk::Token("done".into())],
                ]))
            },
            |provider| {
                let gateway = gateway.clone();
                async move {
                    let session = ToolSessionHandle::new(gateway.open("bench").await.unwrap());
                    let (router, specs) = ToolRouter::new(session.tools().await.unwrap()).unwrap();
                    let request = CreateChatCompletionRequestArgs::default()
                        .model("gpt-5-mini")
                        .messages(vec![])
                        .tools(specs)
                        .build()
                        .unwrap();
                    let agent = BoundedLoopLayer::new(10).layer(StepStreamService::new(provider, router));
                    let mut events = agent.oneshot(LoopRequest::new(request)).await.unwrap();
                    let _ = collect_final(&mut events).await.unwrap();
                    session.close().await;
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_limiter, bench_compile, bench_loop);
criterion_main!(benches);
