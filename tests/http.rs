mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use common::{ScriptedAdapter, gateway, gateway_with, model, registry, unavailable};
use llm_gateway::config::Settings;
use llm_gateway::providers::{ProviderReply, ReplyUsage};
use llm_gateway::server::{AppState, create_app};
use llm_gateway::Gateway;
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

fn app(gateway: Gateway) -> Router {
    create_app(AppState::new(Settings::default(), gateway))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn openai_app(adapter: std::sync::Arc<ScriptedAdapter>) -> Router {
    app(gateway(registry(vec![(
        "openai",
        vec![model("gpt-3.5-turbo", 0.0, 0.000002)],
        adapter,
    )])))
}

#[tokio::test]
async fn complete_returns_documented_shape() {
    let adapter = ScriptedAdapter::replying(
        "4",
        Some(ReplyUsage {
            prompt_tokens: 6,
            completion_tokens: 8,
        }),
    );
    let app = openai_app(adapter);
    let body = json!({
        "prompt": "What is 2+2?",
        "conversation_id": "conv-1",
        "model_preference": { "primary": "openai", "models": ["gpt-3.5-turbo"] }
    });

    let (status, first) = send(&app, Method::POST, "/v1/complete", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["content"], "4");
    assert_eq!(first["provider"], "openai");
    assert_eq!(first["model_used"], "gpt-3.5-turbo");
    assert_eq!(first["usage"]["completion_tokens"], 8);
    assert_eq!(first["usage"]["total_tokens"], 14);
    assert_eq!(first["usage"]["cost_estimate"], 0.000016);
    assert!(first["performance"]["response_time_ms"].is_u64());
    assert_eq!(first["metadata"]["fallback_used"], false);
    assert_eq!(first["metadata"]["cache_hit"], false);
    assert_eq!(first["metadata"]["conversation_id"], "conv-1");

    let (status, second) = send(&app, Method::POST, "/v1/complete", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["metadata"]["cache_hit"], true);
}

#[tokio::test]
async fn malformed_bodies_are_bad_requests() {
    let app = openai_app(ScriptedAdapter::replying("x", None));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/complete")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Method::POST, "/v1/complete", Some(json!({ "prompt": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/complete",
        Some(json!({ "prompt": "hi", "model_preference": { "cost_priority": "cheapest" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exhaustion_is_503_with_sanitized_breakdown() {
    let app = openai_app(ScriptedAdapter::failing(unavailable()));
    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/complete",
        Some(json!({ "prompt": "hi", "model_preference": { "models": ["gpt-3.5-turbo"] } })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "all_providers_exhausted");
    let failures = body["error"]["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["provider"], "openai");
    assert_eq!(failures[0]["kind"], "provider_unavailable");
    assert!(!body.to_string().contains("exploded"));
}

#[tokio::test]
async fn caller_deadline_is_504() {
    let adapter = ScriptedAdapter::slow(
        Ok(ProviderReply {
            content: "late".into(),
            usage: None,
        }),
        Duration::from_millis(300),
    );
    let mut settings = Settings::default();
    settings.server.request_timeout_ms = 50;
    let app = app(gateway_with(
        registry(vec![("slow", vec![model("m", 0.0, 0.0)], adapter)]),
        settings,
    ));

    let (status, body) = send(&app, Method::POST, "/v1/complete", Some(json!({ "prompt": "hi" }))).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["type"], "timeout");
}

#[tokio::test]
async fn health_and_provider_status() {
    let app = openai_app(ScriptedAdapter::replying("ok", None));

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, Method::GET, "/providers/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let providers = body.as_array().unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0]["provider"], "openai");
    assert_eq!(providers[0]["family"], "hosted");
    assert_eq!(providers[0]["circuit_state"], "closed");
    assert_eq!(providers[0]["models"][0]["id"], "gpt-3.5-turbo");
}

#[tokio::test]
async fn usage_stats_filters_by_provider_and_window() {
    let app = openai_app(ScriptedAdapter::replying(
        "ok",
        Some(ReplyUsage {
            prompt_tokens: 2,
            completion_tokens: 8,
        }),
    ));
    send(&app, Method::POST, "/v1/complete", Some(json!({ "prompt": "one" }))).await;
    send(&app, Method::POST, "/v1/complete", Some(json!({ "prompt": "two" }))).await;

    let (status, body) = send(&app, Method::GET, "/usage/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"]["requests"], 2);
    assert_eq!(body["by_provider"]["openai"]["completion_tokens"], 16);
    assert_eq!(body["by_model"]["gpt-3.5-turbo"]["requests"], 2);

    let (_, body) = send(&app, Method::GET, "/usage/stats?provider=nobody", None).await;
    assert_eq!(body["total"]["requests"], 0);

    let (_, body) = send(&app, Method::GET, "/usage/stats?since=2999-01-01T00:00:00Z", None).await;
    assert_eq!(body["total"]["requests"], 0);

    let (status, _) = send(&app, Method::GET, "/usage/stats?since=yesterday", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cache_stats_and_purge() {
    let adapter = ScriptedAdapter::replying("ok", None);
    let app = openai_app(adapter.clone());
    let body = json!({ "prompt": "repeat", "model_preference": { "models": ["gpt-3.5-turbo"] } });

    send(&app, Method::POST, "/v1/complete", Some(body.clone())).await;
    send(&app, Method::POST, "/v1/complete", Some(body.clone())).await;

    let (_, stats) = send(&app, Method::GET, "/cache/stats", None).await;
    assert_eq!(stats["entries"], 1);
    assert_eq!(stats["hits"], 1);

    let (status, cleared) = send(&app, Method::DELETE, "/cache", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["cleared"], 1);

    let (_, response) = send(&app, Method::POST, "/v1/complete", Some(body)).await;
    assert_eq!(response["metadata"]["cache_hit"], false);
    assert_eq!(adapter.calls(), 2);
}
