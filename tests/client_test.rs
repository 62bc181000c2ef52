mod helpers;

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;

use helpers::{client_config, eventually, fast_supervisor_config, spawn_server};
use tether::client::{ChatExchange, ChatMessage, InferenceClient};
use tether::error::ServiceError;
use tether::supervisor::{HealthProbe, HttpHealthProbe, ProbeOutcome};

type Hits = Arc<AtomicUsize>;

const NDJSON: [(header::HeaderName, &str); 1] = [(header::CONTENT_TYPE, "application/x-ndjson")];

fn exchange() -> ChatExchange {
    ChatExchange::new(vec![ChatMessage::user("hello")])
}

#[tokio::test]
async fn chat_streams_every_line_in_order() {
    let router = Router::new().route(
        "/api/chat",
        post(|| async {
            let body = [
                json!({"message": {"role": "assistant", "content": "Hel"}, "done": false}),
                json!({"message": {"role": "assistant", "content": "lo"}, "done": false}),
                json!({"message": {"role": "assistant", "content": "!"}, "done": true}),
            ]
            .iter()
            .map(|v| format!("{v}\n"))
            .collect::<String>();
            (NDJSON, body)
        }),
    );
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let mut stream = client.chat(&exchange()).await.unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].content, "Hel");
    assert!(!chunks[0].is_final);
    assert!(!chunks[1].is_final);
    assert!(chunks[2].is_final);
}

/// Flips its flag when the server drops the response body.
struct BodyDropped(Arc<AtomicBool>);

impl Drop for BodyDropped {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn dropping_the_stream_closes_the_connection() {
    let dropped = Arc::new(AtomicBool::new(false));
    let sent: Hits = Arc::default();
    let router = Router::new()
        .route(
            "/api/chat",
            post(
                |State((dropped, sent)): State<(Arc<AtomicBool>, Hits)>| async move {
                    // an endless reply, one line every 20ms
                    let lines = futures::stream::unfold(
                        (BodyDropped(dropped), sent, 0u32),
                        |(guard, sent, n)| async move {
                            if n > 0 {
                                tokio::time::sleep(Duration::from_millis(20)).await;
                            }
                            sent.fetch_add(1, Ordering::SeqCst);
                            let line = json!({"message": {"content": format!("part {n}")}, "done": false});
                            Some((
                                Ok::<_, Infallible>(Bytes::from(format!("{line}\n"))),
                                (guard, sent, n + 1),
                            ))
                        },
                    );
                    (NDJSON, Body::from_stream(lines))
                },
            ),
        )
        .with_state((dropped.clone(), sent.clone()));
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let mut stream = client.chat(&exchange()).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.content, "part 0");
    assert!(!first.is_final);
    drop(stream);

    eventually(|| dropped.load(Ordering::SeqCst)).await;
    let after_close = sent.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sent.load(Ordering::SeqCst), after_close);
}

#[tokio::test]
async fn complete_text_joins_the_stream() {
    let router = Router::new().route(
        "/api/chat",
        post(|| async {
            (
                NDJSON,
                "{\"message\":{\"content\":\"The user \"},\"done\":false}\n\
                 {\"message\":{\"content\":\"likes tea.\"},\"done\":true}\n",
            )
        }),
    );
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let text = client
        .complete_text(&exchange().with_temperature(0.2))
        .await
        .unwrap();
    assert_eq!(text, "The user likes tea.");
}

#[tokio::test]
async fn missing_model_is_not_retried() {
    let hits: Hits = Arc::default();
    let router = Router::new()
        .route(
            "/api/chat",
            post(|State(hits): State<Hits>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::NOT_FOUND, Json(json!({"error": "model not found"})))
            }),
        )
        .with_state(hits.clone());
    let base = spawn_server(router).await;
    let config = client_config(&base);
    let client = InferenceClient::new(&config).unwrap();

    let err = client.chat(&exchange()).await.err().unwrap();

    assert_eq!(err, ServiceError::ModelNotFound(config.chat_model.clone()));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_errors_are_retried_up_to_the_limit() {
    let hits: Hits = Arc::default();
    let router = Router::new()
        .route(
            "/api/chat",
            post(|State(hits): State<Hits>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "out of memory"})))
            }),
        )
        .with_state(hits.clone());
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let err = client.chat(&exchange()).await.err().unwrap();

    assert_eq!(
        err,
        ServiceError::ServerError {
            status: 500,
            message: "out of memory".into()
        }
    );
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transient_failure_then_success() {
    let hits: Hits = Arc::default();
    let router = Router::new()
        .route(
            "/api/embeddings",
            post(|State(hits): State<Hits>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})));
                }
                (StatusCode::OK, Json(json!({"embedding": [0.25, -0.5, 1.0]})))
            }),
        )
        .with_state(hits.clone());
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let embedding = client.generate_embedding("hello").await.unwrap();

    assert_eq!(embedding, vec![0.25, -0.5, 1.0]);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreachable_server_is_a_connection_failure() {
    // bind then drop, so nothing listens on the port
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = InferenceClient::new(&client_config(&format!("http://{addr}"))).unwrap();
    let err = client.generate_embedding("hello").await.unwrap_err();
    assert!(matches!(err, ServiceError::ConnectionFailed(_)), "{err:?}");

    let report = client.check_health().await;
    assert!(!report.ready);
    assert!(report.models.is_empty());
}

#[tokio::test]
async fn health_check_is_cached() {
    let hits: Hits = Arc::default();
    let router = Router::new()
        .route(
            "/api/tags",
            get(|State(hits): State<Hits>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(json!({"models": [{"name": "gemma3n:e2b"}, {"name": "nomic-embed-text:latest"}]}))
            }),
        )
        .with_state(hits.clone());
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let first = client.check_health().await;
    let second = client.check_health().await;
    assert!(first.ready);
    assert_eq!(first, second);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    client.invalidate_health();
    client.check_health().await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    assert!(client.has_model("nomic-embed-text").await.unwrap());
    assert!(!client.has_model("llama3").await.unwrap());
}

#[tokio::test]
async fn health_reports_missing_chat_model() {
    let router = Router::new().route(
        "/api/tags",
        get(|| async { Json(json!({"models": [{"name": "llama3:8b"}]})) }),
    );
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let report = client.check_health().await;
    assert!(!report.ready);
    assert_eq!(report.models, vec!["llama3:8b".to_string()]);
}

#[tokio::test]
async fn pull_reports_progress_until_success() {
    let router = Router::new().route(
        "/api/pull",
        post(|| async {
            (
                NDJSON,
                "{\"status\":\"pulling manifest\"}\n\
                 {\"status\":\"downloading\",\"total\":200,\"completed\":50}\n\
                 {\"status\":\"downloading\",\"total\":200,\"completed\":200}\n\
                 {\"status\":\"success\"}\n",
            )
        }),
    );
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let mut stream = client.pull_model("gemma3n:e2b").await.unwrap();
    let mut updates = Vec::new();
    while let Some(update) = stream.next().await {
        updates.push(update.unwrap());
    }

    let progress: Vec<f64> = updates.iter().map(|u| u.progress).collect();
    assert_eq!(progress, vec![0.0, 0.25, 1.0, 1.0]);
    assert!(updates.last().unwrap().is_complete());
}

#[tokio::test]
async fn stream_error_line_surfaces_as_error() {
    let router = Router::new().route(
        "/api/pull",
        post(|| async {
            (
                NDJSON,
                "{\"status\":\"downloading\",\"total\":10,\"completed\":1}\n\
                 {\"error\":\"disk full\"}\n",
            )
        }),
    );
    let base = spawn_server(router).await;
    let client = InferenceClient::new(&client_config(&base)).unwrap();

    let mut stream = client.pull_model("gemma3n:e2b").await.unwrap();
    assert!(stream.next().await.unwrap().is_ok());
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err, ServiceError::InvalidResponse("disk full".into()));
}

// ── Supervisor health probe over real HTTP ──────────────────────────────────

fn probe_for(base: &str) -> HttpHealthProbe {
    let port = base.rsplit(':').next().unwrap().parse().unwrap();
    let mut config = fast_supervisor_config();
    config.host = "127.0.0.1".into();
    config.port = port;
    config.probe_timeout_ms = 1_000;
    HttpHealthProbe::new(&config).unwrap()
}

#[tokio::test]
async fn probe_reads_loading_payload() {
    let router = Router::new().route(
        "/api/health",
        get(|| async {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "loading", "model_loaded": false, "download_progress": 0.42})),
            )
        }),
    );
    let base = spawn_server(router).await;

    let outcome = probe_for(&base).probe().await;
    assert_eq!(outcome, ProbeOutcome::Loading { progress: Some(0.42) });
}

#[tokio::test]
async fn probe_falls_back_to_model_list() {
    let router = Router::new().route(
        "/api/tags",
        get(|| async { Json(json!({"models": []})) }),
    );
    let base = spawn_server(router).await;

    assert_eq!(probe_for(&base).probe().await, ProbeOutcome::Healthy);
}

#[tokio::test]
async fn probe_flags_unrelated_http_servers() {
    let router = Router::new().route("/", get(|| async { "hello" }));
    let base = spawn_server(router).await;

    assert_eq!(probe_for(&base).probe().await, ProbeOutcome::Foreign);
}

#[tokio::test]
async fn probe_reports_nothing_listening() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        probe_for(&format!("http://{addr}")).probe(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, ProbeOutcome::Unreachable);
}
