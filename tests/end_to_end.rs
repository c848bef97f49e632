//! End-to-end scenarios against an assembled router and a stub upstream,
//! mirroring the literal inputs/outputs of scenarios S1-S3, S5, S6.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use hushrouter::config::{Config, Environment, Transport};
use hushrouter::RouterContext;

/// A stub `/v1/chat/completions` + `/v1/models` upstream speaking the
/// delta-chunk SSE dialect.
#[derive(Clone)]
struct StubUpstream {
    stall: Arc<std::sync::atomic::AtomicBool>,
    failures_remaining: Arc<AtomicU32>,
}

async fn stub_models() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

async fn stub_chat(State(stub): State<StubUpstream>) -> axum::response::Response {
    if stub.failures_remaining.load(Ordering::SeqCst) > 0 {
        stub.failures_remaining.fetch_sub(1, Ordering::SeqCst);
        return axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if stub.stall.load(Ordering::SeqCst) {
        let body = axum::body::Body::from_stream(async_stream::stream! {
            yield Ok::<_, std::convert::Infallible>(bytes::Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
            ));
            // Stall forever: never send [DONE].
            futures_util::future::pending::<()>().await;
        });
        return axum::response::Response::builder()
            .header("content-type", "text/event-stream")
            .body(body)
            .unwrap();
    }

    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"},\"finish_reason\":null}]}\n\n",
        "data: [DONE]\n\n",
    );
    ([("content-type", "text/event-stream")], body).into_response()
}

async fn spawn_stub_upstream(stall: bool, failures: u32) -> (SocketAddr, StubUpstream) {
    let stub = StubUpstream {
        stall: Arc::new(std::sync::atomic::AtomicBool::new(stall)),
        failures_remaining: Arc::new(AtomicU32::new(failures)),
    };
    let router = Router::new()
        .route("/v1/models", get(stub_models))
        .route("/v1/chat/completions", post(stub_chat))
        .with_state(stub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, stub)
}

async fn spawn_router(upstream_addr: SocketAddr, dir: &tempfile::TempDir) -> (SocketAddr, Arc<RouterContext>) {
    // Config::from_env()'s default transport is `socket`, which requires an
    // existing socket path; point it at `http` before loading so validation
    // passes, then override every field explicitly below anyway.
    std::env::set_var("INFERENCE_TRANSPORT", "http");
    let mut config = Config::from_env().unwrap();
    config.environment = Environment::Development;
    config.inference_transport = Transport::Http;
    config.inference_endpoints = vec![format!("http://{upstream_addr}")];
    config.router_private_key_path = dir.path().join("priv.pem");
    config.router_public_key_path = dir.path().join("pub.pem");
    config.mlock_secrets = false;
    config.health_threshold = 1;
    config.unhealthy_threshold = 1;
    config.health_probe_interval = Duration::from_secs(3600); // tests probe manually
    config.request_budget = Duration::from_secs(1);
    config.rate_limit_per_minute = 1000;
    config.rate_limit_burst = 1000;
    config.circuit_breaker_threshold = 2;
    config.circuit_breaker_reset = Duration::from_millis(100);

    let ctx = RouterContext::build(config).unwrap();
    // Prime the health monitor so the stub endpoint is selected immediately.
    let client = reqwest::Client::new();
    ctx.health.probe_all(&client, Duration::from_secs(5)).await;

    let router = hushrouter::rest::build_router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, ctx)
}

fn seal_request(
    router_pubkey: &PublicKey,
    request_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> (serde_json::Value, StaticSecret) {
    let device_private = StaticSecret::random_from_rng(OsRng);
    let device_public = PublicKey::from(&device_private);

    let plaintext = serde_json::json!({
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 0.7,
        "top_p": 0.9,
        "max_tokens": 5,
    });
    let aad = b"test".to_vec();
    let sealed = hushrouter::envelope::crypto::seal(
        router_pubkey,
        &serde_json::to_vec(&plaintext).unwrap(),
        &aad,
    );

    let body = serde_json::json!({
        "encapsulated_key": URL_SAFE_NO_PAD.encode(sealed.encapsulated_key.as_bytes()),
        "ciphertext": URL_SAFE_NO_PAD.encode(sealed.ciphertext),
        "aad": URL_SAFE_NO_PAD.encode(aad),
        "timestamp": timestamp.to_rfc3339(),
        "request_id": request_id,
        "device_pubkey": URL_SAFE_NO_PAD.encode(device_public.as_bytes()),
    });
    (body, device_private)
}

async fn router_pubkey(ctx: &RouterContext) -> PublicKey {
    let pubkeys = ctx.envelope.public_keys().await;
    let bytes = URL_SAFE_NO_PAD.decode(&pubkeys.current_pubkey).unwrap();
    let arr: [u8; 32] = bytes.try_into().unwrap();
    PublicKey::from(arr)
}

/// One parsed `event: <name>\ndata: <payload>` block from an SSE response body.
struct SseEvent {
    name: String,
    data: String,
}

fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .filter_map(|block| {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data = Some(rest.trim().to_string());
                }
            }
            Some(SseEvent {
                name: name?,
                data: data?,
            })
        })
        .collect()
}

/// Decrypt one `chunk`/`end` SSE event's JSON payload with the device's
/// private key, returning its plaintext and sequence number.
fn open_chunk_event(event: &SseEvent, device_private: &StaticSecret, request_id: &str) -> (Vec<u8>, u64) {
    let payload: serde_json::Value = serde_json::from_str(&event.data).unwrap();
    let encapsulated_bytes = URL_SAFE_NO_PAD
        .decode(payload["encapsulated_key"].as_str().unwrap())
        .unwrap();
    let encapsulated_arr: [u8; 32] = encapsulated_bytes.try_into().unwrap();
    let encapsulated_key = PublicKey::from(encapsulated_arr);
    let ciphertext = URL_SAFE_NO_PAD
        .decode(payload["ciphertext"].as_str().unwrap())
        .unwrap();
    let sequence = payload["sequence"].as_u64().unwrap();
    let aad = hushrouter::envelope::crypto::chunk_aad(request_id, sequence);

    let plaintext =
        hushrouter::envelope::crypto::open(device_private, &encapsulated_key, &ciphertext, &aad).unwrap();
    (plaintext, sequence)
}

#[tokio::test]
async fn s1_happy_path_streams_hello_then_end() {
    let (upstream_addr, _stub) = spawn_stub_upstream(false, 0).await;
    let dir = tempfile::tempdir().unwrap();
    let (router_addr, ctx) = spawn_router(upstream_addr, &dir).await;
    let router_pub = router_pubkey(&ctx).await;

    let request_id = "req-1";
    let (body, device_private) = seal_request(&router_pub, request_id, chrono::Utc::now());
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{router_addr}/api/chat"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let text = response.text().await.unwrap();
    let events = parse_sse_events(&text);

    let chunks: Vec<_> = events.iter().filter(|e| e.name == "chunk").collect();
    assert!(!chunks.is_empty());
    let end = events.iter().find(|e| e.name == "end").expect("missing end event");

    let mut plaintext = Vec::new();
    for (expected_sequence, chunk) in chunks.iter().enumerate() {
        let (bytes, sequence) = open_chunk_event(chunk, &device_private, request_id);
        assert_eq!(sequence, expected_sequence as u64);
        plaintext.extend_from_slice(&bytes);
    }
    assert_eq!(plaintext, b"hello");

    let (end_plaintext, end_sequence) = open_chunk_event(end, &device_private, request_id);
    assert_eq!(end_sequence, chunks.len() as u64);
    assert!(end_plaintext.is_empty());
}

#[tokio::test]
async fn s2_replay_is_rejected() {
    let (upstream_addr, _stub) = spawn_stub_upstream(false, 0).await;
    let dir = tempfile::tempdir().unwrap();
    let (router_addr, ctx) = spawn_router(upstream_addr, &dir).await;
    let router_pub = router_pubkey(&ctx).await;

    let (body, _) = seal_request(&router_pub, "req-replay", chrono::Utc::now());
    let client = reqwest::Client::new();

    let first = client
        .post(format!("http://{router_addr}/api/chat"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let _ = first.bytes().await;

    let second = client
        .post(format!("http://{router_addr}/api/chat"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 400);
}

#[tokio::test]
async fn s3_expired_timestamp_is_rejected() {
    let (upstream_addr, _stub) = spawn_stub_upstream(false, 0).await;
    let dir = tempfile::tempdir().unwrap();
    let (router_addr, ctx) = spawn_router(upstream_addr, &dir).await;
    let router_pub = router_pubkey(&ctx).await;

    let old_timestamp = chrono::Utc::now() - chrono::Duration::seconds(600);
    let (body, _) = seal_request(&router_pub, "req-expired", old_timestamp);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{router_addr}/api/chat"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn s5_budget_expiry_emits_timeout_error() {
    let (upstream_addr, _stub) = spawn_stub_upstream(true, 0).await;
    let dir = tempfile::tempdir().unwrap();
    let (router_addr, ctx) = spawn_router(upstream_addr, &dir).await;
    let router_pub = router_pubkey(&ctx).await;

    let (body, _) = seal_request(&router_pub, "req-budget", chrono::Utc::now());
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{router_addr}/api/chat"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let text = response.text().await.unwrap();
    assert!(text.contains("Request timeout"));
}

#[tokio::test]
async fn s6_breaker_trips_after_threshold_failures() {
    let (upstream_addr, _stub) = spawn_stub_upstream(false, 10).await;
    let dir = tempfile::tempdir().unwrap();
    let (router_addr, ctx) = spawn_router(upstream_addr, &dir).await;
    let router_pub = router_pubkey(&ctx).await;
    let client = reqwest::Client::new();

    // circuit_breaker_threshold = 2 in spawn_router's test config.
    for i in 0..2 {
        let (body, _) = seal_request(&router_pub, &format!("req-fail-{i}"), chrono::Utc::now());
        let response = client
            .post(format!("http://{router_addr}/api/chat"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let text = response.text().await.unwrap();
        assert!(text.contains("Internal server error"));
    }

    let (body, _) = seal_request(&router_pub, "req-tripped", chrono::Utc::now());
    let response = client
        .post(format!("http://{router_addr}/api/chat"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}
