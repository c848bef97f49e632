// SPDX-License-Identifier: MIT
//! Chat request handler: admission, decrypt, SSE stream, terminal events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use axum::http::StatusCode;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use x25519_dalek::PublicKey;

use crate::errors::{EnvelopeError, StreamError};
use crate::models::{EncryptedEnvelope, HealthResponse, MetricsResponse};
use crate::models::{CircuitBreakerMetrics, HealthMetrics, RateLimiterMetrics, StreamerMetrics};
use crate::RouterContext;

const CHANNEL_CAPACITY: usize = 16;

/// Render a client-facing error as the `{"detail": "..."}` JSON body used
/// consistently across this handler, rather than a bare text response.
fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(serde_json::json!({ "detail": detail }))).into_response()
}

pub async fn chat(
    State(ctx): State<Arc<RouterContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(envelope): Json<EncryptedEnvelope>,
) -> Response {
    if ctx.config.rate_limit_enabled
        && !ctx.rate_limiter.allow(&addr.ip().to_string(), &envelope.device_pubkey)
    {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    }

    if ctx.config.circuit_breaker_enabled && !ctx.circuit_breaker.can_make_request() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable");
    }

    let request_id = envelope.request_id.clone();
    let device_pubkey = match decode_device_pubkey(&envelope.device_pubkey) {
        Ok(key) => key,
        Err(_) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, "invalid device key"),
    };

    let payload = match ctx.envelope.decrypt_request(&envelope).await {
        Ok(payload) => payload,
        Err(EnvelopeError::SchemaInvalid) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "invalid request")
        }
        Err(EnvelopeError::ReplayRejected) | Err(EnvelopeError::DecryptFailed) => {
            info!(request_id = %request_id, "request rejected at decrypt");
            return error_response(StatusCode::BAD_REQUEST, "invalid request");
        }
    };

    let (tx, rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
    let ctx_for_task = Arc::clone(&ctx);
    tokio::spawn(run_stream(ctx_for_task, payload, device_pubkey, request_id, tx));

    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response()
}

async fn run_stream(
    ctx: Arc<RouterContext>,
    payload: crate::models::ChatPayload,
    device_pubkey: PublicKey,
    request_id: String,
    tx: mpsc::Sender<Event>,
) {
    let mut sequence: u64 = 0;
    let stream = ctx.streamer.stream_inference(&payload, &ctx.health);
    tokio::pin!(stream);

    loop {
        match stream.next().await {
            Some(Ok(token)) => {
                let chunk = ctx
                    .envelope
                    .encrypt_chunk(token.as_bytes(), &device_pubkey, &request_id, sequence)
                    .await;
                sequence += 1;
                let data = serde_json::to_string(&chunk).expect("chunk serialization cannot fail");
                if tx
                    .send(Event::default().event("chunk").data(data))
                    .await
                    .is_err()
                {
                    // Client disconnected: stop without an error event.
                    // Cancellation is not a failure.
                    if ctx.config.circuit_breaker_enabled {
                        ctx.circuit_breaker.record_success();
                    }
                    return;
                }
            }
            Some(Err(StreamError::Timeout)) => {
                let _ = tx
                    .send(Event::default().event("error").data("Request timeout"))
                    .await;
                if ctx.config.circuit_breaker_enabled {
                    ctx.circuit_breaker.record_failure();
                }
                return;
            }
            Some(Err(other)) => {
                warn!(request_id = %request_id, error_kind = %format!("{other:?}"), "upstream stream failed");
                let _ = tx
                    .send(Event::default().event("error").data("Internal server error"))
                    .await;
                if ctx.config.circuit_breaker_enabled {
                    ctx.circuit_breaker.record_failure();
                }
                return;
            }
            None => break,
        }
    }

    let end_chunk = ctx
        .envelope
        .encrypt_chunk(b"", &device_pubkey, &request_id, sequence)
        .await;
    let data = serde_json::to_string(&end_chunk).expect("chunk serialization cannot fail");
    let _ = tx.send(Event::default().event("end").data(data)).await;
    if ctx.config.circuit_breaker_enabled {
        ctx.circuit_breaker.record_success();
    }
}

fn decode_device_pubkey(b64: &str) -> anyhow::Result<PublicKey> {
    let bytes = URL_SAFE_NO_PAD.decode(b64)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("device key is not 32 bytes"))?;
    Ok(PublicKey::from(arr))
}

pub async fn pubkey(State(ctx): State<Arc<RouterContext>>) -> impl IntoResponse {
    Json(ctx.envelope.public_keys().await)
}

pub async fn health(State(ctx): State<Arc<RouterContext>>) -> Response {
    let endpoints = ctx.health.snapshot();
    let any_healthy = ctx.health.any_healthy();
    let body = HealthResponse {
        status: if any_healthy { "ok" } else { "unhealthy" },
        endpoints,
    };
    let status = if any_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

pub async fn metrics(State(ctx): State<Arc<RouterContext>>) -> impl IntoResponse {
    let (healthy_count, unhealthy_count) = ctx.health.counts();
    Json(MetricsResponse {
        rate_limiter: RateLimiterMetrics {
            admitted: ctx.rate_limiter.admitted(),
            rejected: ctx.rate_limiter.rejected(),
            block_rate_percent: ctx.rate_limiter.block_rate(),
        },
        circuit_breaker: CircuitBreakerMetrics {
            state: ctx.circuit_breaker.state().to_string(),
            trip_count: ctx.circuit_breaker.trip_count(),
            failure_count: ctx.circuit_breaker.failure_count(),
        },
        streamer: StreamerMetrics {
            active_streams: ctx.streamer.active_streams(),
            total_started: ctx.streamer.total_started(),
            error_count: ctx.streamer.error_count(),
            latency_p50_ms: ctx.streamer.latency_p50_ms(),
            latency_p95_ms: ctx.streamer.latency_p95_ms(),
        },
        health: HealthMetrics {
            healthy_count,
            unhealthy_count,
        },
    })
}
