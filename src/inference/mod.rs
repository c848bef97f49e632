// SPDX-License-Identifier: MIT
//! Streaming inference client: connect to upstream, stream chat
//! completions, parse the delta-chunk framing, enforce the request budget
//! and yield tokens lazily so the caller can cancel mid-stream.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::config::{Config, Transport};
use crate::errors::StreamError;
use crate::health::HealthMonitor;
use crate::models::ChatPayload;

const LATENCY_SAMPLE_CAP: usize = 1000;

#[derive(Serialize)]
struct UpstreamRequest<'a> {
    messages: &'a [crate::models::ChatMessage],
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(serde::Deserialize)]
struct UpstreamChunk {
    choices: Vec<UpstreamChoice>,
}

#[derive(serde::Deserialize)]
struct UpstreamChoice {
    delta: UpstreamDelta,
    finish_reason: Option<String>,
}

#[derive(serde::Deserialize, Default)]
struct UpstreamDelta {
    content: Option<String>,
}

enum ParsedLine {
    Token(String),
    Done,
    Skip,
}

/// Parse one `data: ...` SSE line from the upstream's delta-chunk dialect.
fn parse_data_line(payload: &str) -> ParsedLine {
    if payload.trim() == "[DONE]" {
        return ParsedLine::Done;
    }
    match serde_json::from_str::<UpstreamChunk>(payload) {
        Ok(chunk) => {
            let Some(choice) = chunk.choices.into_iter().next() else {
                return ParsedLine::Skip;
            };
            if choice.finish_reason.is_some() {
                return ParsedLine::Done;
            }
            match choice.delta.content {
                Some(content) if !content.is_empty() => ParsedLine::Token(content),
                _ => ParsedLine::Skip,
            }
        }
        Err(_) => ParsedLine::Skip,
    }
}

struct Telemetry {
    active_streams: AtomicU64,
    total_started: AtomicU64,
    error_count: AtomicU64,
    latency_samples_ms: Mutex<std::collections::VecDeque<u64>>,
}

impl Telemetry {
    fn new() -> Self {
        Telemetry {
            active_streams: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latency_samples_ms: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut samples = self.latency_samples_ms.lock().expect("telemetry mutex poisoned");
        samples.push_back(elapsed.as_millis() as u64);
        if samples.len() > LATENCY_SAMPLE_CAP {
            samples.pop_front();
        }
    }

    fn percentile(&self, pct: f64) -> Option<u64> {
        let samples = self.latency_samples_ms.lock().expect("telemetry mutex poisoned");
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
        sorted.get(idx).copied()
    }
}

pub struct InferenceStreamer {
    http: reqwest::Client,
    transport: Transport,
    socket_path: Option<PathBuf>,
    connect_timeout: Duration,
    idle_timeout: Duration,
    request_budget: Duration,
    telemetry: Telemetry,
}

impl InferenceStreamer {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.idle_timeout);

        if config.inference_transport == Transport::Https {
            if let (Some(cert_path), Some(key_path)) =
                (&config.client_cert_path, &config.client_key_path)
            {
                let mut pem = std::fs::read(cert_path)?;
                pem.extend_from_slice(&std::fs::read(key_path)?);
                let identity = reqwest::Identity::from_pem(&pem)?;
                builder = builder.identity(identity);
            }
            if let Some(ca_path) = &config.ca_cert_path {
                let ca = reqwest::Certificate::from_pem(&std::fs::read(ca_path)?)?;
                builder = builder.add_root_certificate(ca);
            }
        }

        Ok(InferenceStreamer {
            http: builder.build()?,
            transport: config.inference_transport,
            socket_path: config.inference_socket_path.clone(),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            request_budget: config.request_budget,
            telemetry: Telemetry::new(),
        })
    }

    pub fn active_streams(&self) -> u64 {
        self.telemetry.active_streams.load(Ordering::Relaxed)
    }

    pub fn total_started(&self) -> u64 {
        self.telemetry.total_started.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.telemetry.error_count.load(Ordering::Relaxed)
    }

    pub fn latency_p50_ms(&self) -> Option<u64> {
        self.telemetry.percentile(0.50)
    }

    pub fn latency_p95_ms(&self) -> Option<u64> {
        self.telemetry.percentile(0.95)
    }

    /// Selects an upstream via the health monitor,
    /// opens a streaming POST, and yields token strings lazily, bounded by
    /// the request budget measured from this call.
    pub fn stream_inference<'a>(
        &'a self,
        payload: &'a ChatPayload,
        health: &'a HealthMonitor,
    ) -> impl Stream<Item = Result<String, StreamError>> + 'a {
        let start = Instant::now();
        self.telemetry.total_started.fetch_add(1, Ordering::Relaxed);
        self.telemetry.active_streams.fetch_add(1, Ordering::Relaxed);

        let budget = self.request_budget;
        let inner = self.body_stream(payload, health);
        let telemetry = &self.telemetry;

        try_stream! {
            tokio::pin!(inner);
            let outcome = loop {
                let remaining = budget.checked_sub(start.elapsed()).unwrap_or(Duration::ZERO);
                if remaining.is_zero() {
                    break Err(StreamError::Timeout);
                }
                match tokio::time::timeout(remaining, inner.next()).await {
                    Ok(Some(Ok(token))) => yield token,
                    Ok(Some(Err(e))) => break Err(e),
                    Ok(None) => break Ok(()),
                    Err(_) => break Err(StreamError::Timeout),
                }
            };

            telemetry.active_streams.fetch_sub(1, Ordering::Relaxed);
            telemetry.record_latency(start.elapsed());
            if let Err(e) = outcome {
                telemetry.error_count.fetch_add(1, Ordering::Relaxed);
                Err(e)?;
            }
        }
    }

    fn body_stream<'a>(
        &'a self,
        payload: &'a ChatPayload,
        health: &'a HealthMonitor,
    ) -> impl Stream<Item = Result<String, StreamError>> + 'a {
        try_stream! {
            let endpoint = health
                .get_healthy_endpoint()
                .ok_or(StreamError::NoEndpoint)?;

            let request = UpstreamRequest {
                messages: &payload.messages,
                temperature: payload.temperature,
                top_p: payload.top_p,
                max_tokens: payload.max_tokens,
                stream: true,
            };

            let lines: Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>> = match self.transport {
                Transport::Socket => Box::pin(self.open_socket(&request).await?),
                Transport::Http | Transport::Https => Box::pin(self.open_http(&endpoint, &request).await?),
            };

            tokio::pin!(lines);
            while let Some(line) = lines.next().await {
                let line = line?;
                match parse_data_line(&line) {
                    ParsedLine::Token(token) => yield token,
                    ParsedLine::Done => break,
                    ParsedLine::Skip => {}
                }
            }
        }
    }

    async fn open_http<'a>(
        &'a self,
        endpoint: &str,
        request: &UpstreamRequest<'a>,
    ) -> Result<impl Stream<Item = Result<String, StreamError>> + 'a, StreamError> {
        let url = format!("{endpoint}/v1/chat/completions");
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| StreamError::UpstreamFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StreamError::UpstreamFailed(format!(
                "status {}",
                response.status()
            )));
        }

        let byte_stream = response.bytes_stream();
        Ok(lines_from_byte_stream(byte_stream))
    }

    async fn open_socket<'a>(
        &'a self,
        request: &UpstreamRequest<'a>,
    ) -> Result<impl Stream<Item = Result<String, StreamError>> + 'a, StreamError> {
        let path = self
            .socket_path
            .as_ref()
            .ok_or(StreamError::NoEndpoint)?;

        let mut stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| StreamError::UpstreamFailed("connect timed out".to_string()))?
            .map_err(|e| StreamError::UpstreamFailed(e.to_string()))?;

        let body = serde_json::to_vec(request).map_err(|e| StreamError::UpstreamFailed(e.to_string()))?;
        let head = format!(
            "POST /v1/chat/completions HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|e| StreamError::UpstreamFailed(e.to_string()))?;
        stream
            .write_all(&body)
            .await
            .map_err(|e| StreamError::UpstreamFailed(e.to_string()))?;

        Ok(lines_from_unix_stream(stream, self.idle_timeout))
    }
}

/// Turn an HTTP byte stream into a stream of complete `data: ` lines,
/// buffering partial lines across chunk boundaries.
fn lines_from_byte_stream(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String, StreamError>> {
    try_stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| StreamError::UpstreamFailed(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);
                if let Some(payload) = line.strip_prefix("data: ") {
                    yield payload.to_string();
                }
            }
        }
    }
}

/// As above, but reading raw bytes off a `UnixStream`, skipping the HTTP
/// response head before the body's SSE lines begin, and dechunking a
/// `Transfer-Encoding: chunked` body before it reaches the SSE line parser.
fn lines_from_unix_stream(
    mut stream: UnixStream,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<String, StreamError>> {
    try_stream! {
        let mut buffer = Vec::new();
        let mut headers_done = false;
        let mut chunked = false;
        let mut body_raw = Vec::new();
        let mut text_buffer = String::new();
        let mut read_buf = [0u8; 4096];

        loop {
            let read = tokio::time::timeout(idle_timeout, stream.read(&mut read_buf))
                .await
                .map_err(|_| StreamError::UpstreamFailed("idle timeout waiting for upstream".to_string()))?
                .map_err(|e: io::Error| StreamError::UpstreamFailed(e.to_string()))?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&read_buf[..read]);

            if !headers_done {
                if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n") {
                    headers_done = true;
                    let header_text = String::from_utf8_lossy(&buffer[..pos]).to_lowercase();
                    chunked = header_text.lines().any(|line| {
                        line.starts_with("transfer-encoding:") && line.contains("chunked")
                    });
                    let body_start = pos + 4;
                    body_raw.extend_from_slice(&buffer[body_start..]);
                    buffer.clear();
                } else {
                    continue;
                }
            } else {
                body_raw.extend_from_slice(&buffer);
                buffer.clear();
            }

            let decoded = if chunked {
                dechunk(&mut body_raw)
            } else {
                std::mem::take(&mut body_raw)
            };
            text_buffer.push_str(&String::from_utf8_lossy(&decoded));

            while let Some(pos) = text_buffer.find('\n') {
                let line = text_buffer[..pos].trim_end_matches('\r').to_string();
                text_buffer.drain(..=pos);
                if let Some(payload) = line.strip_prefix("data: ") {
                    yield payload.to_string();
                }
            }
        }
    }
}

/// Strip HTTP/1.1 chunked transfer-encoding framing from `raw`, consuming
/// every complete chunk and returning their concatenated data. An incomplete
/// trailing chunk is left in `raw` for the next read; the terminal
/// zero-length chunk and any trailers are discarded.
fn dechunk(raw: &mut Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut consumed = 0usize;
    loop {
        let rest = &raw[consumed..];
        let Some(line_end) = find_subslice(rest, b"\r\n") else {
            break;
        };
        let size_str = String::from_utf8_lossy(&rest[..line_end]);
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            break;
        };
        let chunk_start = line_end + 2;
        if size == 0 {
            consumed = raw.len();
            break;
        }
        let chunk_end = chunk_start + size;
        if rest.len() < chunk_end + 2 {
            break;
        }
        out.extend_from_slice(&rest[chunk_start..chunk_end]);
        consumed += chunk_end + 2;
    }
    raw.drain(..consumed);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
