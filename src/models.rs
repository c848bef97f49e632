//! Wire schemas for the HTTP surface and the decrypted chat payload.

use serde::{Deserialize, Serialize};

/// POST `/api/chat` request body. All byte fields are base64-encoded.
#[derive(Debug, Deserialize)]
pub struct EncryptedEnvelope {
    pub encapsulated_key: String,
    pub ciphertext: String,
    pub aad: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub request_id: String,
    pub device_pubkey: String,
}

/// A single re-encrypted stream chunk, serialized as the SSE `chunk`/`end`
/// event body. Deliberately has no `Debug`/`Display` impl: it carries
/// ciphertext and must never reach a log line.
#[derive(Serialize)]
pub struct EncryptedChunk {
    pub encapsulated_key: String,
    pub ciphertext: String,
    pub aad: String,
    pub sequence: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The plaintext a decrypted envelope carries. Intentionally has no
/// `Debug`/`Display` impl — message content must never be logged.
#[derive(Debug, Deserialize)]
pub struct ChatPayload {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_temperature() -> f32 {
    1.0
}
fn default_top_p() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    256
}
fn default_stream() -> bool {
    true
}

/// Operational clamp bounds applied after schema validation.
pub const MAX_TEMPERATURE: f32 = 1.5;
pub const MAX_TOP_P: f32 = 0.95;
pub const MAX_TOKENS_CEILING: u32 = 4096;

impl ChatPayload {
    /// Clamp sampling parameters to the operational bounds the router
    /// enforces regardless of what the client requested.
    pub fn clamp(mut self) -> Self {
        self.temperature = self.temperature.clamp(0.0, MAX_TEMPERATURE);
        self.top_p = self.top_p.clamp(0.0, MAX_TOP_P);
        self.max_tokens = self.max_tokens.clamp(1, MAX_TOKENS_CEILING);
        self
    }
}

#[derive(Serialize)]
pub struct PubkeyResponse {
    pub current_pubkey: String,
    pub next_pubkey: String,
    pub key_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub algorithm: String,
}

#[derive(Serialize)]
pub struct EndpointHealthView {
    pub endpoint: String,
    pub state: String,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub endpoints: Vec<EndpointHealthView>,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub rate_limiter: RateLimiterMetrics,
    pub circuit_breaker: CircuitBreakerMetrics,
    pub streamer: StreamerMetrics,
    pub health: HealthMetrics,
}

#[derive(Serialize)]
pub struct RateLimiterMetrics {
    pub admitted: u64,
    pub rejected: u64,
    pub block_rate_percent: f64,
}

#[derive(Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: String,
    pub trip_count: u64,
    pub failure_count: u32,
}

#[derive(Serialize)]
pub struct StreamerMetrics {
    pub active_streams: u64,
    pub total_started: u64,
    pub error_count: u64,
    pub latency_p50_ms: Option<u64>,
    pub latency_p95_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct HealthMetrics {
    pub healthy_count: usize,
    pub unhealthy_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_limits_to_operational_bounds() {
        let payload = ChatPayload {
            messages: vec![],
            temperature: 2.0,
            top_p: 1.0,
            max_tokens: 999_999,
            stream: true,
        }
        .clamp();
        assert_eq!(payload.temperature, MAX_TEMPERATURE);
        assert_eq!(payload.top_p, MAX_TOP_P);
        assert_eq!(payload.max_tokens, MAX_TOKENS_CEILING);
    }

    #[test]
    fn clamp_preserves_values_within_bounds() {
        let payload = ChatPayload {
            messages: vec![],
            temperature: 0.5,
            top_p: 0.8,
            max_tokens: 16,
            stream: true,
        }
        .clamp();
        assert_eq!(payload.temperature, 0.5);
        assert_eq!(payload.top_p, 0.8);
        assert_eq!(payload.max_tokens, 16);
    }
}
