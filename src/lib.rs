// SPDX-License-Identifier: MIT
//! Privacy-preserving HPKE reverse proxy for local LLM inference.
//!
//! [`RouterContext`] is the explicit composition root: every component is
//! constructed once in [`RouterContext::build`] and shared through `Arc`,
//! rather than living as module-scope global state.

pub mod circuit_breaker;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod health;
pub mod inference;
pub mod models;
pub mod rate_limiter;
pub mod rest;

use std::sync::Arc;

use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use config::Config;
use envelope::EnvelopeService;
use health::HealthMonitor;
use inference::InferenceStreamer;
use rate_limiter::RateLimiter;

/// Shared state handed to every request handler and background task.
pub struct RouterContext {
    pub config: Arc<Config>,
    pub envelope: Arc<EnvelopeService>,
    pub streamer: Arc<InferenceStreamer>,
    pub health: Arc<HealthMonitor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breaker: Arc<CircuitBreaker>,
}

impl RouterContext {
    pub fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let envelope = EnvelopeService::new(
            config.router_private_key_path.clone(),
            config.router_public_key_path.clone(),
            config.key_rotation,
            config.mlock_secrets,
            config.request_ttl,
            config.clock_skew,
            config.replay_retention,
        )?;

        let streamer = InferenceStreamer::new(&config)?;

        let health = HealthMonitor::new(
            config.inference_endpoints.clone(),
            config.health_threshold,
            config.unhealthy_threshold,
            config.inference_transport,
            config.inference_socket_path.clone(),
        );

        let rate_limiter = RateLimiter::new(config.rate_limit_per_minute, config.rate_limit_burst);

        let circuit_breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            success_threshold: 3,
            reset_timeout: config.circuit_breaker_reset,
        });

        Ok(Arc::new(RouterContext {
            config: Arc::new(config),
            envelope: Arc::new(envelope),
            streamer: Arc::new(streamer),
            health: Arc::new(health),
            rate_limiter: Arc::new(rate_limiter),
            circuit_breaker: Arc::new(circuit_breaker),
        }))
    }
}
