// SPDX-License-Identifier: MIT
//! Upstream health monitor: periodic liveness probes, threshold-based
//! state transitions, round-robin selection over the healthy set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::UnixStream;
use tracing::{info, warn};

use crate::config::Transport;
use crate::models::EndpointHealthView;

/// Pseudo-endpoint prefix used to represent the UNIX socket transport in the
/// same `endpoints: Vec<String>` table the HTTP transports use.
const UNIX_SOCKET_PREFIX: &str = "unix:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointState {
    Unknown,
    Healthy,
    Unhealthy,
}

struct EndpointRecord {
    state: EndpointState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_probe: Option<Instant>,
    last_error: Option<String>,
}

impl EndpointRecord {
    fn new() -> Self {
        EndpointRecord {
            state: EndpointState::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_probe: None,
            last_error: None,
        }
    }
}

struct Inner {
    records: HashMap<String, EndpointRecord>,
    round_robin_cursor: usize,
}

/// Tracks one record per configured upstream and round-robins over the
/// healthy set. The mutex is held only for state reads/updates, never across
/// probe I/O. When the streamer's transport is a UNIX socket there is a
/// single pseudo-endpoint (`unix:<path>`) rather than a list of HTTP URLs,
/// and `probe_all` connects to it directly instead of issuing an HTTP GET.
pub struct HealthMonitor {
    endpoints: Vec<String>,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    transport: Transport,
    inner: Mutex<Inner>,
}

impl HealthMonitor {
    pub fn new(
        endpoints: Vec<String>,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
        transport: Transport,
        socket_path: Option<PathBuf>,
    ) -> Self {
        let endpoints = if transport == Transport::Socket {
            let path = socket_path.map(|p| p.display().to_string()).unwrap_or_default();
            vec![format!("{UNIX_SOCKET_PREFIX}{path}")]
        } else {
            endpoints
        };

        let mut records = HashMap::new();
        for endpoint in &endpoints {
            records.insert(endpoint.clone(), EndpointRecord::new());
        }
        HealthMonitor {
            endpoints,
            healthy_threshold,
            unhealthy_threshold,
            transport,
            inner: Mutex::new(Inner {
                records,
                round_robin_cursor: 0,
            }),
        }
    }

    /// Record the outcome of one probe. A 200 (or any `success`) increments
    /// consecutive successes and clears failures; anything else does the
    /// reverse. Transitions are one-shot: once Healthy/Unhealthy, a record
    /// only flips on crossing the opposite threshold.
    pub fn record_outcome(&self, endpoint: &str, success: bool, error: Option<String>) {
        let mut inner = self.inner.lock().expect("health monitor mutex poisoned");
        let Some(record) = inner.records.get_mut(endpoint) else {
            return;
        };
        record.last_probe = Some(Instant::now());

        if success {
            record.consecutive_successes += 1;
            record.consecutive_failures = 0;
            record.last_error = None;
            if record.state != EndpointState::Healthy
                && record.consecutive_successes >= self.healthy_threshold
            {
                record.state = EndpointState::Healthy;
                info!(endpoint, "endpoint transitioned to healthy");
            }
        } else {
            record.consecutive_failures += 1;
            record.consecutive_successes = 0;
            record.last_error = error;
            if record.state != EndpointState::Unhealthy
                && record.consecutive_failures >= self.unhealthy_threshold
            {
                record.state = EndpointState::Unhealthy;
                warn!(endpoint, "endpoint transitioned to unhealthy");
            }
        }
    }

    /// Next endpoint in a round-robin over the healthy set, falling back to
    /// the first configured endpoint if none are healthy.
    pub fn get_healthy_endpoint(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("health monitor mutex poisoned");
        let healthy: Vec<&String> = self
            .endpoints
            .iter()
            .filter(|e| {
                inner
                    .records
                    .get(e.as_str())
                    .map(|r| r.state == EndpointState::Healthy)
                    .unwrap_or(false)
            })
            .collect();

        if healthy.is_empty() {
            return self.endpoints.first().cloned();
        }

        let idx = inner.round_robin_cursor % healthy.len();
        inner.round_robin_cursor = inner.round_robin_cursor.wrapping_add(1);
        Some(healthy[idx].clone())
    }

    pub fn snapshot(&self) -> Vec<EndpointHealthView> {
        let inner = self.inner.lock().expect("health monitor mutex poisoned");
        self.endpoints
            .iter()
            .map(|endpoint| {
                let record = inner.records.get(endpoint);
                EndpointHealthView {
                    endpoint: endpoint.clone(),
                    state: format!("{:?}", record.map(|r| r.state).unwrap_or(EndpointState::Unknown)),
                    consecutive_failures: record.map(|r| r.consecutive_failures).unwrap_or(0),
                    consecutive_successes: record.map(|r| r.consecutive_successes).unwrap_or(0),
                }
            })
            .collect()
    }

    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("health monitor mutex poisoned");
        let healthy = inner
            .records
            .values()
            .filter(|r| r.state == EndpointState::Healthy)
            .count();
        let unhealthy = inner
            .records
            .values()
            .filter(|r| r.state == EndpointState::Unhealthy)
            .count();
        (healthy, unhealthy)
    }

    pub fn any_healthy(&self) -> bool {
        self.counts().0 > 0
    }

    /// Probe every configured endpoint. Over HTTP/HTTPS this is a GET against
    /// `/v1/models`; over a UNIX socket it is a bare connect-and-close, since
    /// there is no HTTP client to round-trip a request through. Runs outside
    /// the mutex: each probe does its own I/O, and the outcome is recorded
    /// afterward.
    pub async fn probe_all(&self, client: &reqwest::Client, timeout: Duration) {
        for endpoint in &self.endpoints {
            if self.transport == Transport::Socket {
                self.probe_socket(endpoint, timeout).await;
                continue;
            }

            let url = format!("{endpoint}/v1/models");
            let result = client.get(&url).timeout(timeout).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    self.record_outcome(endpoint, true, None);
                }
                Ok(response) => {
                    self.record_outcome(endpoint, false, Some(format!("status {}", response.status())));
                }
                Err(e) => {
                    self.record_outcome(endpoint, false, Some(e.to_string()));
                }
            }
        }
    }

    async fn probe_socket(&self, endpoint: &str, timeout: Duration) {
        let path = endpoint.strip_prefix(UNIX_SOCKET_PREFIX).unwrap_or(endpoint);
        match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
            Ok(Ok(_)) => self.record_outcome(endpoint, true, None),
            Ok(Err(e)) => self.record_outcome(endpoint, false, Some(e.to_string())),
            Err(_) => self.record_outcome(endpoint, false, Some("probe timed out".to_string())),
        }
    }
}
