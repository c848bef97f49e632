// SPDX-License-Identifier: MIT
//! Environment-driven configuration.
//!
//! Every field has a hardcoded default so the router boots with zero
//! environment variables set. Two namespaced overlays, `DEVELOPMENT_*` and
//! `PRODUCTION_*`, are consulted after the bare variable name and win when
//! `ENVIRONMENT` matches.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn overlay_prefix(self) -> &'static str {
        match self {
            Environment::Development => "DEVELOPMENT_",
            Environment::Production => "PRODUCTION_",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Socket,
    Http,
    Https,
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socket" => Ok(Transport::Socket),
            "http" => Ok(Transport::Http),
            "https" => Ok(Transport::Https),
            other => Err(anyhow::anyhow!("unknown transport '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,

    pub router_private_key_path: PathBuf,
    pub router_public_key_path: PathBuf,
    pub key_rotation: Duration,
    pub request_ttl: Duration,
    pub clock_skew: Duration,
    pub replay_retention: Duration,
    pub mlock_secrets: bool,

    pub inference_transport: Transport,
    pub inference_endpoints: Vec<String>,
    pub inference_socket_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub request_budget: Duration,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,

    pub health_probe_interval: Duration,
    pub health_threshold: u32,
    pub unhealthy_threshold: u32,
    pub health_probe_timeout: Duration,

    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub rate_limit_enabled: bool,

    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset: Duration,
    pub circuit_breaker_enabled: bool,
}

impl Config {
    /// Load configuration from the process environment, applying
    /// `DEVELOPMENT_*`/`PRODUCTION_*` overlays once `ENVIRONMENT` is known.
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = match env_raw("ENVIRONMENT").as_deref() {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        };

        let transport_str = env_var(environment, "INFERENCE_TRANSPORT", "socket");
        let inference_transport = Transport::from_str(&transport_str).map_err(|source| {
            ConfigError::InvalidValue {
                name: "INFERENCE_TRANSPORT",
                source,
            }
        })?;

        let cfg = Config {
            environment,
            host: env_var(environment, "HOST", "127.0.0.1"),
            port: parse_var(environment, "PORT", 8443u16)?,
            log_level: env_var(environment, "LOG_LEVEL", "info"),
            log_dir: env_var_opt(environment, "LOG_DIR").map(PathBuf::from),

            router_private_key_path: PathBuf::from(env_var(
                environment,
                "ROUTER_HPKE_PRIVATE_KEY_PATH",
                "./router_private_key.pem",
            )),
            router_public_key_path: PathBuf::from(env_var(
                environment,
                "ROUTER_HPKE_PUBLIC_KEY_PATH",
                "./router_public_key.pem",
            )),
            key_rotation: Duration::from_secs(
                3600 * parse_var::<u64>(environment, "HPKE_KEY_ROTATION_HOURS", 24)?,
            ),
            request_ttl: Duration::from_secs(parse_var(environment, "REQUEST_TTL_SECONDS", 60)?),
            clock_skew: Duration::from_secs(parse_var(environment, "CLOCK_SKEW_SECONDS", 10)?),
            replay_retention: Duration::from_secs(parse_var(
                environment,
                "REPLAY_RETENTION_SECONDS",
                3600,
            )?),
            mlock_secrets: parse_var(environment, "MLOCK_SECRETS", true)?,

            inference_transport,
            inference_endpoints: env_var(environment, "INFERENCE_ENDPOINTS", "http://127.0.0.1:11434")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            inference_socket_path: env_var_opt(environment, "INFERENCE_SOCKET_PATH")
                .map(PathBuf::from),
            connect_timeout: Duration::from_secs(parse_var(
                environment,
                "INFERENCE_CONNECT_TIMEOUT_SECONDS",
                5,
            )?),
            idle_timeout: Duration::from_secs(parse_var(
                environment,
                "INFERENCE_IDLE_TIMEOUT_SECONDS",
                30,
            )?),
            request_budget: Duration::from_secs(parse_var(
                environment,
                "REQUEST_BUDGET_SECONDS",
                120,
            )?),
            client_cert_path: env_var_opt(environment, "INFERENCE_CLIENT_CERT_PATH")
                .map(PathBuf::from),
            client_key_path: env_var_opt(environment, "INFERENCE_CLIENT_KEY_PATH")
                .map(PathBuf::from),
            ca_cert_path: env_var_opt(environment, "INFERENCE_CA_CERT_PATH").map(PathBuf::from),

            health_probe_interval: Duration::from_secs(parse_var(
                environment,
                "HEALTH_PROBE_INTERVAL_SECONDS",
                30,
            )?),
            health_threshold: parse_var(environment, "HEALTH_THRESHOLD", 2)?,
            unhealthy_threshold: parse_var(environment, "UNHEALTHY_THRESHOLD", 3)?,
            health_probe_timeout: Duration::from_secs(parse_var(
                environment,
                "HEALTH_PROBE_TIMEOUT_SECONDS",
                5,
            )?),

            rate_limit_per_minute: parse_var(environment, "RATE_LIMIT_PER_MINUTE", 60)?,
            rate_limit_burst: parse_var(environment, "RATE_LIMIT_BURST", 10)?,
            rate_limit_enabled: parse_var(environment, "RATE_LIMIT_ENABLED", true)?,

            circuit_breaker_threshold: parse_var(environment, "CIRCUIT_BREAKER_THRESHOLD", 5)?,
            circuit_breaker_reset: Duration::from_secs(parse_var(
                environment,
                "CIRCUIT_BREAKER_RESET_SECONDS",
                30,
            )?),
            circuit_breaker_enabled: parse_var(environment, "CIRCUIT_BREAKER_ENABLED", true)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inference_transport == Transport::Socket {
            let path = self.inference_socket_path.as_ref().ok_or_else(|| {
                ConfigError::MissingPath {
                    name: "INFERENCE_SOCKET_PATH",
                    path: "<unset>".to_string(),
                }
            })?;
            if !path.exists() {
                return Err(ConfigError::MissingPath {
                    name: "INFERENCE_SOCKET_PATH",
                    path: path.display().to_string(),
                });
            }
        }
        if self.inference_transport == Transport::Https && self.environment == Environment::Production
        {
            for (name, path) in [
                ("INFERENCE_CLIENT_CERT_PATH", &self.client_cert_path),
                ("INFERENCE_CLIENT_KEY_PATH", &self.client_key_path),
                ("INFERENCE_CA_CERT_PATH", &self.ca_cert_path),
            ] {
                let path = path.as_ref().ok_or(ConfigError::MissingPath {
                    name,
                    path: "<unset>".to_string(),
                })?;
                if !path.exists() {
                    return Err(ConfigError::MissingPath {
                        name,
                        path: path.display().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn env_raw(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Read `name`, preferring the environment-specific overlay
/// (`DEVELOPMENT_<name>` / `PRODUCTION_<name>`) over the bare name.
fn env_var_opt(environment: Environment, name: &str) -> Option<String> {
    let overlay = format!("{}{}", environment.overlay_prefix(), name);
    env_raw(&overlay).or_else(|| env_raw(name))
}

fn env_var(environment: Environment, name: &str, default: &str) -> String {
    env_var_opt(environment, name).unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(environment: Environment, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var_opt(environment, name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            name,
            source: anyhow::Error::new(e),
        }),
    }
}
