//! Process configuration, read once from the environment at startup.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use chainrelay_core::RetryPolicy;
use chainrelay_webhook::DispatcherConfig;
use chainrelay_ws::{ConnectionConfig, Endpoint, PoolConfig};

use crate::logging::LogConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid {name}={value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("RPC_URLS lists no endpoints")]
    NoEndpoints,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    pub rpc_urls: Vec<String>,
    pub webhook_url: Option<String>,
    pub check_in_address: String,
    pub purchase_item_address: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub webhook_max_retries: u32,
    pub webhook_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub close_poll_interval_ms: u64,
    pub log: LogConfig,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let rpc_urls: Vec<String> = env
            .required("RPC_URLS")?
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from)
            .collect();
        if rpc_urls.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        for url in &rpc_urls {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::Invalid {
                    name: "RPC_URLS",
                    value: url.clone(),
                    reason: "expected a ws:// or wss:// URL".into(),
                });
            }
        }

        Ok(Self {
            rpc_urls,
            webhook_url: env.optional("WEBHOOK_URL"),
            check_in_address: env.address("CHECK_IN_ADDRESS")?,
            purchase_item_address: env.address("PURCHASE_ITEM_ADDRESS")?,
            max_reconnect_attempts: env.number("MAX_RECONNECT_ATTEMPTS", 10)?,
            reconnect_delay_ms: env.number("RECONNECT_DELAY_MS", 5_000)?,
            heartbeat_interval_ms: env.positive("HEARTBEAT_INTERVAL_MS", 60_000)?,
            pong_timeout_ms: env.number("PONG_TIMEOUT_MS", 15_000)?,
            connect_timeout_ms: env.positive("CONNECT_TIMEOUT_MS", 30_000)?,
            webhook_max_retries: env.number("WEBHOOK_MAX_RETRIES", 5)?,
            webhook_timeout_ms: env.positive("WEBHOOK_TIMEOUT_MS", 10_000)?,
            shutdown_grace_ms: env.number("SHUTDOWN_GRACE_MS", 5_000)?,
            close_poll_interval_ms: env.positive("CLOSE_POLL_INTERVAL_MS", 5)?,
            log: LogConfig {
                level: env.optional("LOG_LEVEL").unwrap_or_else(|| "info".into()),
                components: env.components("LOG_COMPONENTS")?,
                json: env.flag("LOG_JSON")?,
            },
        })
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.rpc_urls.iter().map(Endpoint::new).collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connection: ConnectionConfig {
                max_reconnect_attempts: self.max_reconnect_attempts,
                reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
                heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
                pong_timeout: Duration::from_millis(self.pong_timeout_ms),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            },
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            close_poll_interval: Duration::from_millis(self.close_poll_interval_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let default = RetryPolicy::default();
        DispatcherConfig {
            base_url: self.webhook_url.clone(),
            retry: RetryPolicy {
                max_retries: self.webhook_max_retries,
                backoff: default.backoff,
            },
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; empty counts as unset.
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn number<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// A duration that must not be zero (timers and poll intervals).
    fn positive(&self, name: &'static str, default: u64) -> Result<u64, ConfigError> {
        let value = self.number(name, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                name,
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    fn flag(&self, name: &'static str) -> Result<bool, ConfigError> {
        match self.optional(name).map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("false" | "0" | "no") => Ok(false),
            Some("true" | "1" | "yes") => Ok(true),
            Some(other) => Err(ConfigError::Invalid {
                name,
                value: other.to_string(),
                reason: "expected true or false".into(),
            }),
        }
    }

    /// 20-byte hex contract address, normalised to lowercase.
    fn address(&self, name: &'static str) -> Result<String, ConfigError> {
        let raw = self.required(name)?;
        let digits = raw.strip_prefix("0x").unwrap_or(&raw);
        if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: "expected a 0x-prefixed 20-byte hex address".into(),
            });
        }
        Ok(format!("0x{}", digits.to_ascii_lowercase()))
    }

    /// `crate=level` pairs separated by commas.
    fn components(&self, name: &'static str) -> Result<BTreeMap<String, String>, ConfigError> {
        let Some(raw) = self.optional(name) else {
            return Ok(BTreeMap::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((component, level)) => {
                    Ok((component.trim().to_string(), level.trim().to_string()))
                }
                None => Err(ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                    reason: format!("{pair:?} is not component=level"),
                }),
            })
            .collect()
    }
}
