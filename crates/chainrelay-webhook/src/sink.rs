//! Where webhook bodies are posted.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use chainrelay_core::TransportError;

/// One HTTP POST of a JSON body. Any error is a failed attempt.
#[async_trait]
pub trait WebhookSink: Send + Sync + 'static {
    async fn post(&self, url: &str, body: &Value) -> Result<(), TransportError>;
}

/// `reqwest`-backed sink with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpSink {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl WebhookSink for HttpSink {
    async fn post(&self, url: &str, body: &Value) -> Result<(), TransportError> {
        let resp = self.http.post(url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout { ms: self.timeout.as_millis() as u64 }
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus { status, body });
        }
        Ok(())
    }
}
